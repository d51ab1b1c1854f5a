//! SQLite-based CRM storage
//!
//! Entity operations live in sibling modules as further `impl CrmStore`
//! blocks; this file owns the connection, the schema and shared helpers.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, info};

use crate::crypto::{CryptoError, FieldCipher};

/// Storage error type
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),
}

impl StorageError {
    /// True when the error is a UNIQUE / FOREIGN KEY / CHECK violation
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation
        )
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// SQLite-based CRM store
///
/// Uses a single connection with Mutex (SQLite handles locking internally).
/// Secret columns are encrypted with the configured `FieldCipher`.
pub struct CrmStore {
    pub(super) conn: Mutex<Connection>,
    pub(super) cipher: FieldCipher,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    email TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    first_name TEXT NOT NULL DEFAULT '',
    last_name TEXT NOT NULL DEFAULT '',
    is_superuser INTEGER NOT NULL DEFAULT 0,
    date_joined TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    owner_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    phone_number_id TEXT UNIQUE NOT NULL,
    business_account_id TEXT NOT NULL,
    access_token TEXT NOT NULL,
    webhook_verify_token TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    language TEXT NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    components TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (account_id, name, language)
);

CREATE TABLE IF NOT EXISTS contacts (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    phone_number TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    profile_picture_url TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (account_id, phone_number)
);
CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone_number);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'open',
    last_message_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (account_id, contact_id)
);
CREATE INDEX IF NOT EXISTS idx_conversations_last_message ON conversations(last_message_at);
CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status, last_message_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    whatsapp_id TEXT UNIQUE NOT NULL,
    direction TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    body TEXT,
    media_url TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    delivery_status TEXT NOT NULL DEFAULT 'sent',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS ai_configs (
    id TEXT PRIMARY KEY,
    account_id TEXT UNIQUE NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    enabled INTEGER NOT NULL DEFAULT 0,
    provider TEXT NOT NULL DEFAULT 'gemini',
    api_key TEXT NOT NULL,
    system_prompt TEXT NOT NULL DEFAULT '',
    max_history_messages INTEGER NOT NULL DEFAULT 10,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

impl CrmStore {
    /// Create or open a store at the given path
    pub fn new<P: AsRef<Path>>(path: P, cipher: FieldCipher) -> StorageResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening CRM store at {:?}", path);

        let conn = Connection::open(path)?;
        Self::with_connection(conn, cipher)
    }

    /// In-memory store, used by tests and throwaway runs
    pub fn open_in_memory(cipher: FieldCipher) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, cipher)
    }

    fn with_connection(conn: Connection, cipher: FieldCipher) -> StorageResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            cipher,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn initialize_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock();

        // WAL is ignored for in-memory databases
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;

        debug!("CRM store schema initialized");
        Ok(())
    }

    pub(super) fn seal(&self, value: &str) -> StorageResult<String> {
        Ok(self.cipher.encrypt(value)?)
    }

    pub(super) fn unseal(&self, value: &str) -> String {
        self.cipher.decrypt_or_raw(value)
    }
}

/// New random primary key
pub(super) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `%term%` pattern for LIKE searches, with wildcards in the term escaped
pub(super) fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// `?,?,?` placeholder list for IN clauses
pub(super) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_store_creation() {
        let _store = store();
    }

    #[test]
    fn test_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crm.sqlite3");
        let cipher = FieldCipher::new(&FieldCipher::generate_key()).unwrap();

        let _store = CrmStore::new(&path, cipher).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_secret_columns_encrypted_at_rest() {
        let store = store();
        let account = account(&store, None, "1001");

        let raw: String = store
            .conn
            .lock()
            .query_row(
                "SELECT access_token FROM accounts WHERE id = ?1",
                [&account.id],
                |row| row.get(0),
            )
            .unwrap();

        assert_ne!(raw, "EAAG-token");
        assert_eq!(account.access_token, "EAAG-token");
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("ana"), "%ana%");
        assert_eq!(like_pattern("50%_"), "%50\\%\\_%");
    }

    #[test]
    fn test_constraint_violation_detection() {
        let store = store();
        account(&store, None, "1001");

        let err = store
            .insert_account(crate::storage::models::NewAccount {
                owner_id: None,
                name: "dup".into(),
                phone_number_id: "1001".into(),
                business_account_id: "w".into(),
                access_token: String::new(),
                webhook_verify_token: String::new(),
                status: crate::storage::models::AccountStatus::Active,
            })
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }
}
