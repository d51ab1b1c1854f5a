//! Users and auth tokens

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Row, params};
use tracing::debug;

use super::models::{TokenKind, User};
use super::sqlite::{CrmStore, StorageResult};

const USER_COLUMNS: &str =
    "id, username, email, password_hash, first_name, last_name, is_superuser, date_joined";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        is_superuser: row.get(6)?,
        date_joined: row.get(7)?,
    })
}

impl CrmStore {
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        first_name: &str,
        last_name: &str,
    ) -> StorageResult<User> {
        let conn = self.conn.lock();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO users (username, email, password_hash, first_name, last_name, date_joined)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![username, email, password_hash, first_name, last_name, now],
        )?;

        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            is_superuser: false,
            date_joined: now,
        })
    }

    pub fn get_user(&self, id: i64) -> StorageResult<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                [id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_username(&self, username: &str) -> StorageResult<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                [username],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn email_exists(&self, email: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = ?1)",
            [email],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn set_superuser(&self, user_id: i64, is_superuser: bool) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET is_superuser = ?1 WHERE id = ?2",
            params![is_superuser, user_id],
        )?;
        Ok(())
    }

    /// Persist an issued token
    pub fn insert_token(
        &self,
        token: &str,
        user_id: i64,
        kind: TokenKind,
        ttl: Duration,
    ) -> StorageResult<DateTime<Utc>> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let expires_at = now + ttl;

        conn.execute(
            "INSERT INTO auth_tokens (token, user_id, kind, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token, user_id, kind.as_str(), now, expires_at],
        )?;

        Ok(expires_at)
    }

    /// Resolve an unexpired token of the given kind to its user
    pub fn user_for_token(&self, token: &str, kind: TokenKind) -> StorageResult<Option<User>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM users
             WHERE id = (SELECT user_id FROM auth_tokens
                         WHERE token = ?1 AND kind = ?2 AND expires_at > ?3)",
            USER_COLUMNS
        );
        let user = conn
            .query_row(&sql, params![token, kind.as_str(), Utc::now()], user_from_row)
            .optional()?;
        Ok(user)
    }

    /// Delete a token; returns whether it existed
    pub fn revoke_token(&self, token: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM auth_tokens WHERE token = ?1", [token])?;
        Ok(rows > 0)
    }

    /// Drop expired tokens
    pub fn purge_expired_tokens(&self) -> StorageResult<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM auth_tokens WHERE expires_at <= ?1",
            [Utc::now()],
        )?;
        if rows > 0 {
            debug!("Purged {} expired auth tokens", rows);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite::test_support::*;
    use super::*;

    #[test]
    fn test_create_and_find_user() {
        let store = store();
        let created = user(&store, "ana");

        let found = store.find_user_by_username("ana").unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.email, "ana@example.com");
        assert!(!found.is_superuser);

        assert!(store.email_exists("ana@example.com").unwrap());
        assert!(!store.email_exists("bob@example.com").unwrap());
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let store = store();
        user(&store, "ana");
        let err = store
            .create_user("ana", "other@example.com", "h", "", "")
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_token_lifecycle() {
        let store = store();
        let ana = user(&store, "ana");

        store
            .insert_token("tok-access", ana.id, TokenKind::Access, Duration::hours(1))
            .unwrap();
        store
            .insert_token("tok-expired", ana.id, TokenKind::Access, Duration::seconds(-5))
            .unwrap();

        let resolved = store
            .user_for_token("tok-access", TokenKind::Access)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, ana.id);

        // kind must match
        assert!(
            store
                .user_for_token("tok-access", TokenKind::Refresh)
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .user_for_token("tok-expired", TokenKind::Access)
                .unwrap()
                .is_none()
        );

        assert_eq!(store.purge_expired_tokens().unwrap(), 1);
        assert!(store.revoke_token("tok-access").unwrap());
        assert!(!store.revoke_token("tok-access").unwrap());
    }
}
