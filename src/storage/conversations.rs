//! Conversations and inbox summaries

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params, params_from_iter, types::Value as SqlValue};

use super::models::{
    ContactSummary, Conversation, ConversationFilter, ConversationStatus, ConversationSummary,
};
use super::sqlite::{CrmStore, StorageResult, like_pattern, new_id};

const CONVERSATION_COLUMNS: &str =
    "v.id, v.account_id, v.contact_id, v.status, v.last_message_at, v.created_at, v.updated_at";

/// Joined summary query; callers append WHERE/ORDER clauses
const SUMMARY_SELECT: &str = "
    SELECT v.id, v.account_id, v.contact_id, v.status, v.last_message_at, v.created_at, v.updated_at,
        c.id, c.name, c.phone_number, c.profile_picture_url,
        a.name, a.owner_id,
        (SELECT COUNT(*) FROM messages m
            WHERE m.conversation_id = v.id AND m.direction = 'incoming'
              AND m.delivery_status IN ('sent', 'delivered')),
        (SELECT m.message_type FROM messages m
            WHERE m.conversation_id = v.id ORDER BY m.created_at DESC, m.rowid DESC LIMIT 1),
        (SELECT m.body FROM messages m
            WHERE m.conversation_id = v.id ORDER BY m.created_at DESC, m.rowid DESC LIMIT 1),
        (SELECT MAX(m.created_at) FROM messages m
            WHERE m.conversation_id = v.id AND m.direction = 'incoming')
    FROM conversations v
    JOIN contacts c ON c.id = v.contact_id
    JOIN accounts a ON a.id = v.account_id";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        contact_id: row.get(2)?,
        status: row.get(3)?,
        last_message_at: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        conversation: conversation_from_row(row)?,
        contact: ContactSummary {
            id: row.get(7)?,
            name: row.get(8)?,
            phone_number: row.get(9)?,
            profile_picture_url: row.get(10)?,
        },
        account_name: row.get(11)?,
        owner_id: row.get(12)?,
        unread_count: row.get(13)?,
        last_message_type: row.get(14)?,
        last_message_body: row.get(15)?,
        last_incoming_message_at: row.get(16)?,
    })
}

impl CrmStore {
    /// Conversation between an account and a contact, created `open` if missing.
    ///
    /// Returns the conversation and whether it was created.
    pub fn get_or_create_conversation(
        &self,
        account_id: &str,
        contact_id: &str,
    ) -> StorageResult<(Conversation, bool)> {
        let conn = self.conn.lock();
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations v WHERE v.account_id = ?1 AND v.contact_id = ?2",
                    CONVERSATION_COLUMNS
                ),
                params![account_id, contact_id],
                conversation_from_row,
            )
            .optional()?;

        if let Some(conversation) = existing {
            return Ok((conversation, false));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: new_id(),
            account_id: account_id.to_string(),
            contact_id: contact_id.to_string(),
            status: ConversationStatus::Open,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO conversations (id, account_id, contact_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                conversation.id,
                conversation.account_id,
                conversation.contact_id,
                conversation.status,
                now,
            ],
        )?;

        Ok((conversation, true))
    }

    pub fn get_conversation(&self, id: &str) -> StorageResult<Option<Conversation>> {
        let conn = self.conn.lock();
        let conversation = conn
            .query_row(
                &format!("SELECT {} FROM conversations v WHERE v.id = ?1", CONVERSATION_COLUMNS),
                [id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    /// Conversation on an account owned by `owner_id`
    pub fn get_owned_conversation(
        &self,
        id: &str,
        owner_id: i64,
    ) -> StorageResult<Option<Conversation>> {
        let conn = self.conn.lock();
        let conversation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations v
                     JOIN accounts a ON a.id = v.account_id
                     WHERE v.id = ?1 AND a.owner_id = ?2",
                    CONVERSATION_COLUMNS
                ),
                params![id, owner_id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    pub fn conversation_summary(&self, id: &str) -> StorageResult<Option<ConversationSummary>> {
        let conn = self.conn.lock();
        let summary = conn
            .query_row(
                &format!("{} WHERE v.id = ?1", SUMMARY_SELECT),
                [id],
                summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    /// Inbox listing for `owner_id`: most recent activity first, idle conversations last
    pub fn list_conversation_summaries(
        &self,
        owner_id: i64,
        filter: &ConversationFilter,
    ) -> StorageResult<Vec<ConversationSummary>> {
        let mut sql = format!("{} WHERE a.owner_id = ?", SUMMARY_SELECT);
        let mut args: Vec<SqlValue> = vec![owner_id.into()];

        if let Some(status) = filter.status {
            sql.push_str(" AND v.status = ?");
            args.push(status.as_str().to_string().into());
        }
        if let Some(account) = &filter.account {
            sql.push_str(" AND v.account_id = ?");
            args.push(account.clone().into());
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            sql.push_str(" AND (c.name LIKE ? ESCAPE '\\' OR c.phone_number LIKE ? ESCAPE '\\')");
            let pattern = like_pattern(search);
            args.push(pattern.clone().into());
            args.push(pattern.into());
        }
        sql.push_str(" ORDER BY v.last_message_at IS NULL, v.last_message_at DESC, v.rowid DESC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record activity on a conversation
    pub fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE conversations SET last_message_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, at, Utc::now()],
        )?;
        Ok(())
    }

    pub fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StorageResult<Option<Conversation>> {
        {
            let conn = self.conn.lock();
            let rows = conn.execute(
                "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status, Utc::now()],
            )?;
            if rows == 0 {
                return Ok(None);
            }
        }
        self.get_conversation(id)
    }

    pub fn delete_conversation(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }
}
