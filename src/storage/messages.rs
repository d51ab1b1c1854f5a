//! Messages

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Value as SqlValue};
use serde_json::Value;

use super::models::{DeliveryStatus, Direction, Message, MessageType, NewMessage};
use super::sqlite::{CrmStore, StorageResult, new_id};

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.whatsapp_id, m.direction, \
     m.message_type, m.body, m.media_url, m.metadata, m.delivery_status, m.created_at, m.updated_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        whatsapp_id: row.get(2)?,
        direction: row.get(3)?,
        message_type: row.get(4)?,
        body: row.get(5)?,
        media_url: row.get(6)?,
        metadata: row.get(7)?,
        delivery_status: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn load_message(conn: &Connection, id: &str) -> rusqlite::Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS),
        [id],
        message_from_row,
    )
    .optional()
}

/// Shallow-merge `extra` object keys into `metadata`
fn merge_metadata(metadata: &mut Value, extra: Value) {
    let Value::Object(extra) = extra else {
        return;
    };
    if !metadata.is_object() {
        *metadata = Value::Object(Default::default());
    }
    if let Some(target) = metadata.as_object_mut() {
        target.extend(extra);
    }
}

/// Result of applying a delivery status to a stored message
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub message: Message,
    /// False when the update would have regressed the status and was ignored
    pub applied: bool,
}

impl CrmStore {
    /// Insert a message unless its `whatsapp_id` is already stored.
    ///
    /// Returns `None` for duplicates.
    pub fn insert_message(&self, new: NewMessage) -> StorageResult<Option<Message>> {
        let id = new_id();
        let now = Utc::now();

        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO messages
             (id, conversation_id, whatsapp_id, direction, message_type, body, media_url,
              metadata, delivery_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                new.conversation_id,
                new.whatsapp_id,
                new.direction,
                new.message_type,
                new.body,
                new.media_url,
                new.metadata,
                new.delivery_status,
                now,
            ],
        )?;

        if rows == 0 {
            return Ok(None);
        }

        Ok(Some(Message {
            id,
            conversation_id: new.conversation_id,
            whatsapp_id: new.whatsapp_id,
            direction: new.direction,
            message_type: new.message_type,
            body: new.body,
            media_url: new.media_url,
            metadata: new.metadata,
            delivery_status: new.delivery_status,
            created_at: now,
            updated_at: now,
        }))
    }

    pub fn get_message(&self, id: &str) -> StorageResult<Option<Message>> {
        let conn = self.conn.lock();
        Ok(load_message(&conn, id)?)
    }

    pub fn get_message_by_whatsapp_id(&self, whatsapp_id: &str) -> StorageResult<Option<Message>> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                &format!("SELECT {} FROM messages m WHERE m.whatsapp_id = ?1", MESSAGE_COLUMNS),
                [whatsapp_id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Message in a conversation on an account owned by `owner_id`
    pub fn get_owned_message(&self, id: &str, owner_id: i64) -> StorageResult<Option<Message>> {
        let conn = self.conn.lock();
        let message = conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages m
                     JOIN conversations v ON v.id = m.conversation_id
                     JOIN accounts a ON a.id = v.account_id
                     WHERE m.id = ?1 AND a.owner_id = ?2",
                    MESSAGE_COLUMNS
                ),
                params![id, owner_id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// One page of the owner's messages, newest first, with the total count.
    ///
    /// `page` is 1-based.
    pub fn list_messages(
        &self,
        owner_id: i64,
        conversation_id: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> StorageResult<(Vec<Message>, i64)> {
        let mut where_clause = String::from(
            "FROM messages m
             JOIN conversations v ON v.id = m.conversation_id
             JOIN accounts a ON a.id = v.account_id
             WHERE a.owner_id = ?",
        );
        let mut args: Vec<SqlValue> = vec![owner_id.into()];
        if let Some(conversation_id) = conversation_id {
            where_clause.push_str(" AND m.conversation_id = ?");
            args.push(conversation_id.to_string().into());
        }

        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) {}", where_clause),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        args.push(i64::from(page_size).into());
        args.push(offset.into());

        let mut stmt = conn.prepare(&format!(
            "SELECT {} {} ORDER BY m.created_at DESC, m.rowid DESC LIMIT ? OFFSET ?",
            MESSAGE_COLUMNS, where_clause
        ))?;
        let messages = stmt
            .query_map(params_from_iter(args), message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((messages, total))
    }

    /// All messages of a conversation in chronological order
    pub fn conversation_messages(&self, conversation_id: &str) -> StorageResult<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages m WHERE m.conversation_id = ?1
             ORDER BY m.created_at, m.rowid",
            MESSAGE_COLUMNS
        ))?;
        let messages = stmt
            .query_map([conversation_id], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Last `limit` text messages with a body, oldest first
    pub fn recent_text_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> StorageResult<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages m
             WHERE m.conversation_id = ?1 AND m.message_type = ?2
               AND m.body IS NOT NULL AND m.body != ''
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?3",
            MESSAGE_COLUMNS
        ))?;
        let mut messages = stmt
            .query_map(
                params![conversation_id, MessageType::Text, i64::from(limit)],
                message_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Apply a delivery status, refusing regressions.
    ///
    /// `extra` object keys are merged into the metadata when the status is
    /// applied. Returns `None` when the message does not exist.
    pub fn update_delivery_status(
        &self,
        id: &str,
        status: DeliveryStatus,
        extra: Option<Value>,
    ) -> StorageResult<Option<StatusChange>> {
        let conn = self.conn.lock();
        let Some(mut message) = load_message(&conn, id)? else {
            return Ok(None);
        };

        if !message.delivery_status.can_transition_to(status) {
            return Ok(Some(StatusChange {
                message,
                applied: false,
            }));
        }

        message.delivery_status = status;
        if let Some(extra) = extra {
            merge_metadata(&mut message.metadata, extra);
        }
        message.updated_at = Utc::now();

        conn.execute(
            "UPDATE messages SET delivery_status = ?2, metadata = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                message.id,
                message.delivery_status,
                message.metadata,
                message.updated_at
            ],
        )?;

        Ok(Some(StatusChange {
            message,
            applied: true,
        }))
    }

    /// Replace the local placeholder id with Meta's wamid after a successful send
    pub fn mark_sent(&self, id: &str, whatsapp_id: &str) -> StorageResult<Option<Message>> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE messages SET whatsapp_id = ?2, delivery_status = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, whatsapp_id, DeliveryStatus::Sent, Utc::now()],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(load_message(&conn, id)?)
    }

    /// Set the stored media URL (after a format conversion)
    pub fn set_message_media_url(&self, id: &str, media_url: &str) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE messages SET media_url = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, media_url, Utc::now()],
        )?;
        Ok(())
    }

    /// Mark unread incoming messages of a conversation as read
    pub fn mark_conversation_read(&self, conversation_id: &str) -> StorageResult<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE messages SET delivery_status = ?2, updated_at = ?3
             WHERE conversation_id = ?1 AND direction = ?4 AND delivery_status IN (?5, ?6)",
            params![
                conversation_id,
                DeliveryStatus::Read,
                Utc::now(),
                Direction::Incoming,
                DeliveryStatus::Sent,
                DeliveryStatus::Delivered,
            ],
        )?;
        Ok(rows)
    }

    /// Media URLs referenced by a conversation's messages
    pub fn media_urls_for_conversation(&self, conversation_id: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT media_url FROM messages
             WHERE conversation_id = ?1 AND media_url IS NOT NULL AND media_url != ''",
        )?;
        let urls = stmt
            .query_map([conversation_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(urls)
    }

    pub fn delete_message(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }
}
