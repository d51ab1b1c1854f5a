//! Contacts

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params, params_from_iter, types::Value as SqlValue};
use serde_json::json;

use super::models::{Contact, ContactFilter, ContactListing, ContactPatch, NewContact};
use super::sqlite::{CrmStore, StorageResult, like_pattern, new_id, placeholders};

const CONTACT_COLUMNS: &str = "c.id, c.account_id, c.phone_number, c.name, c.profile_picture_url, \
     c.metadata, c.created_at, c.updated_at";

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        account: row.get(1)?,
        phone_number: row.get(2)?,
        name: row.get(3)?,
        profile_picture_url: row.get(4)?,
        metadata: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<ContactListing> {
    Ok(ContactListing {
        contact: contact_from_row(row)?,
        account_name: row.get(8)?,
        conversations_count: row.get(9)?,
    })
}

impl CrmStore {
    pub fn insert_contact(&self, new: NewContact) -> StorageResult<Contact> {
        let id = new_id();
        let now = Utc::now();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO contacts
             (id, account_id, phone_number, name, profile_picture_url, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                new.account_id,
                new.phone_number,
                new.name,
                new.profile_picture_url,
                new.metadata,
                now,
            ],
        )?;

        Ok(Contact {
            id,
            account: new.account_id,
            phone_number: new.phone_number,
            name: new.name,
            profile_picture_url: new.profile_picture_url,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// Contact for `(account, phone)`, created with `default_name` if missing.
    ///
    /// Returns the contact and whether it was created.
    pub fn get_or_create_contact(
        &self,
        account_id: &str,
        phone_number: &str,
        default_name: &str,
    ) -> StorageResult<(Contact, bool)> {
        let conn = self.conn.lock();
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO contacts
             (id, account_id, phone_number, name, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![new_id(), account_id, phone_number, default_name, json!({}), now],
        )?;

        let contact = conn.query_row(
            &format!(
                "SELECT {} FROM contacts c WHERE c.account_id = ?1 AND c.phone_number = ?2",
                CONTACT_COLUMNS
            ),
            params![account_id, phone_number],
            contact_from_row,
        )?;
        Ok((contact, inserted > 0))
    }

    pub fn get_contact(&self, id: &str) -> StorageResult<Option<Contact>> {
        let conn = self.conn.lock();
        let contact = conn
            .query_row(
                &format!("SELECT {} FROM contacts c WHERE c.id = ?1", CONTACT_COLUMNS),
                [id],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// Contact listing row, visible only through an account `owner_id` owns
    pub fn get_contact_listing(
        &self,
        id: &str,
        owner_id: i64,
    ) -> StorageResult<Option<ContactListing>> {
        let conn = self.conn.lock();
        let listing = conn
            .query_row(
                &format!(
                    "SELECT {}, a.name,
                        (SELECT COUNT(*) FROM conversations v WHERE v.contact_id = c.id)
                     FROM contacts c
                     JOIN accounts a ON a.id = c.account_id
                     WHERE c.id = ?1 AND a.owner_id = ?2",
                    CONTACT_COLUMNS
                ),
                params![id, owner_id],
                listing_from_row,
            )
            .optional()?;
        Ok(listing)
    }

    /// Contacts of the owner's accounts, newest first
    pub fn list_contacts(
        &self,
        owner_id: i64,
        filter: &ContactFilter,
    ) -> StorageResult<Vec<ContactListing>> {
        let mut sql = format!(
            "SELECT {}, a.name,
                (SELECT COUNT(*) FROM conversations v WHERE v.contact_id = c.id)
             FROM contacts c
             JOIN accounts a ON a.id = c.account_id
             WHERE a.owner_id = ?",
            CONTACT_COLUMNS
        );
        let mut args: Vec<SqlValue> = vec![owner_id.into()];

        if let Some(account) = &filter.account {
            sql.push_str(" AND c.account_id = ?");
            args.push(account.clone().into());
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            sql.push_str(" AND (c.name LIKE ? ESCAPE '\\' OR c.phone_number LIKE ? ESCAPE '\\')");
            let pattern = like_pattern(search);
            args.push(pattern.clone().into());
            args.push(pattern.into());
        }
        sql.push_str(" ORDER BY c.created_at DESC, c.rowid DESC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), listing_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Contacts among `ids`; restricted to accounts of `owner_id` when given
    pub fn contacts_by_ids(
        &self,
        ids: &[String],
        owner_id: Option<i64>,
    ) -> StorageResult<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {} FROM contacts c
             JOIN accounts a ON a.id = c.account_id
             WHERE c.id IN ({})",
            CONTACT_COLUMNS,
            placeholders(ids.len())
        );
        let mut args: Vec<SqlValue> = ids.iter().cloned().map(SqlValue::from).collect();
        if let Some(owner_id) = owner_id {
            sql.push_str(" AND a.owner_id = ?");
            args.push(owner_id.into());
        }
        sql.push_str(" ORDER BY c.created_at, c.rowid");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), contact_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_contact(&self, id: &str, patch: ContactPatch) -> StorageResult<Option<Contact>> {
        let Some(mut contact) = self.get_contact(id)? else {
            return Ok(None);
        };

        if let Some(phone_number) = patch.phone_number {
            contact.phone_number = phone_number;
        }
        if let Some(name) = patch.name {
            contact.name = name;
        }
        if let Some(profile_picture_url) = patch.profile_picture_url {
            contact.profile_picture_url = Some(profile_picture_url);
        }
        if let Some(metadata) = patch.metadata {
            contact.metadata = metadata;
        }
        contact.updated_at = Utc::now();

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE contacts SET phone_number = ?2, name = ?3, profile_picture_url = ?4,
                metadata = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                contact.id,
                contact.phone_number,
                contact.name,
                contact.profile_picture_url,
                contact.metadata,
                contact.updated_at,
            ],
        )?;

        Ok(Some(contact))
    }

    pub fn delete_contact(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM contacts WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    /// Delete contacts among `ids`; restricted to accounts of `owner_id` when given
    pub fn delete_contacts(&self, ids: &[String], owner_id: Option<i64>) -> StorageResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut sql = format!(
            "DELETE FROM contacts WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut args: Vec<SqlValue> = ids.iter().cloned().map(SqlValue::from).collect();
        if let Some(owner_id) = owner_id {
            sql.push_str(" AND account_id IN (SELECT id FROM accounts WHERE owner_id = ?)");
            args.push(owner_id.into());
        }

        let conn = self.conn.lock();
        let rows = conn.execute(&sql, params_from_iter(args))?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite::test_support::*;
    use super::*;

    #[test]
    fn test_get_or_create_contact_is_idempotent() {
        let store = store();
        let account = account(&store, None, "1001");

        let (first, created) = store
            .get_or_create_contact(&account.id, "34600111222", "Ana")
            .unwrap();
        assert!(created);
        assert_eq!(first.name, "Ana");

        let (second, created) = store
            .get_or_create_contact(&account.id, "34600111222", "Other")
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Ana");
    }

    #[test]
    fn test_list_contacts_search_and_counts() {
        let store = store();
        let ana = user(&store, "ana");
        let account = account(&store, Some(ana.id), "1001");

        store
            .get_or_create_contact(&account.id, "34600111222", "Lucia Perez")
            .unwrap();
        let (contact, _) = conversation(&store, &account, "34600999888");

        let all = store.list_contacts(ana.id, &ContactFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        // newest first
        assert_eq!(all[0].contact.id, contact.id);
        assert_eq!(all[0].conversations_count, 1);
        assert_eq!(all[1].conversations_count, 0);
        assert_eq!(all[0].account_name, "Account 1001");

        let by_name = store
            .list_contacts(
                ana.id,
                &ContactFilter {
                    search: Some("lucia".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_name.len(), 1);

        let by_phone = store
            .list_contacts(
                ana.id,
                &ContactFilter {
                    search: Some("999".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_phone.len(), 1);

        let wildcard = store
            .list_contacts(
                ana.id,
                &ContactFilter {
                    search: Some("%".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(wildcard.is_empty());
    }

    #[test]
    fn test_contacts_scoped_to_owner() {
        let store = store();
        let ana = user(&store, "ana");
        let bob = user(&store, "bob");
        let account = account(&store, Some(ana.id), "1001");
        let (contact, _) = store
            .get_or_create_contact(&account.id, "34600111222", "Lucia")
            .unwrap();

        assert!(store.list_contacts(bob.id, &ContactFilter::default()).unwrap().is_empty());
        assert!(store.get_contact_listing(&contact.id, bob.id).unwrap().is_none());
        assert!(store.get_contact_listing(&contact.id, ana.id).unwrap().is_some());

        let ids = vec![contact.id.clone()];
        assert!(store.contacts_by_ids(&ids, Some(bob.id)).unwrap().is_empty());
        assert_eq!(store.delete_contacts(&ids, Some(bob.id)).unwrap(), 0);
        assert_eq!(store.delete_contacts(&ids, Some(ana.id)).unwrap(), 1);
    }

    #[test]
    fn test_delete_contact_cascades_conversations() {
        let store = store();
        let account = account(&store, None, "1001");
        let (contact, conversation) = conversation(&store, &account, "34600111222");

        assert!(store.delete_contact(&contact.id).unwrap());
        assert!(store.get_conversation(&conversation.id).unwrap().is_none());
    }

    #[test]
    fn test_update_contact() {
        let store = store();
        let account = account(&store, None, "1001");
        let (contact, _) = store
            .get_or_create_contact(&account.id, "34600111222", "34600111222")
            .unwrap();

        let updated = store
            .update_contact(
                &contact.id,
                ContactPatch {
                    name: Some("Lucia".into()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Lucia");
        assert_eq!(updated.phone_number, "34600111222");
    }
}
