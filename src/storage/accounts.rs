//! WhatsApp Business accounts and their message templates

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params, params_from_iter, types::Value as SqlValue};

use super::models::{
    Account, AccountPatch, NewAccount, NewTemplate, Template, TemplateFilter, TemplatePatch,
    TemplateStatus,
};
use super::sqlite::{CrmStore, StorageResult, new_id};

const ACCOUNT_COLUMNS: &str = "id, owner_id, name, phone_number_id, business_account_id, \
     access_token, webhook_verify_token, status, created_at, updated_at";

const TEMPLATE_COLUMNS: &str = "t.id, t.account_id, t.name, t.language, t.category, t.status, \
     t.components, t.created_at, t.updated_at";

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        account: row.get(1)?,
        name: row.get(2)?,
        language: row.get(3)?,
        category: row.get(4)?,
        status: row.get(5)?,
        components: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl CrmStore {
    fn account_from_row(&self, row: &Row<'_>) -> rusqlite::Result<Account> {
        let access_token: String = row.get(5)?;
        let webhook_verify_token: String = row.get(6)?;
        Ok(Account {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            phone_number_id: row.get(3)?,
            business_account_id: row.get(4)?,
            access_token: self.unseal(&access_token),
            webhook_verify_token: self.unseal(&webhook_verify_token),
            status: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    pub fn insert_account(&self, new: NewAccount) -> StorageResult<Account> {
        let id = new_id();
        let now = Utc::now();
        let sealed_access = self.seal(&new.access_token)?;
        let sealed_verify = self.seal(&new.webhook_verify_token)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts
             (id, owner_id, name, phone_number_id, business_account_id,
              access_token, webhook_verify_token, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                new.owner_id,
                new.name,
                new.phone_number_id,
                new.business_account_id,
                sealed_access,
                sealed_verify,
                new.status,
                now,
            ],
        )?;

        Ok(Account {
            id,
            owner_id: new.owner_id,
            name: new.name,
            phone_number_id: new.phone_number_id,
            business_account_id: new.business_account_id,
            access_token: new.access_token,
            webhook_verify_token: new.webhook_verify_token,
            status: new.status,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_account(&self, id: &str) -> StorageResult<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                [id],
                |row| self.account_from_row(row),
            )
            .optional()?;
        Ok(account)
    }

    /// Account owned by `owner_id`, or `None` when missing or owned by someone else
    pub fn get_owned_account(&self, id: &str, owner_id: i64) -> StorageResult<Option<Account>> {
        Ok(self
            .get_account(id)?
            .filter(|account| account.owner_id == Some(owner_id)))
    }

    pub fn get_account_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> StorageResult<Option<Account>> {
        let conn = self.conn.lock();
        let account = conn
            .query_row(
                &format!(
                    "SELECT {} FROM accounts WHERE phone_number_id = ?1",
                    ACCOUNT_COLUMNS
                ),
                [phone_number_id],
                |row| self.account_from_row(row),
            )
            .optional()?;
        Ok(account)
    }

    pub fn list_accounts(&self, owner_id: i64) -> StorageResult<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts WHERE owner_id = ?1 ORDER BY name, rowid",
            ACCOUNT_COLUMNS
        ))?;
        let accounts = stmt
            .query_map([owner_id], |row| self.account_from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn update_account(&self, id: &str, patch: AccountPatch) -> StorageResult<Option<Account>> {
        let Some(mut account) = self.get_account(id)? else {
            return Ok(None);
        };

        if let Some(name) = patch.name {
            account.name = name;
        }
        if let Some(phone_number_id) = patch.phone_number_id {
            account.phone_number_id = phone_number_id;
        }
        if let Some(business_account_id) = patch.business_account_id {
            account.business_account_id = business_account_id;
        }
        if let Some(access_token) = patch.access_token {
            account.access_token = access_token;
        }
        if let Some(webhook_verify_token) = patch.webhook_verify_token {
            account.webhook_verify_token = webhook_verify_token;
        }
        if let Some(status) = patch.status {
            account.status = status;
        }
        account.updated_at = Utc::now();

        let sealed_access = self.seal(&account.access_token)?;
        let sealed_verify = self.seal(&account.webhook_verify_token)?;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE accounts SET name = ?2, phone_number_id = ?3, business_account_id = ?4,
                access_token = ?5, webhook_verify_token = ?6, status = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                account.id,
                account.name,
                account.phone_number_id,
                account.business_account_id,
                sealed_access,
                sealed_verify,
                account.status,
                account.updated_at,
            ],
        )?;

        Ok(Some(account))
    }

    /// Delete an account and everything hanging off it
    pub fn delete_account(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM accounts WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn insert_template(&self, new: NewTemplate) -> StorageResult<Template> {
        let id = new_id();
        let now = Utc::now();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO templates
             (id, account_id, name, language, category, status, components, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                new.account_id,
                new.name,
                new.language,
                new.category,
                new.status,
                new.components,
                now,
            ],
        )?;

        Ok(Template {
            id,
            account: new.account_id,
            name: new.name,
            language: new.language,
            category: new.category,
            status: new.status,
            components: new.components,
            created_at: now,
            updated_at: now,
        })
    }

    /// Insert or refresh a template keyed on `(account, name, language)`.
    ///
    /// Returns the stored template and whether it was newly created.
    pub fn upsert_template(&self, new: NewTemplate) -> StorageResult<(Template, bool)> {
        let existing = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "SELECT {} FROM templates t
                     WHERE t.account_id = ?1 AND t.name = ?2 AND t.language = ?3",
                    TEMPLATE_COLUMNS
                ),
                params![new.account_id, new.name, new.language],
                template_from_row,
            )
            .optional()?
        };

        match existing {
            Some(template) => {
                let patch = TemplatePatch {
                    category: Some(new.category),
                    status: Some(new.status),
                    components: Some(new.components),
                    ..Default::default()
                };
                let updated = self.update_template(&template.id, patch)?.unwrap_or(template);
                Ok((updated, false))
            }
            None => Ok((self.insert_template(new)?, true)),
        }
    }

    pub fn get_template(&self, id: &str) -> StorageResult<Option<Template>> {
        let conn = self.conn.lock();
        let template = conn
            .query_row(
                &format!("SELECT {} FROM templates t WHERE t.id = ?1", TEMPLATE_COLUMNS),
                [id],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    /// Template visible to `owner_id` together with its account name
    pub fn get_owned_template(
        &self,
        id: &str,
        owner_id: i64,
    ) -> StorageResult<Option<(Template, String)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {}, a.name FROM templates t
                     JOIN accounts a ON a.id = t.account_id
                     WHERE t.id = ?1 AND a.owner_id = ?2",
                    TEMPLATE_COLUMNS
                ),
                params![id, owner_id],
                |row| Ok((template_from_row(row)?, row.get::<_, String>(9)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Templates of the owner's accounts, with account names
    pub fn list_templates(
        &self,
        owner_id: i64,
        filter: &TemplateFilter,
    ) -> StorageResult<Vec<(Template, String)>> {
        let mut sql = format!(
            "SELECT {}, a.name FROM templates t
             JOIN accounts a ON a.id = t.account_id
             WHERE a.owner_id = ?",
            TEMPLATE_COLUMNS
        );
        let mut args: Vec<SqlValue> = vec![owner_id.into()];

        if let Some(account) = &filter.account {
            sql.push_str(" AND t.account_id = ?");
            args.push(account.clone().into());
        }
        if let Some(category) = filter.category {
            sql.push_str(" AND t.category = ?");
            args.push(category.as_str().to_string().into());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND t.status = ?");
            args.push(status.as_str().to_string().into());
        }
        if let Some(language) = &filter.language {
            sql.push_str(" AND t.language = ?");
            args.push(language.clone().into());
        }
        sql.push_str(" ORDER BY t.name, t.language");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((template_from_row(row)?, row.get::<_, String>(9)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Approved template matching name and language on an account
    pub fn find_approved_template(
        &self,
        account_id: &str,
        name: &str,
        language: &str,
    ) -> StorageResult<Option<Template>> {
        let conn = self.conn.lock();
        let template = conn
            .query_row(
                &format!(
                    "SELECT {} FROM templates t
                     WHERE t.account_id = ?1 AND t.name = ?2 AND t.language = ?3 AND t.status = ?4",
                    TEMPLATE_COLUMNS
                ),
                params![account_id, name, language, TemplateStatus::Approved],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    pub fn update_template(
        &self,
        id: &str,
        patch: TemplatePatch,
    ) -> StorageResult<Option<Template>> {
        let Some(mut template) = self.get_template(id)? else {
            return Ok(None);
        };

        if let Some(name) = patch.name {
            template.name = name;
        }
        if let Some(language) = patch.language {
            template.language = language;
        }
        if let Some(category) = patch.category {
            template.category = category;
        }
        if let Some(status) = patch.status {
            template.status = status;
        }
        if let Some(components) = patch.components {
            template.components = components;
        }
        template.updated_at = Utc::now();

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE templates SET name = ?2, language = ?3, category = ?4, status = ?5,
                components = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                template.id,
                template.name,
                template.language,
                template.category,
                template.status,
                template.components,
                template.updated_at,
            ],
        )?;

        Ok(Some(template))
    }

    pub fn delete_template(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM templates WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }
}
