//! AI auto-responder configuration

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params, params_from_iter, types::Value as SqlValue};

use super::models::{AiConfig, AiConfigFilter, AiConfigPatch, NewAiConfig};
use super::sqlite::{CrmStore, StorageResult, new_id};

const AI_CONFIG_COLUMNS: &str = "g.id, g.account_id, g.enabled, g.provider, g.api_key, \
     g.system_prompt, g.max_history_messages, g.created_at, g.updated_at";

impl CrmStore {
    fn ai_config_from_row(&self, row: &Row<'_>) -> rusqlite::Result<AiConfig> {
        let api_key: String = row.get(4)?;
        Ok(AiConfig {
            id: row.get(0)?,
            account_id: row.get(1)?,
            enabled: row.get(2)?,
            provider: row.get(3)?,
            api_key: self.unseal(&api_key),
            system_prompt: row.get(5)?,
            max_history_messages: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    pub fn insert_ai_config(&self, new: NewAiConfig) -> StorageResult<AiConfig> {
        let id = new_id();
        let now = Utc::now();
        let sealed_key = self.seal(&new.api_key)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_configs
             (id, account_id, enabled, provider, api_key, system_prompt, max_history_messages,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                new.account_id,
                new.enabled,
                new.provider,
                sealed_key,
                new.system_prompt,
                new.max_history_messages,
                now,
            ],
        )?;

        Ok(AiConfig {
            id,
            account_id: new.account_id,
            enabled: new.enabled,
            provider: new.provider,
            api_key: new.api_key,
            system_prompt: new.system_prompt,
            max_history_messages: new.max_history_messages,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_ai_config(&self, id: &str) -> StorageResult<Option<AiConfig>> {
        let conn = self.conn.lock();
        let config = conn
            .query_row(
                &format!("SELECT {} FROM ai_configs g WHERE g.id = ?1", AI_CONFIG_COLUMNS),
                [id],
                |row| self.ai_config_from_row(row),
            )
            .optional()?;
        Ok(config)
    }

    pub fn get_ai_config_for_account(&self, account_id: &str) -> StorageResult<Option<AiConfig>> {
        let conn = self.conn.lock();
        let config = conn
            .query_row(
                &format!(
                    "SELECT {} FROM ai_configs g WHERE g.account_id = ?1",
                    AI_CONFIG_COLUMNS
                ),
                [account_id],
                |row| self.ai_config_from_row(row),
            )
            .optional()?;
        Ok(config)
    }

    /// Config on an account owned by `owner_id`, with the account name
    pub fn get_owned_ai_config(
        &self,
        id: &str,
        owner_id: i64,
    ) -> StorageResult<Option<(AiConfig, String)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {}, a.name FROM ai_configs g
                     JOIN accounts a ON a.id = g.account_id
                     WHERE g.id = ?1 AND a.owner_id = ?2",
                    AI_CONFIG_COLUMNS
                ),
                params![id, owner_id],
                |row| Ok((self.ai_config_from_row(row)?, row.get::<_, String>(9)?)),
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_ai_configs(
        &self,
        owner_id: i64,
        filter: &AiConfigFilter,
    ) -> StorageResult<Vec<(AiConfig, String)>> {
        let mut sql = format!(
            "SELECT {}, a.name FROM ai_configs g
             JOIN accounts a ON a.id = g.account_id
             WHERE a.owner_id = ?",
            AI_CONFIG_COLUMNS
        );
        let mut args: Vec<SqlValue> = vec![owner_id.into()];

        if let Some(account) = &filter.account {
            sql.push_str(" AND g.account_id = ?");
            args.push(account.clone().into());
        }
        if let Some(enabled) = filter.enabled {
            sql.push_str(" AND g.enabled = ?");
            args.push(enabled.into());
        }
        if let Some(provider) = filter.provider {
            sql.push_str(" AND g.provider = ?");
            args.push(provider.as_str().to_string().into());
        }
        sql.push_str(" ORDER BY a.name, g.rowid");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((self.ai_config_from_row(row)?, row.get::<_, String>(9)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_ai_config(
        &self,
        id: &str,
        patch: AiConfigPatch,
    ) -> StorageResult<Option<AiConfig>> {
        let Some(mut config) = self.get_ai_config(id)? else {
            return Ok(None);
        };

        if let Some(account) = patch.account {
            config.account_id = account;
        }
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        if let Some(provider) = patch.provider {
            config.provider = provider;
        }
        if let Some(api_key) = patch.api_key {
            config.api_key = api_key;
        }
        if let Some(system_prompt) = patch.system_prompt {
            config.system_prompt = system_prompt;
        }
        if let Some(max_history_messages) = patch.max_history_messages {
            config.max_history_messages = max_history_messages;
        }
        config.updated_at = Utc::now();

        let sealed_key = self.seal(&config.api_key)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE ai_configs SET account_id = ?2, enabled = ?3, provider = ?4, api_key = ?5,
                system_prompt = ?6, max_history_messages = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                config.id,
                config.account_id,
                config.enabled,
                config.provider,
                sealed_key,
                config.system_prompt,
                config.max_history_messages,
                config.updated_at,
            ],
        )?;

        Ok(Some(config))
    }

    pub fn delete_ai_config(&self, id: &str) -> StorageResult<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM ai_configs WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::models::AiProviderKind;
    use super::super::sqlite::test_support::*;
    use super::*;

    fn new_config(account_id: &str, enabled: bool) -> NewAiConfig {
        NewAiConfig {
            account_id: account_id.to_string(),
            enabled,
            provider: AiProviderKind::Gemini,
            api_key: "AIza-secret".to_string(),
            system_prompt: "Eres un asistente".to_string(),
            max_history_messages: 10,
        }
    }

    #[test]
    fn test_one_config_per_account() {
        let store = store();
        let account = account(&store, None, "1001");
        store.insert_ai_config(new_config(&account.id, true)).unwrap();

        let err = store
            .insert_ai_config(new_config(&account.id, false))
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_api_key_roundtrip_and_filters() {
        let store = store();
        let ana = user(&store, "ana");
        let a1 = account(&store, Some(ana.id), "1001");
        let a2 = account(&store, Some(ana.id), "1002");
        store.insert_ai_config(new_config(&a1.id, true)).unwrap();
        store.insert_ai_config(new_config(&a2.id, false)).unwrap();

        let cfg = store.get_ai_config_for_account(&a1.id).unwrap().unwrap();
        assert_eq!(cfg.api_key, "AIza-secret");

        let enabled = store
            .list_ai_configs(
                ana.id,
                &AiConfigFilter {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].1, "Account 1001");
    }

    #[test]
    fn test_update_keeps_key_when_absent() {
        let store = store();
        let account = account(&store, None, "1001");
        let cfg = store.insert_ai_config(new_config(&account.id, false)).unwrap();

        let updated = store
            .update_ai_config(
                &cfg.id,
                AiConfigPatch {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(updated.enabled);
        assert_eq!(updated.api_key, "AIza-secret");

        let reloaded = store.get_ai_config(&cfg.id).unwrap().unwrap();
        assert!(reloaded.enabled);
        assert_eq!(reloaded.api_key, "AIza-secret");
    }
}
