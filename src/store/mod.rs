pub mod crypto;
mod semantic_cache;

pub use semantic_cache::{prompt_hash, CacheEntry};

use crate::error::{AppError, AppResult};
use crate::models::{Account, AccountStatus, Provider, QuotaData, TokenData};
use crypto::{looks_plaintext, CipherBox, MasterKeySource};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    email TEXT NOT NULL,
    name TEXT,
    avatar_url TEXT,
    token TEXT NOT NULL,
    quota TEXT,
    selected_models TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_used INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_accounts_last_used ON accounts(last_used);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS semantic_cache (
    id TEXT NOT NULL,
    prompt_hash TEXT NOT NULL,
    prompt_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    response_text TEXT NOT NULL,
    model TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (id, prompt_hash)
);
CREATE INDEX IF NOT EXISTS idx_cache_prompt_hash ON semantic_cache(prompt_hash);
"#;

/// Durable, encrypted-at-rest store for accounts, settings, and the semantic
/// cache. One writer at a time behind the connection mutex; the active-flag
/// invariant is maintained transactionally.
pub struct AccountStore {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) cipher: CipherBox,
}

impl AccountStore {
    pub fn open(path: &Path, key_source: &dyn MasterKeySource) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: CipherBox::new(key_source)?,
        })
    }

    pub fn open_in_memory(key_source: &dyn MasterKeySource) -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher: CipherBox::new(key_source)?,
        })
    }

    /// Ensure the schema and re-encrypt any row whose secret columns leaked as
    /// plaintext JSON. Safe to call more than once.
    pub fn init(&self) -> AppResult<()> {
        let mut conn = self.lock();
        conn.execute_batch(SCHEMA)?;

        let tx = conn.transaction()?;
        let mut healed = 0usize;
        {
            let mut stmt = tx.prepare("SELECT id, token, quota FROM accounts")?;
            let rows: Vec<(String, String, Option<String>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<_, _>>()?;

            for (id, token, quota) in rows {
                if looks_plaintext(&token) {
                    let sealed = self.cipher.encrypt(&token)?;
                    tx.execute("UPDATE accounts SET token = ?1 WHERE id = ?2", params![sealed, id])?;
                    healed += 1;
                }
                if let Some(q) = quota {
                    if looks_plaintext(&q) {
                        let sealed = self.cipher.encrypt(&q)?;
                        tx.execute("UPDATE accounts SET quota = ?1 WHERE id = ?2", params![sealed, id])?;
                    }
                }
            }
        }
        tx.commit()?;

        if healed > 0 {
            info!("Re-encrypted {} plaintext account rows", healed);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, account: &Account) -> AppResult<()> {
        let token_json = serde_json::to_string(&account.token)
            .map_err(|e| AppError::Protocol(format!("unserializable token: {}", e)))?;
        let sealed_token = self.cipher.encrypt(&token_json)?;
        let sealed_quota = match &account.quota {
            Some(q) => {
                let json = serde_json::to_string(q)
                    .map_err(|e| AppError::Protocol(format!("unserializable quota: {}", e)))?;
                Some(self.cipher.encrypt(&json)?)
            }
            None => None,
        };
        let selected = serde_json::to_string(&account.selected_models)
            .map_err(|e| AppError::Protocol(format!("unserializable model list: {}", e)))?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if account.is_active {
            tx.execute("UPDATE accounts SET is_active = 0", [])?;
        }
        tx.execute(
            "INSERT INTO accounts (id, provider, email, name, avatar_url, token, quota,
                                   selected_models, status, is_active, created_at, last_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                 provider = excluded.provider,
                 email = excluded.email,
                 name = excluded.name,
                 avatar_url = excluded.avatar_url,
                 token = excluded.token,
                 quota = excluded.quota,
                 selected_models = excluded.selected_models,
                 status = excluded.status,
                 is_active = excluded.is_active,
                 last_used = excluded.last_used",
            params![
                account.id,
                account.provider.as_str(),
                account.email,
                account.name,
                account.avatar_url,
                sealed_token,
                sealed_quota,
                selected,
                account.status.as_str(),
                account.is_active as i64,
                account.created_at,
                account.last_used,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list(&self) -> AppResult<Vec<Account>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, provider, email, name, avatar_url, token, quota,
                    selected_models, status, is_active, created_at, last_used
             FROM accounts ORDER BY last_used DESC",
        )?;
        let rows: Vec<RawAccountRow> = stmt
            .query_map([], raw_account_row)?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match self.decode_account(row) {
                Ok(account) => accounts.push(account),
                // One poisoned row must not take the whole store down.
                Err(e) => warn!("[W-STORE-ROW-SKIPPED] account {} unreadable: {}", id, e),
            }
        }
        Ok(accounts)
    }

    pub fn get(&self, id: &str) -> AppResult<Option<Account>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, provider, email, name, avatar_url, token, quota,
                        selected_models, status, is_active, created_at, last_used
                 FROM accounts WHERE id = ?1",
                params![id],
                raw_account_row,
            )
            .optional()?;
        drop(conn);
        row.map(|r| self.decode_account(r)).transpose()
    }

    pub fn remove(&self, id: &str) -> AppResult<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Refresh only moves expiry forward; a regressing update is rejected.
    pub fn update_token(&self, id: &str, token: &TokenData) -> AppResult<()> {
        let current = self
            .get(id)?
            .ok_or_else(|| AppError::Protocol(format!("unknown account {}", id)))?;
        if token.expiry_timestamp < current.token.expiry_timestamp {
            return Err(AppError::Protocol(
                "token expiry_timestamp may not move backwards".to_string(),
            ));
        }

        let json = serde_json::to_string(token)
            .map_err(|e| AppError::Protocol(format!("unserializable token: {}", e)))?;
        let sealed = self.cipher.encrypt(&json)?;
        let conn = self.lock();
        conn.execute("UPDATE accounts SET token = ?1 WHERE id = ?2", params![sealed, id])?;
        Ok(())
    }

    pub fn update_quota(&self, id: &str, quota: &QuotaData) -> AppResult<()> {
        let json = serde_json::to_string(quota)
            .map_err(|e| AppError::Protocol(format!("unserializable quota: {}", e)))?;
        let sealed = self.cipher.encrypt(&json)?;
        let conn = self.lock();
        conn.execute("UPDATE accounts SET quota = ?1 WHERE id = ?2", params![sealed, id])?;
        Ok(())
    }

    pub fn update_selected_models(&self, id: &str, models: &[String]) -> AppResult<()> {
        let json = serde_json::to_string(models)
            .map_err(|e| AppError::Protocol(format!("unserializable model list: {}", e)))?;
        let conn = self.lock();
        conn.execute(
            "UPDATE accounts SET selected_models = ?1 WHERE id = ?2",
            params![json, id],
        )?;
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: AccountStatus) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE accounts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn update_last_used(&self, id: &str) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE accounts SET last_used = ?1 WHERE id = ?2",
            params![chrono::Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    /// Demote all accounts and promote `id` in one transaction.
    pub fn set_active(&self, id: &str) -> AppResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE accounts SET is_active = 0", [])?;
        let updated = tx.execute("UPDATE accounts SET is_active = 1 WHERE id = ?1", params![id])?;
        if updated == 0 {
            return Err(AppError::Protocol(format!("unknown account {}", id)));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str, default: serde_json::Value) -> AppResult<serde_json::Value> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            Some(s) => Ok(serde_json::from_str(&s).unwrap_or(default)),
            None => Ok(default),
        }
    }

    pub fn set_setting(&self, key: &str, value: &serde_json::Value) -> AppResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    fn decode_account(&self, row: RawAccountRow) -> AppResult<Account> {
        let token_json = self.cipher.decrypt(&row.token)?;
        let token: TokenData = serde_json::from_str(&token_json)
            .map_err(|e| AppError::Decrypt(format!("token payload malformed: {}", e)))?;
        let quota = match row.quota {
            Some(sealed) => {
                let json = self.cipher.decrypt(&sealed)?;
                Some(
                    serde_json::from_str(&json)
                        .map_err(|e| AppError::Decrypt(format!("quota payload malformed: {}", e)))?,
                )
            }
            None => None,
        };
        let selected_models: Vec<String> = row
            .selected_models
            .as_deref()
            .map(|s| serde_json::from_str(s).unwrap_or_default())
            .unwrap_or_default();

        Ok(Account {
            id: row.id,
            provider: Provider::from(row.provider),
            email: row.email,
            name: row.name,
            avatar_url: row.avatar_url,
            token,
            quota,
            created_at: row.created_at,
            last_used: row.last_used,
            status: AccountStatus::parse(&row.status),
            is_active: row.is_active != 0,
            selected_models,
        })
    }
}

struct RawAccountRow {
    id: String,
    provider: String,
    email: String,
    name: Option<String>,
    avatar_url: Option<String>,
    token: String,
    quota: Option<String>,
    selected_models: Option<String>,
    status: String,
    is_active: i64,
    created_at: i64,
    last_used: i64,
}

fn raw_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAccountRow> {
    Ok(RawAccountRow {
        id: row.get(0)?,
        provider: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        avatar_url: row.get(4)?,
        token: row.get(5)?,
        quota: row.get(6)?,
        selected_models: row.get(7)?,
        status: row.get(8)?,
        is_active: row.get(9)?,
        created_at: row.get(10)?,
        last_used: row.get(11)?,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{account, memory_store};
    use super::*;
    use crate::store::crypto::FixedKeySource;

    #[test]
    fn init_is_idempotent() {
        let store = memory_store();
        store.init().unwrap();
        store.init().unwrap();
    }

    #[test]
    fn add_get_list_remove() {
        let store = memory_store();
        let mut a = account("a", "a@example.com");
        a.name = Some("Account A".to_string());
        store.add(&a).unwrap();

        let fetched = store.get("a").unwrap().unwrap();
        assert_eq!(fetched.email, "a@example.com");
        assert_eq!(fetched.token.access_token, "at-a");
        assert_eq!(fetched.name.as_deref(), Some("Account A"));

        assert_eq!(store.list().unwrap().len(), 1);
        store.remove("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn list_orders_by_last_used_desc() {
        let store = memory_store();
        let mut a = account("a", "a@example.com");
        a.last_used = 100;
        let mut b = account("b", "b@example.com");
        b.last_used = 200;
        store.add(&a).unwrap();
        store.add(&b).unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|x| x.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn active_singleton_holds_across_add_and_set_active() {
        let store = memory_store();
        for id in ["a", "b", "c"] {
            store.add(&account(id, &format!("{}@example.com", id))).unwrap();
        }

        let active_count = |store: &AccountStore| {
            store
                .list()
                .unwrap()
                .iter()
                .filter(|a| a.is_active)
                .count()
        };

        for id in ["a", "b", "c", "a", "b"] {
            store.set_active(id).unwrap();
            assert_eq!(active_count(&store), 1);
            assert!(store.get(id).unwrap().unwrap().is_active);
        }

        // Adding an already-active account demotes the rest in the same transaction.
        let mut d = account("d", "d@example.com");
        d.is_active = true;
        store.add(&d).unwrap();
        assert_eq!(active_count(&store), 1);
        assert!(store.get("d").unwrap().unwrap().is_active);
    }

    #[test]
    fn set_active_on_unknown_account_fails() {
        let store = memory_store();
        assert!(store.set_active("ghost").is_err());
    }

    #[test]
    fn token_expiry_is_monotonic() {
        let store = memory_store();
        let a = account("a", "a@example.com");
        let original_expiry = a.token.expiry_timestamp;
        store.add(&a).unwrap();

        let mut forward = a.token.clone();
        forward.access_token = "newer".to_string();
        forward.expiry_timestamp = original_expiry + 3600;
        store.update_token("a", &forward).unwrap();

        let mut backward = forward.clone();
        backward.expiry_timestamp = original_expiry - 10;
        assert!(matches!(
            store.update_token("a", &backward),
            Err(AppError::Protocol(_))
        ));
        assert_eq!(
            store.get("a").unwrap().unwrap().token.expiry_timestamp,
            original_expiry + 3600
        );
    }

    #[test]
    fn secret_columns_never_hold_plaintext() {
        let store = memory_store();
        let mut a = account("a", "a@example.com");
        a.quota = Some(QuotaData::new());
        store.add(&a).unwrap();

        let conn = store.lock();
        let (token, quota): (String, Option<String>) = conn
            .query_row("SELECT token, quota FROM accounts WHERE id = 'a'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert!(!looks_plaintext(&token));
        assert!(!looks_plaintext(quota.as_deref().unwrap()));
    }

    #[test]
    fn init_heals_plaintext_rows() {
        let store = memory_store();
        let a = account("a", "a@example.com");
        let token_json = serde_json::to_string(&a.token).unwrap();
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO accounts (id, provider, email, token, quota, selected_models,
                                       status, is_active, created_at, last_used)
                 VALUES ('a', 'google', 'a@example.com', ?1, NULL, '[]', 'active', 0, 1, 1)",
                params![token_json],
            )
            .unwrap();
        }

        store.init().unwrap();

        let conn = store.lock();
        let raw: String = conn
            .query_row("SELECT token FROM accounts WHERE id = 'a'", [], |row| row.get(0))
            .unwrap();
        drop(conn);
        assert!(!looks_plaintext(&raw));
        // And the healed row decrypts back to the original token.
        let healed = store.get("a").unwrap().unwrap();
        assert_eq!(healed.token.access_token, "at-a");
    }

    #[test]
    fn one_undecryptable_row_does_not_poison_the_store() {
        let store = memory_store();
        store.add(&account("good", "good@example.com")).unwrap();
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO accounts (id, provider, email, token, quota, selected_models,
                                       status, is_active, created_at, last_used)
                 VALUES ('bad', 'google', 'bad@example.com', 'AAAAgarbage', NULL, '[]',
                         'active', 0, 1, 1)",
                [],
            )
            .unwrap();
        }

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");
        assert!(matches!(store.get("bad"), Err(AppError::Decrypt(_))));
        assert!(store.get("good").unwrap().is_some());
    }

    #[test]
    fn selected_models_and_status_round_trip() {
        let store = memory_store();
        store.add(&account("a", "a@example.com")).unwrap();

        store
            .update_selected_models("a", &["models/gemini-2.5-pro".to_string()])
            .unwrap();
        store.update_status("a", AccountStatus::RateLimited).unwrap();
        store.update_last_used("a").unwrap();

        let fetched = store.get("a").unwrap().unwrap();
        assert_eq!(fetched.selected_models, vec!["models/gemini-2.5-pro".to_string()]);
        assert_eq!(fetched.status, AccountStatus::RateLimited);
        assert!(fetched.last_used >= fetched.created_at);
    }

    #[test]
    fn settings_default_and_round_trip() {
        let store = memory_store();
        let v = store
            .get_setting("auto_switch_enabled", serde_json::json!(false))
            .unwrap();
        assert_eq!(v, serde_json::json!(false));

        store
            .set_setting("auto_switch_enabled", &serde_json::json!(true))
            .unwrap();
        let v = store
            .get_setting("auto_switch_enabled", serde_json::json!(false))
            .unwrap();
        assert_eq!(v, serde_json::json!(true));
    }

    #[test]
    fn distinct_keys_cannot_read_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        {
            let store = AccountStore::open(&path, &FixedKeySource([1u8; 32])).unwrap();
            store.init().unwrap();
            store.add(&account("a", "a@example.com")).unwrap();
        }
        let other = AccountStore::open(&path, &FixedKeySource([2u8; 32])).unwrap();
        other.init().unwrap();
        assert!(matches!(other.get("a"), Err(AppError::Decrypt(_))));
    }
}
