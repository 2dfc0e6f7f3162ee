//! Durable sqlite-backed implementations of the store and queue traits.
//! All connection work happens on blocking threads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{
    ApiKey, Datastore, LogQueue, LogRecord, Organization, Project, ProviderKey, QueueDepths,
    QueueMessage, StoreError, StoreResult, TopupTransaction, TransactionStatus,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> StoreResult<T> {
            let mut conn = open_connection(&path)?;
            init_schema(&conn)?;
            work(&mut conn)
        })
        .await?
    }

    pub async fn put_api_key(&self, key: ApiKey) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let value = serde_json::to_string(&key)?;
            conn.execute(
                "INSERT OR REPLACE INTO api_keys (token, value_json) VALUES (?1, ?2)",
                params![key.token, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn put_project(&self, project: Project) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let value = serde_json::to_string(&project)?;
            conn.execute(
                "INSERT OR REPLACE INTO projects (id, value_json) VALUES (?1, ?2)",
                params![project.id, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn put_organization(&self, organization: Organization) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let value = serde_json::to_string(&organization)?;
            conn.execute(
                "INSERT OR REPLACE INTO organizations (id, credits_micros, value_json)
                 VALUES (?1, ?2, ?3)",
                params![organization.id, organization.credits_micros, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn put_provider_key(&self, key: ProviderKey) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let value = serde_json::to_string(&key)?;
            conn.execute(
                "INSERT OR REPLACE INTO provider_keys (id, organization_id, value_json)
                 VALUES (?1, ?2, ?3)",
                params![key.id, key.organization_id, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn log_count(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}

fn open_connection(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_keys (
            token TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS organizations (
            id TEXT PRIMARY KEY,
            credits_micros INTEGER NOT NULL DEFAULT 0,
            value_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS provider_keys (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            value_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS provider_keys_org ON provider_keys (organization_id);
        CREATE TABLE IF NOT EXISTS logs (
            request_id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            value_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS topup_transactions (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            value_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS topups_org ON topup_transactions (organization_id, created_at_ms);
        CREATE TABLE IF NOT EXISTS locks (
            key TEXT PRIMARY KEY,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            state TEXT NOT NULL DEFAULT 'main',
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS queue_state ON queue_messages (state, id);",
    )?;
    Ok(())
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn api_key_by_token(&self, token: &str) -> StoreResult<Option<ApiKey>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM api_keys WHERE token = ?1",
                    params![token],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn project(&self, id: &str) -> StoreResult<Option<Project>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM projects WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn organization(&self, id: &str) -> StoreResult<Option<Organization>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT credits_micros, value_json FROM organizations WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((credits, raw)) = row else {
                return Ok(None);
            };
            let mut organization: Organization = serde_json::from_str(&raw)?;
            // The column is authoritative; the JSON snapshot can lag behind
            // concurrent debits.
            organization.credits_micros = credits;
            Ok(Some(organization))
        })
        .await
    }

    async fn provider_keys(&self, organization_id: &str) -> StoreResult<Vec<ProviderKey>> {
        let organization_id = organization_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT value_json FROM provider_keys WHERE organization_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![organization_id], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                let raw = row?;
                keys.push(serde_json::from_str(&raw)?);
            }
            Ok(keys)
        })
        .await
    }

    async fn insert_log(&self, log: &LogRecord) -> StoreResult<bool> {
        let log = log.clone();
        self.with_conn(move |conn| {
            let value = serde_json::to_string(&log)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO logs (request_id, organization_id, created_at_ms, value_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![log.request_id, log.organization_id, log.created_at_ms as i64, value],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn debit_credits(&self, organization_id: &str, amount_micros: i64) -> StoreResult<()> {
        let organization_id = organization_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE organizations SET credits_micros = credits_micros - ?1 WHERE id = ?2",
                params![amount_micros, organization_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn credit_credits(&self, organization_id: &str, amount_micros: i64) -> StoreResult<()> {
        let organization_id = organization_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE organizations SET credits_micros = credits_micros + ?1 WHERE id = ?2",
                params![amount_micros, organization_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn organizations_for_topup(&self) -> StoreResult<Vec<Organization>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT credits_micros, value_json FROM organizations ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut due = Vec::new();
            for row in rows {
                let (credits, raw) = row?;
                let mut organization: Organization = serde_json::from_str(&raw)?;
                organization.credits_micros = credits;
                if organization.auto_topup
                    && organization.credits_micros < organization.topup_threshold_micros
                {
                    due.push(organization);
                }
            }
            Ok(due)
        })
        .await
    }

    async fn latest_topup(&self, organization_id: &str) -> StoreResult<Option<TopupTransaction>> {
        let organization_id = organization_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM topup_transactions
                     WHERE organization_id = ?1
                     ORDER BY created_at_ms DESC LIMIT 1",
                    params![organization_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn insert_topup(&self, transaction: &TopupTransaction) -> StoreResult<()> {
        let transaction = transaction.clone();
        self.with_conn(move |conn| {
            let value = serde_json::to_string(&transaction)?;
            conn.execute(
                "INSERT INTO topup_transactions (id, organization_id, created_at_ms, value_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    transaction.id,
                    transaction.organization_id,
                    transaction.created_at_ms as i64,
                    value
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_topup_status(
        &self,
        id: &str,
        status: TransactionStatus,
        payment_intent_id: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let payment_intent_id = payment_intent_id.map(str::to_string);
        let error = error.map(str::to_string);
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM topup_transactions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(raw) = raw else {
                return Ok(());
            };
            let mut transaction: TopupTransaction = serde_json::from_str(&raw)?;
            transaction.status = status;
            if payment_intent_id.is_some() {
                transaction.payment_intent_id = payment_intent_id;
            }
            if error.is_some() {
                transaction.error = error;
            }
            let value = serde_json::to_string(&transaction)?;
            conn.execute(
                "UPDATE topup_transactions SET value_json = ?1 WHERE id = ?2",
                params![value, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        stale_after: Duration,
        now_ms: u64,
    ) -> StoreResult<bool> {
        let key = key.to_string();
        let stale_ms = stale_after.as_millis() as i64;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM locks WHERE key = ?1 AND updated_at_ms <= ?2",
                params![key, now_ms as i64 - stale_ms],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO locks (key, updated_at_ms) VALUES (?1, ?2)",
                params![key, now_ms as i64],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn release_lock(&self, key: &str) -> StoreResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM locks WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl LogQueue for SqliteStore {
    async fn enqueue(&self, payload: String) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queue_messages (state, payload) VALUES ('main', ?1)",
                params![payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn claim(&self, max: usize) -> StoreResult<Vec<QueueMessage>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let claimed = {
                let mut stmt = tx.prepare(
                    "SELECT id, payload FROM queue_messages
                     WHERE state = 'main' ORDER BY id LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![max as i64], |row| {
                    Ok(QueueMessage {
                        id: row.get(0)?,
                        payload: row.get(1)?,
                    })
                })?;
                let mut claimed = Vec::new();
                for row in rows {
                    claimed.push(row?);
                }
                claimed
            };
            for message in &claimed {
                tx.execute(
                    "UPDATE queue_messages SET state = 'processing' WHERE id = ?1",
                    params![message.id],
                )?;
            }
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn acknowledge(&self, ids: &[i64]) -> StoreResult<()> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute("DELETE FROM queue_messages WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recover(&self, ids: &[i64]) -> StoreResult<()> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute(
                    "UPDATE queue_messages SET state = 'main' WHERE id = ?1",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn recover_all(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let moved = conn.execute(
                "UPDATE queue_messages SET state = 'main' WHERE state = 'processing'",
                [],
            )?;
            Ok(moved as u64)
        })
        .await
    }

    async fn depths(&self) -> StoreResult<QueueDepths> {
        self.with_conn(|conn| {
            let main: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE state = 'main'",
                [],
                |row| row.get(0),
            )?;
            let processing: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE state = 'processing'",
                [],
                |row| row.get(0),
            )?;
            Ok(QueueDepths {
                main: main as u64,
                processing: processing as u64,
            })
        })
        .await
    }
}
