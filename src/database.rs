//! SQLite persistence for users, proxies, failure counters and statistics

use crate::error::EngineResult;
use crate::proxy::models::{CheckOutcome, Protocol, Proxy, ProxyAuth, ProxyOwner, WorkItem};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};
use std::collections::HashSet;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        timeout_ms INTEGER NOT NULL,
        retries INTEGER NOT NULL,
        auto_remove INTEGER NOT NULL DEFAULT 0,
        auto_remove_threshold INTEGER NOT NULL,
        protocols TEXT NOT NULL,
        socks_judge_protocol TEXT NOT NULL DEFAULT 'http'
    )"#,
    r#"CREATE TABLE IF NOT EXISTS proxies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT,
        password TEXT,
        hash TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_proxies (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        proxy_id INTEGER NOT NULL REFERENCES proxies(id) ON DELETE CASCADE,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, proxy_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_user_proxies_proxy ON user_proxies(proxy_id)",
    r#"CREATE TABLE IF NOT EXISTS judges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        regex TEXT,
        UNIQUE (user_id, url)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS proxy_statistics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proxy_id INTEGER NOT NULL,
        protocol TEXT NOT NULL,
        judge_url TEXT NOT NULL,
        alive INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        latency_ms INTEGER,
        anonymity TEXT,
        checked_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_proxy_statistics_checked_at ON proxy_statistics(checked_at)",
];

/// Settings of a user being created
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub auto_remove: bool,
    pub auto_remove_threshold: u32,
    pub protocols: Vec<Protocol>,
    pub socks_judge_protocol: Protocol,
}

/// Failure counter change for one (user, proxy) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDelta {
    pub user_id: i64,
    pub proxy_id: i64,
    pub value: u32,
}

/// Counter value after a bulk update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCount {
    pub user_id: i64,
    pub proxy_id: i64,
    pub failures: u32,
}

/// Result of deleting user/proxy relationships
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub removed: Vec<(i64, i64)>,
    /// Proxies left without any owner; their rows are deleted as well
    pub orphaned: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct JudgeRow {
    pub user_id: i64,
    pub url: String,
    pub regex: Option<String>,
}

#[derive(FromRow)]
struct OwnerRow {
    id: i64,
    timeout_ms: i64,
    retries: i64,
    auto_remove: bool,
    auto_remove_threshold: i64,
    protocols: String,
    socks_judge_protocol: String,
}

impl From<OwnerRow> for ProxyOwner {
    fn from(row: OwnerRow) -> Self {
        Self {
            user_id: row.id,
            timeout_ms: row.timeout_ms.max(0) as u64,
            retries: row.retries.clamp(0, u32::MAX as i64) as u32,
            auto_remove: row.auto_remove,
            auto_remove_threshold: row.auto_remove_threshold.clamp(0, u32::MAX as i64) as u32,
            protocols: Protocol::parse_list(&row.protocols),
            socks_judge_protocol: Protocol::from_str(&row.socks_judge_protocol)
                .unwrap_or(Protocol::Http),
        }
    }
}

#[derive(FromRow)]
struct ProxyRow {
    id: i64,
    host: String,
    port: i64,
    username: Option<String>,
    password: Option<String>,
}

impl From<ProxyRow> for WorkItem {
    fn from(row: ProxyRow) -> Self {
        let auth = match (row.username, row.password) {
            (Some(u), Some(p)) => Some(ProxyAuth::new(u, p)),
            _ => None,
        };
        WorkItem::new(row.id, row.host, row.port as u16, auth)
    }
}

#[derive(FromRow)]
struct CountRow {
    user_id: i64,
    proxy_id: i64,
    consecutive_failures: i64,
}

/// Database handle
#[derive(Clone)]
pub struct ProxyDatabase {
    pool: SqlitePool,
}

impl ProxyDatabase {
    /// Connect and create the schema if needed
    pub async fn new(url: &str) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> EngineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn add_user(&self, user: &NewUser) -> EngineResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO users
               (name, timeout_ms, retries, auto_remove, auto_remove_threshold, protocols, socks_judge_protocol)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(&user.name)
        .bind(user.timeout_ms as i64)
        .bind(user.retries as i64)
        .bind(user.auto_remove)
        .bind(user.auto_remove_threshold as i64)
        .bind(Protocol::join_list(&user.protocols))
        .bind(user.socks_judge_protocol.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn user_ids(&self) -> EngineResult<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT id FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Store proxies (deduplicated by hash) and link them to a user.
    pub async fn add_proxies_for_user(
        &self,
        user_id: i64,
        proxies: &[Proxy],
    ) -> EngineResult<Vec<WorkItem>> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut items = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            let (username, password) = match &proxy.auth {
                Some(a) => (Some(a.username.as_str()), Some(a.password.as_str())),
                None => (None, None),
            };
            let id: i64 = sqlx::query_scalar(
                r#"INSERT INTO proxies (host, port, username, password, hash, created_at)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT(hash) DO UPDATE SET hash = excluded.hash
                   RETURNING id"#,
            )
            .bind(&proxy.host)
            .bind(proxy.port as i64)
            .bind(username)
            .bind(password)
            .bind(proxy.hash())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO user_proxies (user_id, proxy_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            items.push(WorkItem::from_proxy(id, proxy));
        }
        tx.commit().await?;
        Ok(items)
    }

    /// Current owners of a proxy with their check settings
    pub async fn owners_of(&self, proxy_id: i64) -> EngineResult<Vec<ProxyOwner>> {
        let rows = sqlx::query_as::<_, OwnerRow>(
            r#"SELECT u.id, u.timeout_ms, u.retries, u.auto_remove, u.auto_remove_threshold,
                      u.protocols, u.socks_judge_protocol
               FROM users u
               JOIN user_proxies up ON up.user_id = u.id
               WHERE up.proxy_id = ?
               ORDER BY u.id"#,
        )
        .bind(proxy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProxyOwner::from).collect())
    }

    pub async fn add_judge(&self, user_id: i64, url: &str, regex: Option<&str>) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO judges (user_id, url, regex) VALUES (?, ?, ?)
               ON CONFLICT(user_id, url) DO UPDATE SET regex = excluded.regex"#,
        )
        .bind(user_id)
        .bind(url)
        .bind(regex)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn judges(&self) -> EngineResult<Vec<JudgeRow>> {
        let rows: Vec<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT user_id, url, regex FROM judges ORDER BY user_id, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(user_id, url, regex)| JudgeRow { user_id, url, regex })
            .collect())
    }

    /// Set counters to `value` for each pair, in one statement.
    pub async fn reset_failures(&self, rows: &[FailureDelta]) -> EngineResult<Vec<FailureCount>> {
        let mut conn = self.pool.acquire().await?;
        update_failures(&mut conn, RESET_FAILURES, rows).await
    }

    /// Add `value` to each pair's counter (saturating), in one statement.
    pub async fn increment_failures(
        &self,
        rows: &[FailureDelta],
    ) -> EngineResult<Vec<FailureCount>> {
        let mut conn = self.pool.acquire().await?;
        update_failures(&mut conn, INCREMENT_FAILURES, rows).await
    }

    /// Delete relationships and report which proxies lost their last owner.
    pub async fn remove_relationships(&self, pairs: &[(i64, i64)]) -> EngineResult<Removal> {
        let mut tx = self.pool.begin().await?;
        let removal = delete_relationships(&mut tx, pairs).await?;
        tx.commit().await?;
        Ok(removal)
    }

    /// Open a transaction for one batch of failure-counter writes.
    pub async fn failure_writes(&self) -> EngineResult<FailureWrites> {
        Ok(FailureWrites {
            tx: self.pool.begin().await?,
        })
    }

    /// Which of the given proxies still have at least one owner
    pub async fn owned_proxies(&self, proxy_ids: &[i64]) -> EngineResult<HashSet<i64>> {
        if proxy_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT DISTINCT proxy_id FROM user_proxies WHERE proxy_id IN (");
        let mut ids = qb.separated(", ");
        for id in proxy_ids {
            ids.push_bind(*id);
        }
        qb.push(")");
        let owned: Vec<i64> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(owned.into_iter().collect())
    }

    pub async fn failure_count(&self, user_id: i64, proxy_id: i64) -> EngineResult<Option<u32>> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT consecutive_failures FROM user_proxies WHERE user_id = ? AND proxy_id = ?",
        )
        .bind(user_id)
        .bind(proxy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.map(|c| c.clamp(0, u32::MAX as i64) as u32))
    }

    pub async fn insert_statistics(
        &self,
        proxy_id: i64,
        outcomes: &[CheckOutcome],
        checked_at: i64,
    ) -> EngineResult<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO proxy_statistics \
             (proxy_id, protocol, judge_url, alive, attempts, latency_ms, anonymity, checked_at) ",
        );
        qb.push_values(outcomes, |mut b, o| {
            b.push_bind(proxy_id)
                .push_bind(o.protocol.to_string())
                .push_bind(o.judge_url.clone())
                .push_bind(o.alive)
                .push_bind(o.attempts as i64)
                .push_bind(o.latency_ms.map(|l| l as i64))
                .push_bind(o.anonymity.map(|a| a.to_string()))
                .push_bind(checked_at);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn statistics_count(&self, proxy_id: i64) -> EngineResult<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proxy_statistics WHERE proxy_id = ?")
                .bind(proxy_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn delete_statistics_before(&self, cutoff: i64) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM proxy_statistics WHERE checked_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Owned proxies with id greater than `after_id`, ascending
    pub async fn proxies_page(&self, after_id: i64, limit: i64) -> EngineResult<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, ProxyRow>(
            r#"SELECT p.id, p.host, p.port, p.username, p.password
               FROM proxies p
               WHERE p.id > ?
                 AND EXISTS (SELECT 1 FROM user_proxies up WHERE up.proxy_id = p.id)
               ORDER BY p.id
               LIMIT ?"#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(WorkItem::from).collect())
    }
}

/// Failure-counter writes that apply together on `commit`. Dropping the
/// batch without committing rolls every write back.
pub struct FailureWrites {
    tx: Transaction<'static, Sqlite>,
}

impl FailureWrites {
    pub async fn reset(&mut self, rows: &[FailureDelta]) -> EngineResult<Vec<FailureCount>> {
        update_failures(&mut self.tx, RESET_FAILURES, rows).await
    }

    pub async fn increment(&mut self, rows: &[FailureDelta]) -> EngineResult<Vec<FailureCount>> {
        update_failures(&mut self.tx, INCREMENT_FAILURES, rows).await
    }

    pub async fn remove_relationships(&mut self, pairs: &[(i64, i64)]) -> EngineResult<Removal> {
        delete_relationships(&mut self.tx, pairs).await
    }

    pub async fn commit(self) -> EngineResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

const RESET_FAILURES: &str = "UPDATE user_proxies SET consecutive_failures = batch.column3 FROM (";
const INCREMENT_FAILURES: &str = "UPDATE user_proxies SET consecutive_failures = \
     MIN(consecutive_failures + batch.column3, 2147483647) FROM (";

async fn update_failures(
    conn: &mut SqliteConnection,
    head: &str,
    rows: &[FailureDelta],
) -> EngineResult<Vec<FailureCount>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(head);
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.user_id)
            .push_bind(row.proxy_id)
            .push_bind(row.value as i64);
    });
    qb.push(
        ") AS batch \
         WHERE user_proxies.user_id = batch.column1 AND user_proxies.proxy_id = batch.column2 \
         RETURNING user_id, proxy_id, consecutive_failures",
    );
    let counts = qb.build_query_as::<CountRow>().fetch_all(&mut *conn).await?;
    Ok(counts
        .into_iter()
        .map(|r| FailureCount {
            user_id: r.user_id,
            proxy_id: r.proxy_id,
            failures: r.consecutive_failures.clamp(0, u32::MAX as i64) as u32,
        })
        .collect())
}

async fn delete_relationships(
    conn: &mut SqliteConnection,
    pairs: &[(i64, i64)],
) -> EngineResult<Removal> {
    if pairs.is_empty() {
        return Ok(Removal::default());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("WITH batch(user_id, proxy_id) AS (");
    qb.push_values(pairs, |mut b, (user_id, proxy_id)| {
        b.push_bind(*user_id).push_bind(*proxy_id);
    });
    qb.push(
        ") DELETE FROM user_proxies WHERE EXISTS (\
         SELECT 1 FROM batch \
         WHERE batch.user_id = user_proxies.user_id AND batch.proxy_id = user_proxies.proxy_id) \
         RETURNING user_id, proxy_id",
    );
    let removed: Vec<(i64, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;

    let proxy_ids: Vec<i64> = removed
        .iter()
        .map(|(_, p)| *p)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let mut orphaned = Vec::new();
    if !proxy_ids.is_empty() {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM proxies WHERE id IN (");
        let mut ids = qb.separated(", ");
        for id in &proxy_ids {
            ids.push_bind(*id);
        }
        qb.push(
            ") AND NOT EXISTS (SELECT 1 FROM user_proxies up WHERE up.proxy_id = proxies.id) \
             RETURNING id",
        );
        orphaned = qb.build_query_scalar::<i64>().fetch_all(&mut *conn).await?;
        orphaned.sort_unstable();
    }
    Ok(Removal { removed, orphaned })
}
