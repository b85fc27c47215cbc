//! The orchestration core: one [`Core`] owns every piece of process-wide
//! state (storage handles, provider adapters, router configuration, task
//! hooks), so tests can run isolated cores against temporary paths.

pub mod bus;
pub mod calllog;
pub mod error;
pub mod providers;
pub mod registry;
pub mod router;
pub mod swarm;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use calllog::CallLog;
use error::Result;
use providers::Providers;
use registry::ModelRegistry;
use router::RouterConfig;
use swarm::{TaskEvent, TaskHooks};

/// Millisecond-precision UTC timestamp, sortable as text.
pub(crate) fn now_iso() -> String {
    now_iso_at(Utc::now())
}

pub(crate) fn now_iso_at(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Random lowercase hex string of `bytes * 2` characters.
pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Paths and endpoints for one core instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding both store files (`llm_calls.db`, `swarm.db`).
    pub data_dir: PathBuf,
    /// OAuth credentials file, owned by an external login command.
    pub auth_path: PathBuf,
    pub anthropic_base_url: String,
    pub openai_base_url: String,
    pub oauth_token_url: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            data_dir: home.join(".swarmcore"),
            auth_path: home.join(".codex").join("auth.json"),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            openai_base_url: "https://api.openai.com".to_string(),
            oauth_token_url: "https://auth.openai.com/oauth/token".to_string(),
        }
    }
}

pub(crate) struct CoreInner {
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) calllog: CallLog,
    pub(crate) providers: Providers,
    pub(crate) router: RwLock<RouterConfig>,
    pub(crate) swarm_db: Arc<Mutex<Connection>>,
    pub(crate) hooks: TaskHooks,
}

/// Handle to the orchestration core. Cloning is cheap; every clone shares
/// the same stores, adapters, and hook registry.
#[derive(Clone)]
pub struct Core {
    pub(crate) inner: Arc<CoreInner>,
}

impl Core {
    /// Open both stores (creating schemas on first use), spawn the call-log
    /// writer, and wire the provider adapters.
    pub async fn init(config: CoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let registry = Arc::new(ModelRegistry::load());
        let calllog =
            CallLog::open(config.data_dir.join("llm_calls.db"), registry.clone()).await?;

        let swarm_conn = Connection::open(config.data_dir.join("swarm.db"))?;
        swarm_conn.pragma_update(None, "journal_mode", "WAL")?;
        create_swarm_schema(&swarm_conn)?;

        let providers = Providers::new(&config);
        info!("core initialized at {}", config.data_dir.display());

        Ok(Self {
            inner: Arc::new(CoreInner {
                registry,
                calllog,
                providers,
                router: RwLock::new(RouterConfig::default()),
                swarm_db: Arc::new(Mutex::new(swarm_conn)),
                hooks: TaskHooks::default(),
            }),
        })
    }

    /// Flush the call-log writer. The core must not be used afterwards.
    pub async fn shutdown(&self) {
        self.inner.calllog.flush().await;
        info!("core shut down");
    }

    /// Register a hook for task lifecycle events. Hooks run synchronously
    /// on the transitioning call path; panics are isolated.
    pub fn on_task_event<F>(&self, hook: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.inner.hooks.subscribe(hook);
    }

    /// Model registry lookup surface.
    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// Call-log store handle, for read-only analytical queries.
    pub fn calllog_db(&self) -> Arc<Mutex<Connection>> {
        self.inner.calllog.db()
    }

    /// Records the call log discarded because its queue was full.
    pub fn calllog_dropped_count(&self) -> u64 {
        self.inner.calllog.dropped_count()
    }

    /// Swarm/message store handle, for read-only analytical queries.
    pub fn bus_db(&self) -> Arc<Mutex<Connection>> {
        self.inner.swarm_db.clone()
    }
}

fn create_swarm_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS swarm_tasks (
            id TEXT PRIMARY KEY,
            swarm_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            description TEXT NOT NULL,
            prompt TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            agent_id TEXT,
            model TEXT,
            strategy TEXT,
            mode TEXT NOT NULL DEFAULT 'inline',
            result TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            completed_at TEXT,
            metadata TEXT NOT NULL DEFAULT '{}'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_swarm_tasks_swarm ON swarm_tasks (swarm_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_swarm_tasks_status ON swarm_tasks (status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_swarm_tasks_claim ON swarm_tasks (status, claimed_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient TEXT,
            type TEXT NOT NULL DEFAULT 'data',
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages (channel)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages (recipient)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_created ON messages (created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS read_cursors (
            agent_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            last_read_id INTEGER NOT NULL,
            last_read_at TEXT NOT NULL,
            PRIMARY KEY (agent_id, channel)
        )",
        [],
    )?;
    Ok(())
}
