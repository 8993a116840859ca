// Database change listener: trigger-based LISTEN/NOTIFY fan-out.
//
// A trigger function NOTIFYs on every row change in user tables; a dedicated
// listener connection normalizes payloads into `DatabaseChange`, appends to
// the replay buffer, and broadcasts to subscribers in arrival order.
// Failure to start is non-fatal to the runtime: live-update is a
// convenience, not a correctness requirement.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use chrono::Utc;
use folio_common::changes::ChangeBuffer;
use folio_common::types::{ChangeOp, DatabaseChange};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const CHANGE_CHANNEL: &str = "folio_changes";
const BROADCAST_CAPACITY: usize = 256;

const NOTIFY_FN_SQL: &str = r#"
CREATE OR REPLACE FUNCTION folio_notify_change() RETURNS trigger
LANGUAGE plpgsql AS $fn$
DECLARE
    rec jsonb;
BEGIN
    IF TG_OP = 'DELETE' THEN
        rec := to_jsonb(OLD);
    ELSE
        rec := to_jsonb(NEW);
    END IF;
    PERFORM pg_notify(
        'folio_changes',
        json_build_object('table', TG_TABLE_NAME, 'op', TG_OP, 'row_id', rec->>'id')::text
    );
    RETURN NULL;
END;
$fn$;
"#;

#[derive(Debug, Deserialize)]
struct RawChange {
    table: String,
    op: ChangeOp,
    row_id: Option<String>,
}

pub struct ChangeListener {
    task: StdMutex<Option<JoinHandle<()>>>,
    buffer: Arc<StdMutex<ChangeBuffer>>,
    tx: broadcast::Sender<DatabaseChange>,
}

impl Default for ChangeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeListener {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            task: StdMutex::new(None),
            buffer: Arc::new(StdMutex::new(ChangeBuffer::default())),
            tx,
        }
    }

    /// Install triggers and start the listener task. Safe to call again; an
    /// existing task is stopped first.
    pub async fn start(&self, pool: &PgPool) -> Result<()> {
        self.stop();
        install_triggers(pool).await?;

        let mut listener = PgListener::connect_with(pool)
            .await
            .context("failed to open change listener connection")?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .context("failed to LISTEN on the change channel")?;

        let buffer = Arc::clone(&self.buffer);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => ingest_payload(&buffer, &tx, notification.payload()),
                    Err(error) => {
                        warn!(%error, "change listener connection lost");
                        break;
                    }
                }
            }
        });

        *self.task.lock().expect("listener task lock poisoned") = Some(handle);
        info!("change listener started");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("listener task lock poisoned").take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .expect("listener task lock poisoned")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// (Re)install the trigger function and per-table triggers. Idempotent;
    /// call after schema changes so new tables are captured.
    pub async fn refresh_triggers(&self, pool: &PgPool) -> Result<()> {
        install_triggers(pool).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseChange> {
        self.tx.subscribe()
    }

    /// Replay snapshot for newly connecting subscribers, oldest first.
    pub fn recent(&self) -> Vec<DatabaseChange> {
        self.buffer.lock().expect("change buffer lock poisoned").snapshot()
    }

    /// Drop buffered changes (workbook switch).
    pub fn clear(&self) {
        self.buffer.lock().expect("change buffer lock poisoned").clear();
    }
}

fn ingest_payload(
    buffer: &Arc<StdMutex<ChangeBuffer>>,
    tx: &broadcast::Sender<DatabaseChange>,
    payload: &str,
) {
    let Some(change) = normalize(payload) else {
        warn!(payload, "ignoring malformed change notification");
        return;
    };
    buffer.lock().expect("change buffer lock poisoned").push(change.clone());
    let _ = tx.send(change);
}

fn normalize(payload: &str) -> Option<DatabaseChange> {
    let raw: RawChange = serde_json::from_str(payload).ok()?;
    Some(DatabaseChange { table: raw.table, op: raw.op, row_id: raw.row_id, ts: Utc::now() })
}

async fn install_triggers(pool: &PgPool) -> Result<()> {
    sqlx::query(NOTIFY_FN_SQL)
        .execute(pool)
        .await
        .context("failed to install change notify function")?;

    // Runtime bookkeeping tables (folio_*) are excluded: sync history writes
    // would otherwise feed back into the change stream.
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
         AND table_name NOT LIKE 'folio~_%' ESCAPE '~'",
    )
    .fetch_all(pool)
    .await
    .context("failed to enumerate user tables")?;

    for table in &tables {
        let ident = quote_ident(table);
        sqlx::query(&format!("DROP TRIGGER IF EXISTS folio_changes_trigger ON {ident}"))
            .execute(pool)
            .await
            .with_context(|| format!("failed to drop stale change trigger on `{table}`"))?;
        sqlx::query(&format!(
            "CREATE TRIGGER folio_changes_trigger \
             AFTER INSERT OR UPDATE OR DELETE ON {ident} \
             FOR EACH ROW EXECUTE FUNCTION folio_notify_change()"
        ))
        .execute(pool)
        .await
        .with_context(|| format!("failed to install change trigger on `{table}`"))?;
    }

    info!(table_count = tables.len(), "change triggers installed");
    Ok(())
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
