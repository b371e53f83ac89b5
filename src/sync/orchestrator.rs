use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::api::OrderApi;
use crate::error::{Error, Result};
use crate::query::{OrderQuery, OrderRow};
use crate::storage::{repository, Database};
use crate::sync::{runner, SyncMode, SyncOutcome, SyncState};

/// Timeout for local reads.
const LOCAL_READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Policy layer consumed by the UI: a fast hot sync over the ids the
/// user is looking at, then a slower background sync over a date
/// window, plus cancellable local-read queries. The UI never talks to
/// the platform directly.
pub struct SyncOrchestrator {
    db: Database,
    api: Arc<dyn OrderApi>,
    state: Mutex<SyncState>,
    /// Token for the current in-flight local read; a newer read cancels it.
    fetch_gate: tokio::sync::Mutex<CancellationToken>,
    /// Held for the duration of a sync so runs never overlap.
    sync_gate: tokio::sync::Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(db: Database, api: Arc<dyn OrderApi>) -> Self {
        Self {
            db,
            api,
            state: Mutex::new(SyncState::Idle),
            fetch_gate: tokio::sync::Mutex::new(CancellationToken::new()),
            sync_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current sync state, for the UI's busy indicator.
    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap() = state;
    }

    /// Query the local mirror. Supersedes any previous in-flight
    /// `fetch_local` from this orchestrator: the older call returns
    /// `Error::Cancelled` and never delivers stale rows after a newer
    /// call has begun.
    pub async fn fetch_local(&self, query: OrderQuery) -> Result<Vec<OrderRow>> {
        let token = {
            let mut gate = self.fetch_gate.lock().await;
            gate.cancel();
            let fresh = CancellationToken::new();
            *gate = fresh.clone();
            fresh
        };

        let rows = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(LOCAL_READ_TIMEOUT, query.orders(&self.db)) => {
                result.map_err(|_| Error::Database("local read timed out".into()))??
            }
        };

        // The response may have arrived after a newer call superseded us.
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(rows)
    }

    /// Last completed background sync, if any.
    pub async fn last_synced_at(&self) -> Result<Option<String>> {
        self.db
            .reader()
            .call(|conn| repository::get_config(conn, repository::LAST_SYNCED_AT))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Run a full sync: hot phase over `priority_ids` (the rows the user
    /// currently sees), then the background phase over the window the
    /// mode computes. Resolves only once the background phase completes,
    /// so a busy indicator driven by [`state`] reflects true completion.
    /// Not cancellable mid-flight: every page is already committed
    /// transactionally, so cancelling would discard correct progress.
    pub async fn sync(&self, mode: SyncMode, priority_ids: &[String]) -> Result<SyncOutcome> {
        let _running = self.sync_gate.lock().await;

        let result = self.run_phases(&mode, priority_ids).await;
        match result {
            Ok(outcome) => {
                self.set_state(SyncState::Idle);
                Ok(outcome)
            }
            Err(e) => {
                log::error!("sync failed: {e}");
                self.set_state(SyncState::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, mode: &SyncMode, priority_ids: &[String]) -> Result<SyncOutcome> {
        // Phase 1: hot sync of the visible rows.
        self.set_state(SyncState::HotSyncing);
        let mut hot_synced: u64 = 0;
        if !priority_ids.is_empty() {
            let orders = self.api.list_orders_by_ids(priority_ids).await?;
            hot_synced = orders.len() as u64;
            self.db
                .writer()
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    for order in &orders {
                        repository::upsert_order(&tx, order)?;
                    }
                    tx.commit()?;
                    Ok::<(), rusqlite::Error>(())
                })
                .await?;
            // Silent refresh so the visible rows pick up new statuses
            // before the slower background phase runs.
            let _ = self.fetch_local(OrderQuery::new()).await;
        }

        // Phase 2: background consistency sync over the mode's window.
        self.set_state(SyncState::BackgroundSyncing);
        let now = Local::now().naive_local();
        let (date_type, start, end, narrowed) = mode.window(now);
        if narrowed {
            log::info!(
                "manual range narrowed to the last 5 days to bound latency; older rows not re-synced"
            );
        }
        let report = runner::sync_range(&self.db, self.api.as_ref(), date_type, start, end).await?;

        let stamp = Local::now()
            .naive_local()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_config(conn, repository::LAST_SYNCED_AT, &stamp))
            .await?;
        let _ = self.fetch_local(OrderQuery::new()).await;

        Ok(SyncOutcome {
            hot_synced,
            background: report,
            narrowed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DateType, OrderListQuery, OrderPage, OrderPayload};
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn order(id: &str, status: &str) -> OrderPayload {
        OrderPayload {
            order_id: id.to_string(),
            store_name: Some("us-main".to_string()),
            status: Some(status.to_string()),
            purchase_at: Some("2026-08-28 09:00:00".to_string()),
            ..Default::default()
        }
    }

    /// Hot batch returns scripted orders; the background list returns a
    /// single scripted page then empties.
    struct ScriptedApi {
        hot: Vec<OrderPayload>,
        background: Vec<OrderPayload>,
        hot_calls: AtomicU32,
        list_calls: AtomicU32,
    }

    #[async_trait]
    impl OrderApi for ScriptedApi {
        async fn list_orders(&self, query: &OrderListQuery) -> Result<OrderPage> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let rows = if query.page_no == 1 {
                self.background.clone()
            } else {
                Vec::new()
            };
            Ok(OrderPage {
                total_size: rows.len() as u64,
                rows,
            })
        }

        async fn list_orders_by_ids(&self, ids: &[String]) -> Result<Vec<OrderPayload>> {
            self.hot_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .hot
                .iter()
                .filter(|o| ids.contains(&o.order_id))
                .cloned()
                .collect())
        }

        async fn count_orders(
            &self,
            _date_type: DateType,
            _start: NaiveDateTime,
            _end: NaiveDateTime,
        ) -> Result<u64> {
            Ok(0)
        }
    }

    fn orchestrator_with(api: ScriptedApi, db: Database) -> SyncOrchestrator {
        SyncOrchestrator::new(db, Arc::new(api))
    }

    #[tokio::test]
    async fn test_sync_runs_hot_then_background() {
        let db = Database::open_memory().await.unwrap();
        let api = ScriptedApi {
            hot: vec![order("O1", "Shipped")],
            background: vec![order("O2", "Pending")],
            hot_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        };
        let orch = orchestrator_with(api, db.clone());

        let outcome = orch
            .sync(SyncMode::Auto, &["O1".to_string()])
            .await
            .unwrap();

        assert_eq!(outcome.hot_synced, 1);
        assert_eq!(outcome.background.synced_count, 1);
        assert!(!outcome.narrowed);
        assert_eq!(orch.state(), SyncState::Idle);
        assert!(orch.last_synced_at().await.unwrap().is_some());

        let count: u64 = db
            .reader()
            .call(|conn| repository::count_orders(conn))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_sync_without_priority_ids_skips_hot_phase() {
        let db = Database::open_memory().await.unwrap();
        let api = ScriptedApi {
            hot: vec![order("O1", "Shipped")],
            background: vec![],
            hot_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        };
        let api = Arc::new(api);
        let orch = SyncOrchestrator::new(db, api.clone());

        let outcome = orch.sync(SyncMode::Auto, &[]).await.unwrap();
        assert_eq!(outcome.hot_synced, 0);
        assert_eq!(api.hot_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_narrowing_is_surfaced() {
        let db = Database::open_memory().await.unwrap();
        let api = ScriptedApi {
            hot: vec![],
            background: vec![],
            hot_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        };
        let orch = orchestrator_with(api, db);

        let start = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let end = chrono::NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let outcome = orch
            .sync(SyncMode::Manual { start, end }, &[])
            .await
            .unwrap();
        assert!(outcome.narrowed);
    }

    #[tokio::test]
    async fn test_superseded_fetch_local_is_cancelled() {
        let db = Database::open_memory().await.unwrap();
        let api = ScriptedApi {
            hot: vec![],
            background: vec![],
            hot_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        };
        let orch = Arc::new(orchestrator_with(api, db.clone()));

        // Occupy the connection thread so queued reads cannot complete
        // until after the newer calls have superseded the older ones.
        let writer = db.writer().clone();
        let blocker = tokio::spawn(async move {
            writer
                .call(|_conn| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok::<(), rusqlite::Error>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.fetch_local(OrderQuery::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.fetch_local(OrderQuery::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The third call supersedes both earlier ones and completes.
        let third = orch.fetch_local(OrderQuery::new()).await;

        assert!(matches!(
            first.await.unwrap(),
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(Error::Cancelled)
        ));
        assert!(third.is_ok());
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fetch_local_reads_only_local_rows() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| repository::upsert_order(conn, &order("O9", "Pending")))
            .await
            .unwrap();
        let api = ScriptedApi {
            hot: vec![],
            background: vec![],
            hot_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        };
        let orch = orchestrator_with(api, db);

        let rows = orch.fetch_local(OrderQuery::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_id, "O9");
    }
}
