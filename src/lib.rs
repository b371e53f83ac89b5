pub mod api;
pub mod date_util;
pub mod error;
pub mod query;
pub mod reconcile;
pub mod storage;
pub mod sync;

pub use error::{ApiErrorKind, Error, Result};
pub use query::{OrderQuery, OrderRow};
pub use reconcile::{AuditStatus, DayAudit, MonthAudit, ReconciliationReport};
pub use storage::Database;
pub use sync::{SyncMode, SyncOutcome, SyncReport, SyncState};

use std::sync::Arc;

use api::client::{ReqwestTransport, SignedApiClient};
use api::token::{HttpTokenEndpoint, TokenCache};
use api::OrderApi;
use storage::repository;
use sync::orchestrator::SyncOrchestrator;

/// Main entry point for the order data warehouse.
pub struct OrderDW {
    db: Database,
    api: Arc<dyn OrderApi>,
    orchestrator: SyncOrchestrator,
}

impl OrderDW {
    pub fn new(db: Database, api: Arc<dyn OrderApi>) -> Self {
        let orchestrator = SyncOrchestrator::new(db.clone(), api.clone());
        Self {
            db,
            api,
            orchestrator,
        }
    }

    /// Build against the real platform using credentials from the
    /// environment: `ORDERDW_APP_ID`, `ORDERDW_APP_SECRET`, and
    /// optionally `ORDERDW_API_BASE`.
    pub fn from_env(db: Database) -> Result<Self> {
        let app_id = std::env::var("ORDERDW_APP_ID")
            .map_err(|_| Error::Config("ORDERDW_APP_ID is not set".into()))?;
        let app_secret = std::env::var("ORDERDW_APP_SECRET")
            .map_err(|_| Error::Config("ORDERDW_APP_SECRET is not set".into()))?;
        let base_url = std::env::var("ORDERDW_API_BASE")
            .unwrap_or_else(|_| "https://openapi.example-erp.com/api/v1".to_string());

        let tokens = TokenCache::new(Box::new(HttpTokenEndpoint::new(
            format!("{base_url}/oauth/token"),
            app_id.clone(),
            app_secret.clone(),
        )));
        let client = SignedApiClient::new(
            Box::new(ReqwestTransport::new()),
            tokens,
            base_url,
            app_id,
            app_secret,
        );
        Ok(Self::new(db, Arc::new(client)))
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Access the platform client directly (used by reconciliation).
    pub fn api(&self) -> &dyn OrderApi {
        self.api.as_ref()
    }

    // ── Sync commands ──────────────────────────────────────────────

    /// Run a full orchestrated sync (hot phase, then background phase).
    pub async fn sync(&self, mode: SyncMode, priority_ids: &[String]) -> Result<SyncOutcome> {
        self.orchestrator.sync(mode, priority_ids).await
    }

    /// Query the local mirror, superseding any in-flight local read.
    pub async fn fetch_local(&self, query: OrderQuery) -> Result<Vec<OrderRow>> {
        self.orchestrator.fetch_local(query).await
    }

    pub fn sync_state(&self) -> SyncState {
        self.orchestrator.state()
    }

    pub async fn last_synced_at(&self) -> Result<Option<String>> {
        self.orchestrator.last_synced_at().await
    }

    /// Audit a calendar year against the platform and repair short days.
    pub async fn reconcile_year(&self, year: i32) -> Result<ReconciliationReport> {
        reconcile::reconcile_year(&self.db, self.api.as_ref(), year).await
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
