use chrono::NaiveDateTime;

use crate::api::{DateType, OrderApi, OrderListQuery};
use crate::date_util::format_api_datetime;
use crate::error::{ApiErrorKind, Result};
use crate::storage::{repository, Database};
use crate::sync::SyncReport;

/// Page size requested by default.
const DEFAULT_PAGE_SIZE: u32 = 200;
/// Page size after the platform signals "page too large".
const REDUCED_PAGE_SIZE: u32 = 100;
/// Hard upper bound on pages per run, in case the dedup guard never fires.
const MAX_PAGES: u32 = 500;

/// Drive date-ranged, cursor-paginated retrieval from the platform,
/// applying each page in one local transaction.
///
/// Termination: an empty page ends the run; a page whose first order id
/// matches the previous page's first id means the API is repeating
/// itself, and the run ends as complete rather than looping. A failure
/// while writing a page rolls that page back and aborts the run;
/// previously committed pages are kept.
pub async fn sync_range(
    db: &Database,
    api: &dyn OrderApi,
    date_type: DateType,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<SyncReport> {
    let window = format!(
        "{} {}..{}",
        date_type.as_param(),
        format_api_datetime(start),
        format_api_datetime(end)
    );
    log::info!("syncing {window}");

    let mut page_no: u32 = 1;
    let mut page_size = DEFAULT_PAGE_SIZE;
    let mut shrunk = false;
    // First order id seen on the previous page; never outlives this run.
    let mut prev_first_id: Option<String> = None;
    let mut synced_count: u64 = 0;
    let mut pages: u32 = 0;
    let mut stalled = false;

    while page_no <= MAX_PAGES {
        let query = OrderListQuery {
            date_type,
            start,
            end,
            page_no,
            page_size,
        };
        let page = match api.list_orders(&query).await {
            Ok(page) => page,
            Err(e) if e.api_kind() == Some(ApiErrorKind::PageTooLarge) && !shrunk => {
                log::warn!(
                    "page size {page_size} too large for {window}, retrying page {page_no} at {REDUCED_PAGE_SIZE}"
                );
                page_size = REDUCED_PAGE_SIZE;
                shrunk = true;
                continue;
            }
            Err(e) => return Err(e),
        };

        if page.rows.is_empty() {
            break;
        }

        let first_id = page.rows[0].order_id.clone();
        if prev_first_id.as_deref() == Some(first_id.as_str()) {
            // Pagination stalled: the platform is repeating pages.
            log::warn!("pagination stalled at page {page_no} for {window}, ending run");
            stalled = true;
            break;
        }
        prev_first_id = Some(first_id);

        let rows = page.rows;
        let written = db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for order in &rows {
                    repository::upsert_order(&tx, order)?;
                }
                tx.commit()?;
                Ok::<usize, rusqlite::Error>(rows.len())
            })
            .await?;

        synced_count += written as u64;
        pages += 1;
        log::debug!("committed page {page_no} ({written} orders) for {window}");
        page_no += 1;
    }

    log::info!("synced {synced_count} orders over {pages} pages for {window}");
    Ok(SyncReport {
        window,
        synced_count,
        pages,
        stalled,
    })
}
