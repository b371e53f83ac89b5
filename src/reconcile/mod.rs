//! Month-then-day audit of the local mirror against the platform's
//! order counts, with targeted repair syncs for days that come up short.

use chrono::{Local, NaiveDate};
use serde::Serialize;

use crate::api::{DateType, OrderApi};
use crate::date_util::{day_window, days_in_month, month_window};
use crate::error::Result;
use crate::storage::{repository, Database};
use crate::sync::{runner, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditStatus {
    /// External and local counts match.
    Balanced,
    /// Local mirror has fewer orders than the platform.
    Missing,
    /// Local mirror has more orders than the platform. Not repaired
    /// automatically; usually means orders were re-dated upstream.
    Surplus,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthAudit {
    pub year: i32,
    pub month: u32,
    pub external: u64,
    pub local: u64,
    pub status: AuditStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayAudit {
    pub day: NaiveDate,
    pub external: u64,
    pub local: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub year: i32,
    pub months: Vec<MonthAudit>,
    /// Days that came up short, in audit order.
    pub deficit_days: Vec<DayAudit>,
    /// One repair sync per deficit day.
    pub repairs: Vec<SyncReport>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        self.months
            .iter()
            .all(|m| m.status == AuditStatus::Balanced)
    }
}

/// Audit a calendar year month by month. Months whose local count falls
/// short of the platform's are drilled into day by day, and each deficit
/// day gets its own repair sync. Future months and days are skipped.
pub async fn reconcile_year(
    db: &Database,
    api: &dyn OrderApi,
    year: i32,
) -> Result<ReconciliationReport> {
    reconcile_year_as_of(db, api, year, Local::now().date_naive()).await
}

async fn reconcile_year_as_of(
    db: &Database,
    api: &dyn OrderApi,
    year: i32,
    today: NaiveDate,
) -> Result<ReconciliationReport> {
    log::info!("reconciling year {year}");
    let mut months = Vec::new();
    let mut deficit_days = Vec::new();
    let mut repairs = Vec::new();

    for month in 1..=12 {
        let month_start = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
        if month_start > today {
            break;
        }

        let (start, end) = month_window(year, month);
        let external = api.count_orders(DateType::Purchase, start, end).await?;
        let local = db
            .reader()
            .call(move |conn| repository::count_orders_between(conn, start, end))
            .await?;

        let status = match local.cmp(&external) {
            std::cmp::Ordering::Equal => AuditStatus::Balanced,
            std::cmp::Ordering::Less => AuditStatus::Missing,
            std::cmp::Ordering::Greater => AuditStatus::Surplus,
        };
        if status != AuditStatus::Balanced {
            log::warn!(
                "{year}-{month:02}: local {local} vs external {external} ({status:?})"
            );
        }
        months.push(MonthAudit {
            year,
            month,
            external,
            local,
            status,
        });

        if status != AuditStatus::Missing {
            continue;
        }

        // Drill into the short month day by day.
        for day_no in 1..=days_in_month(year, month) {
            let day = NaiveDate::from_ymd_opt(year, month, day_no).unwrap();
            if day > today {
                break;
            }
            let (day_start, day_end) = day_window(day);
            let day_external = api
                .count_orders(DateType::Purchase, day_start, day_end)
                .await?;
            let day_local = db
                .reader()
                .call(move |conn| repository::count_orders_between(conn, day_start, day_end))
                .await?;
            if day_local >= day_external {
                continue;
            }

            log::info!("repairing {day}: local {day_local} vs external {day_external}");
            deficit_days.push(DayAudit {
                day,
                external: day_external,
                local: day_local,
            });
            let report =
                runner::sync_range(db, api, DateType::Purchase, day_start, day_end).await?;
            repairs.push(report);
        }
    }

    log::info!(
        "reconciled {year}: {} months audited, {} repairs",
        months.len(),
        repairs.len()
    );
    Ok(ReconciliationReport {
        year,
        months,
        deficit_days,
        repairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderListQuery, OrderPage, OrderPayload};
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn order(id: &str, purchased: &str) -> OrderPayload {
        OrderPayload {
            order_id: id.to_string(),
            store_name: Some("us-main".to_string()),
            status: Some("Shipped".to_string()),
            purchase_at: Some(purchased.to_string()),
            ..Default::default()
        }
    }

    /// Platform double holding a fixed set of orders; counts and listings
    /// both derive from the same set, filtered by purchase date.
    struct FixedApi {
        orders: Vec<OrderPayload>,
        list_calls: AtomicU32,
    }

    impl FixedApi {
        fn new(orders: Vec<OrderPayload>) -> Self {
            Self {
                orders,
                list_calls: AtomicU32::new(0),
            }
        }

        fn in_window(&self, start: NaiveDateTime, end: NaiveDateTime) -> Vec<OrderPayload> {
            let lo = start.format("%Y-%m-%d %H:%M:%S").to_string();
            let hi = end.format("%Y-%m-%d %H:%M:%S").to_string();
            self.orders
                .iter()
                .filter(|o| {
                    o.purchase_at
                        .as_deref()
                        .map(|p| p >= lo.as_str() && p <= hi.as_str())
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl OrderApi for FixedApi {
        async fn list_orders(&self, query: &OrderListQuery) -> Result<OrderPage> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let all = self.in_window(query.start, query.end);
            let total = all.len() as u64;
            let from = ((query.page_no - 1) * query.page_size) as usize;
            let rows = all
                .into_iter()
                .skip(from)
                .take(query.page_size as usize)
                .collect();
            Ok(OrderPage {
                rows,
                total_size: total,
            })
        }

        async fn list_orders_by_ids(&self, ids: &[String]) -> Result<Vec<OrderPayload>> {
            Ok(self
                .orders
                .iter()
                .filter(|o| ids.contains(&o.order_id))
                .cloned()
                .collect())
        }

        async fn count_orders(
            &self,
            _date_type: DateType,
            start: NaiveDateTime,
            end: NaiveDateTime,
        ) -> Result<u64> {
            Ok(self.in_window(start, end).len() as u64)
        }
    }

    async fn seed(db: &Database, orders: Vec<OrderPayload>) {
        db.writer()
            .call(move |conn| {
                for o in &orders {
                    repository::upsert_order(conn, o)?;
                }
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 29).unwrap()
    }

    #[tokio::test]
    async fn test_balanced_year_needs_no_repairs() {
        let db = Database::open_memory().await.unwrap();
        let orders = vec![
            order("O1", "2026-03-14 10:00:00"),
            order("O2", "2026-05-02 08:30:00"),
        ];
        seed(&db, orders.clone()).await;
        let api = FixedApi::new(orders);

        let report = reconcile_year_as_of(&db, &api, 2026, today()).await.unwrap();

        assert!(report.is_balanced());
        assert!(report.repairs.is_empty());
        // Months clipped at today: Jan through Aug.
        assert_eq!(report.months.len(), 8);
        // No drill-down ever listed orders.
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_day_is_found_and_repaired() {
        let db = Database::open_memory().await.unwrap();
        let external = vec![
            order("O1", "2026-03-14 10:00:00"),
            order("O2", "2026-03-14 15:00:00"),
            order("O3", "2026-03-20 09:00:00"),
        ];
        // Local mirror is missing O2.
        seed(
            &db,
            vec![
                order("O1", "2026-03-14 10:00:00"),
                order("O3", "2026-03-20 09:00:00"),
            ],
        )
        .await;
        let api = FixedApi::new(external);

        let report = reconcile_year_as_of(&db, &api, 2026, today()).await.unwrap();

        let march = report.months.iter().find(|m| m.month == 3).unwrap();
        assert_eq!(march.status, AuditStatus::Missing);
        assert_eq!(march.external, 3);
        assert_eq!(march.local, 2);

        // Exactly the one short day was repaired.
        assert_eq!(report.deficit_days.len(), 1);
        assert_eq!(
            report.deficit_days[0].day,
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
        );
        assert_eq!(report.repairs.len(), 1);
        assert!(report.repairs[0].window.contains("2026-03-14 00:00:00"));
        assert!(report.repairs[0].window.contains("2026-03-14 23:59:59"));

        // The repair actually landed the missing order.
        let count = db
            .reader()
            .call(|conn| repository::count_orders(conn))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_surplus_month_reported_but_not_repaired() {
        let db = Database::open_memory().await.unwrap();
        // Local has an order the platform no longer reports in February.
        seed(&db, vec![order("O9", "2026-02-10 12:00:00")]).await;
        let api = FixedApi::new(vec![]);

        let report = reconcile_year_as_of(&db, &api, 2026, today()).await.unwrap();

        let feb = report.months.iter().find(|m| m.month == 2).unwrap();
        assert_eq!(feb.status, AuditStatus::Surplus);
        assert!(report.repairs.is_empty());
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_future_months_skipped() {
        let db = Database::open_memory().await.unwrap();
        let api = FixedApi::new(vec![]);
        let early = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();

        let report = reconcile_year_as_of(&db, &api, 2026, early).await.unwrap();
        assert_eq!(report.months.len(), 2);
    }
}
