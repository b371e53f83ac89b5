use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};

use crate::api::{OrderItemPayload, OrderPayload};

/// Config key holding the timestamp of the last completed background sync.
pub const LAST_SYNCED_AT: &str = "last_synced_at";

/// Parse a platform monetary string defensively. Missing or non-numeric
/// values become 0.0 rather than failing the whole write.
pub fn parse_money(value: Option<&str>) -> f64 {
    value
        .map(str::trim)
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Parse a platform datetime string, or leave it null. Accepts the
/// platform's space-separated format, ISO-8601, and bare dates.
pub fn parse_datetime(value: Option<&str>) -> Option<String> {
    let s = value?.trim();
    if s.is_empty() {
        return None;
    }
    let parsed = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

// ── Orders ─────────────────────────────────────────────────────────

/// Idempotent merge of one external order payload: header upsert keyed
/// by the external order id, then a full delete-and-reinsert of its
/// line items. Must be called inside an open transaction so a line-item
/// failure can never leave an order with stale or missing items.
pub fn upsert_order(conn: &Connection, order: &OrderPayload) -> Result<(), rusqlite::Error> {
    let store_name = order.store_name.as_deref().unwrap_or("");
    conn.execute(
        "INSERT INTO orders (
            order_id, seller_order_id, store_name, marketplace_id, status,
            purchase_at, updated_at, amount, currency, buyer_name, buyer_email,
            sales_channel, raw_payload, profit, refund_at, fulfillment_channel,
            is_business, is_replacement, latest_ship_at, cached_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, datetime('now')
        )
        ON CONFLICT(order_id) DO UPDATE SET
            seller_order_id=excluded.seller_order_id, store_name=excluded.store_name,
            marketplace_id=excluded.marketplace_id, status=excluded.status,
            purchase_at=excluded.purchase_at, updated_at=excluded.updated_at,
            amount=excluded.amount, currency=excluded.currency,
            buyer_name=excluded.buyer_name, buyer_email=excluded.buyer_email,
            sales_channel=excluded.sales_channel, raw_payload=excluded.raw_payload,
            profit=excluded.profit, refund_at=excluded.refund_at,
            fulfillment_channel=excluded.fulfillment_channel,
            is_business=excluded.is_business, is_replacement=excluded.is_replacement,
            latest_ship_at=excluded.latest_ship_at, cached_at=excluded.cached_at",
        params![
            order.order_id,
            order.seller_order_id,
            store_name,
            order.marketplace_id,
            order.status.as_deref().unwrap_or(""),
            parse_datetime(order.purchase_at.as_deref()),
            parse_datetime(order.updated_at.as_deref()),
            parse_money(order.amount.as_deref()),
            order.currency,
            order.buyer_name,
            order.buyer_email,
            order.sales_channel,
            order.raw.to_string(),
            parse_money(order.profit.as_deref()),
            parse_datetime(order.refund_at.as_deref()),
            order.fulfillment_channel,
            order.is_business.unwrap_or(false) as i32,
            order.is_replacement.unwrap_or(false) as i32,
            parse_datetime(order.latest_ship_at.as_deref()),
        ],
    )?;

    replace_order_items(conn, &order.order_id, store_name, &order.items)
}

/// Replace all line items for (order id, store name): delete, then one
/// bulk insert. Never incrementally patched, so stale items from a
/// shrunk order cannot survive.
pub fn replace_order_items(
    conn: &Connection,
    order_id: &str,
    store_name: &str,
    items: &[OrderItemPayload],
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "DELETE FROM order_items WHERE order_id = ?1 AND store_name = ?2",
        params![order_id, store_name],
    )?;

    if items.is_empty() {
        return Ok(());
    }

    let placeholders: Vec<String> = (0..items.len())
        .map(|i| {
            let base = i * 14;
            format!(
                "({})",
                (1..=14)
                    .map(|j| format!("?{}", base + j))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
        .collect();
    let sql = format!(
        "INSERT INTO order_items (
            order_id, store_name, asin, sku, title, quantity, unit_price,
            image_url, promotion_ids, purchase_cost, head_leg_cost,
            shipping_cost, tax, discount
        ) VALUES {}",
        placeholders.join(", ")
    );

    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::with_capacity(items.len() * 14);
    for item in items {
        values.push(Box::new(order_id.to_string()));
        values.push(Box::new(store_name.to_string()));
        values.push(Box::new(item.asin.clone()));
        values.push(Box::new(item.sku.clone()));
        values.push(Box::new(item.title.clone()));
        values.push(Box::new(item.quantity.unwrap_or(0)));
        values.push(Box::new(parse_money(item.unit_price.as_deref())));
        values.push(Box::new(item.image_url.clone()));
        values.push(Box::new(item.promotion_ids.clone()));
        values.push(Box::new(parse_money(item.purchase_cost.as_deref())));
        values.push(Box::new(parse_money(item.head_leg_cost.as_deref())));
        values.push(Box::new(parse_money(item.shipping_cost.as_deref())));
        values.push(Box::new(parse_money(item.tax.as_deref())));
        values.push(Box::new(parse_money(item.discount.as_deref())));
    }
    let value_refs: Vec<&dyn rusqlite::types::ToSql> =
        values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, value_refs.as_slice())?;
    Ok(())
}

/// Count locally mirrored orders with purchase_at inside [start, end].
pub fn count_orders_between(
    conn: &Connection,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE purchase_at >= ?1 AND purchase_at <= ?2",
        params![
            start.format("%Y-%m-%d %H:%M:%S").to_string(),
            end.format("%Y-%m-%d %H:%M:%S").to_string()
        ],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn count_orders(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn count_order_items(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM order_items", [], |row| row.get(0))?;
    Ok(count as u64)
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO app_config (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}
