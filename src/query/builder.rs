use serde::Serialize;

use crate::error::Result;
use crate::storage::Database;

/// A row from a local order query.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    pub order_id: String,
    pub seller_order_id: Option<String>,
    pub store_name: String,
    pub marketplace_id: Option<String>,
    pub status: String,
    pub purchase_at: Option<String>,
    pub updated_at: Option<String>,
    pub amount: f64,
    pub currency: Option<String>,
    pub buyer_name: Option<String>,
    pub sales_channel: Option<String>,
    pub profit: f64,
    pub refund_at: Option<String>,
    pub fulfillment_channel: Option<String>,
    pub item_count: i64,
}

/// Builder for constructing local order queries with optional filters.
/// Queries only ever touch the local mirror, never the platform.
#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    store_name: Option<String>,
    status: Option<String>,
    marketplace_id: Option<String>,
    purchased_after: Option<String>,
    purchased_before: Option<String>,
    updated_after: Option<String>,
    updated_before: Option<String>,
    buyer_contains: Option<String>,
    refunded: Option<bool>,
    limit: Option<u32>,
    offset: Option<u32>,
    order_by: Option<String>,
    order_desc: bool,
}

impl OrderQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, name: &str) -> Self {
        self.store_name = Some(name.to_string());
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn marketplace(mut self, id: &str) -> Self {
        self.marketplace_id = Some(id.to_string());
        self
    }

    pub fn purchased_after(mut self, date: &str) -> Self {
        self.purchased_after = Some(date.to_string());
        self
    }

    pub fn purchased_before(mut self, date: &str) -> Self {
        self.purchased_before = Some(date.to_string());
        self
    }

    pub fn updated_after(mut self, date: &str) -> Self {
        self.updated_after = Some(date.to_string());
        self
    }

    pub fn updated_before(mut self, date: &str) -> Self {
        self.updated_before = Some(date.to_string());
        self
    }

    pub fn buyer_contains(mut self, fragment: &str) -> Self {
        self.buyer_contains = Some(fragment.to_string());
        self
    }

    pub fn refunded(mut self, val: bool) -> Self {
        self.refunded = Some(val);
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u32) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order_desc = true;
        self
    }

    /// Build and execute the query, returning order rows.
    pub async fn orders(self, db: &Database) -> Result<Vec<OrderRow>> {
        let builder = self;
        db.reader()
            .call(move |conn| {
                let (sql, params) = builder.build_sql();
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(param_refs.as_slice(), |row| {
                    Ok(OrderRow {
                        order_id: row.get(0)?,
                        seller_order_id: row.get(1)?,
                        store_name: row.get(2)?,
                        marketplace_id: row.get(3)?,
                        status: row.get(4)?,
                        purchase_at: row.get(5)?,
                        updated_at: row.get(6)?,
                        amount: row.get(7)?,
                        currency: row.get(8)?,
                        buyer_name: row.get(9)?,
                        sales_channel: row.get(10)?,
                        profit: row.get(11)?,
                        refund_at: row.get(12)?,
                        fulfillment_channel: row.get(13)?,
                        item_count: row.get(14)?,
                    })
                })?;
                let result: std::result::Result<Vec<OrderRow>, _> = rows.collect();
                result
            })
            .await
            .map_err(|e| crate::error::Error::Database(e.to_string()))
    }

    /// Build and execute the query, returning a count of matching orders.
    pub async fn count(self, db: &Database) -> Result<u64> {
        let builder = self;
        db.reader()
            .call(move |conn| {
                let (inner_sql, params) = builder.build_sql();
                let sql = format!("SELECT COUNT(*) FROM ({inner_sql})");
                let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();
                let count: i64 = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
                Ok::<u64, rusqlite::Error>(count as u64)
            })
            .await
            .map_err(|e| crate::error::Error::Database(e.to_string()))
    }

    /// Build and execute the query, returning results as JSON.
    pub async fn to_json(self, db: &Database) -> Result<String> {
        let rows = self.orders(db).await?;
        serde_json::to_string_pretty(&rows)
            .map_err(|e| crate::error::Error::Other(e.to_string()))
    }

    /// Build and execute the query, returning results as CSV.
    pub async fn to_csv(self, db: &Database) -> Result<String> {
        let rows = self.orders(db).await?;
        let mut out = String::new();
        out.push_str("order_id,seller_order_id,store_name,marketplace_id,status,purchase_at,updated_at,amount,currency,buyer_name,sales_channel,profit,refund_at,fulfillment_channel,item_count\n");
        for row in &rows {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
                csv_escape(&row.order_id),
                csv_escape(row.seller_order_id.as_deref().unwrap_or("")),
                csv_escape(&row.store_name),
                csv_escape(row.marketplace_id.as_deref().unwrap_or("")),
                csv_escape(&row.status),
                csv_escape(row.purchase_at.as_deref().unwrap_or("")),
                csv_escape(row.updated_at.as_deref().unwrap_or("")),
                row.amount,
                csv_escape(row.currency.as_deref().unwrap_or("")),
                csv_escape(row.buyer_name.as_deref().unwrap_or("")),
                csv_escape(row.sales_channel.as_deref().unwrap_or("")),
                row.profit,
                csv_escape(row.refund_at.as_deref().unwrap_or("")),
                csv_escape(row.fulfillment_channel.as_deref().unwrap_or("")),
                row.item_count,
            ));
        }
        Ok(out)
    }

    fn build_sql(&self) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut wheres = Vec::new();
        let mut param_idx = 1;

        let select = "SELECT o.order_id, o.seller_order_id, o.store_name, o.marketplace_id,
                o.status, o.purchase_at, o.updated_at, o.amount, o.currency,
                o.buyer_name, o.sales_channel, o.profit, o.refund_at,
                o.fulfillment_channel,
                (SELECT COUNT(*) FROM order_items i
                   WHERE i.order_id = o.order_id AND i.store_name = o.store_name) AS item_count
            FROM orders o";

        if let Some(ref name) = self.store_name {
            wheres.push(format!("o.store_name = ?{param_idx}"));
            params.push(Box::new(name.clone()));
            param_idx += 1;
        }
        if let Some(ref status) = self.status {
            wheres.push(format!("o.status = ?{param_idx}"));
            params.push(Box::new(status.clone()));
            param_idx += 1;
        }
        if let Some(ref id) = self.marketplace_id {
            wheres.push(format!("o.marketplace_id = ?{param_idx}"));
            params.push(Box::new(id.clone()));
            param_idx += 1;
        }
        if let Some(ref date) = self.purchased_after {
            wheres.push(format!("o.purchase_at >= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            param_idx += 1;
        }
        if let Some(ref date) = self.purchased_before {
            wheres.push(format!("o.purchase_at <= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            param_idx += 1;
        }
        if let Some(ref date) = self.updated_after {
            wheres.push(format!("o.updated_at >= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            param_idx += 1;
        }
        if let Some(ref date) = self.updated_before {
            wheres.push(format!("o.updated_at <= ?{param_idx}"));
            params.push(Box::new(date.clone()));
            param_idx += 1;
        }
        if let Some(ref fragment) = self.buyer_contains {
            wheres.push(format!(
                "(o.buyer_name LIKE ?{param_idx} OR o.buyer_email LIKE ?{param_idx})"
            ));
            params.push(Box::new(format!("%{fragment}%")));
            param_idx += 1;
        }
        if let Some(refunded) = self.refunded {
            if refunded {
                wheres.push("o.refund_at IS NOT NULL".to_string());
            } else {
                wheres.push("o.refund_at IS NULL".to_string());
            }
        }

        let mut sql = select.to_string();
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres.join(" AND "));
        }

        let order_field = self.order_by.as_deref().unwrap_or("o.purchase_at");
        let order_dir = if self.order_desc { "DESC" } else { "ASC" };
        sql.push_str(&format!(" ORDER BY {order_field} {order_dir}"));

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT ?{param_idx}"));
            params.push(Box::new(limit));
            param_idx += 1;
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET ?{param_idx}"));
            params.push(Box::new(offset));
        }

        (sql, params)
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
