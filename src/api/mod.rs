pub mod client;
pub mod signing;
pub mod token;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::Result;

/// Which order timestamp a date-ranged query filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateType {
    /// Filter on purchase time (used by reconciliation and history syncs).
    Purchase,
    /// Filter on last-update time (used by freshness syncs).
    UpdateTime,
}

impl DateType {
    pub fn as_param(&self) -> &'static str {
        match self {
            DateType::Purchase => "purchase",
            DateType::UpdateTime => "updateDateTime",
        }
    }
}

/// Parameters for one page of the order-list endpoint.
#[derive(Debug, Clone)]
pub struct OrderListQuery {
    pub date_type: DateType,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub page_no: u32,
    pub page_size: u32,
}

/// One page of results from the order-list endpoint.
#[derive(Debug, Clone, Default)]
pub struct OrderPage {
    pub rows: Vec<OrderPayload>,
    pub total_size: u64,
}

/// A line item as the platform reports it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemPayload {
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub unit_price: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub promotion_ids: Option<String>,
    #[serde(default)]
    pub purchase_cost: Option<String>,
    #[serde(default)]
    pub head_leg_cost: Option<String>,
    #[serde(default)]
    pub shipping_cost: Option<String>,
    #[serde(default)]
    pub tax: Option<String>,
    #[serde(default)]
    pub discount: Option<String>,
}

/// An order header as the platform reports it. Monetary fields arrive as
/// strings and are parsed defensively at write time; the full original
/// JSON travels alongside in `raw` for forward compatibility.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub order_id: String,
    #[serde(default)]
    pub seller_order_id: Option<String>,
    #[serde(default)]
    pub store_name: Option<String>,
    #[serde(default)]
    pub marketplace_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub purchase_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub buyer_name: Option<String>,
    #[serde(default)]
    pub buyer_email: Option<String>,
    #[serde(default)]
    pub sales_channel: Option<String>,
    #[serde(default)]
    pub profit: Option<String>,
    #[serde(default)]
    pub refund_at: Option<String>,
    #[serde(default)]
    pub fulfillment_channel: Option<String>,
    #[serde(default)]
    pub is_business: Option<bool>,
    #[serde(default)]
    pub is_replacement: Option<bool>,
    #[serde(default)]
    pub latest_ship_at: Option<String>,
    #[serde(default)]
    pub items: Vec<OrderItemPayload>,
    /// Original payload snapshot, attached after deserialization.
    #[serde(skip)]
    pub raw: serde_json::Value,
}

/// The external platform surface the sync engine consumes. Behind a trait
/// so the runner, orchestrator, and auditor are testable against mocks.
#[async_trait]
pub trait OrderApi: Send + Sync {
    /// One page of date-ranged orders.
    async fn list_orders(&self, query: &OrderListQuery) -> Result<OrderPage>;

    /// Batch fetch scoped to exactly the given external order ids.
    async fn list_orders_by_ids(&self, ids: &[String]) -> Result<Vec<OrderPayload>>;

    /// Total order count for a window (issued as a pageSize-1 request).
    async fn count_orders(
        &self,
        date_type: DateType,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_type_params() {
        assert_eq!(DateType::Purchase.as_param(), "purchase");
        assert_eq!(DateType::UpdateTime.as_param(), "updateDateTime");
    }

    #[test]
    fn test_order_payload_tolerates_missing_fields() {
        let json = r#"{"orderId": "111-222", "status": "Shipped"}"#;
        let order: OrderPayload = serde_json::from_str(json).unwrap();
        assert_eq!(order.order_id, "111-222");
        assert_eq!(order.status.as_deref(), Some("Shipped"));
        assert!(order.amount.is_none());
        assert!(order.items.is_empty());
    }

    #[test]
    fn test_order_payload_with_items() {
        let json = r#"{
            "orderId": "111-333",
            "storeName": "us-main",
            "amount": "42.50",
            "items": [
                {"sku": "SKU-1", "quantity": 2, "unitPrice": "21.25"}
            ]
        }"#;
        let order: OrderPayload = serde_json::from_str(json).unwrap();
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].sku.as_deref(), Some("SKU-1"));
        assert_eq!(order.items[0].quantity, Some(2));
    }
}
