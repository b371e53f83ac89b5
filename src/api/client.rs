use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::api::signing;
use crate::api::token::TokenCache;
use crate::api::{DateType, OrderApi, OrderListQuery, OrderPage, OrderPayload};
use crate::date_util::format_api_datetime;
use crate::error::{ApiErrorKind, Error, Result};

/// Platform code meaning success.
const CODE_OK: i64 = 0;
/// Platform code meaning the access token is invalid or expired.
const CODE_TOKEN_EXPIRED: i64 = 401;
/// Platform code meaning the requested page size is too large.
const CODE_PAGE_TOO_LARGE: i64 = 413;
/// Platform code meaning the caller is being throttled.
const CODE_RATE_LIMITED: i64 = 429;

/// Minimum delay between consecutive platform calls.
const MIN_CALL_INTERVAL: Duration = Duration::from_millis(1000);
/// Timeout for sync calls to the platform.
const CALL_TIMEOUT: Duration = Duration::from_secs(15);
/// Bounded retries for transient failures.
const MAX_RETRIES: u32 = 3;
/// Fixed backoff between transient retries.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Classify a platform error code into the closed retry taxonomy.
fn classify_code(code: i64) -> ApiErrorKind {
    match code {
        CODE_TOKEN_EXPIRED => ApiErrorKind::TokenExpired,
        CODE_PAGE_TOO_LARGE => ApiErrorKind::PageTooLarge,
        CODE_RATE_LIMITED => ApiErrorKind::RateLimited,
        _ => ApiErrorKind::Other,
    }
}

/// Response envelope shared by all platform endpoints.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListData {
    #[serde(default)]
    rows: Vec<serde_json::Value>,
    #[serde(default)]
    total_size: u64,
}

/// The raw HTTP hop, behind a trait so retry and signing logic is
/// testable with scripted responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST a JSON body with the given query parameters; returns the
    /// raw response body.
    async fn post(
        &self,
        url: &str,
        query: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<String>;
}

/// Production transport over reqwest.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        query: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<String> {
        let response = self
            .http
            .post(url)
            .timeout(CALL_TIMEOUT)
            .query(query)
            .json(body)
            .send()
            .await?;
        Ok(response.text().await?)
    }
}

/// Throttle state: the instant of the last issued call.
struct Gate {
    last_call: Option<Instant>,
}

/// Signed client for the order platform. Signs every request with an
/// HMAC-SHA256 digest over the sorted parameters, serializes calls
/// through a minimum inter-call delay, refreshes the token once on an
/// auth rejection, and retries transient failures a bounded number of
/// times.
pub struct SignedApiClient {
    transport: Box<dyn HttpTransport>,
    tokens: TokenCache,
    base_url: String,
    app_id: String,
    app_secret: String,
    gate: Mutex<Gate>,
}

impl SignedApiClient {
    pub fn new(
        transport: Box<dyn HttpTransport>,
        tokens: TokenCache,
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            base_url: base_url.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            gate: Mutex::new(Gate { last_call: None }),
        }
    }

    /// Issue a signed call. Holds the gate for the whole call so no two
    /// platform requests are ever in flight concurrently.
    pub async fn call(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let mut gate = self.gate.lock().await;
        let mut refreshed = false;
        let mut attempts: u32 = 0;

        loop {
            if let Some(prev) = gate.last_call {
                let elapsed = prev.elapsed();
                if elapsed < MIN_CALL_INTERVAL {
                    tokio::time::sleep(MIN_CALL_INTERVAL - elapsed).await;
                }
            }
            gate.last_call = Some(Instant::now());

            match self.issue(path, &body).await {
                Ok(data) => return Ok(data),
                Err(e) => match e.api_kind() {
                    Some(ApiErrorKind::TokenExpired) if !refreshed => {
                        log::info!("platform rejected token on {path}, refreshing once");
                        self.tokens.invalidate().await;
                        refreshed = true;
                    }
                    Some(ApiErrorKind::PageTooLarge) => return Err(e),
                    Some(ApiErrorKind::RateLimited) | Some(ApiErrorKind::Other)
                        if attempts < MAX_RETRIES =>
                    {
                        attempts += 1;
                        log::warn!(
                            "transient platform error on {path} (attempt {attempts}/{MAX_RETRIES}): {e}"
                        );
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    None if matches!(e, Error::Network(_)) && attempts < MAX_RETRIES => {
                        attempts += 1;
                        log::warn!(
                            "network error on {path} (attempt {attempts}/{MAX_RETRIES}): {e}"
                        );
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    /// One signed request/response exchange, no retry policy.
    async fn issue(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let token = self.tokens.token().await?;

        let timestamp = Utc::now().timestamp_millis().to_string();
        let nonce = rand::rng().random::<u64>().to_string();

        let mut params: Vec<(String, String)> = vec![
            ("appId".into(), self.app_id.clone()),
            ("accessToken".into(), token),
            ("timestamp".into(), timestamp),
            ("nonce".into(), nonce),
        ];
        // Business parameters participate in the signature too.
        if let Some(map) = body.as_object() {
            for (key, value) in map {
                params.push((key.clone(), scalar_to_string(value)));
            }
        }
        let sign = signing::sign(&params, &self.app_secret);

        // Only the auth parameters and signature travel in the query.
        let mut query: Vec<(String, String)> = params.drain(..4).collect();
        query.push(("sign".into(), sign));

        let url = format!("{}{}", self.base_url, path);
        let raw = self.transport.post(&url, &query, body).await?;

        let envelope: Envelope = serde_json::from_str(&raw)
            .map_err(|e| Error::Network(format!("malformed platform response: {e}")))?;
        if envelope.code != CODE_OK {
            return Err(Error::Api {
                kind: classify_code(envelope.code),
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    fn parse_rows(rows: Vec<serde_json::Value>) -> Result<Vec<OrderPayload>> {
        rows.into_iter()
            .map(|value| {
                let mut order: OrderPayload = serde_json::from_value(value.clone())
                    .map_err(|e| Error::Other(format!("unparseable order row: {e}")))?;
                order.raw = value;
                Ok(order)
            })
            .collect()
    }
}

/// Stringify a scalar JSON value the way it appears on the wire.
fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl OrderApi for SignedApiClient {
    async fn list_orders(&self, query: &OrderListQuery) -> Result<OrderPage> {
        let body = serde_json::json!({
            "pageNo": query.page_no,
            "pageSize": query.page_size,
            "dateType": query.date_type.as_param(),
            "dateStart": format_api_datetime(query.start),
            "dateEnd": format_api_datetime(query.end),
        });
        let data = self.call("/order/list", body).await?;
        let list: ListData = serde_json::from_value(data)
            .map_err(|e| Error::Other(format!("malformed order list: {e}")))?;
        Ok(OrderPage {
            rows: Self::parse_rows(list.rows)?,
            total_size: list.total_size,
        })
    }

    async fn list_orders_by_ids(&self, ids: &[String]) -> Result<Vec<OrderPayload>> {
        let body = serde_json::json!({ "orderIds": ids.join(",") });
        let data = self.call("/order/batch", body).await?;
        let list: ListData = serde_json::from_value(data)
            .map_err(|e| Error::Other(format!("malformed batch response: {e}")))?;
        Self::parse_rows(list.rows)
    }

    async fn count_orders(
        &self,
        date_type: DateType,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<u64> {
        // A pageSize-1 request is the cheapest way to read totalSize.
        let page = self
            .list_orders(&OrderListQuery {
                date_type,
                start,
                end,
                page_no: 1,
                page_size: 1,
            })
            .await?;
        Ok(page.total_size)
    }
}
