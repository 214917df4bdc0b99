// =============================================================================
// OKX v5 REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key and passphrase are never logged or serialised.
// Signature = base64(HMAC-SHA256(secret, timestamp + METHOD + path + body))
// with an ISO-8601 millisecond timestamp, sent alongside the API key and
// passphrase headers.
//
// Error mapping:
//   HTTP 5xx                      -> ExchangeTransient (retried with backoff)
//   envelope code != "0" / sCode  -> ExchangeReject { code } (51006 is the
//                                    bit-exact "price out of band" reject the
//                                    executor clamps and retries once)
// =============================================================================

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, Result};
use crate::gateway::limits::{with_retries, RestLimiter, DEFAULT_RETRIES};
use crate::market_data::Candle;
use crate::types::{Instrument, Timeframe};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";

/// Order kind offered to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    PostOnly,
}

impl OrderKind {
    pub fn ord_type(self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::PostOnly => "post_only",
        }
    }
}

/// A position as the exchange reports it.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Raw exchange side string; parsed by the caller, never defaulted.
    pub side: String,
    /// Size in contracts, positive.
    pub size: f64,
    pub avg_entry: f64,
    pub leverage: f64,
    pub margin: f64,
    pub unrealized_pnl: f64,
    pub c_time_ms: i64,
    pub u_time_ms: i64,
}

/// REST ticker payload.
#[derive(Debug, Clone, Copy)]
pub struct TickerData {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
    pub quote_volume_24h: f64,
}

/// Exchange price band for a symbol.
#[derive(Debug, Clone, Copy)]
pub struct PriceLimits {
    pub max_buy: f64,
    pub min_sell: f64,
}

/// Lifecycle state of an order on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Fill progress of an order.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    /// Accumulated fee in quote currency (negative = paid).
    pub fee: f64,
}

pub struct OkxClient {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    http: reqwest::Client,
    limiter: RestLimiter,
}

impl OkxClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: BASE_URL.to_string(),
            http,
            limiter: RestLimiter::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        signed: bool,
    ) -> Result<serde_json::Value> {
        let _permit = self.limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        let mut req = self.http.request(method.clone(), &url);

        if signed {
            let ts = Self::timestamp();
            let sig = self.sign(&ts, method.as_str(), path, &body_str);
            req = req
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", sig)
                .header("OK-ACCESS-TIMESTAMP", ts)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
        }
        if body.is_some() {
            req = req
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::ExchangeTransient(format!("{method} {path}: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(EngineError::ExchangeTransient(format!(
                "{method} {path} returned {status}"
            )));
        }

        let mut envelope: serde_json::Value = resp.json().await?;
        let code = envelope["code"].as_str().unwrap_or("");
        if code != "0" {
            // Trade endpoints report the specific reject per item in sCode.
            let (s_code, s_msg) = envelope["data"]
                .as_array()
                .and_then(|arr| arr.first())
                .map(|item| {
                    (
                        item["sCode"].as_str().unwrap_or("").to_string(),
                        item["sMsg"].as_str().unwrap_or("").to_string(),
                    )
                })
                .unwrap_or_default();

            let code = if s_code.is_empty() { code.to_string() } else { s_code };
            let message = if s_msg.is_empty() {
                envelope["msg"].as_str().unwrap_or("").to_string()
            } else {
                s_msg
            };
            return Err(EngineError::ExchangeReject { code, message });
        }

        Ok(envelope["data"].take())
    }

    async fn get(&self, path: &str, signed: bool) -> Result<serde_json::Value> {
        with_retries(path, DEFAULT_RETRIES, || {
            self.request(reqwest::Method::GET, path, None, signed)
        })
        .await
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        with_retries(path, DEFAULT_RETRIES, || {
            self.request(reqwest::Method::POST, path, Some(body.clone()), true)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// Total USDT equity of the trading account.
    #[instrument(skip(self), name = "okx::get_balance")]
    pub async fn get_balance(&self) -> Result<f64> {
        let data = self.get("/api/v5/account/balance?ccy=USDT", true).await?;
        let total_eq = data
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|acct| acct["totalEq"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        debug!(total_eq, "balance retrieved");
        Ok(total_eq)
    }

    /// All open swap positions as the exchange sees them.
    #[instrument(skip(self), name = "okx::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let data = self
            .get("/api/v5/account/positions?instType=SWAP", true)
            .await?;

        let mut positions = Vec::new();
        for item in data.as_array().into_iter().flatten() {
            let size = parse_decimal(&item["pos"]).unwrap_or(0.0);
            if size == 0.0 {
                continue;
            }

            // Netting mode: posSide is "net" and the sign of pos carries the
            // direction. Hedge-mode rows keep their explicit posSide.
            let pos_side = item["posSide"].as_str().unwrap_or("");
            let side = match pos_side {
                "net" | "" => {
                    if size > 0.0 {
                        "long".to_string()
                    } else {
                        "short".to_string()
                    }
                }
                explicit => explicit.to_string(),
            };

            positions.push(ExchangePosition {
                symbol: item["instId"].as_str().unwrap_or("").to_string(),
                side,
                size: size.abs(),
                avg_entry: parse_decimal(&item["avgPx"]).unwrap_or(0.0),
                leverage: parse_decimal(&item["lever"]).unwrap_or(0.0),
                margin: parse_decimal(&item["margin"])
                    .or_else(|| parse_decimal(&item["imr"]))
                    .unwrap_or(0.0),
                unrealized_pnl: parse_decimal(&item["upl"]).unwrap_or(0.0),
                c_time_ms: item["cTime"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                u_time_ms: item["uTime"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }

        debug!(count = positions.len(), "exchange positions retrieved");
        Ok(positions)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "okx::get_ticker")]
    pub async fn get_ticker(&self, symbol: &str) -> Result<TickerData> {
        let path = format!("/api/v5/market/ticker?instId={symbol}");
        let data = self.get(&path, false).await?;
        let item = data
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::ExchangeTransient("empty ticker response".into()))?;

        Ok(TickerData {
            last: parse_decimal(&item["last"]).unwrap_or(0.0),
            bid: parse_decimal(&item["bidPx"]).unwrap_or(0.0),
            ask: parse_decimal(&item["askPx"]).unwrap_or(0.0),
            ts_ms: item["ts"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
            quote_volume_24h: parse_decimal(&item["volCcy24h"]).unwrap_or(0.0),
        })
    }

    /// Historical candles, oldest first. The exchange returns newest first;
    /// this call reverses them.
    #[instrument(skip(self), name = "okx::get_candles")]
    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let path = format!(
            "/api/v5/market/candles?instId={symbol}&bar={}&limit={limit}",
            timeframe.bar()
        );
        let data = self.get(&path, false).await?;

        let mut candles = Vec::new();
        for entry in data.as_array().into_iter().flatten() {
            if let Some(candle) = parse_rest_candle(entry) {
                candles.push(candle);
            } else {
                warn!(symbol, "skipping malformed candle entry");
            }
        }
        candles.reverse();

        debug!(symbol, bar = timeframe.bar(), count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "okx::get_price_limits")]
    pub async fn get_price_limits(&self, symbol: &str) -> Result<PriceLimits> {
        let path = format!("/api/v5/public/price-limit?instId={symbol}");
        let data = self.get(&path, false).await?;
        let item = data
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::ExchangeTransient("empty price-limit response".into()))?;

        Ok(PriceLimits {
            max_buy: parse_decimal(&item["buyLmt"]).unwrap_or(f64::MAX),
            min_sell: parse_decimal(&item["sellLmt"]).unwrap_or(0.0),
        })
    }

    /// Contract metadata plus the account's fee tier for the instrument.
    #[instrument(skip(self), name = "okx::get_instrument")]
    pub async fn get_instrument(&self, symbol: &str) -> Result<Instrument> {
        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={symbol}");
        let data = self.get(&path, false).await?;
        let item = data
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::ExchangeReject {
                code: "instrument_not_found".into(),
                message: format!("{symbol} not in instruments response"),
            })?;

        let ct_val = parse_decimal(&item["ctVal"]).unwrap_or(0.0);
        let lot_size = parse_decimal(&item["lotSz"]).unwrap_or(0.0);
        let tick_size = parse_decimal(&item["tickSz"]).unwrap_or(0.0);
        let quote_ccy = item["settleCcy"].as_str().unwrap_or("USDT").to_string();

        // Fee tier is account-specific. The API reports maker/taker as
        // negative-for-paid rates; normalise to positive per-side fractions.
        let fee_path = format!("/api/v5/account/trade-fee?instType=SWAP&instId={symbol}");
        let (maker_fee, taker_fee) = match self.get(&fee_path, true).await {
            Ok(fee_data) => {
                let item = fee_data.as_array().and_then(|arr| arr.first()).cloned();
                let maker = item
                    .as_ref()
                    .and_then(|i| parse_decimal(&i["makerU"]).or_else(|| parse_decimal(&i["maker"])))
                    .map(|f| f.abs())
                    .unwrap_or(0.0002);
                let taker = item
                    .as_ref()
                    .and_then(|i| parse_decimal(&i["takerU"]).or_else(|| parse_decimal(&i["taker"])))
                    .map(|f| f.abs())
                    .unwrap_or(0.0005);
                (maker, taker)
            }
            Err(e) => {
                warn!(symbol, error = %e, "trade-fee lookup failed — using defaults");
                (0.0002, 0.0005)
            }
        };

        Ok(Instrument {
            symbol: symbol.to_string(),
            ct_val,
            lot_size,
            tick_size,
            maker_fee,
            taker_fee,
            quote_ccy,
        })
    }

    #[instrument(skip(self), name = "okx::get_funding_rate")]
    pub async fn get_funding_rate(&self, symbol: &str) -> Result<f64> {
        let path = format!("/api/v5/public/funding-rate?instId={symbol}");
        let data = self.get(&path, false).await?;
        let rate = data
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|item| parse_decimal(&item["fundingRate"]))
            .unwrap_or(0.0);
        Ok(rate)
    }

    // -------------------------------------------------------------------------
    // Trading
    // -------------------------------------------------------------------------

    /// Set cross leverage for a symbol. Must happen before the entry order;
    /// the position inherits it for its lifetime.
    #[instrument(skip(self), name = "okx::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()> {
        let body = serde_json::json!({
            "instId": symbol,
            "lever": format!("{leverage}"),
            "mgnMode": "cross",
        });
        self.post("/api/v5/account/set-leverage", body).await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// Submit an order. `order_side` is the exchange side ("buy"/"sell");
    /// returns the exchange order id.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, price), name = "okx::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        order_side: &str,
        kind: OrderKind,
        size_contracts: f64,
        price: Option<f64>,
        reduce_only: bool,
    ) -> Result<String> {
        let mut body = serde_json::json!({
            "instId": symbol,
            "tdMode": "cross",
            "side": order_side,
            "ordType": kind.ord_type(),
            "sz": format!("{size_contracts}"),
        });
        if let Some(px) = price {
            body["px"] = serde_json::json!(format!("{px}"));
        }
        if reduce_only {
            body["reduceOnly"] = serde_json::json!("true");
        }

        let data = self.post("/api/v5/trade/order", body).await?;
        let order_id = data
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|item| item["ordId"].as_str())
            .ok_or_else(|| EngineError::ExchangeTransient("order response missing ordId".into()))?
            .to_string();

        debug!(symbol, order_side, kind = kind.ord_type(), order_id, "order placed");
        Ok(order_id)
    }

    #[instrument(skip(self), name = "okx::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let body = serde_json::json!({ "instId": symbol, "ordId": order_id });
        self.post("/api/v5/trade/cancel-order", body).await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "okx::amend_order")]
    pub async fn amend_order(
        &self,
        symbol: &str,
        order_id: &str,
        new_price: Option<f64>,
        new_size: Option<f64>,
    ) -> Result<()> {
        let mut body = serde_json::json!({ "instId": symbol, "ordId": order_id });
        if let Some(px) = new_price {
            body["newPx"] = serde_json::json!(format!("{px}"));
        }
        if let Some(sz) = new_size {
            body["newSz"] = serde_json::json!(format!("{sz}"));
        }
        self.post("/api/v5/trade/amend-order", body).await?;
        debug!(symbol, order_id, "order amended");
        Ok(())
    }

    #[instrument(skip(self), name = "okx::get_order")]
    pub async fn get_order(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        let path = format!("/api/v5/trade/order?instId={symbol}&ordId={order_id}");
        let data = self.get(&path, true).await?;
        let item = data
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::ExchangeTransient("empty order response".into()))?;

        let state = match item["state"].as_str().unwrap_or("") {
            "live" => OrderState::Pending,
            "partially_filled" => OrderState::PartiallyFilled,
            "filled" => OrderState::Filled,
            "canceled" | "mmp_canceled" => OrderState::Canceled,
            _ => OrderState::Rejected,
        };

        Ok(OrderStatus {
            state,
            filled_size: parse_decimal(&item["accFillSz"]).unwrap_or(0.0),
            avg_fill_price: parse_decimal(&item["avgPx"]).unwrap_or(0.0),
            fee: parse_decimal(&item["fee"]).unwrap_or(0.0),
        })
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

/// OKX sends numeric fields as JSON strings; accept either representation,
/// and treat empty strings as absent.
pub(crate) fn parse_decimal(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// REST candle entry: [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm].
fn parse_rest_candle(entry: &serde_json::Value) -> Option<Candle> {
    let arr = entry.as_array()?;
    if arr.len() < 9 {
        return None;
    }
    Some(Candle::new(
        arr[0].as_str()?.parse().ok()?,
        parse_decimal(&arr[1])?,
        parse_decimal(&arr[2])?,
        parse_decimal(&arr[3])?,
        parse_decimal(&arr[4])?,
        parse_decimal(&arr[5])?,
        parse_decimal(&arr[7]).or_else(|| parse_decimal(&arr[6]))?,
        arr[8].as_str() == Some("1"),
    ))
}
