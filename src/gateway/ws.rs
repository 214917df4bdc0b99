// =============================================================================
// OKX WebSocket streams — tickers, book tops, and candles into the registry
// =============================================================================
//
// Two long-lived connections:
//   - public stream:   tickers + books5 per symbol
//   - business stream: candle channels per (symbol, timeframe)
//
// Each runner connects, subscribes, and pumps messages until the stream ends
// or errors, then returns so the supervising task can reconnect after a
// short delay — a single reconnector per stream keeps reconnects idempotent.
// The public runner also honours reconnect requests raised by the registry
// after sustained REST fallbacks.
//
// OKX idle policy: the server drops quiet connections, so after ~25 s without
// traffic we send a text "ping" and expect a "pong".
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::{Candle, CandleKey, MarketDataRegistry};
use crate::types::{Tick, Timeframe};

const PUBLIC_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const BUSINESS_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";

/// Idle time before a heartbeat ping goes out.
const HEARTBEAT_IDLE: Duration = Duration::from_secs(25);

/// Run the public stream (tickers + books5) for all symbols. Ticks land in
/// the registry; each tick's symbol is also sent to `tick_tx` so the
/// fast-path exit check can react without polling.
pub async fn run_public_stream(
    symbols: &[String],
    registry: &Arc<MarketDataRegistry>,
    tick_tx: &UnboundedSender<String>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(PUBLIC_WS_URL)
        .await
        .context("failed to connect to public WebSocket")?;
    info!(url = PUBLIC_WS_URL, symbols = symbols.len(), "public WebSocket connected");

    let (mut write, mut read) = ws_stream.split();

    let mut args = Vec::new();
    for symbol in symbols {
        args.push(serde_json::json!({ "channel": "tickers", "instId": symbol }));
        args.push(serde_json::json!({ "channel": "books5", "instId": symbol }));
    }
    let sub = serde_json::json!({ "op": "subscribe", "args": args });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("failed to send public subscribe")?;

    let mut awaiting_pong = false;
    loop {
        if registry.take_reconnect_request() {
            warn!("registry requested reconnect — cycling public WebSocket");
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }

        match tokio::time::timeout(HEARTBEAT_IDLE, read.next()).await {
            Err(_) => {
                if awaiting_pong {
                    anyhow::bail!("public WebSocket heartbeat timed out");
                }
                write
                    .send(Message::Text("ping".to_string()))
                    .await
                    .context("failed to send heartbeat ping")?;
                awaiting_pong = true;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                awaiting_pong = false;
                if text == "pong" {
                    continue;
                }
                handle_public_message(&text, registry, tick_tx);
            }
            Ok(Some(Ok(_))) => {
                awaiting_pong = false;
            }
            Ok(Some(Err(e))) => {
                error!(error = %e, "public WebSocket read error");
                return Err(e.into());
            }
            Ok(None) => {
                warn!("public WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Run the business stream (candle channels) for all symbols and timeframes.
pub async fn run_candle_stream(
    symbols: &[String],
    registry: &Arc<MarketDataRegistry>,
) -> Result<()> {
    let (ws_stream, _response) = connect_async(BUSINESS_WS_URL)
        .await
        .context("failed to connect to business WebSocket")?;
    info!(url = BUSINESS_WS_URL, symbols = symbols.len(), "candle WebSocket connected");

    let (mut write, mut read) = ws_stream.split();

    let mut args = Vec::new();
    for symbol in symbols {
        for tf in Timeframe::ALL {
            args.push(serde_json::json!({
                "channel": format!("candle{}", tf.bar()),
                "instId": symbol,
            }));
        }
    }
    let sub = serde_json::json!({ "op": "subscribe", "args": args });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("failed to send candle subscribe")?;

    let mut awaiting_pong = false;
    loop {
        match tokio::time::timeout(HEARTBEAT_IDLE, read.next()).await {
            Err(_) => {
                if awaiting_pong {
                    anyhow::bail!("candle WebSocket heartbeat timed out");
                }
                write
                    .send(Message::Text("ping".to_string()))
                    .await
                    .context("failed to send heartbeat ping")?;
                awaiting_pong = true;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                awaiting_pong = false;
                if text == "pong" {
                    continue;
                }
                handle_candle_message(&text, registry);
            }
            Ok(Some(Ok(_))) => {
                awaiting_pong = false;
            }
            Ok(Some(Err(e))) => {
                error!(error = %e, "candle WebSocket read error");
                return Err(e.into());
            }
            Ok(None) => {
                warn!("candle WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Message dispatch
// =============================================================================

fn handle_public_message(
    text: &str,
    registry: &MarketDataRegistry,
    tick_tx: &UnboundedSender<String>,
) {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("unparsable public WebSocket message");
        return;
    };
    if root.get("event").is_some() {
        debug!(event = ?root["event"], "public WebSocket control event");
        return;
    }

    let channel = root["arg"]["channel"].as_str().unwrap_or("");
    let symbol = root["arg"]["instId"].as_str().unwrap_or("");
    if symbol.is_empty() {
        return;
    }

    match channel {
        "tickers" => {
            for item in root["data"].as_array().into_iter().flatten() {
                if let Some((tick, quote_vol)) = parse_ticker(item) {
                    registry.upsert_tick(symbol, tick);
                    registry.set_day_volume(symbol, quote_vol);
                    let _ = tick_tx.send(symbol.to_string());
                }
            }
        }
        "books5" => {
            for item in root["data"].as_array().into_iter().flatten() {
                if let Some((bid, ask, bid_sz, ask_sz, ts)) = parse_books5(item) {
                    registry.books.update(symbol, bid, ask, bid_sz, ask_sz, ts);
                }
            }
        }
        other => {
            debug!(channel = other, "ignoring unknown public channel");
        }
    }
}

fn handle_candle_message(text: &str, registry: &MarketDataRegistry) {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
        warn!("unparsable candle WebSocket message");
        return;
    };
    if root.get("event").is_some() {
        return;
    }

    let channel = root["arg"]["channel"].as_str().unwrap_or("");
    let symbol = root["arg"]["instId"].as_str().unwrap_or("");
    let Some(timeframe) = channel
        .strip_prefix("candle")
        .and_then(Timeframe::from_bar)
    else {
        return;
    };
    if symbol.is_empty() {
        return;
    }

    for item in root["data"].as_array().into_iter().flatten() {
        if let Some(candle) = parse_ws_candle(item) {
            registry.upsert_candle(CandleKey::new(symbol, timeframe), candle);
        }
    }
}

// =============================================================================
// Payload parsing
// =============================================================================

/// Tickers item: { last, bidPx, askPx, volCcy24h, ts, ... } (all strings).
fn parse_ticker(item: &serde_json::Value) -> Option<(Tick, f64)> {
    let last = super::client::parse_decimal(&item["last"])?;
    let bid = super::client::parse_decimal(&item["bidPx"]).unwrap_or(last);
    let ask = super::client::parse_decimal(&item["askPx"]).unwrap_or(last);
    let ts = item["ts"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);
    let quote_vol = super::client::parse_decimal(&item["volCcy24h"]).unwrap_or(0.0);

    Some((
        Tick {
            timestamp_ms: ts,
            last,
            bid,
            ask,
        },
        quote_vol,
    ))
}

/// Books5 item: { bids: [[px, sz, _, _], ...], asks: [...], ts }.
fn parse_books5(item: &serde_json::Value) -> Option<(f64, f64, f64, f64, i64)> {
    let best_bid = item["bids"].as_array()?.first()?.as_array()?;
    let best_ask = item["asks"].as_array()?.first()?.as_array()?;

    let bid_px = super::client::parse_decimal(&best_bid[0])?;
    let bid_sz = super::client::parse_decimal(&best_bid[1])?;
    let ask_px = super::client::parse_decimal(&best_ask[0])?;
    let ask_sz = super::client::parse_decimal(&best_ask[1])?;
    let ts = item["ts"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);

    Some((bid_px, ask_px, bid_sz, ask_sz, ts))
}

/// WS candle item: [ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm].
fn parse_ws_candle(item: &serde_json::Value) -> Option<Candle> {
    let arr = item.as_array()?;
    if arr.len() < 9 {
        return None;
    }
    Some(Candle::new(
        arr[0].as_str()?.parse().ok()?,
        super::client::parse_decimal(&arr[1])?,
        super::client::parse_decimal(&arr[2])?,
        super::client::parse_decimal(&arr[3])?,
        super::client::parse_decimal(&arr[4])?,
        super::client::parse_decimal(&arr[5])?,
        super::client::parse_decimal(&arr[7]).or_else(|| super::client::parse_decimal(&arr[6]))?,
        arr[8].as_str() == Some("1"),
    ))
}
