use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use common::{Error, OrderUpdate, OrderUpdateStatus, Result, Venue};

const LIVE_REST: &str = "https://fapi.binance.com";
const LIVE_WS: &str = "wss://fstream.binance.com/ws";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com/ws";

/// Binance futures user-data stream: obtains a listen key, subscribes, and
/// publishes normalized `OrderUpdate`s on a broadcast channel. Reconnects
/// with capped exponential backoff; the listen key is kept alive with a
/// periodic PUT.
pub struct BinanceUserStream {
    api_key: String,
    rest_url: String,
    ws_url: String,
    update_tx: broadcast::Sender<OrderUpdate>,
    http: reqwest::Client,
}

impl BinanceUserStream {
    pub fn new(
        api_key: impl Into<String>,
        testnet: bool,
        update_tx: broadcast::Sender<OrderUpdate>,
    ) -> Self {
        let (rest_url, ws_url) = if testnet {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (LIVE_REST, LIVE_WS)
        };
        Self {
            api_key: api_key.into(),
            rest_url: rest_url.to_string(),
            ws_url: ws_url.to_string(),
            update_tx,
            http: reqwest::Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Run the stream loop forever, reconnecting on failure.
    /// Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!("Binance user stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "Binance user stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn listen_key(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/fapi/v1/listenKey", self.rest_url))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let body: ListenKey = resp.json().await.map_err(|e| Error::Http(e.to_string()))?;
        Ok(body.listen_key)
    }

    async fn keepalive(&self) -> Result<()> {
        self.http
            .put(format!("{}/fapi/v1/listenKey", self.rest_url))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(())
    }

    async fn connect_once(&self) -> Result<()> {
        let key = self.listen_key().await?;
        let url = url::Url::parse(&format!("{}/{key}", self.ws_url))
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        info!("Connecting to Binance user stream");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (_, mut read) = ws_stream.split();

        // Listen keys expire after 60 minutes without a keepalive.
        let mut keepalive_timer = tokio::time::interval(Duration::from_secs(30 * 60));
        keepalive_timer.tick().await;

        loop {
            tokio::select! {
                _ = keepalive_timer.tick() => {
                    if let Err(e) = self.keepalive().await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_order_update(&text) {
                            Ok(Some(update)) => {
                                let _ = self.update_tx.send(update);
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "failed to parse order update"),
                        }
                    }
                }
            }
        }
    }
}

// ─── ORDER_TRADE_UPDATE parsing ──────────────────────────────────────────────

#[derive(Deserialize)]
struct ListenKey {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[derive(Deserialize)]
struct OrderTradeUpdate {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "o")]
    order: OrderData,
}

#[derive(Deserialize)]
struct OrderData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "z")]
    filled_qty: String,
    #[serde(rename = "ap")]
    average_price: String,
    #[serde(rename = "R", default)]
    reduce_only: bool,
}

fn parse_order_update(text: &str) -> Result<Option<OrderUpdate>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("e").and_then(|v| v.as_str()) != Some("ORDER_TRADE_UPDATE") {
        return Ok(None);
    }
    let event: OrderTradeUpdate = serde_json::from_value(value)?;
    let status = match event.order.status.as_str() {
        "NEW" => OrderUpdateStatus::New,
        "PARTIALLY_FILLED" => OrderUpdateStatus::PartiallyFilled,
        "FILLED" => OrderUpdateStatus::Filled,
        "CANCELED" | "EXPIRED" => OrderUpdateStatus::Cancelled,
        "REJECTED" => OrderUpdateStatus::Rejected,
        other => {
            warn!(status = other, "unknown order status from Binance");
            return Ok(None);
        }
    };
    let timestamp = Utc
        .timestamp_millis_opt(event.event_time_ms)
        .single()
        .unwrap_or_else(Utc::now);

    Ok(Some(OrderUpdate {
        venue: Venue::Binance,
        symbol: event.order.symbol,
        order_id: event.order.order_id.to_string(),
        status,
        filled_qty: event.order.filled_qty.parse().unwrap_or(0.0),
        average_price: event.order.average_price.parse().unwrap_or(0.0),
        reduce_only: event.order.reduce_only,
        timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_filled_order_update() {
        let text = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000000000,
            "o": {
                "s": "BTCUSDT",
                "i": 123456,
                "X": "FILLED",
                "z": "0.05",
                "ap": "60123.5",
                "R": true
            }
        }"#;
        let update = parse_order_update(text).unwrap().unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.order_id, "123456");
        assert_eq!(update.status, OrderUpdateStatus::Filled);
        assert_eq!(update.filled_qty, 0.05);
        assert_eq!(update.average_price, 60123.5);
        assert!(update.reduce_only);
    }

    #[test]
    fn ignores_non_order_events() {
        let text = r#"{"e": "ACCOUNT_UPDATE", "E": 1700000000000}"#;
        assert!(parse_order_update(text).unwrap().is_none());
    }
}
