use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use common::{Error, OrderUpdate, OrderUpdateStatus, Result, Venue};

const LIVE_WS: &str = "wss://stream.bybit.com/v5/private";
const TESTNET_WS: &str = "wss://stream-testnet.bybit.com/v5/private";
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Bybit v5 private order stream. Authenticates with an expiring HMAC
/// signature, subscribes to the `order` topic and publishes normalized
/// updates; reconnects with capped backoff.
pub struct BybitPrivateStream {
    api_key: String,
    secret: String,
    ws_url: String,
    update_tx: broadcast::Sender<OrderUpdate>,
}

impl BybitPrivateStream {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        testnet: bool,
        update_tx: broadcast::Sender<OrderUpdate>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            ws_url: if testnet { TESTNET_WS } else { LIVE_WS }.to_string(),
            update_tx,
        }
    }

    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!("Bybit private stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "Bybit private stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn auth_args(&self) -> (String, String, String) {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
            + 5_000;
        let payload = format!("GET/realtime{expires}");
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        (self.api_key.clone(), expires.to_string(), signature)
    }

    async fn connect_once(&self) -> Result<()> {
        info!("Connecting to Bybit private stream");
        let (ws_stream, _) = connect_async(&self.ws_url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (api_key, expires, signature) = self.auth_args();
        let auth = json!({ "op": "auth", "args": [api_key, expires, signature] });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let subscribe = json!({ "op": "subscribe", "args": ["order"] });
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await;
        let mut authed = false;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    let ping = json!({ "op": "ping" }).to_string();
                    write
                        .send(Message::Text(ping))
                        .await
                        .map_err(|e| Error::WebSocket(format!("ping failed: {e}")))?;
                }
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
                    let Message::Text(text) = msg else { continue };
                    let value: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "unparseable private stream message");
                            continue;
                        }
                    };

                    if value["op"].as_str() == Some("auth") {
                        if value["success"].as_bool() == Some(true) {
                            info!("Bybit private stream authenticated");
                            authed = true;
                            write
                                .send(Message::Text(subscribe.to_string()))
                                .await
                                .map_err(|e| Error::WebSocket(e.to_string()))?;
                        } else {
                            return Err(Error::WebSocket(format!("auth rejected: {text}")));
                        }
                        continue;
                    }

                    if authed && value["topic"].as_str() == Some("order") {
                        for update in parse_order_topic(&value) {
                            let _ = self.update_tx.send(update);
                        }
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntry {
    symbol: String,
    order_id: String,
    order_status: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    updated_time: String,
}

fn parse_order_topic(value: &serde_json::Value) -> Vec<OrderUpdate> {
    let Some(data) = value.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|entry| {
            let entry: OrderEntry = serde_json::from_value(entry.clone()).ok()?;
            let status = match entry.order_status.as_str() {
                "New" | "Untriggered" | "Triggered" => OrderUpdateStatus::New,
                "PartiallyFilled" => OrderUpdateStatus::PartiallyFilled,
                "Filled" => OrderUpdateStatus::Filled,
                "Cancelled" | "Deactivated" | "PartiallyFilledCanceled" => {
                    OrderUpdateStatus::Cancelled
                }
                "Rejected" => OrderUpdateStatus::Rejected,
                other => {
                    warn!(status = other, "unknown order status from Bybit");
                    return None;
                }
            };
            let timestamp = entry
                .updated_time
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);
            Some(OrderUpdate {
                venue: Venue::Bybit,
                symbol: entry.symbol,
                order_id: entry.order_id,
                status,
                filled_qty: entry.cum_exec_qty.parse().unwrap_or(0.0),
                average_price: entry.avg_price.parse().unwrap_or(0.0),
                reduce_only: entry.reduce_only,
                timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_an_order_topic_batch() {
        let value = json!({
            "topic": "order",
            "data": [{
                "symbol": "ETHUSDT",
                "orderId": "abc-123",
                "orderStatus": "Filled",
                "cumExecQty": "0.5",
                "avgPrice": "3010.2",
                "reduceOnly": true,
                "updatedTime": "1700000000000"
            }]
        });
        let updates = parse_order_topic(&value);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].order_id, "abc-123");
        assert_eq!(updates[0].status, OrderUpdateStatus::Filled);
        assert_eq!(updates[0].filled_qty, 0.5);
        assert_eq!(updates[0].venue, Venue::Bybit);
    }

    #[test]
    fn untriggered_conditionals_map_to_new() {
        let value = json!({
            "topic": "order",
            "data": [{
                "symbol": "ETHUSDT",
                "orderId": "abc-124",
                "orderStatus": "Untriggered"
            }]
        });
        let updates = parse_order_topic(&value);
        assert_eq!(updates[0].status, OrderUpdateStatus::New);
    }
}
