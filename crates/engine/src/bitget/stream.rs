use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
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

const WS_URL: &str = "wss://ws.bitget.com/v2/ws/private";
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bitget v2 private order stream: login op with a base64 HMAC signature,
/// `orders` channel subscription, reconnect with capped backoff.
pub struct BitgetPrivateStream {
    api_key: String,
    secret: String,
    passphrase: String,
    update_tx: broadcast::Sender<OrderUpdate>,
}

impl BitgetPrivateStream {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        update_tx: broadcast::Sender<OrderUpdate>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            update_tx,
        }
    }

    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!("Bitget private stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "Bitget private stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn login_args(&self) -> (String, String) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let payload = format!("{timestamp}GET/user/verify");
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        (timestamp, BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn connect_once(&self) -> Result<()> {
        info!("Connecting to Bitget private stream");
        let (ws_stream, _) = connect_async(WS_URL)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (timestamp, signature) = self.login_args();
        let login = json!({
            "op": "login",
            "args": [{
                "apiKey": self.api_key,
                "passphrase": self.passphrase,
                "timestamp": timestamp,
                "sign": signature,
            }]
        });
        write
            .send(Message::Text(login.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let subscribe = json!({
            "op": "subscribe",
            "args": [{ "instType": "USDT-FUTURES", "channel": "orders", "instId": "default" }]
        });
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await;
        let mut authed = false;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .map_err(|e| Error::WebSocket(format!("ping failed: {e}")))?;
                }
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
                    let Message::Text(text) = msg else { continue };
                    if text == "pong" {
                        continue;
                    }
                    let value: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "unparseable private stream message");
                            continue;
                        }
                    };

                    if value["event"].as_str() == Some("login") {
                        if value["code"].as_str() == Some("0")
                            || value["code"].as_i64() == Some(0)
                        {
                            info!("Bitget private stream authenticated");
                            authed = true;
                            write
                                .send(Message::Text(subscribe.to_string()))
                                .await
                                .map_err(|e| Error::WebSocket(e.to_string()))?;
                        } else {
                            return Err(Error::WebSocket(format!("login rejected: {text}")));
                        }
                        continue;
                    }

                    let is_orders = value["arg"]["channel"].as_str() == Some("orders");
                    if authed && is_orders {
                        for update in parse_orders_channel(&value) {
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
    inst_id: String,
    order_id: String,
    status: String,
    #[serde(default)]
    acc_base_volume: String,
    #[serde(default)]
    price_avg: String,
    #[serde(default)]
    reduce_only: String,
    #[serde(default)]
    u_time: String,
}

fn parse_orders_channel(value: &serde_json::Value) -> Vec<OrderUpdate> {
    let Some(data) = value.get("data").and_then(|d| d.as_array()) else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|entry| {
            let entry: OrderEntry = serde_json::from_value(entry.clone()).ok()?;
            let status = match entry.status.as_str() {
                "live" | "new" => OrderUpdateStatus::New,
                "partially_filled" => OrderUpdateStatus::PartiallyFilled,
                "filled" => OrderUpdateStatus::Filled,
                "cancelled" | "canceled" => OrderUpdateStatus::Cancelled,
                "rejected" => OrderUpdateStatus::Rejected,
                other => {
                    warn!(status = other, "unknown order status from Bitget");
                    return None;
                }
            };
            let timestamp = entry
                .u_time
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);
            Some(OrderUpdate {
                venue: Venue::Bitget,
                symbol: entry.inst_id,
                order_id: entry.order_id,
                status,
                filled_qty: entry.acc_base_volume.parse().unwrap_or(0.0),
                average_price: entry.price_avg.parse().unwrap_or(0.0),
                reduce_only: entry.reduce_only.eq_ignore_ascii_case("yes"),
                timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_an_orders_channel_push() {
        let value = json!({
            "arg": { "channel": "orders" },
            "data": [{
                "instId": "BTCUSDT",
                "orderId": "xyz-9",
                "status": "filled",
                "accBaseVolume": "0.02",
                "priceAvg": "60200",
                "reduceOnly": "yes",
                "uTime": "1700000000000"
            }]
        });
        let updates = parse_orders_channel(&value);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, OrderUpdateStatus::Filled);
        assert!(updates[0].reduce_only);
        assert_eq!(updates[0].venue, Venue::Bitget);
    }
}
