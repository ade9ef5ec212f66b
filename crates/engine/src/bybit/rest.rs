use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use common::{
    Error, ExecutionResult, FuturesMarketData, FuturesOrderExecutor, Kline, MarginType, OrderSide,
    Result,
};

const LIVE_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW: &str = "5000";

/// REST client for Bybit v5 linear perpetuals.
///
/// Bybit returns HTTP 200 with a non-zero `retCode` for business rejections;
/// those map to `ExecutionResult::rejected`, not `Err`.
pub struct BybitFutures {
    api_key: String,
    secret: String,
    base_url: String,
    http: Client,
}

impl BybitFutures {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: if testnet { TESTNET_URL } else { LIVE_URL }.to_string(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn timestamp_ms() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string()
    }

    /// v5 signature: HMAC-SHA256 over `timestamp + api_key + recv_window +
    /// payload` where payload is the query string (GET) or JSON body (POST).
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Envelope> {
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(&timestamp, query);
        let url = format!("{}{path}?{query}", self.base_url);

        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        envelope(resp).await
    }

    async fn signed_post(&self, path: &str, body: serde_json::Value) -> Result<Envelope> {
        let timestamp = Self::timestamp_ms();
        let payload = body.to_string();
        let signature = self.sign(&timestamp, &payload);
        let url = format!("{}{path}", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        envelope(resp).await
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Envelope> {
        let url = format!("{}{path}?{query}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        envelope(resp).await
    }

    async fn create_order(&self, body: serde_json::Value) -> Result<ExecutionResult> {
        let env = self.signed_post("/v5/order/create", body).await?;
        if env.ret_code == 0 {
            let created: OrderCreated = serde_json::from_value(env.result)?;
            Ok(ExecutionResult::filled(created.order_id, None))
        } else {
            Ok(ExecutionResult::rejected(format!(
                "{} ({})",
                env.ret_msg, env.ret_code
            )))
        }
    }
}

async fn envelope(resp: reqwest::Response) -> Result<Envelope> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
    if !status.is_success() {
        return Err(Error::Exchange(format!("HTTP {status}: {body}")));
    }
    serde_json::from_str(&body).map_err(Into::into)
}

#[async_trait]
impl FuturesMarketData for BybitFutures {
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let env = self
            .public_get(
                "/v5/market/tickers",
                &format!("category=linear&symbol={symbol}"),
            )
            .await?;
        env.ok()?;
        let tickers: TickerList = serde_json::from_value(env.result)?;
        tickers
            .list
            .first()
            .and_then(|t| t.mark_price.parse().ok())
            .ok_or_else(|| Error::Exchange(format!("no ticker for {symbol}")))
    }

    async fn balance(&self, asset: &str) -> Result<f64> {
        let env = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        env.ok()?;
        let wallet: WalletBalance = serde_json::from_value(env.result)?;
        Ok(wallet
            .list
            .first()
            .map(|account| {
                account
                    .coin
                    .iter()
                    .filter(|c| c.coin == asset)
                    .filter_map(|c| c.wallet_balance.parse::<f64>().ok())
                    .sum()
            })
            .unwrap_or(0.0))
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let env = self
            .public_get(
                "/v5/market/kline",
                &format!("category=linear&symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;
        env.ok()?;
        let rows: KlineList = serde_json::from_value(env.result)?;
        // Bybit lists newest first; normalize to oldest first.
        let mut klines: Vec<Kline> = rows
            .list
            .iter()
            .filter_map(|row| {
                let open_time = Utc
                    .timestamp_millis_opt(row.first()?.parse().ok()?)
                    .single()?;
                let field = |i: usize| row.get(i)?.parse::<f64>().ok();
                Some(Kline {
                    open_time,
                    open: field(1)?,
                    high: field(2)?,
                    low: field(3)?,
                    close: field(4)?,
                    volume: field(5)?,
                })
            })
            .collect();
        klines.reverse();
        Ok(klines)
    }
}

#[async_trait]
impl FuturesOrderExecutor for BybitFutures {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        debug!(symbol, leverage, "setting leverage");
        let env = self
            .signed_post(
                "/v5/position/set-leverage",
                json!({
                    "category": "linear",
                    "symbol": symbol,
                    "buyLeverage": leverage.to_string(),
                    "sellLeverage": leverage.to_string(),
                }),
            )
            .await?;
        // 110043: leverage not modified — already at the requested value.
        if env.ret_code == 0 || env.ret_code == 110043 {
            Ok(())
        } else {
            Err(Error::Exchange(format!("{} ({})", env.ret_msg, env.ret_code)))
        }
    }

    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<()> {
        let trade_mode = match margin {
            MarginType::Isolated => 1,
            MarginType::Cross => 0,
        };
        let env = self
            .signed_post(
                "/v5/position/switch-isolated",
                json!({
                    "category": "linear",
                    "symbol": symbol,
                    "tradeMode": trade_mode,
                    "buyLeverage": "1",
                    "sellLeverage": "1",
                }),
            )
            .await?;
        // 110026: already in the requested margin mode.
        if env.ret_code == 0 || env.ret_code == 110026 {
            Ok(())
        } else {
            Err(Error::Exchange(format!("{} ({})", env.ret_msg, env.ret_code)))
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<ExecutionResult> {
        self.create_order(json!({
            "category": "linear",
            "symbol": symbol,
            "side": side_name(side),
            "orderType": "Market",
            "qty": quantity.to_string(),
            "reduceOnly": reduce_only,
        }))
        .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        // Closing a long sells when the price falls through the trigger (2);
        // closing a short buys when it rises through it (1).
        let trigger_direction = match side {
            OrderSide::Sell => 2,
            OrderSide::Buy => 1,
        };
        self.create_order(json!({
            "category": "linear",
            "symbol": symbol,
            "side": side_name(side),
            "orderType": "Market",
            "qty": quantity.to_string(),
            "triggerPrice": stop_price.to_string(),
            "triggerDirection": trigger_direction,
            "reduceOnly": true,
        }))
        .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        // Mirror of the stop trigger: profit-taking fires on the favorable
        // side of the market.
        let trigger_direction = match side {
            OrderSide::Sell => 1,
            OrderSide::Buy => 2,
        };
        self.create_order(json!({
            "category": "linear",
            "symbol": symbol,
            "side": side_name(side),
            "orderType": "Market",
            "qty": quantity.to_string(),
            "triggerPrice": price.to_string(),
            "triggerDirection": trigger_direction,
            "reduceOnly": true,
        }))
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let env = self
            .signed_post(
                "/v5/order/cancel",
                json!({
                    "category": "linear",
                    "symbol": symbol,
                    "orderId": order_id,
                }),
            )
            .await?;
        // 110001: order does not exist — already gone.
        if env.ret_code == 0 || env.ret_code == 110001 {
            Ok(())
        } else {
            Err(Error::Exchange(format!("{} ({})", env.ret_msg, env.ret_code)))
        }
    }

    async fn open_order_ids(&self, symbol: &str) -> Result<Vec<String>> {
        let env = self
            .signed_get(
                "/v5/order/realtime",
                &format!("category=linear&symbol={symbol}"),
            )
            .await?;
        env.ok()?;
        let orders: OrderList = serde_json::from_value(env.result)?;
        Ok(orders.list.into_iter().map(|o| o.order_id).collect())
    }

    async fn position_size(&self, symbol: &str) -> Result<f64> {
        let env = self
            .signed_get(
                "/v5/position/list",
                &format!("category=linear&symbol={symbol}"),
            )
            .await?;
        env.ok()?;
        let positions: PositionList = serde_json::from_value(env.result)?;
        Ok(positions
            .list
            .first()
            .map(|p| {
                let size: f64 = p.size.parse().unwrap_or(0.0);
                if p.side == "Sell" {
                    -size
                } else {
                    size
                }
            })
            .unwrap_or(0.0))
    }
}

fn side_name(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

impl Envelope {
    fn ok(&self) -> Result<()> {
        if self.ret_code == 0 {
            Ok(())
        } else {
            Err(Error::Exchange(format!("{} ({})", self.ret_msg, self.ret_code)))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    order_id: String,
}

#[derive(Deserialize)]
struct TickerList {
    list: Vec<Ticker>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    mark_price: String,
}

#[derive(Deserialize)]
struct WalletBalance {
    list: Vec<WalletAccount>,
}

#[derive(Deserialize)]
struct WalletAccount {
    coin: Vec<WalletCoin>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    wallet_balance: String,
}

#[derive(Deserialize)]
struct KlineList {
    list: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct OrderList {
    list: Vec<OpenOrder>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrder {
    order_id: String,
}

#[derive(Deserialize)]
struct PositionList {
    list: Vec<PositionEntry>,
}

#[derive(Deserialize)]
struct PositionEntry {
    side: String,
    size: String,
}
