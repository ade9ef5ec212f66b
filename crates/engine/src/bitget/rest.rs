use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
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

const BASE_URL: &str = "https://api.bitget.com";
const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const OK_CODE: &str = "00000";

/// REST client for Bitget v2 USDT-margined futures.
///
/// Bitget signs with base64 HMAC over `timestamp + method + path + body` and
/// additionally requires the account passphrase. Demo trading is selected by
/// the `paptrading` header rather than a separate host.
pub struct BitgetFutures {
    api_key: String,
    secret: String,
    passphrase: String,
    demo: bool,
    http: Client,
}

impl BitgetFutures {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        demo: bool,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            demo,
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

    fn sign(&self, timestamp: &str, method: &str, path_and_query: &str, body: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let message = format!("{timestamp}{method}{path_and_query}{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope> {
        let timestamp = Self::timestamp_ms();
        let path_and_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), &path_and_query, &body_text);

        let mut request = self
            .http
            .request(method, format!("{BASE_URL}{path_and_query}"))
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", &signature)
            .header("ACCESS-TIMESTAMP", &timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if self.demo {
            request = request.header("paptrading", "1");
        }
        if !body_text.is_empty() {
            request = request.body(body_text);
        }

        let resp = request.send().await.map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {text}")));
        }
        serde_json::from_str(&text).map_err(Into::into)
    }

    async fn place(&self, path: &str, body: serde_json::Value) -> Result<ExecutionResult> {
        let env = self.request(reqwest::Method::POST, path, "", Some(body)).await?;
        if env.code == OK_CODE {
            let created: OrderCreated = serde_json::from_value(env.data)?;
            Ok(ExecutionResult::filled(created.order_id, None))
        } else {
            Ok(ExecutionResult::rejected(format!("{} ({})", env.msg, env.code)))
        }
    }
}

#[async_trait]
impl FuturesMarketData for BitgetFutures {
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let env = self
            .request(
                reqwest::Method::GET,
                "/api/v2/mix/market/symbol-price",
                &format!("productType={PRODUCT_TYPE}&symbol={symbol}"),
                None,
            )
            .await?;
        env.ok()?;
        let prices: Vec<SymbolPrice> = serde_json::from_value(env.data)?;
        prices
            .first()
            .and_then(|p| p.mark_price.parse().ok())
            .ok_or_else(|| Error::Exchange(format!("no mark price for {symbol}")))
    }

    async fn balance(&self, asset: &str) -> Result<f64> {
        let env = self
            .request(
                reqwest::Method::GET,
                "/api/v2/mix/account/accounts",
                &format!("productType={PRODUCT_TYPE}"),
                None,
            )
            .await?;
        env.ok()?;
        let accounts: Vec<Account> = serde_json::from_value(env.data)?;
        Ok(accounts
            .iter()
            .find(|a| a.margin_coin == asset)
            .and_then(|a| a.available.parse().ok())
            .unwrap_or(0.0))
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let env = self
            .request(
                reqwest::Method::GET,
                "/api/v2/mix/market/candles",
                &format!(
                    "productType={PRODUCT_TYPE}&symbol={symbol}&granularity={interval}&limit={limit}"
                ),
                None,
            )
            .await?;
        env.ok()?;
        let rows: Vec<Vec<String>> = serde_json::from_value(env.data)?;
        Ok(rows
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
            .collect())
    }
}

#[async_trait]
impl FuturesOrderExecutor for BitgetFutures {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        debug!(symbol, leverage, "setting leverage");
        let env = self
            .request(
                reqwest::Method::POST,
                "/api/v2/mix/account/set-leverage",
                "",
                Some(json!({
                    "symbol": symbol,
                    "productType": PRODUCT_TYPE,
                    "marginCoin": MARGIN_COIN,
                    "leverage": leverage.to_string(),
                })),
            )
            .await?;
        env.ok()
    }

    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<()> {
        let margin_mode = match margin {
            MarginType::Isolated => "isolated",
            MarginType::Cross => "crossed",
        };
        let env = self
            .request(
                reqwest::Method::POST,
                "/api/v2/mix/account/set-margin-mode",
                "",
                Some(json!({
                    "symbol": symbol,
                    "productType": PRODUCT_TYPE,
                    "marginCoin": MARGIN_COIN,
                    "marginMode": margin_mode,
                })),
            )
            .await?;
        env.ok()
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<ExecutionResult> {
        self.place(
            "/api/v2/mix/order/place-order",
            json!({
                "symbol": symbol,
                "productType": PRODUCT_TYPE,
                "marginMode": "isolated",
                "marginCoin": MARGIN_COIN,
                "side": side_name(side),
                "orderType": "market",
                "size": quantity.to_string(),
                "reduceOnly": if reduce_only { "YES" } else { "NO" },
            }),
        )
        .await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        self.place(
            "/api/v2/mix/order/place-plan-order",
            json!({
                "symbol": symbol,
                "productType": PRODUCT_TYPE,
                "marginMode": "isolated",
                "marginCoin": MARGIN_COIN,
                "planType": "normal_plan",
                "side": side_name(side),
                "orderType": "market",
                "size": quantity.to_string(),
                "triggerPrice": stop_price.to_string(),
                "triggerType": "mark_price",
                "reduceOnly": "YES",
            }),
        )
        .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        self.place(
            "/api/v2/mix/order/place-plan-order",
            json!({
                "symbol": symbol,
                "productType": PRODUCT_TYPE,
                "marginMode": "isolated",
                "marginCoin": MARGIN_COIN,
                "planType": "normal_plan",
                "side": side_name(side),
                "orderType": "market",
                "size": quantity.to_string(),
                "triggerPrice": price.to_string(),
                "triggerType": "mark_price",
                "reduceOnly": "YES",
            }),
        )
        .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let env = self
            .request(
                reqwest::Method::POST,
                "/api/v2/mix/order/cancel-order",
                "",
                Some(json!({
                    "symbol": symbol,
                    "productType": PRODUCT_TYPE,
                    "orderId": order_id,
                })),
            )
            .await?;
        // 40768: order does not exist — already gone.
        if env.code == OK_CODE || env.code == "40768" {
            Ok(())
        } else {
            Err(Error::Exchange(format!("{} ({})", env.msg, env.code)))
        }
    }

    async fn open_order_ids(&self, symbol: &str) -> Result<Vec<String>> {
        let env = self
            .request(
                reqwest::Method::GET,
                "/api/v2/mix/order/orders-pending",
                &format!("productType={PRODUCT_TYPE}&symbol={symbol}"),
                None,
            )
            .await?;
        env.ok()?;
        let pending: PendingOrders = serde_json::from_value(env.data)?;
        Ok(pending
            .entrusted_list
            .unwrap_or_default()
            .into_iter()
            .map(|o| o.order_id)
            .collect())
    }

    async fn position_size(&self, symbol: &str) -> Result<f64> {
        let env = self
            .request(
                reqwest::Method::GET,
                "/api/v2/mix/position/single-position",
                &format!("productType={PRODUCT_TYPE}&symbol={symbol}&marginCoin={MARGIN_COIN}"),
                None,
            )
            .await?;
        env.ok()?;
        let positions: Vec<PositionEntry> = serde_json::from_value(env.data)?;
        Ok(positions
            .first()
            .map(|p| {
                let size: f64 = p.total.parse().unwrap_or(0.0);
                if p.hold_side == "short" {
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
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Envelope {
    fn ok(&self) -> Result<()> {
        if self.code == OK_CODE {
            Ok(())
        } else {
            Err(Error::Exchange(format!("{} ({})", self.msg, self.code)))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    order_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolPrice {
    mark_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    margin_coin: String,
    available: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrders {
    entrusted_list: Option<Vec<PendingOrder>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrder {
    order_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    hold_side: String,
    total: String,
}
