use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use common::{
    Error, ExecutionResult, FuturesMarketData, FuturesOrderExecutor, Kline, MarginType, OrderSide,
    Result,
};

const LIVE_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// REST client for Binance USDⓈ-M futures. Implements both the market-data
/// and order-execution surfaces of the facade.
pub struct BinanceFutures {
    api_key: String,
    secret: String,
    base_url: String,
    http: Client,
}

impl BinanceFutures {
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

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed(&self, method: reqwest::Method, path: &str, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(&query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    async fn public_get(&self, path: &str, params: &str) -> Result<String> {
        let url = if params.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{params}", self.base_url)
        };
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    /// Orders either land (`orderId` in the body) or come back rejected with
    /// a `code`/`msg` body on HTTP 400; both are data for the caller.
    async fn place_order(&self, params: String) -> Result<ExecutionResult> {
        let ts = Self::timestamp_ms();
        let query = format!("{params}&timestamp={ts}");
        let signature = self.sign(&query);
        let url = format!("{}/fapi/v1/order?{query}&signature={signature}", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if status.is_success() {
            let order: OrderResponse = serde_json::from_str(&body)?;
            let average = order
                .avg_price
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|p| *p > 0.0);
            Ok(ExecutionResult::filled(order.order_id.to_string(), average))
        } else if status.as_u16() == 400 {
            let reject: ApiError = serde_json::from_str(&body).unwrap_or(ApiError {
                code: -1,
                msg: body.clone(),
            });
            Ok(ExecutionResult::rejected(format!(
                "{} ({})",
                reject.msg, reject.code
            )))
        } else {
            Err(Error::Exchange(format!("HTTP {status}: {body}")))
        }
    }
}

#[async_trait]
impl FuturesMarketData for BinanceFutures {
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .public_get("/fapi/v1/premiumIndex", &format!("symbol={symbol}"))
            .await?;
        let index: PremiumIndex = serde_json::from_str(&body)?;
        index
            .mark_price
            .parse()
            .map_err(|e| Error::Exchange(format!("bad mark price: {e}")))
    }

    async fn balance(&self, asset: &str) -> Result<f64> {
        let body = self.signed(reqwest::Method::GET, "/fapi/v2/balance", "").await?;
        let balances: Vec<FuturesBalance> = serde_json::from_str(&body)?;
        Ok(balances
            .iter()
            .find(|b| b.asset == asset)
            .and_then(|b| b.available_balance.parse().ok())
            .unwrap_or(0.0))
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let body = self
            .public_get(
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let open_time = Utc.timestamp_millis_opt(row.first()?.as_i64()?).single()?;
                let field = |i: usize| row.get(i)?.as_str()?.parse::<f64>().ok();
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
impl FuturesOrderExecutor for BinanceFutures {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        debug!(symbol, leverage, "setting leverage");
        self.signed(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
        )
        .await?;
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<()> {
        let margin_type = match margin {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        };
        let result = self
            .signed(
                reqwest::Method::POST,
                "/fapi/v1/marginType",
                &format!("symbol={symbol}&marginType={margin_type}"),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // -4046: "No need to change margin type" — already set.
            Err(Error::Exchange(body)) if body.contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<ExecutionResult> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}&newOrderRespType=RESULT"
        );
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        self.place_order(params).await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&stopPrice={stop_price}&quantity={quantity}&reduceOnly=true"
        );
        self.place_order(params).await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        let params = format!(
            "symbol={symbol}&side={side}&type=TAKE_PROFIT_MARKET&stopPrice={price}&quantity={quantity}&reduceOnly=true"
        );
        self.place_order(params).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let result = self
            .signed(
                reqwest::Method::DELETE,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // -2011: unknown order — already gone; cancel stays idempotent.
            Err(Error::Exchange(body)) if body.contains("-2011") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn open_order_ids(&self, symbol: &str) -> Result<Vec<String>> {
        let body = self
            .signed(
                reqwest::Method::GET,
                "/fapi/v1/openOrders",
                &format!("symbol={symbol}"),
            )
            .await?;
        let orders: Vec<OpenOrder> = serde_json::from_str(&body)?;
        Ok(orders.iter().map(|o| o.order_id.to_string()).collect())
    }

    async fn position_size(&self, symbol: &str) -> Result<f64> {
        let body = self
            .signed(
                reqwest::Method::GET,
                "/fapi/v2/positionRisk",
                &format!("symbol={symbol}"),
            )
            .await?;
        let positions: Vec<PositionRisk> = serde_json::from_str(&body)?;
        Ok(positions
            .first()
            .and_then(|p| p.position_amt.parse().ok())
            .unwrap_or(0.0))
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(default)]
    avg_price: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesBalance {
    asset: String,
    available_balance: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrder {
    order_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    position_amt: String,
}
