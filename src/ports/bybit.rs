use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Credentials;
use crate::exchange::{
    ExchangeClient, ExchangeError, Kline, OrderRequest, RawExchangePosition, Side,
};
use crate::quantity::precision_from_step;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    last_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentEntry {
    lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletEntry {
    total_equity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    symbol: String,
    side: String,
    size: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    unrealised_pnl: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
}

fn parse_decimal_field(raw: &str, field: &str) -> Result<Decimal, ExchangeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| ExchangeError::Decode(format!("parse {} from '{}': {}", field, raw, e)))
}

fn header_insert(map: &mut HeaderMap, key: &str, val: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(key.as_bytes()),
        HeaderValue::from_str(val),
    ) {
        map.insert(name, value);
    }
}

fn query_string(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Bybit v5 REST client for linear perpetuals.
pub struct BybitClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    category: String,
    recv_window_ms: u64,
}

impl BybitClient {
    pub fn new(
        testnet: bool,
        credentials: Credentials,
        category: &str,
        recv_window_ms: u64,
    ) -> Result<Self, ExchangeError> {
        let client = ClientBuilder::new()
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        log::info!("[CONFIG] Bybit endpoint: {}", base_url);
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            credentials,
            category: category.to_string(),
            recv_window_ms,
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn sign(&self, timestamp: u64, payload: &str) -> Result<String, ExchangeError> {
        let message = format!(
            "{}{}{}{}",
            timestamp, self.credentials.key, self.recv_window_ms, payload
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(self.credentials.secret.as_bytes())
            .map_err(|e| ExchangeError::Other(format!("hmac key: {}", e)))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, payload: &str) -> Result<HeaderMap, ExchangeError> {
        let ts = Self::timestamp_ms();
        let signature = self.sign(ts, payload)?;
        let mut headers = HeaderMap::new();
        header_insert(&mut headers, "X-BAPI-API-KEY", &self.credentials.key);
        header_insert(&mut headers, "X-BAPI-TIMESTAMP", &ts.to_string());
        header_insert(&mut headers, "X-BAPI-SIGN", &signature);
        header_insert(
            &mut headers,
            "X-BAPI-RECV-WINDOW",
            &self.recv_window_ms.to_string(),
        );
        Ok(headers)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let query = query_string(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let mut request = self.client.get(&url);
        if signed {
            request = request.headers(self.auth_headers(&query)?);
        }
        Self::decode(request.send().await?).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ExchangeError> {
        let payload = serde_json::to_string(body)?;
        let mut headers = self.auth_headers(&payload)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .body(payload)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExchangeError::Http(format!("{} {}", status.as_u16(), text)));
        }
        let envelope: Envelope = serde_json::from_str(&text)?;
        if envelope.ret_code != 0 {
            return Err(ExchangeError::Api {
                code: envelope.ret_code,
                msg: envelope.ret_msg,
            });
        }
        Ok(serde_json::from_value(envelope.result)?)
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let result: ListResult<TickerEntry> = self
            .get(
                "/v5/market/tickers",
                &[("category", self.category.clone()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let entry = result
            .list
            .first()
            .ok_or_else(|| ExchangeError::Other(format!("no ticker for {}", symbol)))?;
        parse_decimal_field(&entry.last_price, "lastPrice")
    }

    async fn get_kline_series(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let result: ListResult<Vec<String>> = self
            .get(
                "/v5/market/kline",
                &[
                    ("category", self.category.clone()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
                false,
            )
            .await?;
        result
            .list
            .iter()
            .map(|row| {
                if row.len() < 6 {
                    return Err(ExchangeError::Decode(format!(
                        "kline row has {} fields",
                        row.len()
                    )));
                }
                let start_ms = row[0]
                    .parse::<i64>()
                    .map_err(|e| ExchangeError::Decode(format!("kline start: {}", e)))?;
                Ok(Kline {
                    start_ms,
                    open: parse_decimal_field(&row[1], "open")?,
                    high: parse_decimal_field(&row[2], "high")?,
                    low: parse_decimal_field(&row[3], "low")?,
                    close: parse_decimal_field(&row[4], "close")?,
                    volume: parse_decimal_field(&row[5], "volume")?,
                })
            })
            .collect()
    }

    async fn get_instrument_quantity_precision(&self, symbol: &str) -> Result<u32, ExchangeError> {
        let result: ListResult<InstrumentEntry> = self
            .get(
                "/v5/market/instruments-info",
                &[("category", self.category.clone()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let entry = result
            .list
            .first()
            .ok_or_else(|| ExchangeError::Other(format!("no instrument info for {}", symbol)))?;
        let step = parse_decimal_field(&entry.lot_size_filter.qty_step, "qtyStep")?;
        Ok(precision_from_step(step))
    }

    async fn get_wallet_equity(&self) -> Result<Decimal, ExchangeError> {
        let result: ListResult<WalletEntry> = self
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
                true,
            )
            .await?;
        let entry = result
            .list
            .first()
            .ok_or_else(|| ExchangeError::Other("empty wallet balance".to_string()))?;
        parse_decimal_field(&entry.total_equity, "totalEquity")
    }

    async fn get_open_positions(
        &self,
        settle_asset: &str,
    ) -> Result<Vec<RawExchangePosition>, ExchangeError> {
        let result: ListResult<PositionEntry> = self
            .get(
                "/v5/position/list",
                &[
                    ("category", self.category.clone()),
                    ("settleCoin", settle_asset.to_string()),
                ],
                true,
            )
            .await?;
        let mut positions = Vec::with_capacity(result.list.len());
        for entry in result.list {
            // flat positions report an empty side
            let side = match entry.side.as_str() {
                "Buy" => Side::Buy,
                "Sell" => Side::Sell,
                _ => continue,
            };
            positions.push(RawExchangePosition {
                symbol: entry.symbol,
                side,
                size: parse_decimal_field(&entry.size, "size")?,
                entry_price: parse_decimal_field(&entry.avg_price, "avgPrice")?,
                unrealized_pnl: parse_decimal_field(&entry.unrealised_pnl, "unrealisedPnl")?,
            });
        }
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        let body = json!({
            "category": self.category,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": request.order_type.as_str(),
            "qty": request.quantity.to_string(),
            "reduceOnly": request.reduce_only,
        });
        let result: CreateOrderResult = self.post("/v5/order/create", &body).await?;
        Ok(result.order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": self.category,
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: Value = self.post("/v5/order/cancel", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> BybitClient {
        BybitClient::new(
            true,
            Credentials {
                key: "XXXXXXXXXX".to_string(),
                secret: "YYYYYYYYYY".to_string(),
            },
            "linear",
            5000,
        )
        .unwrap()
    }

    #[test]
    fn signature_is_hex_hmac_of_prehash() {
        let c = client();
        let sig = c.sign(1658384314791, "category=linear&symbol=BTCUSDT").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(
            sig,
            c.sign(1658384314791, "category=linear&symbol=BTCUSDT").unwrap()
        );
        assert_ne!(sig, c.sign(1658384314792, "category=linear&symbol=BTCUSDT").unwrap());
    }

    #[test]
    fn builds_query_in_parameter_order() {
        let q = query_string(&[
            ("category", "linear".to_string()),
            ("symbol", "BTCUSDT".to_string()),
        ]);
        assert_eq!(q, "category=linear&symbol=BTCUSDT");
    }

    #[test]
    fn parses_decimal_fields() {
        assert_eq!(parse_decimal_field("0.001", "qtyStep").unwrap(), dec!(0.001));
        assert_eq!(parse_decimal_field("", "avgPrice").unwrap(), Decimal::ZERO);
        assert_eq!(parse_decimal_field("1e-3", "x").unwrap(), dec!(0.001));
        assert!(parse_decimal_field("abc", "x").is_err());
    }

    #[test]
    fn envelope_with_error_code_decodes() {
        let env: Envelope =
            serde_json::from_str(r#"{"retCode":10001,"retMsg":"params error","result":{}}"#)
                .unwrap();
        assert_eq!(env.ret_code, 10001);
        assert_eq!(env.ret_msg, "params error");
        let list: ListResult<TickerEntry> = serde_json::from_value(env.result).unwrap();
        assert!(list.list.is_empty());
    }

    #[test]
    fn position_entry_decodes() {
        let raw = r#"{"list":[{"symbol":"BTCUSDT","side":"Sell","size":"0.020","avgPrice":"50000","unrealisedPnl":"-3.5","leverage":"10"}]}"#;
        let result: ListResult<PositionEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(result.list[0].side, "Sell");
        assert_eq!(
            parse_decimal_field(&result.list[0].unrealised_pnl, "pnl").unwrap(),
            dec!(-3.5)
        );
    }
}
