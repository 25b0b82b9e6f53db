use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;

use super::broker::{Broker, BrokerError};
use crate::models::{
    DailyBar, Funding, HoldingKind, HoldingRow, OrderId, OrderMode, OrderRequest, QuoteField,
    Side,
};

/// Refresh the access token this long before it expires
const TOKEN_REFRESH_MARGIN_SECS: i64 = 600;

const PATH_TOKEN: &str = "/oauth2/tokenP";
const PATH_HASHKEY: &str = "/uapi/hashkey";
const PATH_PRICE: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";
const PATH_EXPECTED: &str = "/uapi/domestic-stock/v1/quotations/inquire-asking-price-exp-ccn";
const PATH_DAILY_PRICE: &str = "/uapi/domestic-stock/v1/quotations/inquire-daily-price";
const PATH_CHART: &str = "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice";
const PATH_STOCK_INFO: &str = "/uapi/domestic-stock/v1/quotations/search-stock-info";
const PATH_BALANCE: &str = "/uapi/domestic-stock/v1/trading/inquire-balance";
const PATH_CREDIT_POWER: &str = "/uapi/domestic-stock/v1/trading/inquire-credit-psamount";
const PATH_ORDER_CASH: &str = "/uapi/domestic-stock/v1/trading/order-cash";
const PATH_ORDER_CREDIT: &str = "/uapi/domestic-stock/v1/trading/order-credit";

/// App credentials and account identifiers
#[derive(Debug, Clone)]
pub struct KisCredentials {
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub account_product_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

#[derive(Debug, Deserialize)]
struct BalanceRow {
    pdno: String,
    #[serde(default)]
    prdt_name: String,
    hldg_qty: Value,
    ord_psbl_qty: Value,
    pchs_avg_pric: Value,
    #[serde(default)]
    loan_dt: String,
}

#[derive(Debug, Deserialize)]
struct ChartRow {
    #[serde(default)]
    stck_bsop_date: String,
    stck_oprc: Value,
    stck_hgpr: Value,
    stck_lwpr: Value,
    stck_clpr: Value,
}

/// Numbers arrive as strings ("71000") or JSON numbers
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn quantity(v: &Value) -> Result<u64, BrokerError> {
    number(v)
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64)
        .ok_or_else(|| BrokerError::Malformed(format!("bad quantity: {}", v)))
}

/// Read `section` as a single object or a list, returning its rows
fn rows<T: serde::de::DeserializeOwned>(body: &Value, section: &str) -> Result<Vec<T>, BrokerError> {
    let raw = body
        .get(section)
        .cloned()
        .ok_or_else(|| BrokerError::Malformed(format!("missing `{}`", section)))?;
    let parsed: OneOrMany<T> = serde_json::from_value(raw)
        .map_err(|e| BrokerError::Malformed(format!("`{}`: {}", section, e)))?;
    Ok(parsed.into_vec())
}

/// Numeric `key` of the first row in `section`
fn first_number(body: &Value, section: &str, key: &str) -> Result<f64, BrokerError> {
    let rows: Vec<Value> = rows(body, section)?;
    rows.first()
        .and_then(|row| row.get(key))
        .and_then(number)
        .ok_or_else(|| BrokerError::Malformed(format!("missing `{}.{}`", section, key)))
}

/// Non-zero `rt_cd` is an authoritative rejection.
/// Inquiries tolerate a missing code; orders (`strict`) only succeed on `"0"`.
fn check_result(body: &Value, strict: bool) -> Result<(), BrokerError> {
    match body.get("rt_cd").and_then(Value::as_str) {
        Some("0") => Ok(()),
        None if !strict => Ok(()),
        None => Err(BrokerError::Malformed(format!(
            "missing `rt_cd`: {}",
            body.get("msg1").and_then(Value::as_str).unwrap_or_default().trim()
        ))),
        Some(code) => Err(BrokerError::Rejected {
            code: body
                .get("msg_cd")
                .and_then(Value::as_str)
                .unwrap_or(code)
                .to_string(),
            message: body
                .get("msg1")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
        }),
    }
}

fn status_error(status: StatusCode, body: String) -> BrokerError {
    match status.as_u16() {
        429 => BrokerError::RateLimited,
        401 | 403 => BrokerError::Auth(body),
        s if status.is_server_error() => BrokerError::Server { status: s },
        s => BrokerError::BadRequest { status: s, body },
    }
}

/// Korea Investment & Securities open-API client
pub struct KisClient {
    client: Client,
    base_url: String,
    creds: KisCredentials,
    token: RwLock<Option<AccessToken>>,
    token_cache: Option<PathBuf>,
}

impl KisClient {
    pub fn new(
        base_url: impl Into<String>,
        creds: KisCredentials,
        timeout: Duration,
        token_cache: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            creds,
            token: RwLock::new(None),
            token_cache,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn bearer(&self) -> Result<String, BrokerError> {
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| format!("Bearer {}", t.access_token))
            .ok_or_else(|| BrokerError::Auth("no access token".to_string()))
    }

    async fn authorized(&self, builder: RequestBuilder, tr_id: &str) -> Result<RequestBuilder, BrokerError> {
        Ok(builder
            .header("content-type", "application/json; charset=utf-8")
            .header("authorization", self.bearer().await?)
            .header("appkey", &self.creds.app_key)
            .header("appsecret", &self.creds.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P"))
    }

    async fn send(builder: RequestBuilder) -> Result<Value, BrokerError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        Ok(response.json::<Value>().await?)
    }

    async fn get(&self, path: &str, tr_id: &str, query: &[(&str, &str)]) -> Result<Value, BrokerError> {
        let builder = self.authorized(self.client.get(self.url(path)), tr_id).await?;
        let body = Self::send(builder.query(query)).await?;
        check_result(&body, false)?;
        Ok(body)
    }

    async fn hashkey(&self, body: &Value) -> Result<String, BrokerError> {
        let builder = self
            .client
            .post(self.url(PATH_HASHKEY))
            .header("content-type", "application/json; charset=utf-8")
            .header("appkey", &self.creds.app_key)
            .header("appsecret", &self.creds.app_secret)
            .json(body);
        let resp = Self::send(builder).await?;
        resp.get("HASH")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Malformed("missing `HASH`".to_string()))
    }

    async fn post_signed(&self, path: &str, tr_id: &str, body: &Value) -> Result<Value, BrokerError> {
        let hash = self.hashkey(body).await?;
        let builder = self
            .authorized(self.client.post(self.url(path)), tr_id)
            .await?
            .header("hashkey", hash)
            .json(body);
        let resp = Self::send(builder).await?;
        check_result(&resp, true)?;
        Ok(resp)
    }

    async fn issue_token(&self) -> Result<AccessToken, BrokerError> {
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.creds.app_key,
            "appsecret": self.creds.app_secret,
        });
        let resp = Self::send(self.client.post(self.url(PATH_TOKEN)).json(&body))
            .await
            .map_err(|e| BrokerError::Auth(format!("token request failed: {}", e)))?;
        let parsed: TokenResponse = serde_json::from_value(resp)
            .map_err(|e| BrokerError::Auth(format!("bad token response: {}", e)))?;

        Ok(AccessToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
        })
    }

    async fn load_cached_token(&self) -> Option<AccessToken> {
        let path = self.token_cache.as_ref()?;
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn store_cached_token(&self, token: &AccessToken) {
        let Some(path) = &self.token_cache else {
            return;
        };
        let result = match serde_json::to_string(token) {
            Ok(raw) => tokio::fs::write(path, raw).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            tracing::warn!("Could not cache access token at {}: {}", path.display(), e);
        }
    }

    fn account(&self) -> [(&'static str, &str); 2] {
        [
            ("CANO", self.creds.account_no.as_str()),
            ("ACNT_PRDT_CD", self.creds.account_product_code.as_str()),
        ]
    }
}

#[async_trait]
impl Broker for KisClient {
    async fn ensure_session(&self) -> Result<(), BrokerError> {
        let now = Utc::now();
        if self.token.read().await.as_ref().is_some_and(|t| t.is_fresh(now)) {
            return Ok(());
        }

        let token = match self.load_cached_token().await.filter(|t| t.is_fresh(now)) {
            Some(cached) => {
                tracing::info!("🔑 Using cached access token (expires {})", cached.expires_at);
                cached
            }
            None => {
                let issued = self.issue_token().await?;
                tracing::info!("🔑 Issued new access token (expires {})", issued.expires_at);
                self.store_cached_token(&issued).await;
                issued
            }
        };

        *self.token.write().await = Some(token);
        Ok(())
    }

    async fn quote(&self, symbol: &str, field: QuoteField) -> Result<f64, BrokerError> {
        let base = [("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", symbol)];
        match field {
            QuoteField::Current | QuoteField::Ceiling | QuoteField::Reference => {
                let body = self.get(PATH_PRICE, "FHKST01010100", &base).await?;
                let key = match field {
                    QuoteField::Ceiling => "stck_mxpr",
                    QuoteField::Reference => "stck_sdpr",
                    _ => "stck_prpr",
                };
                first_number(&body, "output", key)
            }
            QuoteField::ExpectedClose => {
                let body = self.get(PATH_EXPECTED, "FHKST01010200", &base).await?;
                first_number(&body, "output2", "antc_cnpr")
            }
            QuoteField::Open => {
                let query = [
                    base[0],
                    base[1],
                    ("FID_PERIOD_DIV_CODE", "D"),
                    ("FID_ORG_ADJ_PRC", "0"),
                ];
                let body = self.get(PATH_DAILY_PRICE, "FHKST01010400", &query).await?;
                first_number(&body, "output", "stck_oprc")
            }
        }
    }

    async fn daily_bars(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>, BrokerError> {
        let from = from.format("%Y%m%d").to_string();
        let to = to.format("%Y%m%d").to_string();
        let query = [
            ("FID_COND_MRKT_DIV_CODE", "J"),
            ("FID_INPUT_ISCD", symbol),
            ("FID_INPUT_DATE_1", from.as_str()),
            ("FID_INPUT_DATE_2", to.as_str()),
            ("FID_PERIOD_DIV_CODE", "D"),
            ("FID_ORG_ADJ_PRC", "0"),
        ];
        let body = self.get(PATH_CHART, "FHKST03010100", &query).await?;

        let mut bars = Vec::new();
        for row in rows::<ChartRow>(&body, "output2")? {
            let Ok(date) = NaiveDate::parse_from_str(row.stck_bsop_date.trim(), "%Y%m%d") else {
                continue;
            };
            let parse = |v: &Value| {
                number(v).ok_or_else(|| BrokerError::Malformed(format!("bad chart value: {}", v)))
            };
            bars.push(DailyBar {
                date,
                open: parse(&row.stck_oprc)?,
                high: parse(&row.stck_hgpr)?,
                low: parse(&row.stck_lwpr)?,
                close: parse(&row.stck_clpr)?,
            });
        }
        Ok(bars)
    }

    async fn holdings(&self, kind: HoldingKind) -> Result<Vec<HoldingRow>, BrokerError> {
        let [cano, prdt] = self.account();
        let query = [
            cano,
            prdt,
            ("AFHR_FLPR_YN", "N"),
            ("OFL_YN", ""),
            ("INQR_DVSN", "01"),
            ("UNPR_DVSN", "01"),
            ("FUND_STTL_ICLD_YN", "N"),
            ("FNCG_AMT_AUTO_RDPT_YN", "N"),
            ("PRCS_DVSN", "01"),
            ("CTX_AREA_FK100", ""),
            ("CTX_AREA_NK100", ""),
        ];
        let body = self.get(PATH_BALANCE, "TTTC8434R", &query).await?;

        let mut result = Vec::new();
        for row in rows::<BalanceRow>(&body, "output1")? {
            let loan_date = Some(row.loan_dt.trim().to_string()).filter(|d| !d.is_empty());
            let wanted = match kind {
                HoldingKind::Credit => loan_date.is_some(),
                HoldingKind::Cash => loan_date.is_none(),
            };
            if !wanted {
                continue;
            }
            result.push(HoldingRow {
                symbol: row.pdno,
                held_qty: quantity(&row.hldg_qty)?,
                orderable_qty: quantity(&row.ord_psbl_qty)?,
                avg_cost: number(&row.pchs_avg_pric).unwrap_or(0.0),
                product_name: row.prdt_name,
                loan_date,
            });
        }
        Ok(result)
    }

    async fn credit_buying_power(&self, symbol: &str) -> Result<f64, BrokerError> {
        let [cano, prdt] = self.account();
        let query = [
            cano,
            prdt,
            ("PDNO", symbol),
            ("ORD_UNPR", ""),
            ("ORD_DVSN", "01"),
            ("CRDT_TYPE", "21"),
            ("CMA_EVLU_AMT_ICLD_YN", "N"),
            ("OVRS_ICLD_YN", "N"),
        ];
        let body = self.get(PATH_CREDIT_POWER, "TTTC8909R", &query).await?;
        first_number(&body, "output", "max_buy_amt")
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderId, BrokerError> {
        let (ord_dvsn, ord_unpr) = match order.mode {
            OrderMode::Market => ("01", "0".to_string()),
            OrderMode::Limit { price } => ("00", format!("{}", price.round() as i64)),
        };
        let mut body = json!({
            "CANO": self.creds.account_no,
            "ACNT_PRDT_CD": self.creds.account_product_code,
            "PDNO": order.symbol,
            "ORD_DVSN": ord_dvsn,
            "ORD_QTY": order.quantity.to_string(),
            "ORD_UNPR": ord_unpr,
        });

        let (path, tr_id) = match (&order.funding, order.side) {
            (Funding::Cash, Side::Buy) => (PATH_ORDER_CASH, "TTTC0802U"),
            (Funding::Cash, Side::Sell) => (PATH_ORDER_CASH, "TTTC0801U"),
            (Funding::Credit { .. }, Side::Buy) => (PATH_ORDER_CREDIT, "TTTC0852U"),
            (Funding::Credit { .. }, Side::Sell) => (PATH_ORDER_CREDIT, "TTTC0851U"),
        };
        if let Funding::Credit { loan_date } = &order.funding {
            body["CRDT_TYPE"] = json!(if order.side == Side::Buy { "21" } else { "25" });
            body["LOAN_DT"] = json!(loan_date);
            body["RSVN_ORD_YN"] = json!("N");
        }

        let resp = self.post_signed(path, tr_id, &body).await?;
        let rows: Vec<Value> = rows(&resp, "output")?;
        rows.first()
            .and_then(|o| o.get("ODNO"))
            .and_then(Value::as_str)
            .map(|id| OrderId(id.to_string()))
            .ok_or_else(|| BrokerError::Malformed("missing `output.ODNO`".to_string()))
    }

    async fn symbol_name(&self, symbol: &str) -> Result<String, BrokerError> {
        let query = [("PRDT_TYPE_CD", "300"), ("PDNO", symbol)];
        let body = self.get(PATH_STOCK_INFO, "CTPF1002R", &query).await?;
        let rows: Vec<Value> = rows(&body, "output")?;
        rows.first()
            .and_then(|o| o.get("prdt_abrv_name"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BrokerError::Malformed("missing `output.prdt_abrv_name`".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn creds() -> KisCredentials {
        KisCredentials {
            app_key: "key".to_string(),
            app_secret: "secret".to_string(),
            account_no: "12345678".to_string(),
            account_product_code: "01".to_string(),
        }
    }

    async fn client(server: &mockito::Server) -> KisClient {
        let client = KisClient::new(server.url(), creds(), Duration::from_secs(5), None).unwrap();
        *client.token.write().await = Some(AccessToken {
            access_token: "test-token".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(12),
        });
        client
    }

    #[test]
    fn test_number_accepts_strings_and_numbers() {
        assert_eq!(number(&json!("71000")), Some(71000.0));
        assert_eq!(number(&json!(" 1.5 ")), Some(1.5));
        assert_eq!(number(&json!(42)), Some(42.0));
        assert_eq!(number(&json!("")), None);
        assert_eq!(number(&json!(null)), None);
    }

    #[test]
    fn test_first_number_object_or_list() {
        let object = json!({"output": {"stck_prpr": "71000"}});
        let list = json!({"output": [{"stck_prpr": "72000"}]});
        let empty = json!({"output": []});

        assert_eq!(first_number(&object, "output", "stck_prpr").unwrap(), 71000.0);
        assert_eq!(first_number(&list, "output", "stck_prpr").unwrap(), 72000.0);
        assert!(matches!(
            first_number(&empty, "output", "stck_prpr"),
            Err(BrokerError::Malformed(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            BrokerError::RateLimited
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, String::new()),
            BrokerError::Server { status: 502 }
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            BrokerError::Auth(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, String::new()),
            BrokerError::BadRequest { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn test_quote_current_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", PATH_PRICE)
            .match_query(Matcher::UrlEncoded("FID_INPUT_ISCD".into(), "005930".into()))
            .match_header("tr_id", "FHKST01010100")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","output":{"stck_prpr":"71000","stck_mxpr":"92300"}}"#)
            .create_async()
            .await;

        let client = client(&server).await;
        assert_eq!(
            client.quote("005930", QuoteField::Current).await.unwrap(),
            71000.0
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expected_close_from_list_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH_EXPECTED)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","output2":[{"antc_cnpr":"70500"}]}"#)
            .create_async()
            .await;

        let client = client(&server).await;
        assert_eq!(
            client
                .quote("005930", QuoteField::ExpectedClose)
                .await
                .unwrap(),
            70500.0
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH_PRICE)
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = client(&server).await;
        let err = client
            .quote("005930", QuoteField::Current)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Server { status: 503 }));
    }

    #[tokio::test]
    async fn test_holdings_split_by_loan_date() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PATH_BALANCE)
            .match_query(Matcher::UrlEncoded("INQR_DVSN".into(), "01".into()))
            .with_status(200)
            .with_body(
                r#"{"rt_cd":"0","output1":[
                    {"pdno":"005930","prdt_name":"삼성전자","hldg_qty":"60","ord_psbl_qty":"60","pchs_avg_pric":"70000.0000","loan_dt":"20240105"},
                    {"pdno":"005930","prdt_name":"삼성전자","hldg_qty":"40","ord_psbl_qty":"40","pchs_avg_pric":"71000.0000","loan_dt":"20240112"},
                    {"pdno":"035720","prdt_name":"카카오","hldg_qty":"10","ord_psbl_qty":"10","pchs_avg_pric":"50000","loan_dt":""}
                ]}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let client = client(&server).await;
        let credit = client.holdings(HoldingKind::Credit).await.unwrap();
        let cash = client.holdings(HoldingKind::Cash).await.unwrap();

        assert_eq!(credit.len(), 2);
        assert_eq!(credit[1].loan_date.as_deref(), Some("20240112"));
        assert_eq!(cash.len(), 1);
        assert_eq!(cash[0].symbol, "035720");
        assert_eq!(cash[0].held_qty, 10);
    }

    #[tokio::test]
    async fn test_credit_sell_order_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH_HASHKEY)
            .with_status(200)
            .with_body(r#"{"HASH":"abc123"}"#)
            .create_async()
            .await;
        let order_mock = server
            .mock("POST", PATH_ORDER_CREDIT)
            .match_header("tr_id", "TTTC0851U")
            .match_header("hashkey", "abc123")
            .match_body(Matcher::PartialJson(json!({
                "PDNO": "005930",
                "ORD_DVSN": "01",
                "ORD_QTY": "30",
                "CRDT_TYPE": "25",
                "LOAN_DT": "20240105"
            })))
            .with_status(200)
            .with_body(r#"{"rt_cd":"0","msg1":"주문 전송 완료","output":{"ODNO":"0000117057"}}"#)
            .create_async()
            .await;

        let client = client(&server).await;
        let id = client
            .submit_order(&OrderRequest {
                symbol: "005930".to_string(),
                side: Side::Sell,
                quantity: 30,
                mode: OrderMode::Market,
                funding: Funding::Credit {
                    loan_date: "20240105".to_string(),
                },
            })
            .await
            .unwrap();

        assert_eq!(id, OrderId("0000117057".to_string()));
        order_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_order_reject_maps_broker_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH_HASHKEY)
            .with_status(200)
            .with_body(r#"{"HASH":"abc123"}"#)
            .create_async()
            .await;
        server
            .mock("POST", PATH_ORDER_CASH)
            .with_status(200)
            .with_body(r#"{"rt_cd":"1","msg_cd":"APBK0952","msg1":"주문가능금액을 초과 했습니다"}"#)
            .create_async()
            .await;

        let client = client(&server).await;
        let err = client
            .submit_order(&OrderRequest {
                symbol: "005930".to_string(),
                side: Side::Buy,
                quantity: 1000,
                mode: OrderMode::Limit { price: 70_000.0 },
                funding: Funding::Cash,
            })
            .await
            .unwrap_err();

        match err {
            BrokerError::Rejected { code, .. } => assert_eq!(code, "APBK0952"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_without_result_code_not_accepted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH_HASHKEY)
            .with_status(200)
            .with_body(r#"{"HASH":"abc123"}"#)
            .create_async()
            .await;
        server
            .mock("POST", PATH_ORDER_CASH)
            .with_status(200)
            .with_body(r#"{"msg1":"unknown","output":{"ODNO":"42"}}"#)
            .create_async()
            .await;

        let client = client(&server).await;
        let result = client
            .submit_order(&OrderRequest {
                symbol: "005930".to_string(),
                side: Side::Buy,
                quantity: 1,
                mode: OrderMode::Market,
                funding: Funding::Cash,
            })
            .await;

        assert!(matches!(result, Err(BrokerError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_ensure_session_issues_and_caches_token() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", PATH_TOKEN)
            .with_status(200)
            .with_body(r#"{"access_token":"fresh","token_type":"Bearer","expires_in":86400}"#)
            .expect(1)
            .create_async()
            .await;

        let cache = std::env::temp_dir().join(format!("equitybot-token-{}.json", uuid::Uuid::new_v4()));
        let client = KisClient::new(server.url(), creds(), Duration::from_secs(5), Some(cache.clone())).unwrap();

        client.ensure_session().await.unwrap();
        client.ensure_session().await.unwrap();
        assert_eq!(client.bearer().await.unwrap(), "Bearer fresh");
        token_mock.assert_async().await;

        // A second client picks the token up from disk
        let reloaded = KisClient::new(server.url(), creds(), Duration::from_secs(5), Some(cache.clone())).unwrap();
        reloaded.ensure_session().await.unwrap();
        assert_eq!(reloaded.bearer().await.unwrap(), "Bearer fresh");

        let _ = std::fs::remove_file(cache);
    }

    #[tokio::test]
    async fn test_token_failure_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", PATH_TOKEN)
            .with_status(403)
            .with_body(r#"{"error_code":"EGW00133"}"#)
            .create_async()
            .await;

        let client = KisClient::new(server.url(), creds(), Duration::from_secs(5), None).unwrap();
        assert!(matches!(
            client.ensure_session().await,
            Err(BrokerError::Auth(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires live credentials
    async fn test_quote_live() {
        let creds = KisCredentials {
            app_key: std::env::var("EQUITYBOT__APP_KEY").expect("EQUITYBOT__APP_KEY not set"),
            app_secret: std::env::var("EQUITYBOT__APP_SECRET").expect("EQUITYBOT__APP_SECRET not set"),
            account_no: String::new(),
            account_product_code: "01".to_string(),
        };
        let client = KisClient::new(
            "https://openapi.koreainvestment.com:9443",
            creds,
            Duration::from_secs(10),
            None,
        )
        .unwrap();
        client.ensure_session().await.unwrap();
        assert!(client.quote("005930", QuoteField::Current).await.unwrap() > 0.0);
    }
}
