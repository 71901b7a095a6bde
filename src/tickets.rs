//! Ticket API
//!
//! - `GET /ticket/{token}`: the token's 10 most recent tickets as JSON
//! - `POST /ticket/?buy`: start a purchase, returns a payment QR payload
//! - `POST /ticket/`: payment notification from the provider; creates the ticket
//!
//! Purchases go through a [`PaymentProvider`]; without one the purchase
//! routes answer 501. The pay order number is `<token>@<RFC 3339 time>`, so
//! the notification alone identifies the token to credit.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{SecondsFormat, Utc};
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, Response, StatusCode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::Ledger;

/// Path prefix of the ticket API
pub const TICKET_PREFIX: &str = "/ticket/";

/// Smallest purchase, in cents
pub const MIN_PURCHASE_CENTS: i64 = 100;

/// Tickets returned by a listing
pub const LIST_LIMIT: usize = 10;

const MIB: i64 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment notification rejected: {0}")]
    Rejected(String),

    #[error("Payment provider error: {0}")]
    Provider(String),
}

/// Order as known to the payment provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Our order number, `<token>@<time>`
    pub order_no: String,
    /// Amount in yuan with two decimals, e.g. `"12.50"`
    pub amount: String,
    /// Provider's transaction number
    #[serde(default)]
    pub trade_no: String,
}

/// External payment integration
#[async_trait::async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a payment for `order` and return the QR code payload to show
    async fn new_qr(&self, order: &Order, notify_url: &str) -> Result<String, PaymentError>;

    /// Verify a payment notification and return the paid order
    async fn on_pay(&self, headers: &HeaderMap, body: &[u8]) -> Result<Order, PaymentError>;
}

#[derive(Debug, Deserialize)]
struct BuyRequest {
    #[serde(default)]
    token: String,
    cents: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuyResponse {
    pub qr: String,
    pub token: String,
    pub order: String,
}

/// Ticket API handler
#[derive(Clone)]
pub struct TicketApi {
    ledger: Arc<dyn Ledger>,
    payment: Option<Arc<dyn PaymentProvider>>,
    mib_per_cny: i64,
}

impl TicketApi {
    pub fn new(ledger: Arc<dyn Ledger>, mib_per_cny: i64) -> Self {
        Self {
            ledger,
            payment: None,
            mib_per_cny,
        }
    }

    pub fn with_payment(mut self, payment: Arc<dyn PaymentProvider>) -> Self {
        self.payment = Some(payment);
        self
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let token = req
            .uri()
            .path()
            .strip_prefix(TICKET_PREFIX)
            .unwrap_or("")
            .trim_end_matches('/')
            .to_string();

        match *req.method() {
            Method::GET => self.list(&token).await,
            Method::POST => {
                let buying = req
                    .uri()
                    .query()
                    .map(|q| url::form_urlencoded::parse(q.as_bytes()).any(|(k, _)| k == "buy"))
                    .unwrap_or(false);
                if buying {
                    self.buy(req).await
                } else {
                    self.notify(req).await
                }
            }
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
        }
    }

    async fn list(&self, token: &str) -> Response<Body> {
        if token.is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "missing token");
        }
        match self.ledger.list(token, LIST_LIMIT).await {
            Ok(tickets) => json_response(&tickets),
            Err(e) => {
                warn!("Listing tickets failed: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }

    async fn buy(&self, req: Request<Body>) -> Response<Body> {
        let payment = match &self.payment {
            Some(payment) => payment.clone(),
            None => return text_response(StatusCode::NOT_IMPLEMENTED, "purchases disabled"),
        };

        let host = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let notify_url = format!("https://{}{}", host, req.uri().path());

        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        let buy: BuyRequest = match serde_json::from_slice(&body) {
            Ok(buy) => buy,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if buy.cents < MIN_PURCHASE_CENTS {
            return text_response(StatusCode::BAD_REQUEST, "cents must be at least 100");
        }

        let token = if buy.token.is_empty() {
            generate_token()
        } else {
            buy.token
        };
        let order = Order {
            order_no: format!(
                "{}@{}",
                token,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            amount: format_cents(buy.cents),
            trade_no: String::new(),
        };

        match payment.new_qr(&order, &notify_url).await {
            Ok(qr) => json_response(&BuyResponse {
                qr,
                token,
                order: order.order_no,
            }),
            Err(e) => {
                warn!("Creating payment for {} failed: {}", order.order_no, e);
                text_response(StatusCode::BAD_GATEWAY, "payment provider unavailable")
            }
        }
    }

    async fn notify(&self, req: Request<Body>) -> Response<Body> {
        let payment = match &self.payment {
            Some(payment) => payment.clone(),
            None => return text_response(StatusCode::NOT_IMPLEMENTED, "purchases disabled"),
        };

        let headers = req.headers().clone();
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };

        let order = match payment.on_pay(&headers, &body).await {
            Ok(order) => order,
            Err(e) => {
                warn!("{}", e);
                return text_response(StatusCode::BAD_REQUEST, "invalid notification");
            }
        };

        let token = order_token(&order.order_no);
        let bytes = match parse_cents(&order.amount).and_then(|cents| self.credit_bytes(cents)) {
            Some(bytes) => bytes,
            None => return text_response(StatusCode::BAD_REQUEST, "invalid amount"),
        };

        if let Err(e) = self
            .ledger
            .create(token, bytes, &order.order_no, &order.trade_no)
            .await
        {
            warn!("Crediting order {} failed: {}", order.order_no, e);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }

        info!("Order {} paid: {} bytes for {}", order.order_no, bytes, token);
        text_response(StatusCode::OK, "success")
    }

    /// Bytes bought for `cents`. `None` if it does not fit in an i64.
    fn credit_bytes(&self, cents: i64) -> Option<i64> {
        cents
            .checked_mul(self.mib_per_cny)?
            .checked_mul(MIB)
            .map(|v| v / 100)
    }
}

/// Token part of an order number
pub fn order_token(order_no: &str) -> &str {
    order_no.split('@').next().unwrap_or(order_no)
}

/// Fresh access token: 16 random bytes, base64url, lowercase, `-`/`_` as `z`
pub fn generate_token() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD
        .encode(raw)
        .to_ascii_lowercase()
        .replace(['-', '_'], "z")
}

fn format_cents(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

/// Parse a yuan amount ("12", "12.5", "12.50") into cents
pub fn parse_cents(amount: &str) -> Option<i64> {
    let amount = amount.trim();
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, ""));
    if whole.is_empty() || frac.len() > 2 {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    if whole < 0 {
        return None;
    }
    whole.checked_mul(100)?.checked_add(frac)
}

fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
}
