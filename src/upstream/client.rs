// =============================================================================
// Upstream Client (C2) — synchronous request/response access to the
// upstream auction site (§4.2)
// =============================================================================
//
// `reqwest` usage and `#[instrument]` placement mirror the teacher's
// `BinanceClient`: one shared `reqwest::Client`, default timeouts set at
// construction, and a custom `Debug` impl that never prints the cookie
// blob — the same "never log secrets" posture as the teacher never logging
// `api_key`/`secret`.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER};
use serde::Deserialize;
use tracing::instrument;

use crate::errors::ErrorType;
use crate::record::AuctionSnapshot;

const GET_TIMEOUT: Duration = Duration::from_secs(10);
const BID_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a `placeBid` call (§4.2).
#[derive(Debug, Clone)]
pub struct BidOutcome {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub retryable: bool,
}

#[derive(Debug, Clone)]
pub struct CheckAuthResult {
    pub authenticated: bool,
    pub cookie_count: usize,
}

/// Classifies an upstream message (already lowercased) into the fixed
/// taxonomy (§4.2). Each branch documents the exact substring(s) matched so
/// tests can pin them verbatim.
pub fn classify_bid_response(message: &str) -> ErrorType {
    let message = message.to_lowercase();

    if message.contains("already placed") && message.contains("same price") {
        return ErrorType::DuplicateBidAmount;
    }
    if message.contains("too low") || message.contains("minimum bid") {
        return ErrorType::BidTooLow;
    }
    if message.contains("ended") || message.contains("closed") {
        return ErrorType::AuctionEnded;
    }
    if message.contains("login") || message.contains("authentication") {
        return ErrorType::AuthenticationError;
    }
    if message.contains("outbid") || message.contains("higher") {
        return ErrorType::Outbid;
    }
    ErrorType::UnknownError
}

#[derive(Deserialize)]
struct UpstreamCloseTime {
    value: i64,
}

#[derive(Deserialize)]
struct UpstreamUserState {
    #[serde(rename = "isWinning")]
    is_winning: bool,
    #[serde(rename = "nextBid")]
    next_bid: u64,
}

#[derive(Deserialize)]
struct UpstreamProduct {
    #[serde(rename = "currentPrice")]
    current_price: u64,
    #[serde(rename = "bidCount")]
    bid_count: u32,
    #[serde(rename = "isClosed")]
    is_closed: bool,
    #[serde(rename = "closeTime")]
    close_time: UpstreamCloseTime,
    #[serde(rename = "extensionInterval")]
    extension_interval: u64,
    #[serde(rename = "userState")]
    user_state: UpstreamUserState,
}

#[derive(Deserialize)]
struct UpstreamSnapshotResponse {
    product: UpstreamProduct,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    product_page_base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, product_page_base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.into(),
            product_page_base_url: product_page_base_url.into(),
        }
    }

    fn cookie_header(cookies: &[u8]) -> Option<HeaderValue> {
        HeaderValue::from_bytes(cookies).ok()
    }

    /// GET the upstream auction snapshot, transformed into the internal
    /// representation (§3).
    #[instrument(skip(self, cookies), name = "upstream::get_auction_data")]
    pub async fn get_auction_data(
        &self,
        product_id: u64,
        cookies: &[u8],
    ) -> Result<AuctionSnapshot> {
        let url = format!("{}/products/{}", self.base_url, product_id);

        let mut headers = HeaderMap::new();
        if let Some(cookie) = Self::cookie_header(cookies) {
            headers.insert(COOKIE, cookie);
        }

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .timeout(GET_TIMEOUT)
            .send()
            .await
            .context("upstream snapshot request failed")?;

        let parsed: UpstreamSnapshotResponse = response
            .error_for_status()
            .context("upstream returned an error status for snapshot request")?
            .json()
            .await
            .context("failed to parse upstream snapshot response")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let time_remaining =
            ((parsed.product.close_time.value - now_ms) / 1000).max(0) as u64;
        let next_bid = parsed.product.user_state.next_bid;

        Ok(AuctionSnapshot {
            current_bid: parsed.product.current_price,
            next_bid,
            bid_count: parsed.product.bid_count,
            is_winning: parsed.product.user_state.is_winning,
            is_closed: parsed.product.is_closed,
            time_remaining,
            close_time: parsed.product.close_time.value,
            extension_interval: parsed.product.extension_interval,
        })
    }

    /// POST a bid, classifying the response/error into the fixed taxonomy
    /// (§4.2). Network failures map to `CONNECTION_ERROR`, upstream 5xx to
    /// `SERVER_ERROR`.
    #[instrument(skip(self, cookies), name = "upstream::place_bid")]
    pub async fn place_bid(&self, product_id: u64, amount: u64, cookies: &[u8]) -> BidOutcome {
        let url = format!("{}/bid", self.base_url);
        let referer = format!("{}/products/{}", self.product_page_base_url, product_id);

        let mut headers = HeaderMap::new();
        if let Some(cookie) = Self::cookie_header(cookies) {
            headers.insert(COOKIE, cookie);
        }
        if let Ok(value) = HeaderValue::from_str(&referer) {
            headers.insert(REFERER, value);
        }

        let body = serde_json::json!({ "productId": product_id, "bid": amount });

        let response = match self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(BID_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return BidOutcome {
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                    error_type: Some(ErrorType::ConnectionError),
                    retryable: true,
                };
            }
        };

        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if status.is_server_error() {
            return BidOutcome {
                success: false,
                data: Some(payload),
                error: Some(message.to_string()),
                error_type: Some(ErrorType::ServerError),
                retryable: true,
            };
        }

        if status.is_success() {
            // A 2xx response may still report the bidder was outbid in the
            // payload itself (§4.2): same classification path as errors, and
            // the same lowercase-before-match rule.
            let lower = message.to_lowercase();
            if lower.contains("outbid") || lower.contains("higher") {
                return BidOutcome {
                    success: false,
                    data: Some(payload),
                    error: Some(message.to_string()),
                    error_type: Some(ErrorType::Outbid),
                    retryable: true,
                };
            }
            return BidOutcome {
                success: true,
                data: Some(payload),
                error: None,
                error_type: None,
                retryable: false,
            };
        }

        let error_type = classify_bid_response(message);
        BidOutcome {
            success: false,
            data: Some(payload),
            error: Some(message.to_string()),
            retryable: error_type.is_retryable(),
            error_type: Some(error_type),
        }
    }

    #[instrument(skip(self, cookies), name = "upstream::authenticate")]
    pub async fn authenticate(&self, cookies: &[u8]) -> Result<()> {
        self.check_auth(cookies).await.map(|_| ())
    }

    #[instrument(skip(self, cookies), name = "upstream::check_auth")]
    pub async fn check_auth(&self, cookies: &[u8]) -> Result<CheckAuthResult> {
        let url = format!("{}/account", self.base_url);

        let mut headers = HeaderMap::new();
        if let Some(cookie) = Self::cookie_header(cookies) {
            headers.insert(COOKIE, cookie);
        }

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .timeout(GET_TIMEOUT)
            .send()
            .await
            .context("auth check request failed")?;

        let authenticated = response.status().is_success();
        let cookie_count = String::from_utf8_lossy(cookies)
            .split(';')
            .filter(|s| !s.trim().is_empty())
            .count();

        Ok(CheckAuthResult {
            authenticated,
            cookie_count,
        })
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_duplicate_bid_amount() {
        assert_eq!(
            classify_bid_response("A bid at the same price was already placed."),
            ErrorType::DuplicateBidAmount
        );
    }

    #[test]
    fn classifies_bid_too_low() {
        assert_eq!(
            classify_bid_response("Your bid is too low."),
            ErrorType::BidTooLow
        );
        assert_eq!(
            classify_bid_response("Bid does not meet the minimum bid requirement."),
            ErrorType::BidTooLow
        );
    }

    #[test]
    fn classifies_auction_ended() {
        assert_eq!(
            classify_bid_response("This auction has ended."),
            ErrorType::AuctionEnded
        );
    }

    #[test]
    fn classifies_authentication_error() {
        assert_eq!(
            classify_bid_response("Please login to continue."),
            ErrorType::AuthenticationError
        );
    }

    #[test]
    fn classifies_outbid() {
        assert_eq!(
            classify_bid_response("You have been outbid by another user."),
            ErrorType::Outbid
        );
    }

    #[test]
    fn unrecognized_message_is_unknown() {
        assert_eq!(
            classify_bid_response("something unexpected happened"),
            ErrorType::UnknownError
        );
    }

    #[tokio::test]
    async fn place_bid_against_malformed_host_is_a_connection_error() {
        let client = UpstreamClient::new(
            "http://127.0.0.1:1",
            "http://127.0.0.1:1",
        );
        let outcome = client.place_bid(1, 10, b"").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_type, Some(ErrorType::ConnectionError));
        assert!(outcome.retryable);
    }

    #[tokio::test]
    async fn place_bid_2xx_success_has_no_error_type() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/bid"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Bid placed successfully"
            })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), server.uri());
        let outcome = client.place_bid(1, 10, b"").await;
        assert!(outcome.success);
        assert_eq!(outcome.error_type, None);
    }

    #[tokio::test]
    async fn place_bid_2xx_with_outbid_message_is_classified_outbid() {
        // Scenario 4's literal upstream message, mixed case on purpose to
        // pin the lowercase-before-match rule on this call site.
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/bid"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Someone placed a higher maximum bid",
                "currentAmount": 120,
                "minimumNextBid": 125
            })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), server.uri());
        let outcome = client.place_bid(1, 10, b"").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_type, Some(ErrorType::Outbid));
        assert!(outcome.retryable);
    }

    #[tokio::test]
    async fn place_bid_5xx_is_server_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/bid"))
            .respond_with(wiremock::ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "message": "upstream unavailable"
            })))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), server.uri());
        let outcome = client.place_bid(1, 10, b"").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_type, Some(ErrorType::ServerError));
        assert!(outcome.retryable);
    }
}
