//! PayPal Payouts client (reqwest)
//!
//! Each payout is preceded by an OAuth2 client-credentials token exchange.
//! The saga's tx id is sent as `sender_batch_id`, so PayPal itself refuses
//! to execute the same batch twice.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::{GatewayError, PayoutClient, PayoutRequest};
use crate::core_types::ExternalRef;

#[derive(Clone)]
pub struct PaypalConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub currency: String,
    pub timeout: Duration,
}

impl fmt::Debug for PaypalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaypalConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("currency", &self.currency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct PayoutBody<'a> {
    sender_batch_header: SenderBatchHeader<'a>,
    items: [PayoutItem<'a>; 1],
}

#[derive(Debug, Serialize)]
struct SenderBatchHeader<'a> {
    sender_batch_id: &'a str,
    email_subject: &'a str,
}

#[derive(Debug, Serialize)]
struct PayoutItem<'a> {
    recipient_type: &'a str,
    amount: PayoutAmount<'a>,
    receiver: &'a str,
    note: &'a str,
    sender_item_id: &'a str,
}

#[derive(Debug, Serialize)]
struct PayoutAmount<'a> {
    value: String,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct PayoutResponse {
    batch_header: BatchHeader,
}

#[derive(Debug, Deserialize)]
struct BatchHeader {
    payout_batch_id: String,
}

pub struct PaypalPayoutClient {
    http: Client,
    config: PaypalConfig,
}

impl PaypalPayoutClient {
    pub fn new(config: PaypalConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::InvalidInput(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GatewayError::Network(format!("token request failed: {e}"))
                } else {
                    GatewayError::AuthFailure(format!("token request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::AuthFailure(format!(
                "token request returned {status}: {body}"
            )));
        }

        let token: OAuthTokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::AuthFailure(format!("invalid token response: {e}")))?;
        if token.access_token.trim().is_empty() {
            return Err(GatewayError::AuthFailure(
                "token response did not include access_token".to_string(),
            ));
        }
        Ok(token.access_token)
    }
}

/// Map a non-success payout response to a gateway error
fn classify_status(status: StatusCode, body: &str, batch_id: &str) -> GatewayError {
    match status.as_u16() {
        401 | 403 => GatewayError::AuthFailure(format!("payout returned {status}: {body}")),
        400 | 422 => GatewayError::RecipientInvalid(format!("payout returned {status}: {body}")),
        code if code >= 500 => GatewayError::Ambiguous {
            reference: Some(batch_id.to_string()),
            reason: format!("payout returned {status}: {body}"),
        },
        _ => GatewayError::Rejected(format!("payout returned {status}: {body}")),
    }
}

#[async_trait]
impl PayoutClient for PaypalPayoutClient {
    async fn payout(&self, request: &PayoutRequest) -> Result<ExternalRef, GatewayError> {
        let token = self.access_token().await?;

        let body = PayoutBody {
            sender_batch_header: SenderBatchHeader {
                sender_batch_id: &request.batch_id,
                email_subject: "You have a payout!",
            },
            items: [PayoutItem {
                recipient_type: "EMAIL",
                amount: PayoutAmount {
                    value: format_amount(request.amount),
                    currency: &self.config.currency,
                },
                receiver: &request.recipient,
                note: "Withdrawal",
                sender_item_id: &request.batch_id,
            }],
        };

        let response = match self
            .http
            .post(self.url("/v1/payments/payouts"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                return Err(GatewayError::Network(format!("payout request failed: {e}")));
            }
            Err(e) => {
                return Err(GatewayError::Ambiguous {
                    reference: Some(request.batch_id.clone()),
                    reason: format!("payout request failed after send: {e}"),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, &request.batch_id));
        }

        // Accepted from here on: an unreadable body is not a rejection
        let accepted: PayoutResponse =
            response.json().await.map_err(|e| GatewayError::Ambiguous {
                reference: Some(request.batch_id.clone()),
                reason: format!("payout accepted with unreadable response: {e}"),
            })?;
        debug!(
            batch_id = %request.batch_id,
            payout_batch_id = %accepted.batch_header.payout_batch_id,
            "Payout accepted"
        );
        Ok(accepted.batch_header.payout_batch_id)
    }
}

fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount)
}
