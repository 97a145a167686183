//! LNURL-pay: turn an `lnurl1...` string into a payable invoice.
//!
//! Two HTTP round trips: the decoded URL returns a pay request describing
//! the accepted amounts, and its callback returns a bolt11 invoice for the
//! chosen amount.

use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::invoice::{decode_lnurl, validate_invoice, DecodeType, InvoiceAmount, InvoiceError};

/// `tag` of an LNURL-pay response.
const PAY_REQUEST_TAG: &str = "payRequest";

#[derive(Debug, Error)]
pub enum LnurlError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// Service answered `{"status":"ERROR"}`.
    #[error("service error: {0}")]
    Service(String),

    #[error("unexpected response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a pay request (tag {0:?})")]
    NotPayRequest(String),

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("amount {amount} msat outside {min}..={max}")]
    AmountOutOfRange { amount: u64, min: u64, max: u64 },

    #[error("invoice is for {found} msat, asked for {expected}")]
    AmountMismatch { expected: u64, found: u64 },

    #[error(transparent)]
    Invoice(#[from] InvoiceError),
}

/// Error body some services send with a 200 status.
#[derive(Debug, Deserialize)]
struct Status {
    status: Option<String>,
    reason: Option<String>,
}

/// First response of an LNURL-pay exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    pub callback: String,
    pub max_sendable: Option<u64>,
    pub min_sendable: Option<u64>,
    /// JSON array of `[mime, content]` pairs, as a string.
    pub metadata: String,
    pub tag: String,
}

#[derive(Debug, Deserialize)]
struct PayInvoice {
    pr: String,
}

impl PayRequest {
    /// Smallest accepted amount in msat.
    pub fn min_msat(&self) -> u64 {
        self.min_sendable.unwrap_or(1)
    }

    /// Largest accepted amount in msat.
    pub fn max_msat(&self) -> u64 {
        self.max_sendable.unwrap_or(u64::MAX)
    }

    fn metadata_entry(&self, mime: &str) -> Option<String> {
        let entries: Vec<Vec<String>> = serde_json::from_str(&self.metadata).ok()?;
        entries
            .into_iter()
            .find(|entry| entry.first().map(String::as_str) == Some(mime))
            .and_then(|entry| entry.into_iter().nth(1))
    }

    /// Short `text/plain` description.
    pub fn description(&self) -> Option<String> {
        self.metadata_entry("text/plain")
    }

    /// `text/long-desc` description.
    pub fn long_description(&self) -> Option<String> {
        self.metadata_entry("text/long-desc")
    }

    /// Host serving the callback.
    pub fn vendor(&self) -> Option<String> {
        Url::parse(&self.callback)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    /// Reject amounts the service said it will not accept.
    pub fn check_amount(&self, amount_msat: u64) -> Result<(), LnurlError> {
        let (min, max) = (self.min_msat(), self.max_msat());
        if amount_msat < min || amount_msat > max {
            return Err(LnurlError::AmountOutOfRange {
                amount: amount_msat,
                min,
                max,
            });
        }
        Ok(())
    }

    /// Callback URL requesting an invoice for `amount_msat`.
    pub fn callback_url(&self, amount_msat: u64) -> Result<Url, LnurlError> {
        let mut url = parse_url(&self.callback)?;
        url.query_pairs_mut()
            .append_pair("amount", &amount_msat.to_string());
        Ok(url)
    }
}

fn parse_url(url: &str) -> Result<Url, LnurlError> {
    Url::parse(url).map_err(|e| LnurlError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a service response, surfacing `{"status":"ERROR"}` bodies.
fn parse_response<T: DeserializeOwned>(body: &[u8]) -> Result<T, LnurlError> {
    if let Ok(status) = serde_json::from_slice::<Status>(body) {
        if status.status.as_deref() == Some("ERROR") {
            return Err(LnurlError::Service(
                status.reason.unwrap_or_else(|| "no reason given".into()),
            ));
        }
    }
    Ok(serde_json::from_slice(body)?)
}

async fn get<T: DeserializeOwned>(client: &Client, url: Url) -> Result<T, LnurlError> {
    tracing::debug!("GET {}", url);
    let body = client.get(url).send().await?.error_for_status()?.bytes().await?;
    parse_response(&body)
}

/// Decode `lnurl` and fetch the pay request it points at.
pub async fn fetch_pay_request(client: &Client, lnurl: &str) -> Result<PayRequest, LnurlError> {
    let url = parse_url(&decode_lnurl(lnurl)?)?;
    let request: PayRequest = get(client, url).await?;
    if request.tag != PAY_REQUEST_TAG {
        return Err(LnurlError::NotPayRequest(request.tag));
    }
    Ok(request)
}

/// Ask the service for an invoice of `amount_msat`.
///
/// The invoice is checksum-verified and must carry the requested amount.
pub async fn fetch_invoice(
    client: &Client,
    request: &PayRequest,
    amount_msat: u64,
) -> Result<String, LnurlError> {
    request.check_amount(amount_msat)?;
    let invoice: PayInvoice = get(client, request.callback_url(amount_msat)?).await?;

    match validate_invoice(&invoice.pr)? {
        DecodeType::Invoice(InvoiceAmount::Amount(found)) if found != amount_msat => {
            Err(LnurlError::AmountMismatch {
                expected: amount_msat,
                found,
            })
        }
        _ => Ok(invoice.pr),
    }
}
