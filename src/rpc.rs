//! Typed wrappers for common node RPCs.

use std::time::Duration;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::client::Session;
use crate::error::Result;
use crate::invoice::validate_invoice;

/// Deadline for read-only RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(8);

/// Deadline for `pay`, which waits for the payment to settle.
pub const PAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Millisatoshi amount.
///
/// Nodes report amounts either as integers or as strings like `"1000msat"`;
/// both deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Msat(pub u64);

impl<'de> Deserialize<'de> for Msat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Msat(n)),
            Raw::Text(s) => s
                .strip_suffix("msat")
                .unwrap_or(&s)
                .parse()
                .map(Msat)
                .map_err(|_| de::Error::custom(format!("invalid msat amount {:?}", s))),
        }
    }
}

impl std::fmt::Display for Msat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

/// Result of `getinfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetInfo {
    pub id: String,
    pub alias: String,
    pub color: String,
    pub network: String,
    pub num_peers: u32,
    pub num_active_channels: u32,
    pub blockheight: u64,
    #[serde(alias = "msatoshi_fees_collected")]
    pub fees_collected_msat: Msat,
}

/// On-chain output from `listfunds`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    pub txid: String,
    pub output: u32,
    pub amount_msat: Msat,
    pub scriptpubkey: String,
    pub address: Option<String>,
    pub status: String,
    pub blockheight: Option<u64>,
    pub reserved: bool,
}

/// Channel from `listfunds`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub peer_id: String,
    pub connected: bool,
    pub state: String,
    pub short_channel_id: Option<String>,
    pub our_amount_msat: Msat,
    pub amount_msat: Msat,
    pub funding_txid: String,
    pub funding_output: u32,
}

/// Result of `listfunds`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFunds {
    pub outputs: Vec<Output>,
    pub channels: Vec<Channel>,
}

/// Result of `pay`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pay {
    pub destination: Option<String>,
    pub payment_hash: String,
    pub created_at: f64,
    pub parts: u32,
    pub amount_msat: Msat,
    pub amount_sent_msat: Msat,
    pub payment_preimage: String,
    pub status: String,
}

/// Positional params for `pay`.
fn pay_params(bolt11: &str, amount_msat: Option<u64>) -> Value {
    match amount_msat {
        Some(amount) => json!([bolt11, format!("{}msat", amount)]),
        None => json!([bolt11]),
    }
}

impl Session {
    /// Call `method` and deserialize its result.
    pub fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let value = self.call(method, params, timeout)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn getinfo(&self) -> Result<GetInfo> {
        self.call_typed("getinfo", json!([]), Some(RPC_TIMEOUT))
    }

    pub fn listfunds(&self) -> Result<ListFunds> {
        self.call_typed("listfunds", json!([]), Some(RPC_TIMEOUT))
    }

    /// Pay `bolt11`, optionally overriding the amount.
    ///
    /// The invoice's checksum is verified locally before anything is sent.
    pub fn pay(&self, bolt11: &str, amount_msat: Option<u64>) -> Result<Pay> {
        validate_invoice(bolt11)?;
        self.call_typed("pay", pay_params(bolt11, amount_msat), Some(PAY_TIMEOUT))
    }
}
