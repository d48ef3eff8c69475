//! Decoding of broadcast payloads into the fields the admission policy
//! evaluates.

pub mod proto;

use std::{
    fmt,
    str::FromStr,
    sync::LazyLock,
};

use alloy_primitives::{
    U256,
    ruint::UintTryFrom,
};
use prost::Message;
use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

use crate::error::{
    FirewallError,
    Result,
};

static DENOM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9/:._-]{1,127}$").expect("static denom pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoinParseError {
    #[error("coin `{0}` has no amount")]
    MissingAmount(String),
    #[error("coin `{0}` has an amount that is not a base-10 integer")]
    InvalidAmount(String),
    #[error("coin `{0}` has an invalid denom")]
    InvalidDenom(String),
}

/// A fee amount in a single denomination, e.g. `500utest`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Coin {
    pub denom: String,
    pub amount: U256,
}

impl Coin {
    pub fn new<T>(amount: T, denom: impl Into<String>) -> Self
    where
        U256: UintTryFrom<T>,
    {
        Self {
            denom: denom.into(),
            amount: U256::from(amount),
        }
    }
}

fn parse_amount(raw: &str, coin: &str) -> Result<U256, CoinParseError> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoinParseError::InvalidAmount(coin.to_string()));
    }
    U256::from_str_radix(raw, 10).map_err(|_| CoinParseError::InvalidAmount(coin.to_string()))
}

impl FromStr for Coin {
    type Err = CoinParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (amount, denom) = s.split_at(split);
        if amount.is_empty() {
            return Err(CoinParseError::MissingAmount(s.to_string()));
        }
        if !DENOM.is_match(denom) {
            return Err(CoinParseError::InvalidDenom(s.to_string()));
        }
        Ok(Self {
            denom: denom.to_string(),
            amount: parse_amount(amount, s)?,
        })
    }
}

impl TryFrom<String> for Coin {
    type Error = CoinParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Coin> for String {
    fn from(coin: Coin) -> Self {
        coin.to_string()
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

impl TryFrom<proto::Coin> for Coin {
    type Error = CoinParseError;

    fn try_from(coin: proto::Coin) -> Result<Self, Self::Error> {
        let amount = parse_amount(&coin.amount, &format!("{}{}", coin.amount, coin.denom))?;
        Ok(Self {
            denom: coin.denom,
            amount,
        })
    }
}

/// The policy-relevant view of a decoded transaction.
///
/// Lives only for the duration of one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    pub gas_limit: u64,
    pub fee: Vec<Coin>,
    pub memo: String,
    /// Type URL of every message, in transaction order.
    pub messages: Vec<String>,
    pub extension_options: usize,
    pub non_critical_extension_options: usize,
    pub granter: String,
    pub payer: String,
    pub signer_infos: usize,
    pub signatures: usize,
    /// Type URL of each signer's public key, in signer order. Signers that
    /// omit their key contribute an empty string.
    pub public_key_type_urls: Vec<String>,
}

impl Transaction {
    /// Decodes the protobuf `TxRaw` bytes carried by every broadcast call.
    pub fn from_tx_bytes(bytes: &[u8]) -> Result<Self> {
        let raw = proto::TxRaw::decode(bytes).map_err(|err| invalid("tx", err))?;
        let body =
            proto::TxBody::decode(raw.body_bytes.as_slice()).map_err(|err| invalid("tx body", err))?;
        let auth_info = proto::AuthInfo::decode(raw.auth_info_bytes.as_slice())
            .map_err(|err| invalid("auth info", err))?;

        let fee = auth_info.fee.unwrap_or_default();
        let coins = fee
            .amount
            .into_iter()
            .map(Coin::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| invalid("fee", err))?;

        Ok(Self {
            gas_limit: fee.gas_limit,
            fee: coins,
            memo: body.memo,
            messages: body.messages.into_iter().map(|any| any.type_url).collect(),
            extension_options: body.extension_options.len(),
            non_critical_extension_options: body.non_critical_extension_options.len(),
            granter: fee.granter,
            payer: fee.payer,
            signer_infos: auth_info.signer_infos.len(),
            signatures: raw.signatures.len(),
            public_key_type_urls: auth_info
                .signer_infos
                .into_iter()
                .map(|signer| signer.public_key.map(|key| key.type_url).unwrap_or_default())
                .collect(),
        })
    }
}

fn invalid(what: &str, err: impl fmt::Display) -> FirewallError {
    FirewallError::InvalidTransaction(format!("failed to decode {what}: {err}"))
}
