//! Admission policy.
//!
//! [`evaluate`] is a pure function of a decoded [`Transaction`] and the
//! loaded [`PolicyConfig`]. Rules run in a fixed order and the first failing
//! rule decides the rejection reason, so the same transaction always yields
//! the same verdict.

use std::{
    fmt,
    sync::Arc,
};

use alloy_primitives::U256;
use thiserror::Error;

use crate::{
    config::PolicyConfig,
    tx::Transaction,
};

/// Stable rejection reason codes surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    GasLimitTooLow,
    FeeTooLow,
    MemoTooLong,
    MessageRouteNotAllowed,
    ExtensionOptionsNotAllowed,
    GranterNotAllowed,
    PayerNotAllowed,
    SignerInfoCountMismatch,
    InsufficientSignatures,
    PublicKeyTypeNotAllowed,
}

impl RejectReason {
    /// Wire code, also used as the metrics label.
    pub const fn code(self) -> &'static str {
        match self {
            RejectReason::GasLimitTooLow => "GAS_LIMIT_TOO_LOW",
            RejectReason::FeeTooLow => "FEE_TOO_LOW",
            RejectReason::MemoTooLong => "MEMO_TOO_LONG",
            RejectReason::MessageRouteNotAllowed => "MESSAGE_ROUTE_NOT_ALLOWED",
            RejectReason::ExtensionOptionsNotAllowed => "EXTENSION_OPTIONS_NOT_ALLOWED",
            RejectReason::GranterNotAllowed => "GRANTER_NOT_ALLOWED",
            RejectReason::PayerNotAllowed => "PAYER_NOT_ALLOWED",
            RejectReason::SignerInfoCountMismatch => "SIGNER_INFO_COUNT_MISMATCH",
            RejectReason::InsufficientSignatures => "INSUFFICIENT_SIGNATURES",
            RejectReason::PublicKeyTypeNotAllowed => "PUBLIC_KEY_TYPE_NOT_ALLOWED",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failed rule: the reason code plus a human readable detail.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason}: {detail}")]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejection {
    fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Outcome of evaluating one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Verdict::Accepted => None,
            Verdict::Rejected(rejection) => Some(rejection.reason),
        }
    }

    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Verdict::Accepted => Ok(()),
            Verdict::Rejected(rejection) => Err(rejection),
        }
    }
}

impl From<Result<(), Rejection>> for Verdict {
    fn from(result: Result<(), Rejection>) -> Self {
        match result {
            Ok(()) => Verdict::Accepted,
            Err(rejection) => Verdict::Rejected(rejection),
        }
    }
}

/// Shared handle to the policy, cloned into every transport adapter.
#[derive(Clone, Debug)]
pub struct Validator {
    policy: Arc<PolicyConfig>,
}

impl Validator {
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn evaluate(&self, tx: &Transaction) -> Verdict {
        evaluate(tx, &self.policy)
    }
}

/// Runs every admission rule in order, stopping at the first failure.
pub fn evaluate(tx: &Transaction, policy: &PolicyConfig) -> Verdict {
    check_all(tx, policy).into()
}

fn check_all(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    check_gas_limit(tx, policy)?;
    check_fee(tx, policy)?;
    check_memo(tx, policy)?;
    check_message_routes(tx, policy)?;
    check_extension_options(tx, policy)?;
    check_granter(tx, policy)?;
    check_payer(tx, policy)?;
    check_signer_infos(tx, policy)?;
    check_signatures(tx, policy)?;
    check_public_key_types(tx, policy)
}

fn check_gas_limit(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.gas_limit < policy.minimum_gas_limit {
        return Err(Rejection::new(
            RejectReason::GasLimitTooLow,
            format!(
                "gas limit {} is below the minimum {}",
                tx.gas_limit, policy.minimum_gas_limit
            ),
        ));
    }
    Ok(())
}

fn check_fee(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    let Some(minimum) = &policy.minimum_fee else {
        return Ok(());
    };
    let paid = tx
        .fee
        .iter()
        .find(|coin| coin.denom == minimum.denom)
        .map_or(U256::ZERO, |coin| coin.amount);
    if paid < minimum.amount {
        return Err(Rejection::new(
            RejectReason::FeeTooLow,
            format!("fee {paid}{} is below the minimum {minimum}", minimum.denom),
        ));
    }
    Ok(())
}

fn check_memo(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    let len = tx.memo.len() as u64;
    if len > policy.max_memo_length {
        return Err(Rejection::new(
            RejectReason::MemoTooLong,
            format!(
                "memo is {len} bytes, limit is {}",
                policy.max_memo_length
            ),
        ));
    }
    Ok(())
}

fn check_message_routes(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    match tx
        .messages
        .iter()
        .find(|route| !policy.allowed_message_routes.contains(route.as_str()))
    {
        Some(route) => {
            Err(Rejection::new(
                RejectReason::MessageRouteNotAllowed,
                format!("message {route} is not allowed"),
            ))
        }
        None => Ok(()),
    }
}

fn check_extension_options(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.extension_options > policy.max_extension_options {
        return Err(Rejection::new(
            RejectReason::ExtensionOptionsNotAllowed,
            format!(
                "{} extension options, limit is {}",
                tx.extension_options, policy.max_extension_options
            ),
        ));
    }
    if tx.non_critical_extension_options > policy.max_non_critical_extension_options {
        return Err(Rejection::new(
            RejectReason::ExtensionOptionsNotAllowed,
            format!(
                "{} non-critical extension options, limit is {}",
                tx.non_critical_extension_options, policy.max_non_critical_extension_options
            ),
        ));
    }
    Ok(())
}

fn check_granter(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.granter.len() > policy.max_granter_length {
        return Err(Rejection::new(
            RejectReason::GranterNotAllowed,
            format!("fee granter {:?} is not allowed", tx.granter),
        ));
    }
    Ok(())
}

fn check_payer(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.payer.len() > policy.max_payer_length {
        return Err(Rejection::new(
            RejectReason::PayerNotAllowed,
            format!("fee payer {:?} is not allowed", tx.payer),
        ));
    }
    Ok(())
}

fn check_signer_infos(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.signer_infos != policy.exact_signer_infos {
        return Err(Rejection::new(
            RejectReason::SignerInfoCountMismatch,
            format!(
                "{} signer infos, expected exactly {}",
                tx.signer_infos, policy.exact_signer_infos
            ),
        ));
    }
    Ok(())
}

fn check_signatures(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    if tx.signatures < policy.minimum_signatures {
        return Err(Rejection::new(
            RejectReason::InsufficientSignatures,
            format!(
                "{} signatures, at least {} required",
                tx.signatures, policy.minimum_signatures
            ),
        ));
    }
    Ok(())
}

fn check_public_key_types(tx: &Transaction, policy: &PolicyConfig) -> Result<(), Rejection> {
    match tx
        .public_key_type_urls
        .iter()
        .find(|type_url| !policy.allowed_public_key_type_urls.contains(type_url.as_str()))
    {
        Some(type_url) => {
            Err(Rejection::new(
                RejectReason::PublicKeyTypeNotAllowed,
                format!("public key type {type_url:?} is not allowed"),
            ))
        }
        None => Ok(()),
    }
}
