//! Structured domain errors returned to swap clients.
//!
//! Codes are grouped by category:
//! - 200xx: request validation
//! - 201xx: liquidity / capacity
//! - 202xx: consistency (caller should retry)
//! - 203xx: fraud / funding mismatch
//! - 204xx: plugin rejections
//! - 0: generic failure, details are only logged

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("amount too low")]
    AmountTooLow { min: u64, max: u64 },

    #[error("amount too high")]
    AmountTooHigh { min: u64, max: u64 },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("unsupported token: {token}")]
    UnsupportedToken { token: String },

    #[error("quote expired")]
    QuoteExpired,

    #[error("swap not found")]
    NotFound,

    #[error("insufficient liquidity: required {required}, available {available}")]
    InsufficientLiquidity { required: u64, available: u64 },

    #[error("no vault with sufficient liquidity")]
    NoVaultAvailable,

    #[error("try again: {reason}")]
    TryAgain { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("funding mismatch: {reason}")]
    FundingMismatch { reason: String },

    #[error("rejected by plugin {plugin}: {msg}")]
    PluginRejected {
        plugin: String,
        code: u32,
        msg: String,
        data: Option<Value>,
    },

    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl SwapError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn try_again(reason: impl Into<String>) -> Self {
        Self::TryAgain {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::AmountTooLow { .. } => 20003,
            Self::AmountTooHigh { .. } => 20004,
            Self::InvalidRequest { .. } => 20001,
            Self::UnsupportedToken { .. } => 20002,
            Self::QuoteExpired => 20005,
            Self::NotFound => 20006,
            Self::InsufficientLiquidity { .. } => 20101,
            Self::NoVaultAvailable => 20102,
            Self::TryAgain { .. } => 20201,
            Self::InvalidState { .. } => 20202,
            Self::FundingMismatch { .. } => 20301,
            Self::PluginRejected { code, .. } => *code,
            Self::External(_) => 0,
        }
    }

    /// Domain errors are safe to show to the client; external ones are not.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Self::External(_))
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            Self::AmountTooLow { min, max } | Self::AmountTooHigh { min, max } => {
                Some(json!({ "min": min.to_string(), "max": max.to_string() }))
            }
            Self::InsufficientLiquidity {
                required,
                available,
            } => Some(json!({
                "required": required.to_string(),
                "available": available.to_string(),
            })),
            Self::PluginRejected { data, .. } => data.clone(),
            _ => None,
        }
    }

    pub fn response(&self) -> ErrorResponse {
        if !self.is_domain() {
            tracing::error!(error = ?self, "internal error while handling request");
            return ErrorResponse {
                code: 0,
                msg: "internal server error".to_string(),
                data: None,
            };
        }
        ErrorResponse {
            code: self.code(),
            msg: self.to_string(),
            data: self.data(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub type SwapResult<T> = std::result::Result<T, SwapError>;
