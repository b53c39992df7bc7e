#[cfg(feature = "sea-orm")]
use sea_orm::prelude::StringLen;

use serde::{Deserialize, Serialize};

/// Broad class of a payment confirmation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "validation"))]
    Validation,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "network"))]
    Network,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "blockchain"))]
    Blockchain,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "database"))]
    Database,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "business_logic"))]
    BusinessLogic,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "timeout"))]
    Timeout,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "unknown"))]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Blockchain => "blockchain",
            Self::Database => "database",
            Self::BusinessLogic => "business_logic",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment confirmation failure as reported by a verifier.
///
/// `code` is machine-readable (`TX_NOT_FOUND`, `AMOUNT_MISMATCH`, ...);
/// `detail` carries optional structured context such as an upstream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct PaymentError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl PaymentError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, "TIMEOUT", message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "NETWORK_ERROR", message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Database, "DATABASE_ERROR", message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, "UNKNOWN_ERROR", message)
    }
}
