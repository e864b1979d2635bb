//! The closed set of protocol error codes.
//!
//! Errors cross component boundaries as plain messages with
//! `intent = "error"`, never as exceptions. Every envelope carries one of
//! these codes plus a `retryable` flag.

use serde::{Deserialize, Serialize};

/// Wire-level error codes. The set is closed: adapters and nodes must not
/// invent new codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_BAD_MESSAGE")]
    BadMessage,
    #[serde(rename = "E_UNSUPPORTED_PROTOCOL")]
    UnsupportedProtocol,
    #[serde(rename = "E_NO_ROUTE")]
    NoRoute,
    #[serde(rename = "E_REQUIRED_EXTENSION_MISSING")]
    RequiredExtensionMissing,
    #[serde(rename = "E_CONFIRMATION_REQUIRED")]
    ConfirmationRequired,
    #[serde(rename = "E_NODE_UNAVAILABLE")]
    NodeUnavailable,
    #[serde(rename = "E_NODE_TIMEOUT")]
    NodeTimeout,
    #[serde(rename = "E_NODE_ERROR")]
    NodeError,
    #[serde(rename = "E_NODE_REG_INVALID")]
    NodeRegInvalid,
    #[serde(rename = "E_NODE_UNTRUSTED")]
    NodeUntrusted,
    #[serde(rename = "E_NODE_NOT_REGISTERED")]
    NodeNotRegistered,
    #[serde(rename = "E_ADAPTER_NOT_FOUND")]
    AdapterNotFound,
    #[serde(rename = "E_AUTH_REQUIRED")]
    AuthRequired,
    #[serde(rename = "E_AUTH_INVALID")]
    AuthInvalid,
    #[serde(rename = "E_AUTH_FORBIDDEN")]
    AuthForbidden,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// The wire representation of this code.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadMessage => "E_BAD_MESSAGE",
            Self::UnsupportedProtocol => "E_UNSUPPORTED_PROTOCOL",
            Self::NoRoute => "E_NO_ROUTE",
            Self::RequiredExtensionMissing => "E_REQUIRED_EXTENSION_MISSING",
            Self::ConfirmationRequired => "E_CONFIRMATION_REQUIRED",
            Self::NodeUnavailable => "E_NODE_UNAVAILABLE",
            Self::NodeTimeout => "E_NODE_TIMEOUT",
            Self::NodeError => "E_NODE_ERROR",
            Self::NodeRegInvalid => "E_NODE_REG_INVALID",
            Self::NodeUntrusted => "E_NODE_UNTRUSTED",
            Self::NodeNotRegistered => "E_NODE_NOT_REGISTERED",
            Self::AdapterNotFound => "E_ADAPTER_NOT_FOUND",
            Self::AuthRequired => "E_AUTH_REQUIRED",
            Self::AuthInvalid => "E_AUTH_INVALID",
            Self::AuthForbidden => "E_AUTH_FORBIDDEN",
            Self::Internal => "E_INTERNAL",
        }
    }

    /// Parse a wire code back into the enum.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "E_BAD_MESSAGE" => Some(Self::BadMessage),
            "E_UNSUPPORTED_PROTOCOL" => Some(Self::UnsupportedProtocol),
            "E_NO_ROUTE" => Some(Self::NoRoute),
            "E_REQUIRED_EXTENSION_MISSING" => Some(Self::RequiredExtensionMissing),
            "E_CONFIRMATION_REQUIRED" => Some(Self::ConfirmationRequired),
            "E_NODE_UNAVAILABLE" => Some(Self::NodeUnavailable),
            "E_NODE_TIMEOUT" => Some(Self::NodeTimeout),
            "E_NODE_ERROR" => Some(Self::NodeError),
            "E_NODE_REG_INVALID" => Some(Self::NodeRegInvalid),
            "E_NODE_UNTRUSTED" => Some(Self::NodeUntrusted),
            "E_NODE_NOT_REGISTERED" => Some(Self::NodeNotRegistered),
            "E_ADAPTER_NOT_FOUND" => Some(Self::AdapterNotFound),
            "E_AUTH_REQUIRED" => Some(Self::AuthRequired),
            "E_AUTH_INVALID" => Some(Self::AuthInvalid),
            "E_AUTH_FORBIDDEN" => Some(Self::AuthForbidden),
            "E_INTERNAL" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
