// src/utils/errors.rs

use reqwest;
use serde_json;
use std::{error::Error, fmt};

/// Errors coming from external API calls (HTTP, JSON, gateway, etc).
#[derive(Debug)]
pub enum ApiError {
    Http(reqwest::Error),
    Json(serde_json::Error),
    Gateway(String),
    Other(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Http(e) => write!(f, "HTTP error: {}", e),
            ApiError::Json(e) => write!(f, "JSON error: {}", e),
            ApiError::Gateway(msg) => write!(f, "Gateway error: {}", msg),
            ApiError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Http(e) => Some(e),
            ApiError::Json(e) => Some(e),
            ApiError::Gateway(_) => None,
            ApiError::Other(_) => None,
        }
    }
}

// Conversions from underlying errors into ApiError
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Json(err)
    }
}

/// Errors at the scan-cycle level: wraps ApiError plus data-quality issues.
/// The loop picks reconnect vs skip-cycle off the variant.
#[derive(Debug)]
pub enum ScanError {
    Api(ApiError),
    Disconnected(String),
    NoMarketData(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Api(e)          => write!(f, "{e}"),
            ScanError::Disconnected(m) => write!(f, "Gateway disconnected: {m}"),
            ScanError::NoMarketData(m) => write!(f, "No market data: {m}"),
        }
    }
}

impl Error for ScanError {}

/// Allow `?` to lift any `ApiError` into the scan layer
impl From<ApiError> for ScanError {
    fn from(e: ApiError) -> Self { ScanError::Api(e) }
}
