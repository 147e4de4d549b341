//! API request and response types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// JSON body accepted by `POST /predict`.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    /// Base64-encoded image file. May start with a `data:` URL header.
    pub image_base64: Option<String>,
}

/// Successful prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub success: bool,
    pub prediction: String,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Service description returned by `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResponse {
    pub message: String,
    /// Route => description
    pub endpoints: BTreeMap<String, String>,
}
