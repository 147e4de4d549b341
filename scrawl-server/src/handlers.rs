//! HTTP request handlers for API endpoints

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use scrawl::image_input::ImageInputError;
use scrawl::PredictError;
use tracing::{error, info, warn};

use crate::types::{ErrorResponse, HealthResponse, IndexResponse, PredictRequest, PredictResponse};
use crate::AppState;

pub const NO_IMAGE_MESSAGE: &str = "No valid image provided";
pub const EMPTY_IMAGE_MESSAGE: &str = "Empty image data";
pub const INVALID_IMAGE_MESSAGE: &str = "Invalid image data";
pub const TOO_LARGE_MESSAGE: &str = "Image data too large";

/// Name of the multipart form field holding the image file.
const IMAGE_FIELD: &str = "image";

/// Failure of a `POST /predict` request.
#[derive(Debug)]
pub enum ApiError {
    /// The request has no image in a supported form.
    NoImage,
    /// The image payload is empty.
    EmptyImage,
    /// The payload could not be decoded as an image.
    InvalidImage,
    /// The body exceeds the configured size limit.
    TooLarge,
    /// Recognition failed after the image was decoded.
    Internal(String),
}

impl ApiError {
    /// Map the status of an axum extractor rejection.
    fn from_rejection_status(status: StatusCode) -> ApiError {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::TooLarge
        } else {
            ApiError::InvalidImage
        }
    }
}

impl From<PredictError> for ApiError {
    fn from(err: PredictError) -> ApiError {
        match err {
            PredictError::Input(ImageInputError::Empty) => ApiError::EmptyImage,
            err if err.is_client_error() => ApiError::InvalidImage,
            err => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NoImage => (StatusCode::BAD_REQUEST, NO_IMAGE_MESSAGE.to_string()),
            ApiError::EmptyImage => (StatusCode::BAD_REQUEST, EMPTY_IMAGE_MESSAGE.to_string()),
            ApiError::InvalidImage => (StatusCode::BAD_REQUEST, INVALID_IMAGE_MESSAGE.to_string()),
            ApiError::TooLarge => (StatusCode::PAYLOAD_TOO_LARGE, TOO_LARGE_MESSAGE.to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (
            status,
            Json(ErrorResponse {
                success: false,
                error: message,
            }),
        )
            .into_response()
    }
}

/// Image extracted from a prediction request.
enum ImagePayload {
    /// Encoded image file.
    Bytes(Bytes),
    /// Base64-encoded image file.
    Base64(String),
}

/// Return the media type of a request, lower-cased and without parameters.
fn media_type(request: &Request) -> Option<String> {
    let value = request.headers().get(CONTENT_TYPE)?.to_str().ok()?;
    let media_type = value.split(';').next().unwrap_or_default().trim();
    Some(media_type.to_ascii_lowercase())
}

/// Extract the image from a request according to its content type.
async fn extract_image(request: Request, state: &AppState) -> Result<ImagePayload, ApiError> {
    let Some(media_type) = media_type(&request) else {
        return Err(ApiError::NoImage);
    };

    if media_type.starts_with("image/") {
        let bytes = Bytes::from_request(request, state)
            .await
            .map_err(|rejection| ApiError::from_rejection_status(rejection.status()))?;
        return Ok(ImagePayload::Bytes(bytes));
    }

    match media_type.as_str() {
        "multipart/form-data" => {
            let mut multipart = Multipart::from_request(request, state)
                .await
                .map_err(|rejection| ApiError::from_rejection_status(rejection.status()))?;
            while let Some(field) = multipart
                .next_field()
                .await
                .map_err(|err| ApiError::from_rejection_status(err.status()))?
            {
                if field.name() != Some(IMAGE_FIELD) {
                    continue;
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::from_rejection_status(err.status()))?;
                return Ok(ImagePayload::Bytes(bytes));
            }
            Err(ApiError::NoImage)
        }
        "application/json" => {
            let Json(body) = Json::<PredictRequest>::from_request(request, state)
                .await
                .map_err(|rejection| ApiError::from_rejection_status(rejection.status()))?;
            body.image_base64
                .map(ImagePayload::Base64)
                .ok_or(ApiError::NoImage)
        }
        _ => Err(ApiError::NoImage),
    }
}

/// Recognize the handwritten text in an uploaded image.
///
/// The image may be sent as the raw body with an `image/*` content type, as
/// the `image` field of a multipart form or as the `image_base64` key of a
/// JSON object.
pub async fn predict(State(state): State<AppState>, request: Request) -> Response {
    match run_predict(state, request).await {
        Ok(prediction) => Json(PredictResponse {
            success: true,
            prediction,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn run_predict(state: AppState, request: Request) -> Result<String, ApiError> {
    let payload = extract_image(request, &state).await.inspect_err(|err| {
        warn!(?err, "rejected prediction request");
    })?;

    let is_empty = match &payload {
        ImagePayload::Bytes(bytes) => bytes.is_empty(),
        ImagePayload::Base64(text) => text.trim().is_empty(),
    };
    if is_empty {
        warn!("rejected prediction request with empty image");
        return Err(ApiError::EmptyImage);
    }

    let start = Instant::now();
    let engine = state.engine.clone();
    let result = tokio::task::spawn_blocking(move || match payload {
        ImagePayload::Bytes(bytes) => engine.predict_bytes(&bytes),
        ImagePayload::Base64(text) => engine.predict_base64(&text),
    })
    .await
    .map_err(|err| {
        error!(%err, "prediction task failed");
        ApiError::Internal(err.to_string())
    })?;

    match result {
        Ok(recognition) => {
            info!(
                chars = recognition.labels.len(),
                elapsed_ms = start.elapsed().as_secs_f64() * 1000.,
                "prediction complete"
            );
            Ok(recognition.text)
        }
        Err(err) if err.is_client_error() => {
            warn!(%err, "invalid image in prediction request");
            Err(err.into())
        }
        Err(err) => {
            error!(%err, "prediction failed");
            Err(err.into())
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// Describe the available endpoints
pub async fn index() -> Json<IndexResponse> {
    let endpoints = [
        ("POST /predict", "Upload image for prediction"),
        ("GET /health", "Health check"),
        ("GET /", "This message"),
    ]
    .into_iter()
    .map(|(route, description)| (route.to_string(), description.to_string()))
    .collect();

    Json(IndexResponse {
        message: "Image Prediction API".to_string(),
        endpoints,
    })
}
