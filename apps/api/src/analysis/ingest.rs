use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use thiserror::Error;

pub const ACCEPTED_MIME_TYPES: [&str; 2] = ["image/png", "image/jpeg"];

/// Upload limits applied before anything leaves the process.
#[derive(Debug, Clone)]
pub struct IngestLimits {
    pub max_bytes: usize,
    pub accepted_mime_types: Vec<String>,
}

impl IngestLimits {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            accepted_mime_types: ACCEPTED_MIME_TYPES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("No image file was provided")]
    Missing,

    #[error("The uploaded file is empty")]
    Empty,

    #[error("Unsupported file type '{0}'; upload a PNG or JPEG image")]
    UnsupportedType(String),

    #[error("Image is {size} bytes; the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// An accepted upload, already encoded for the vision API.
/// The raw bytes are not kept.
#[derive(Debug, Clone, Serialize)]
pub struct IngestedImage {
    pub file_name: String,
    pub mime_type: String,
    #[serde(skip)]
    pub data_base64: String,
    pub preview_data_uri: String,
    pub size_bytes: usize,
}

/// Validates type and size, then base64-encodes the image and builds its
/// data-URI preview.
pub fn ingest(
    file_name: &str,
    mime_type: &str,
    bytes: &[u8],
    limits: &IngestLimits,
) -> Result<IngestedImage, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Empty);
    }

    let mime_type = normalize_mime(mime_type);
    if !limits
        .accepted_mime_types
        .iter()
        .any(|accepted| accepted.eq_ignore_ascii_case(&mime_type))
    {
        return Err(IngestError::UnsupportedType(mime_type));
    }

    if bytes.len() > limits.max_bytes {
        return Err(IngestError::TooLarge {
            size: bytes.len(),
            limit: limits.max_bytes,
        });
    }

    let data_base64 = STANDARD.encode(bytes);
    let preview_data_uri = format!("data:{mime_type};base64,{data_base64}");

    Ok(IngestedImage {
        file_name: file_name.to_string(),
        mime_type,
        data_base64,
        preview_data_uri,
        size_bytes: bytes.len(),
    })
}

/// Drops parameters (`; charset=...`) and lowercases the essence.
fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}
