use serde::{Deserialize, Serialize};

use crate::jobs::Provider;

pub const PROMPT_MIN_CHARS: usize = 3;
pub const PROMPT_MAX_CHARS: usize = 1000;

/// Structured rejection returned before any dispatch happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRejection {
    pub message: String,
    pub status: u16,
}

impl RequestRejection {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: 400,
        }
    }
}

/// Wire body of `POST /api/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateImageRequest {
    pub prompt: String,
    pub model: String,
}

/// Wire body of `POST /api/edit`. `imageUrls` accepts durable data URLs as
/// well as plain network addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct EditImageRequest {
    pub prompt: String,
    #[serde(rename = "imageUrls")]
    pub image_urls: Vec<String>,
    pub provider: String,
}

pub fn validate_generate_request(
    request: &GenerateImageRequest,
) -> Result<Provider, RequestRejection> {
    validate_prompt(&request.prompt)?;
    Provider::parse(&request.model).ok_or_else(|| {
        RequestRejection::bad_request(format!("Unsupported model: {}", request.model.trim()))
    })
}

pub fn validate_edit_request(request: &EditImageRequest) -> Result<Provider, RequestRejection> {
    validate_prompt(&request.prompt)?;
    if request.image_urls.is_empty() {
        return Err(RequestRejection::bad_request(
            "At least one image is required for editing",
        ));
    }
    if request
        .image_urls
        .iter()
        .any(|url| url.trim().is_empty())
    {
        return Err(RequestRejection::bad_request(
            "Image references must be non-empty strings",
        ));
    }
    Provider::parse(&request.provider).ok_or_else(|| {
        RequestRejection::bad_request(format!(
            "Unsupported provider: {}",
            request.provider.trim()
        ))
    })
}

fn validate_prompt(prompt: &str) -> Result<(), RequestRejection> {
    let chars = prompt.trim().chars().count();
    if chars < PROMPT_MIN_CHARS || chars > PROMPT_MAX_CHARS {
        return Err(RequestRejection::bad_request(format!(
            "Prompt must be between {PROMPT_MIN_CHARS} and {PROMPT_MAX_CHARS} characters"
        )));
    }
    Ok(())
}
