use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::events::EventWriter;
use easel_contracts::jobs::{Job, JobStore, Provider};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

const DEFAULT_OPENAI_IMAGE_MODEL: &str = "gpt-image-1";
const DEFAULT_GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
const DEFAULT_OPENAI_SIZE: &str = "1024x1024";
const FALLBACK_MEDIA_TYPE: &str = "image/png";

/// Prompt substituted for the typed text in scene-composite mode.
const SCENE_COMPOSITE_PROMPT: &str = "Blend the subjects of the attached photo into a single \
cohesive, photorealistic scene with natural lighting and consistent perspective.";

// ---------------------------------------------------------------------------
// Durable image encoding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub media_type: Option<String>,
}

/// Encode raw bytes as a self-describing `data:` URL, directly usable as a
/// display source without any further fetch.
pub fn encode_data_url(bytes: &[u8], media_type: &str) -> String {
    format!("data:{media_type};base64,{}", BASE64.encode(bytes))
}

/// Exact inverse of [`encode_data_url`]. An empty media-type declaration
/// decodes as `image/png`.
pub fn decode_data_url(value: &str) -> Result<(Vec<u8>, String)> {
    let rest = value
        .strip_prefix("data:")
        .context("not a data URL (missing 'data:' prefix)")?;
    let (header, payload) = rest
        .split_once(',')
        .context("not a data URL (missing ',' separator)")?;
    let media_type = header
        .strip_suffix(";base64")
        .context("unsupported data URL (expected base64 payload)")?;
    let media_type = if media_type.is_empty() {
        FALLBACK_MEDIA_TYPE.to_string()
    } else {
        media_type.to_string()
    };
    let bytes = BASE64
        .decode(payload.as_bytes())
        .context("data URL base64 decode failed")?;
    Ok((bytes, media_type))
}

pub fn is_data_url(value: &str) -> bool {
    value.starts_with("data:")
}

/// Resolve one image reference to raw bytes. Data URLs are decoded locally;
/// anything else is treated as a network address and downloaded.
pub fn fetch_image_bytes(http: &HttpClient, reference: &str) -> Result<ImageBytes> {
    if is_data_url(reference) {
        let (bytes, media_type) = decode_data_url(reference)?;
        return Ok(ImageBytes {
            bytes,
            media_type: Some(media_type),
        });
    }

    let response = http
        .get(reference)
        .send()
        .with_context(|| format!("failed downloading image ({reference})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let media_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .context("failed reading image bytes")?
        .to_vec();
    Ok(ImageBytes { bytes, media_type })
}

// ---------------------------------------------------------------------------
// Provider dispatch layer
// ---------------------------------------------------------------------------

/// Normalized outcome of one provider call: a durable data URL plus the pixel
/// dimensions probed from the returned bytes (0x0 when the probe fails).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub image_url: String,
    pub width: u32,
    pub height: u32,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, prompt: &str) -> Result<ImageResult>;
    fn edit(&self, prompt: &str, image_urls: &[String]) -> Result<ImageResult>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry() -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(OpenAiProvider::new());
    providers.register(GeminiProvider::new());
    providers
}

/// Dispatch a generation request to the handler registered for `provider`.
pub fn generate_image(
    registry: &ImageProviderRegistry,
    prompt: &str,
    provider: Provider,
) -> Result<ImageResult> {
    let Some(handler) = registry.get(provider.as_str()) else {
        bail!("Unsupported provider: {provider}");
    };
    handler.generate(prompt)
}

/// Dispatch an edit request. Zero input images is an error here regardless of
/// what the caller validated.
pub fn edit_image(
    registry: &ImageProviderRegistry,
    prompt: &str,
    image_urls: &[String],
    provider: Provider,
) -> Result<ImageResult> {
    if image_urls.is_empty() {
        bail!("At least one image is required for editing");
    }
    let Some(handler) = registry.get(provider.as_str()) else {
        bail!("Unsupported provider: {provider}");
    };
    handler.edit(prompt, image_urls)
}

fn image_result_from_bytes(item: ImageBytes) -> ImageResult {
    let (width, height) = image::load_from_memory(&item.bytes)
        .map(|decoded| (decoded.width(), decoded.height()))
        .unwrap_or((0, 0));
    let media_type = item
        .media_type
        .as_deref()
        .filter(|value| !value.is_empty())
        .unwrap_or(FALLBACK_MEDIA_TYPE);
    ImageResult {
        image_url: encode_data_url(&item.bytes, media_type),
        width,
        height,
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

enum ImageSource {
    Inline(ImageBytes),
    Remote(String),
}

pub struct OpenAiProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: non_empty_env("OPENAI_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_IMAGE_MODEL.to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String> {
        non_empty_env("OPENAI_API_KEY").context("OPENAI_API_KEY not set")
    }

    fn first_image(&self, response_payload: &Value, action: &str) -> Result<ImageBytes> {
        for source in extract_openai_sources(response_payload)? {
            match source {
                ImageSource::Inline(item) => return Ok(item),
                ImageSource::Remote(url) => return fetch_image_bytes(&self.http, &url),
            }
        }
        bail!("OpenAI {action} returned no image");
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, prompt: &str) -> Result<ImageResult> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "size": DEFAULT_OPENAI_SIZE,
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("OpenAI", response)?;
        let item = self.first_image(&response_payload, "generation")?;
        Ok(image_result_from_bytes(item))
    }

    fn edit(&self, prompt: &str, image_urls: &[String]) -> Result<ImageResult> {
        if image_urls.is_empty() {
            bail!("OpenAI image edits require at least one input image");
        }
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/images/edits", self.api_base);
        let mut form = MultipartForm::new()
            .text("model", self.model.clone())
            .text("prompt", prompt.to_string())
            .text("n", "1")
            .text("size", DEFAULT_OPENAI_SIZE);

        for (idx, reference) in image_urls.iter().enumerate() {
            let item = fetch_image_bytes(&self.http, reference)?;
            let media_type = item
                .media_type
                .clone()
                .unwrap_or_else(|| FALLBACK_MEDIA_TYPE.to_string());
            let file_name = format!("image-{idx}.{}", extension_for_media_type(&media_type));
            let part = MultipartPart::bytes(item.bytes)
                .file_name(file_name)
                .mime_str(&media_type)
                .with_context(|| format!("invalid media type '{media_type}'"))?;
            form = form.part("image[]", part);
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("OpenAI edits request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("OpenAI edits", response)?;
        let item = self.first_image(&response_payload, "edit")?;
        Ok(image_result_from_bytes(item))
    }
}

fn extract_openai_sources(response_payload: &Value) -> Result<Vec<ImageSource>> {
    let rows = response_payload
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();

    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };

        if let Some(b64) = obj.get("b64_json").and_then(Value::as_str) {
            let bytes = BASE64
                .decode(b64.as_bytes())
                .context("OpenAI image base64 decode failed")?;
            out.push(ImageSource::Inline(ImageBytes {
                bytes,
                media_type: None,
            }));
            continue;
        }

        if let Some(url) = obj.get("url").and_then(Value::as_str) {
            out.push(ImageSource::Remote(url.to_string()));
        }
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------------

pub struct GeminiProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: non_empty_env("GEMINI_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_IMAGE_MODEL.to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Result<String> {
        non_empty_env("GEMINI_API_KEY")
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .context("GEMINI_API_KEY or GOOGLE_API_KEY not set")
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Generation and editing share the multi-modal chat endpoint; edits
    /// carry the input encodings as inline parts ahead of the text prompt.
    fn generate_content(&self, prompt: &str, image_urls: &[String]) -> Result<ImageResult> {
        let api_key = Self::api_key()?;
        let endpoint = self.endpoint();

        let mut parts = Vec::new();
        for reference in image_urls {
            let item = fetch_image_bytes(&self.http, reference)?;
            let media_type = item
                .media_type
                .clone()
                .unwrap_or_else(|| FALLBACK_MEDIA_TYPE.to_string());
            parts.push(json!({
                "inline_data": {
                    "mime_type": media_type,
                    "data": BASE64.encode(&item.bytes),
                }
            }));
        }
        parts.push(json!({ "text": prompt }));

        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        let Some(item) = extract_gemini_items(&response_payload)?.into_iter().next() else {
            bail!("Gemini returned no image");
        };
        Ok(image_result_from_bytes(item))
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, prompt: &str) -> Result<ImageResult> {
        self.generate_content(prompt, &[])
    }

    fn edit(&self, prompt: &str, image_urls: &[String]) -> Result<ImageResult> {
        if image_urls.is_empty() {
            bail!("Gemini image edits require at least one input image");
        }
        self.generate_content(prompt, image_urls)
    }
}

fn extract_gemini_items(response_payload: &Value) -> Result<Vec<ImageBytes>> {
    let candidates = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut out = Vec::new();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("Gemini image base64 decode failed")?;
            let media_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            out.push(ImageBytes { bytes, media_type });
        }
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// A short-lived reference to an editing input: a local file path within the
/// current session, or an already-durable data URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub reference: String,
    pub media_type: String,
}

impl Attachment {
    pub fn new(reference: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            media_type: media_type.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/") || is_data_url(&self.reference)
    }
}

/// Read an attachment's transient reference and produce a durable data URL.
pub fn encode_attachment(attachment: &Attachment) -> Result<String> {
    if is_data_url(&attachment.reference) {
        return Ok(attachment.reference.clone());
    }
    let bytes = fs::read(&attachment.reference)
        .with_context(|| format!("failed reading {}", attachment.reference))?;
    Ok(encode_data_url(&bytes, &attachment.media_type))
}

/// Best-effort conversion of every image attachment to its durable form.
/// A failed conversion falls back to the original transient reference and
/// never aborts the submission.
pub fn normalize_attachments(attachments: &[Attachment]) -> Vec<String> {
    attachments
        .iter()
        .map(|attachment| {
            if !attachment.is_image() {
                return attachment.reference.clone();
            }
            encode_attachment(attachment).unwrap_or_else(|_| attachment.reference.clone())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Job lifecycle controller
// ---------------------------------------------------------------------------

/// Which submissions the studio accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmissionMode {
    /// Prompt text or attachments; at least one required.
    #[default]
    FreePrompt,
    /// Exactly one photo required; the typed prompt is ignored in favor of a
    /// fixed scene-composition prompt.
    SceneComposite,
}

/// Owns the session's job collection, inserts a pending placeholder before
/// any network call, and reconciles it by id when the call settles.
pub struct Studio {
    jobs: Arc<Mutex<JobStore>>,
    providers: Arc<ImageProviderRegistry>,
    events: EventWriter,
    mode: SubmissionMode,
    in_flight: Arc<AtomicUsize>,
}

impl Studio {
    pub fn new(session_dir: impl Into<PathBuf>, mode: SubmissionMode) -> Result<Self> {
        Self::with_providers(session_dir, mode, default_provider_registry())
    }

    pub fn with_providers(
        session_dir: impl Into<PathBuf>,
        mode: SubmissionMode,
        providers: ImageProviderRegistry,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)?;
        let session_id = session_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("session")
            .to_string();
        let events = EventWriter::new(session_dir.join("events.jsonl"), session_id);
        events.session_started(&session_dir)?;

        Ok(Self {
            jobs: Arc::new(Mutex::new(JobStore::new())),
            providers: Arc::new(providers),
            events,
            mode,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn mode(&self) -> SubmissionMode {
        self.mode
    }

    /// Count of submissions whose provider call has not settled. Advisory
    /// only; it never blocks further submissions.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Newest-first snapshot of the job collection.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .map(|store| store.jobs().to_vec())
            .unwrap_or_default()
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .ok()
            .and_then(|store| store.get(id).cloned())
    }

    /// Submit one generation/edit job. Returns the new job id, or `None`
    /// when the submission violates the active mode (silent no-op: no job,
    /// no network call).
    pub fn submit(
        &self,
        prompt: &str,
        attachments: &[Attachment],
        provider: Provider,
    ) -> Option<String> {
        let prompt = match self.mode {
            SubmissionMode::FreePrompt => {
                if prompt.trim().is_empty() && attachments.is_empty() {
                    return None;
                }
                prompt.trim().to_string()
            }
            SubmissionMode::SceneComposite => {
                if attachments.len() != 1 {
                    return None;
                }
                SCENE_COMPOSITE_PROMPT.to_string()
            }
        };

        // Optimistic insert: the pending entry is visible before any I/O.
        let job = Job::new(prompt.clone(), provider, normalize_attachments(attachments));
        let job_id = job.id.clone();
        let is_edit = job.is_edit;
        if let Ok(mut store) = self.jobs.lock() {
            store.insert(job);
        }
        let _ = self.events.job_submitted(&job_id, provider, is_edit);

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let jobs = Arc::clone(&self.jobs);
        let providers = Arc::clone(&self.providers);
        let events = self.events.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let attachments = attachments.to_vec();
        let thread_job_id = job_id.clone();

        thread::spawn(move || {
            let outcome = settle_submission(&providers, &prompt, &attachments, provider, is_edit);
            match outcome {
                Ok(result) => {
                    let (width, height) = (result.width, result.height);
                    if let Ok(mut store) = jobs.lock() {
                        store.resolve(&thread_job_id, result.image_url);
                    }
                    let _ = events.job_succeeded(&thread_job_id, width, height);
                }
                Err(err) => {
                    let message = error_text(&err);
                    if let Ok(mut store) = jobs.lock() {
                        store.fail(&thread_job_id, &message);
                    }
                    let _ = events.job_failed(&thread_job_id, &message);
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        Some(job_id)
    }

    /// Poll until every in-flight submission settled or the deadline passed.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

fn settle_submission(
    providers: &ImageProviderRegistry,
    prompt: &str,
    attachments: &[Attachment],
    provider: Provider,
    is_edit: bool,
) -> Result<ImageResult> {
    if !is_edit {
        return generate_image(providers, prompt, provider);
    }

    // The edit handler gets its own freshly encoded copies, independent of
    // the display copies stored on the job.
    let image_attachments: Vec<&Attachment> = attachments
        .iter()
        .filter(|attachment| attachment.is_image())
        .collect();
    if image_attachments.is_empty() {
        bail!("No image files found in attachments");
    }
    let mut encodings = Vec::with_capacity(image_attachments.len());
    for attachment in image_attachments {
        encodings.push(encode_attachment(attachment)?);
    }
    edit_image(providers, prompt, &encodings, provider)
}

/// Human-readable message for a failed job: the error's own chain, or a
/// generic fallback if it is somehow empty.
fn error_text(err: &anyhow::Error) -> String {
    let text = format!("{err:#}");
    if text.trim().is_empty() {
        "Failed to generate image".to_string()
    } else {
        text
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON"))
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    use easel_contracts::jobs::Provider;
    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([120, 40, 200]);
        }
        let mut out = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut out),
            image::ImageFormat::Png,
        )
        .expect("png encode");
        out
    }

    #[test]
    fn data_url_round_trip_is_exact() -> Result<()> {
        let bytes = png_bytes(2, 2);
        let encoded = encode_data_url(&bytes, "image/png");
        assert!(encoded.starts_with("data:image/png;base64,"));

        let (decoded, media_type) = decode_data_url(&encoded)?;
        assert_eq!(decoded, bytes);
        assert_eq!(media_type, "image/png");
        Ok(())
    }

    #[test]
    fn decode_rejects_non_data_urls() {
        assert!(decode_data_url("https://example.com/a.png").is_err());
        assert!(decode_data_url("data:image/png;base64").is_err());
        assert!(decode_data_url("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn decode_defaults_media_type_to_png() -> Result<()> {
        let encoded = format!("data:;base64,{}", BASE64.encode(b"abc"));
        let (bytes, media_type) = decode_data_url(&encoded)?;
        assert_eq!(bytes, b"abc");
        assert_eq!(media_type, "image/png");
        Ok(())
    }

    #[test]
    fn image_result_probes_dimensions() {
        let result = image_result_from_bytes(ImageBytes {
            bytes: png_bytes(3, 5),
            media_type: Some("image/png".to_string()),
        });
        assert_eq!((result.width, result.height), (3, 5));
        assert!(result.image_url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn image_result_tolerates_unprobeable_bytes() {
        let result = image_result_from_bytes(ImageBytes {
            bytes: b"not an image".to_vec(),
            media_type: None,
        });
        assert_eq!((result.width, result.height), (0, 0));
        assert!(result.image_url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn openai_extraction_prefers_inline_payload() -> Result<()> {
        let payload = json!({
            "created": 1,
            "data": [
                { "b64_json": BASE64.encode(b"first") },
                { "url": "https://example.com/second.png" },
            ],
        });
        let sources = extract_openai_sources(&payload)?;
        assert_eq!(sources.len(), 2);
        match &sources[0] {
            ImageSource::Inline(item) => assert_eq!(item.bytes, b"first"),
            ImageSource::Remote(_) => panic!("expected inline payload first"),
        }
        Ok(())
    }

    #[test]
    fn openai_extraction_handles_empty_data() -> Result<()> {
        let sources = extract_openai_sources(&json!({ "created": 1, "data": [] }))?;
        assert!(sources.is_empty());
        Ok(())
    }

    #[test]
    fn gemini_extraction_reads_inline_data_variants() -> Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here you go" },
                        { "inlineData": { "mimeType": "image/webp", "data": BASE64.encode(b"img") } },
                    ],
                },
            }],
        });
        let items = extract_gemini_items(&payload)?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].bytes, b"img");
        assert_eq!(items[0].media_type.as_deref(), Some("image/webp"));

        let snake = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "inline_data": { "mime_type": "image/png", "data": BASE64.encode(b"img2") } },
                    ],
                },
            }],
        });
        let items = extract_gemini_items(&snake)?;
        assert_eq!(items[0].media_type.as_deref(), Some("image/png"));
        Ok(())
    }

    #[test]
    fn dispatch_rejects_unknown_provider() {
        let registry = ImageProviderRegistry::new();
        let err = generate_image(&registry, "a boat", Provider::Openai).unwrap_err();
        assert!(err.to_string().contains("Unsupported provider: openai"));
    }

    #[test]
    fn edit_dispatch_rejects_empty_image_list() {
        let mut registry = ImageProviderRegistry::new();
        registry.register(EchoProvider::new("openai"));
        let err = edit_image(&registry, "a boat", &[], Provider::Openai).unwrap_err();
        assert!(err.to_string().contains("At least one image"));
    }

    #[test]
    fn normalize_converts_image_files_and_falls_back() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("photo.png");
        let bytes = png_bytes(2, 2);
        fs::write(&path, &bytes)?;

        let attachments = vec![
            Attachment::new(path.to_string_lossy().to_string(), "image/png"),
            Attachment::new("/nonexistent/gone.png", "image/png"),
            Attachment::new("notes.txt", "text/plain"),
        ];
        let normalized = normalize_attachments(&attachments);

        assert_eq!(normalized[0], encode_data_url(&bytes, "image/png"));
        // Failed conversion keeps the transient reference.
        assert_eq!(normalized[1], "/nonexistent/gone.png");
        // Non-image attachments pass through untouched.
        assert_eq!(normalized[2], "notes.txt");
        Ok(())
    }

    #[test]
    fn normalize_passes_durable_encodings_through() {
        let durable = encode_data_url(b"abc", "image/png");
        let normalized = normalize_attachments(&[Attachment::new(durable.clone(), "image/png")]);
        assert_eq!(normalized, vec![durable]);
    }

    // Test provider that records prompts and answers immediately.
    struct EchoProvider {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl EchoProvider {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_log(name: &'static str, calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self { name, calls }
        }
    }

    impl ImageProvider for EchoProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn generate(&self, prompt: &str) -> Result<ImageResult> {
            self.calls.lock().unwrap().push(format!("generate:{prompt}"));
            Ok(ImageResult {
                image_url: encode_data_url(prompt.as_bytes(), "image/png"),
                width: 1,
                height: 1,
            })
        }

        fn edit(&self, prompt: &str, image_urls: &[String]) -> Result<ImageResult> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("edit:{prompt}:{}", image_urls.len()));
            Ok(ImageResult {
                image_url: encode_data_url(prompt.as_bytes(), "image/png"),
                width: 1,
                height: 1,
            })
        }
    }

    // Test provider that blocks until released, to hold jobs in Pending.
    struct GatedProvider {
        name: &'static str,
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl GatedProvider {
        fn new(name: &'static str) -> (Self, Sender<()>) {
            let (tx, rx) = channel();
            (
                Self {
                    name,
                    gate: Mutex::new(rx),
                },
                tx,
            )
        }
    }

    impl ImageProvider for GatedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn generate(&self, prompt: &str) -> Result<ImageResult> {
            self.gate
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .context("gate never released")?;
            Ok(ImageResult {
                image_url: encode_data_url(prompt.as_bytes(), "image/png"),
                width: 1,
                height: 1,
            })
        }

        fn edit(&self, prompt: &str, _image_urls: &[String]) -> Result<ImageResult> {
            self.generate(prompt)
        }
    }

    struct FailingProvider {
        name: &'static str,
    }

    impl ImageProvider for FailingProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn generate(&self, _prompt: &str) -> Result<ImageResult> {
            bail!("provider exploded")
        }

        fn edit(&self, _prompt: &str, _image_urls: &[String]) -> Result<ImageResult> {
            bail!("provider exploded")
        }
    }

    fn studio_with(registry: ImageProviderRegistry) -> (Studio, tempfile::TempDir) {
        let temp = tempfile::tempdir().expect("tempdir");
        let studio = Studio::with_providers(
            temp.path().join("session"),
            SubmissionMode::FreePrompt,
            registry,
        )
        .expect("studio");
        (studio, temp)
    }

    #[test]
    fn submit_inserts_pending_job_before_settlement() {
        let (gated, release) = GatedProvider::new("openai");
        let mut registry = ImageProviderRegistry::new();
        registry.register(gated);
        let (studio, _temp) = studio_with(registry);

        let id = studio.submit("a quiet harbor", &[], Provider::Openai).unwrap();

        // The placeholder is observable while the provider call is blocked.
        let jobs = studio.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert!(jobs[0].state.is_pending());

        release.send(()).unwrap();
        assert!(studio.wait_settled(Duration::from_secs(5)));
        let job = studio.job(&id).unwrap();
        assert!(job.image_url().is_some());
        assert_eq!(job.error(), None);
    }

    #[test]
    fn provider_hint_routes_to_that_provider_only() {
        let openai_calls = Arc::new(Mutex::new(Vec::new()));
        let gemini_calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ImageProviderRegistry::new();
        registry.register(EchoProvider::with_log("openai", Arc::clone(&openai_calls)));
        registry.register(EchoProvider::with_log("gemini", Arc::clone(&gemini_calls)));
        let (studio, _temp) = studio_with(registry);

        studio.submit("a valid prompt", &[], Provider::Openai).unwrap();
        assert!(studio.wait_settled(Duration::from_secs(5)));

        assert_eq!(openai_calls.lock().unwrap().len(), 1);
        assert!(gemini_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_submission_is_a_silent_no_op() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ImageProviderRegistry::new();
        registry.register(EchoProvider::with_log("openai", Arc::clone(&calls)));
        let (studio, _temp) = studio_with(registry);

        assert_eq!(studio.submit("   ", &[], Provider::Openai), None);
        assert!(studio.jobs().is_empty());
        assert_eq!(studio.in_flight(), 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn scene_composite_requires_exactly_one_photo() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let photo = temp.path().join("photo.png");
        fs::write(&photo, png_bytes(2, 2))?;
        let attachment = Attachment::new(photo.to_string_lossy().to_string(), "image/png");

        let mut registry = ImageProviderRegistry::new();
        registry.register(EchoProvider::new("gemini"));
        let studio = Studio::with_providers(
            temp.path().join("session"),
            SubmissionMode::SceneComposite,
            registry,
        )?;

        assert_eq!(studio.submit("ignored", &[], Provider::Gemini), None);
        assert_eq!(
            studio.submit("ignored", &[attachment.clone(), attachment.clone()], Provider::Gemini),
            None
        );

        let id = studio
            .submit("typed text is ignored", &[attachment], Provider::Gemini)
            .unwrap();
        let job = studio.job(&id).unwrap();
        assert_eq!(job.prompt, SCENE_COMPOSITE_PROMPT);
        assert!(job.is_edit);
        assert!(studio.wait_settled(Duration::from_secs(5)));
        Ok(())
    }

    #[test]
    fn edit_with_no_image_attachments_fails_the_job() {
        let mut registry = ImageProviderRegistry::new();
        registry.register(EchoProvider::new("openai"));
        let (studio, _temp) = studio_with(registry);

        let id = studio
            .submit(
                "make it pop",
                &[Attachment::new("notes.txt", "text/plain")],
                Provider::Openai,
            )
            .unwrap();
        assert!(studio.wait_settled(Duration::from_secs(5)));

        let job = studio.job(&id).unwrap();
        assert_eq!(job.error(), Some("No image files found in attachments"));
        assert_eq!(job.image_url(), None);
    }

    #[test]
    fn failed_provider_call_marks_job_failed_with_message() {
        let mut registry = ImageProviderRegistry::new();
        registry.register(FailingProvider { name: "openai" });
        let (studio, _temp) = studio_with(registry);

        let id = studio.submit("a valid prompt", &[], Provider::Openai).unwrap();
        assert!(studio.wait_settled(Duration::from_secs(5)));

        let job = studio.job(&id).unwrap();
        assert_eq!(job.error(), Some("provider exploded"));
    }

    #[test]
    fn concurrent_submissions_settle_independently() {
        let (gated, release_first) = GatedProvider::new("openai");
        let mut registry = ImageProviderRegistry::new();
        registry.register(gated);
        registry.register(EchoProvider::new("gemini"));
        let (studio, _temp) = studio_with(registry);

        // First submission blocks on the gate; second settles immediately.
        let first = studio.submit("slow harbor", &[], Provider::Openai).unwrap();
        let second = studio.submit("fast meadow", &[], Provider::Gemini).unwrap();

        assert!(wait_for(|| {
            studio
                .job(&second)
                .map(|job| job.state.is_terminal())
                .unwrap_or(false)
        }));
        assert!(studio.job(&first).unwrap().state.is_pending());

        release_first.send(()).unwrap();
        assert!(studio.wait_settled(Duration::from_secs(5)));

        // Each job carries the result of its own input, and insertion order
        // (newest first) is unchanged by settlement order.
        let first_job = studio.job(&first).unwrap();
        let second_job = studio.job(&second).unwrap();
        assert_eq!(
            first_job.image_url(),
            Some(encode_data_url(b"slow harbor", "image/png").as_str())
        );
        assert_eq!(
            second_job.image_url(),
            Some(encode_data_url(b"fast meadow", "image/png").as_str())
        );
        let jobs = studio.jobs();
        assert_eq!(jobs[0].id, second);
        assert_eq!(jobs[1].id, first);
    }

    #[test]
    fn submissions_emit_lifecycle_events() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session_dir = temp.path().join("session");
        let mut registry = ImageProviderRegistry::new();
        registry.register(EchoProvider::new("openai"));
        let studio =
            Studio::with_providers(&session_dir, SubmissionMode::FreePrompt, registry)?;

        studio.submit("a valid prompt", &[], Provider::Openai).unwrap();
        assert!(studio.wait_settled(Duration::from_secs(5)));

        let raw = fs::read_to_string(session_dir.join("events.jsonl"))?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert!(types.contains(&"session_started".to_string()));
        assert!(types.contains(&"job_submitted".to_string()));
        assert!(types.contains(&"job_succeeded".to_string()));
        Ok(())
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}
