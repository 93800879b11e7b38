use std::io::{self, BufRead, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use clap::{Args, Parser, Subcommand};
use easel_contracts::jobs::{JobState, Provider};
use easel_contracts::validate::{
    validate_edit_request, validate_generate_request, EditImageRequest, GenerateImageRequest,
};
use easel_engine::{
    decode_data_url, default_provider_registry, edit_image, encode_attachment, generate_image,
    is_data_url, Attachment, ImageProviderRegistry, ImageResult, Studio, SubmissionMode,
};
use serde_json::{json, Value};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "easel", about = "AI image generation and editing studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate one image from a text prompt.
    Generate(GenerateArgs),
    /// Edit one or more input images with a text prompt.
    Edit(EditArgs),
    /// Interactive studio session with optimistic job history.
    Chat(ChatArgs),
    /// Serve the HTTP API.
    Serve(ServeArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "openai")]
    model: String,
    /// Write the decoded image here instead of printing the data URL.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct EditArgs {
    #[arg(long)]
    prompt: String,
    /// Input image: a local file path, a data URL, or a network URL.
    /// Repeatable.
    #[arg(long = "image", required = true)]
    images: Vec<String>,
    #[arg(long, default_value = "openai")]
    provider: String,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct ChatArgs {
    #[arg(long)]
    session_dir: Option<PathBuf>,
    #[arg(long, default_value = "openai")]
    provider: String,
    /// Require exactly one photo per submission and use the fixed
    /// scene-composition prompt instead of typed text.
    #[arg(long)]
    scene_composite: bool,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8731")]
    addr: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Edit(args) => run_edit(args),
        Command::Chat(args) => run_chat(args),
        Command::Serve(args) => run_serve(args),
    }
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let request = GenerateImageRequest {
        prompt: args.prompt.clone(),
        model: args.model.clone(),
    };
    let provider =
        validate_generate_request(&request).map_err(|rejection| anyhow::anyhow!(rejection.message))?;

    let registry = default_provider_registry();
    let result = generate_image(&registry, request.prompt.trim(), provider)?;
    finish_one_shot(result, args.out.as_deref())
}

fn run_edit(args: EditArgs) -> Result<i32> {
    let image_urls = args
        .images
        .iter()
        .map(|reference| resolve_image_reference(reference))
        .collect::<Result<Vec<String>>>()?;
    let request = EditImageRequest {
        prompt: args.prompt.clone(),
        image_urls,
        provider: args.provider.clone(),
    };
    let provider =
        validate_edit_request(&request).map_err(|rejection| anyhow::anyhow!(rejection.message))?;

    let registry = default_provider_registry();
    let result = edit_image(&registry, request.prompt.trim(), &request.image_urls, provider)?;
    finish_one_shot(result, args.out.as_deref())
}

/// Local file paths become durable data URLs; data URLs and network
/// addresses pass through for the provider layer to resolve.
fn resolve_image_reference(reference: &str) -> Result<String> {
    if is_data_url(reference) || is_network_url(reference) {
        return Ok(reference.to_string());
    }
    let attachment = Attachment::new(reference, media_type_for_path(Path::new(reference)));
    encode_attachment(&attachment)
}

fn finish_one_shot(result: ImageResult, out: Option<&Path>) -> Result<i32> {
    if let Some(out) = out {
        let (bytes, media_type) = decode_data_url(&result.image_url)?;
        std::fs::write(out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
        println!(
            "{}",
            json!({
                "path": out.to_string_lossy(),
                "mediaType": media_type,
                "width": result.width,
                "height": result.height,
            })
        );
    } else {
        println!(
            "{}",
            json!({
                "imageUrl": result.image_url,
                "width": result.width,
                "height": result.height,
            })
        );
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// Interactive session
// ---------------------------------------------------------------------------

fn run_chat(args: ChatArgs) -> Result<i32> {
    let session_dir = args.session_dir.unwrap_or_else(default_session_dir);
    let mode = if args.scene_composite {
        SubmissionMode::SceneComposite
    } else {
        SubmissionMode::FreePrompt
    };
    let mut provider =
        Provider::parse(&args.provider).with_context(|| format!("Unsupported provider: {}", args.provider))?;
    let studio = Studio::new(&session_dir, mode)?;

    println!("session: {}", session_dir.display());
    println!("provider: {provider} (/help for commands)");

    let stdin = io::stdin();
    let mut staged: Vec<Attachment> = Vec::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('/') {
            let tokens = shell_words::split(rest).unwrap_or_default();
            match tokens.first().map(String::as_str) {
                Some("quit") | Some("exit") => break,
                Some("help") => print_chat_help(),
                Some("provider") => match tokens.get(1).and_then(|raw| Provider::parse(raw)) {
                    Some(parsed) => {
                        provider = parsed;
                        println!("provider set to {provider}");
                    }
                    None => println!("usage: /provider <openai|gemini>"),
                },
                Some("attach") => {
                    if tokens.len() < 2 {
                        println!("usage: /attach <path>...");
                        continue;
                    }
                    for path in &tokens[1..] {
                        staged.push(Attachment::new(
                            path.clone(),
                            media_type_for_path(Path::new(path)),
                        ));
                    }
                    println!("{} attachment(s) staged", staged.len());
                }
                Some("jobs") => print_jobs(&studio),
                Some("save") => {
                    if let (Some(id), Some(path)) = (tokens.get(1), tokens.get(2)) {
                        match save_job_image(&studio, id, Path::new(path)) {
                            Ok(()) => println!("saved {path}"),
                            Err(err) => println!("save failed: {err:#}"),
                        }
                    } else {
                        println!("usage: /save <job-id> <path>");
                    }
                }
                _ => println!("unknown command; /help for commands"),
            }
            continue;
        }

        match studio.submit(line, &staged, provider) {
            Some(id) => {
                println!("job {} submitted ({provider})", short_id(&id));
                staged.clear();
            }
            None => println!("nothing to submit (need a prompt or attachments)"),
        }
    }

    Ok(0)
}

fn print_chat_help() {
    println!("/attach <path>...   stage images; next submission becomes an edit");
    println!("/jobs               list jobs, newest first");
    println!("/provider <name>    switch between openai and gemini");
    println!("/save <id> <path>   write a finished job's image to disk");
    println!("/quit               exit");
}

fn print_jobs(studio: &Studio) {
    let jobs = studio.jobs();
    if jobs.is_empty() {
        println!("no jobs yet");
        return;
    }
    for job in jobs {
        let status = match &job.state {
            JobState::Pending => format!("pending {}s", job.elapsed_seconds()),
            JobState::Succeeded { .. } => "done".to_string(),
            JobState::Failed { error } => format!("failed: {}", truncate(error, 60)),
        };
        let kind = if job.is_edit { "edit" } else { "gen" };
        println!(
            "{}  [{kind}/{}] {:<18} {}",
            short_id(&job.id),
            job.provider,
            status,
            truncate(&job.prompt, 48),
        );
    }
}

fn save_job_image(studio: &Studio, id: &str, path: &Path) -> Result<()> {
    let job = studio
        .jobs()
        .into_iter()
        .find(|job| job.id == id || short_id(&job.id) == id)
        .context("no such job")?;
    let image_url = job.image_url().context("job has no image yet")?;
    let (bytes, _media_type) = decode_data_url(image_url)?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn default_session_dir() -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_secs())
        .unwrap_or(0);
    PathBuf::from("easel-sessions").join(format!("session-{stamp}"))
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let cut: String = value.chars().take(max_chars).collect();
    format!("{cut}…")
}

fn media_type_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn is_network_url(reference: &str) -> bool {
    reference.starts_with("http://") || reference.starts_with("https://")
}

// ---------------------------------------------------------------------------
// HTTP API
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    registry: Arc<ImageProviderRegistry>,
    token: Option<String>,
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easel=info,axum=info".into()),
        )
        .init();

    let state = AppState {
        registry: Arc::new(default_provider_registry()),
        token: std::env::var("EASEL_API_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty()),
    };
    let app = Router::new()
        .route("/api/generate", post(generate_handler))
        .route("/api/edit", post(edit_handler))
        .with_state(state);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&args.addr)
            .await
            .with_context(|| format!("failed to bind {}", args.addr))?;
        info!(addr = %args.addr, "listening");
        axum::serve(listener, app).await.context("server exited")
    })?;
    Ok(0)
}

async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateImageRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(response) = authorize(&state.token, &headers) {
        return response;
    }
    let provider = match validate_generate_request(&body) {
        Ok(provider) => provider,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.message })),
            )
        }
    };

    let registry = Arc::clone(&state.registry);
    let prompt = body.prompt.trim().to_string();
    let outcome =
        tokio::task::spawn_blocking(move || generate_image(&registry, &prompt, provider)).await;
    respond_with_outcome("generate", provider, outcome)
}

async fn edit_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EditImageRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(response) = authorize(&state.token, &headers) {
        return response;
    }
    let provider = match validate_edit_request(&body) {
        Ok(provider) => provider,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.message })),
            )
        }
    };

    let registry = Arc::clone(&state.registry);
    let prompt = body.prompt.trim().to_string();
    let image_urls = body.image_urls.clone();
    let outcome =
        tokio::task::spawn_blocking(move || edit_image(&registry, &prompt, &image_urls, provider))
            .await;
    respond_with_outcome("edit", provider, outcome)
}

fn respond_with_outcome(
    action: &str,
    provider: Provider,
    outcome: std::result::Result<Result<ImageResult>, tokio::task::JoinError>,
) -> (StatusCode, Json<Value>) {
    match outcome {
        Ok(Ok(result)) => {
            info!(action, provider = %provider, width = result.width, height = result.height, "dispatch ok");
            (StatusCode::OK, Json(json!({ "imageUrl": result.image_url })))
        }
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            error!(action, provider = %provider, error = %message, "dispatch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
        }
        Err(join_err) => {
            error!(action, error = %join_err, "dispatch task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal dispatch failure" })),
            )
        }
    }
}

/// When `EASEL_API_TOKEN` is configured, requests must present it as a
/// bearer token.
fn authorize(
    token: &Option<String>,
    headers: &HeaderMap,
) -> std::result::Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = token else {
        return Ok(());
    };
    let presented = bearer_token(headers);
    if presented == Some(expected.as_str()) {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Missing or invalid bearer token" })),
    ))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
