use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderValue, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use std::convert::Infallible;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServeArgs;
use crate::manager::{ModelManager, ModelStatus};
use crate::model::QwenLoader;

#[derive(Clone, Debug)]
pub struct AppState {
    pub manager: ModelManager,
    /// Pause before each chunk frame; zero streams as fast as words arrive.
    pub chunk_delay: Duration,
}

impl AppState {
    pub fn new(manager: ModelManager, chunk_delay: Duration) -> Self {
        Self {
            manager,
            chunk_delay,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ChunkFrame<'a> {
    chunk: &'a str,
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    error: &'a str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub model: ModelStatus,
}

/// Frame JSON: `", "` and `": "` separators, every non-ASCII character
/// escaped as `\uXXXX`. A frame then never carries a multi-byte sequence
/// that a network read could split.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

fn to_frame_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut buf = Vec::new();
    value.serialize(&mut serde_json::Serializer::with_formatter(&mut buf, AsciiFormatter))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn chunk_event(word: &str) -> Event {
    let json_data = to_frame_json(&ChunkFrame { chunk: word }).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(json_data)
}

fn error_event(message: &str) -> Event {
    let json_data =
        to_frame_json(&ErrorFrame { error: message }).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(json_data)
}

fn done_event() -> Event {
    Event::default().data("[DONE]")
}

/// Maps generated words to chunk frames; an error ends the stream after its frame.
fn word_events(
    words: ReceiverStream<Result<String>>,
    delay: Duration,
) -> impl Stream<Item = Event> + Send + 'static {
    stream::unfold(Some(words), move |words| async move {
        let mut words = words?;
        match words.next().await {
            Some(Ok(word)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((chunk_event(&word), Some(words)))
            }
            Some(Err(e)) => Some((error_event(&e.to_string()), None)),
            None => None,
        }
    })
}

pub async fn chat(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = uuid::Uuid::new_v4();

    // Parsed by hand so any body that is not a valid request gets the same
    // JSON error, whatever its content type.
    let req: ChatRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "Error in chat endpoint");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    tracing::info!(
        request_id = %request_id,
        message_length = req.message.len(),
        "Received chat request"
    );

    let events: BoxStream<'static, Event> = match state.manager.stream_chat(&req.message).await {
        Ok(words) => {
            tracing::debug!(request_id = %request_id, "Streaming response");
            word_events(words, state.chunk_delay).boxed()
        }
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Model unavailable for chat");
            stream::once(async move { error_event(&e.to_string()) }).boxed()
        }
    };

    let sse_stream = events
        .chain(stream::once(async { done_event() }))
        .map(Ok::<Event, Infallible>);

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model: state.manager.status().await,
    })
}

fn cors_layer(allowed_origins: Vec<HeaderValue>) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|origin| *origin == "*") {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(allowed_origins)
    };

    // Credentials rule out wildcards, so methods and headers echo the preflight.
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

pub fn create_router(state: AppState, allowed_origins: Vec<HeaderValue>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(allowed_origins)),
        )
        .with_state(state)
}

/// Binds the listener, kicks off the model load and serves until Ctrl-C.
pub async fn serve(args: ServeArgs) -> Result<()> {
    let generation = args.generation.to_config()?;
    let allowed_origins = args.cors_header_values()?;

    let loader = Arc::new(QwenLoader::new(args.model.source(), args.model.device));
    let manager = ModelManager::new(loader, generation);

    let listener = tokio::net::TcpListener::bind(args.bind_addr())
        .await
        .with_context(|| format!("Failed to bind to {}:{}", args.host, args.port))?;
    let addr = listener.local_addr()?;
    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Chat endpoint: http://{}/api/chat", addr);

    // Requests are served while the model loads; chat reports "still loading".
    manager.start_loading().await;

    let app = create_router(AppState::new(manager, args.chunk_delay()), allowed_origins);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}
