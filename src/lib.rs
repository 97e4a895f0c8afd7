//! quantum-chat: a streaming chat server for a single causal language model
//!
//! This library provides:
//! - Model file resolution from the Hugging Face hub or a local directory
//! - A candle-backed Qwen2 generation engine with GPU-to-CPU load fallback
//! - Background model loading that never blocks request handling
//! - Serialized access to the one shared model/tokenizer pair
//! - A bridge from the blocking generation thread to an SSE response
//!
//! # Example
//!
//! ```no_run
//! use quantum_chat::{config::ServeArgs, server, Result};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let args = ServeArgs::parse_from(["quantum-chat", "--port", "8000"]);
//!     server::serve(args).await
//! }
//! ```

pub mod chunker;
pub mod config;
pub mod error;
pub mod hub;
pub mod manager;
pub mod model;
pub mod prompt;
pub mod server;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export main types for library users
pub use error::ChatError;
pub use manager::{ModelManager, ModelStatus};
pub use model::{ModelLoader, QwenLoader, TextGenerator};
pub use prompt::{ChatMessage, Role};
pub use server::{create_router, AppState};

// Re-export common types
pub type Result<T> = std::result::Result<T, anyhow::Error>;
