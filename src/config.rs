use anyhow::{bail, Context, Result};
use axum::http::HeaderValue;
use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::hub::ModelSource;
use crate::prompt::DEFAULT_SYSTEM_PROMPT;

pub const DEFAULT_MODEL_ID: &str = "ahmeterdempmk/Qwen2.5-0.5B-Quantum-Computing-Instruct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DevicePreference {
    /// CUDA if available, then Metal, then CPU
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Where the model comes from and where it runs.
#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Hugging Face model repository
    #[arg(long, env = "MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Repository revision (branch, tag or commit)
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub revision: String,

    /// Load model files from a local directory instead of the hub
    #[arg(long, env = "MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    #[arg(long, env = "DEVICE", value_enum, default_value = "auto")]
    pub device: DevicePreference,
}

impl ModelArgs {
    pub fn source(&self) -> ModelSource {
        match &self.model_dir {
            Some(dir) => ModelSource::Local(dir.clone()),
            None => ModelSource::Hub {
                model_id: self.model_id.clone(),
                revision: self.revision.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct GenerationArgs {
    /// System prompt placed before every user message
    #[arg(long, env = "SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    /// Sampling temperature; 0 selects greedy decoding
    #[arg(long, env = "TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f64,

    /// Nucleus sampling probability mass
    #[arg(long, env = "TOP_P", default_value_t = 0.95)]
    pub top_p: f64,

    #[arg(long, env = "MAX_NEW_TOKENS", default_value_t = 4096)]
    pub max_new_tokens: usize,

    /// Fixed sampling seed; a fresh seed is drawn per request when unset
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,

    /// Penalty applied to recently generated tokens (1.0 disables it)
    #[arg(long, env = "REPEAT_PENALTY", default_value_t = 1.0)]
    pub repeat_penalty: f32,

    /// Number of trailing tokens the repeat penalty looks at
    #[arg(long, env = "REPEAT_LAST_N", default_value_t = 64)]
    pub repeat_last_n: usize,
}

/// Sampling knobs handed to the generator for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_new_tokens: usize,
    pub seed: Option<u64>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            max_new_tokens: 4096,
            seed: None,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub system_prompt: String,
    pub sampling: SamplingParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            sampling: SamplingParams::default(),
        }
    }
}

impl GenerationArgs {
    pub fn to_config(&self) -> Result<GenerationConfig> {
        if !(self.temperature >= 0.0) {
            bail!("temperature must be >= 0, got {}", self.temperature);
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            bail!("top_p must be in (0, 1], got {}", self.top_p);
        }
        if self.max_new_tokens == 0 {
            bail!("max_new_tokens must be greater than 0");
        }
        if !(self.repeat_penalty > 0.0) {
            bail!("repeat_penalty must be > 0, got {}", self.repeat_penalty);
        }

        Ok(GenerationConfig {
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            sampling: SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                max_new_tokens: self.max_new_tokens,
                seed: self.seed,
                repeat_penalty: self.repeat_penalty,
                repeat_last_n: self.repeat_last_n,
            },
        })
    }
}

#[derive(Debug, Clone, Parser)]
pub struct ServeArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Origins allowed to call the API from a browser (comma separated)
    #[arg(
        long,
        env = "CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    pub cors_origins: Vec<String>,

    /// Pause between streamed chunks in milliseconds (0 disables pacing)
    #[arg(long, env = "CHUNK_DELAY_MS", default_value_t = 0)]
    pub chunk_delay_ms: u64,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

impl ServeArgs {
    /// Host and port to listen on; the host may be a name such as `localhost`.
    pub fn bind_addr(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn cors_header_values(&self) -> Result<Vec<HeaderValue>> {
        self.cors_origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("Invalid CORS origin: {}", origin))
            })
            .collect()
    }
}
