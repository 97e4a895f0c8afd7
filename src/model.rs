use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::qwen2::{Config as QwenConfig, ModelForCausalLM};
use std::fs;
use std::ops::ControlFlow;
use tokenizers::Tokenizer;

use crate::config::{DevicePreference, SamplingParams};
use crate::hub::{ModelFiles, ModelSource};
use crate::prompt::{ChatMessage, ChatTemplate};

const STOP_TOKENS: [&str; 2] = ["<|im_end|>", "<|endoftext|>"];

/// A loaded model that can answer a conversation.
///
/// Implementations block the calling thread for the whole generation. Every
/// piece of decoded text is handed to `emit`; when it returns
/// `ControlFlow::Break` nobody is listening anymore and generation stops.
pub trait TextGenerator: Send {
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()>;
}

/// Produces the generator. Blocking; run it off the async runtime.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn TextGenerator>>;
}

impl<F> ModelLoader for F
where
    F: Fn() -> Result<Box<dyn TextGenerator>> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn TextGenerator>> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct QwenLoader {
    source: ModelSource,
    device: DevicePreference,
}

impl QwenLoader {
    pub fn new(source: ModelSource, device: DevicePreference) -> Self {
        Self { source, device }
    }
}

impl ModelLoader for QwenLoader {
    fn load(&self) -> Result<Box<dyn TextGenerator>> {
        tracing::info!(source = %self.source, device = ?self.device, "Loading model");
        let files = ModelFiles::resolve(&self.source)?;
        let device = select_device(self.device)?;

        load_with_fallback(
            device.is_cpu(),
            || QwenEngine::load(&files, device.clone()),
            || QwenEngine::load(&files, Device::Cpu),
        )
        .map(|engine| Box::new(engine) as Box<dyn TextGenerator>)
    }
}

/// Runs `primary`, retrying with `fallback` when it fails.
///
/// A primary attempt that already ran on the CPU is not retried.
fn load_with_fallback<T>(
    primary_is_cpu: bool,
    primary: impl FnOnce() -> Result<T>,
    fallback: impl FnOnce() -> Result<T>,
) -> Result<T> {
    match primary() {
        Ok(loaded) => {
            tracing::info!("Model loaded successfully");
            Ok(loaded)
        }
        Err(e) if primary_is_cpu => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "Accelerator load failed. Retrying on CPU with f32...");
            match fallback() {
                Ok(loaded) => {
                    tracing::info!("Model loaded successfully with CPU fallback");
                    Ok(loaded)
                }
                Err(fallback) => bail!(
                    "Failed to load model with both configurations: {:#}\nFallback error: {:#}",
                    e,
                    fallback
                ),
            }
        }
    }
}

fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => Device::new_cuda(0).context("CUDA device unavailable"),
        DevicePreference::Metal => Device::new_metal(0).context("Metal device unavailable"),
        DevicePreference::Auto => {
            let accelerator = if candle_core::utils::cuda_is_available() {
                Some(Device::new_cuda(0))
            } else if candle_core::utils::metal_is_available() {
                Some(Device::new_metal(0))
            } else {
                None
            };
            match accelerator {
                Some(Ok(device)) => Ok(device),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Accelerator detected but unusable, using CPU");
                    Ok(Device::Cpu)
                }
                None => Ok(Device::Cpu),
            }
        }
    }
}

/// Qwen2 causal LM running on candle.
pub struct QwenEngine {
    model: ModelForCausalLM,
    tokenizer: Tokenizer,
    template: ChatTemplate,
    device: Device,
    stop_tokens: Vec<u32>,
}

impl std::fmt::Debug for QwenEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenEngine")
            .field("device", &self.device)
            .field("stop_tokens", &self.stop_tokens)
            .finish()
    }
}

impl QwenEngine {
    pub fn load(files: &ModelFiles, device: Device) -> Result<Self> {
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        tracing::info!(device = ?device, dtype = ?dtype, "Building Qwen2 model");

        let raw_config = fs::read(&files.config)
            .with_context(|| format!("Failed to read {}", files.config.display()))?;
        let config: QwenConfig =
            serde_json::from_slice(&raw_config).context("Invalid model config.json")?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(anyhow::Error::msg)
            .context("Failed to load tokenizer")?;

        // SAFETY: the weight files are memory-mapped read-only and must not be
        // modified while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = ModelForCausalLM::new(&config, vb).context("Failed to build model")?;

        let stop_tokens: Vec<u32> = STOP_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        if stop_tokens.is_empty() {
            tracing::warn!("Tokenizer has no stop tokens, generation ends at max_new_tokens");
        }

        let template = ChatTemplate::from_tokenizer_config(files.tokenizer_config.as_deref());

        Ok(Self {
            model,
            tokenizer,
            template,
            device,
            stop_tokens,
        })
    }
}

impl TextGenerator for QwenEngine {
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        let prompt = self.template.render(messages);
        tracing::trace!(prompt = %prompt, "Rendered prompt");

        self.model.clear_kv_cache();
        let mut tokens = self
            .tokenizer
            .encode(prompt.as_str(), true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        let prompt_tokens = tokens.len();

        let seed = params.seed.unwrap_or_else(random_seed);
        let mut sampler = LogitsProcessor::from_sampling(seed, sampling_for(params));
        let mut decoder = IncrementalDecoder::new(&self.tokenizer);

        for index in 0..params.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, start_pos)?;
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            let logits = if params.repeat_penalty == 1.0 {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(params.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repeat_penalty,
                    &tokens[start_at..],
                )?
            };

            let next = sampler.sample(&logits)?;
            if self.stop_tokens.contains(&next) {
                break;
            }
            tokens.push(next);

            if let Some(text) = decoder.push(next)? {
                if emit(&text).is_break() {
                    tracing::debug!(generated = tokens.len() - prompt_tokens, "Consumer gone, stopping");
                    return Ok(());
                }
            }
        }

        if let Some(rest) = decoder.flush()? {
            let _ = emit(&rest);
        }

        tracing::debug!(
            prompt_tokens,
            generated = tokens.len() - prompt_tokens,
            "Generation finished"
        );
        Ok(())
    }
}

fn sampling_for(params: &SamplingParams) -> Sampling {
    if params.temperature <= 0.0 {
        Sampling::ArgMax
    } else if params.top_p >= 1.0 {
        Sampling::All {
            temperature: params.temperature,
        }
    } else {
        Sampling::TopP {
            p: params.top_p,
            temperature: params.temperature,
        }
    }
}

fn random_seed() -> u64 {
    uuid::Uuid::new_v4().as_u64_pair().0
}

/// Detokenizes one token at a time without splitting multi-byte characters.
///
/// Text is only released once the decoded tail ends on an alphanumeric
/// character, so byte-fallback tokens are reassembled before they are sent.
struct IncrementalDecoder<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> IncrementalDecoder<'a> {
    fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer.decode(tokens, true).map_err(anyhow::Error::msg)
    }

    fn push(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len() && text.chars().last().is_some_and(char::is_alphanumeric) {
            let Some(fresh) = text.get(prev_text.len()..) else {
                return Ok(None);
            };
            let fresh = fresh.to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(fresh))
        } else {
            Ok(None)
        }
    }

    fn flush(&self) -> Result<Option<String>> {
        let prev_text = self.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            Ok(text.get(prev_text.len()..).map(|s| s.to_string()))
        } else {
            Ok(None)
        }
    }
}
