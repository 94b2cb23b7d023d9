//! # Whisper Engine
//!
//! Loads and runs Whisper models with Candle. Construction is parameterized
//! by model identifier, device and compute precision; weights come from
//! HuggingFace (cached locally), either safetensors for the float modes or
//! quantized gguf for the int8 modes.
//!
//! ## Loading Process:
//! 1. Reject compute/device combinations the backend cannot run
//! 2. Download config, tokenizer and weights through hf-hub
//! 3. Build the model on the target device at the requested precision
//! 4. Resolve the special tokens the decoder loop needs
//!
//! ## Inference:
//! Audio is decoded to 16 kHz mono, converted to a log-mel spectrogram and
//! processed in 30-second windows. Each window yields one timestamped text
//! segment. Language is detected on the first window unless a language was
//! forced by configuration.

use crate::audio;
use crate::device;
use crate::transcription::compute::ComputeType;
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::whisper::{self as m, Config};
use std::fmt;
use std::path::Path;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;

const MAX_DECODE_TOKENS: usize = 224;
const TEMPERATURES: &[f32] = &[0.0, 0.2, 0.4, 0.6, 0.8, 1.0];

/// Languages the gateway can auto-detect. Token form is `<|code|>`.
const DETECTABLE_LANGUAGES: &[&str] =
    &["en", "es", "fr", "de", "it", "pt", "ru", "ja", "ko", "zh"];

/// Why a model failed to load.
///
/// The provider's fallback loop only swallows `InvalidComputeType`; every
/// other failure aborts initialization immediately.
#[derive(Debug)]
pub enum LoadError {
    /// The requested precision cannot be used with this model or device
    InvalidComputeType {
        compute_type: ComputeType,
        reason: String,
    },

    /// Network, missing files, weight parsing, tokenizer problems
    Other(anyhow::Error),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::InvalidComputeType {
                compute_type,
                reason,
            } => write!(f, "Compute type {} not usable: {}", compute_type, reason),
            LoadError::Other(err) => write!(f, "Model initialization failed: {}", err),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        LoadError::Other(err)
    }
}

/// One timestamped chunk of transcribed text.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Segment {
    /// Window start in seconds
    pub start: f64,
    /// Window end in seconds
    pub end: f64,
    pub text: String,
}

/// Result of transcribing one audio file.
#[derive(Debug, Clone)]
pub struct TranscriptionOutput {
    pub segments: Vec<Segment>,
    /// Detected or forced language code
    pub language: String,
    /// Confidence of the detection, 1.0 when the language was forced,
    /// 0.0 when no estimate is available
    pub language_probability: f32,
}

/// Plain or quantized variant of the underlying Candle model.
enum Model {
    Normal(m::model::Whisper),
    Quantized(m::quantized_model::Whisper),
}

impl Model {
    fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(model) => model.encoder.forward(x, flush),
            Model::Quantized(model) => model.encoder.forward(x, flush),
        }
    }

    fn decoder_forward(
        &mut self,
        x: &Tensor,
        xa: &Tensor,
        flush: bool,
    ) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(model) => model.decoder.forward(x, xa, flush),
            Model::Quantized(model) => model.decoder.forward(x, xa, flush),
        }
    }

    fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(model) => model.decoder.final_linear(x),
            Model::Quantized(model) => model.decoder.final_linear(x),
        }
    }
}

/// Special token ids resolved from the tokenizer at load time.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
}

/// A loaded Whisper model ready for transcription.
///
/// The handle itself is immutable and safe to share behind an `Arc`; the
/// decoder's key-value cache lives behind an internal async mutex, so
/// concurrent requests serialize at the inference step only.
pub struct WhisperModel {
    state: Mutex<Model>,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,
    model_id: String,
    compute_type: ComputeType,
    special: SpecialTokens,
}

impl WhisperModel {
    /// Load a Whisper model at the given precision.
    ///
    /// ## Errors:
    /// - `LoadError::InvalidComputeType` when the precision cannot run on
    ///   the selected device or no weights exist for it
    /// - `LoadError::Other` for download and parsing failures
    pub async fn load(
        model_id: &str,
        device: Device,
        compute_type: ComputeType,
    ) -> Result<Self, LoadError> {
        tracing::info!(
            "Loading Whisper model '{}' with compute type {}",
            model_id,
            compute_type
        );
        let start_time = std::time::Instant::now();

        if compute_type.requires_accelerator() && !device::is_accelerator(&device) {
            return Err(LoadError::InvalidComputeType {
                compute_type,
                reason: "f16 arithmetic requires a GPU device".to_string(),
            });
        }

        let api = build_hub_api().map_err(LoadError::Other)?;
        let files = ModelFiles::fetch(&api, model_id, compute_type).await?;

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config).map_err(|e| anyhow!(e))?,
        )
        .map_err(|e| anyhow!("Failed to parse model config: {}", e))?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let mel_filters = mel_filter_bank(m::N_FFT, config.num_mel_bins as usize);

        let model = if compute_type.is_quantized() {
            let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                &files.weights,
                &device,
            )
            .map_err(|e| anyhow!("Failed to read quantized weights: {}", e))?;
            Model::Quantized(
                m::quantized_model::Whisper::load(&vb, config.clone())
                    .map_err(|e| anyhow!("Failed to build quantized model: {}", e))?,
            )
        } else {
            let dtype = match compute_type {
                ComputeType::Float16 => DType::F16,
                _ => DType::F32,
            };
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(
                    &[files.weights.clone()],
                    dtype,
                    &device,
                )
                .map_err(|e| anyhow!("Failed to map model weights: {}", e))?
            };
            Model::Normal(
                m::model::Whisper::load(&vb, config.clone())
                    .map_err(|e| anyhow!("Failed to build model: {}", e))?,
            )
        };

        let special = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
        };

        tracing::info!(
            "Whisper model '{}' ({}) loaded in {:.2}s",
            model_id,
            compute_type,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            state: Mutex::new(model),
            config,
            tokenizer,
            mel_filters,
            device,
            model_id: model_id.to_string(),
            compute_type,
            special,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn compute_type(&self) -> ComputeType {
        self.compute_type
    }

    /// Dtype of encoder inputs. Quantized models keep f32 activations.
    fn activation_dtype(&self) -> DType {
        match self.compute_type {
            ComputeType::Float16 => DType::F16,
            _ => DType::F32,
        }
    }

    /// Transcribe an audio file.
    ///
    /// ## Parameters:
    /// - **path**: WAV file on disk
    /// - **language**: forced language code, or `None` for auto-detection
    /// - **beam_size**: width of the per-step candidate pool in the decoder
    pub async fn transcribe(
        &self,
        path: &Path,
        language: Option<&str>,
        beam_size: usize,
    ) -> Result<TranscriptionOutput> {
        let samples = audio::load_wav(path)?;
        let duration = samples.len() as f64 / audio::SAMPLE_RATE as f64;
        tracing::debug!("Transcribing {:.2}s of audio from {:?}", duration, path);

        let mel = m::audio::pcm_to_mel(&self.config, &samples, &self.mel_filters);
        let mel_len = mel.len();
        let n_mels = self.config.num_mel_bins as usize;
        let content_frames = mel_len / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, content_frames), &self.device)?
            .to_dtype(self.activation_dtype())?;

        let mut state = self.state.lock().await;

        let (language, language_probability) = match language {
            Some(code) => (code.to_string(), 1.0),
            None => {
                let first_frames = content_frames.min(m::N_FRAMES);
                let head = mel.narrow(2, 0, first_frames)?;
                self.detect_language(&mut state, &head)
                    .unwrap_or_else(|e| {
                        tracing::warn!("Language detection failed: {}", e);
                        ("en".to_string(), 0.0)
                    })
            }
        };
        let lang_token = self.language_token(&language);

        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let segment_frames = m::N_FRAMES.min(content_frames - seek);
            let mel_segment = mel.narrow(2, seek, segment_frames)?;
            let text = self.decode_segment(&mut state, &mel_segment, lang_token, beam_size)?;

            let start = seek as f64 * m::HOP_LENGTH as f64 / audio::SAMPLE_RATE as f64;
            let end = (seek + segment_frames) as f64 * m::HOP_LENGTH as f64
                / audio::SAMPLE_RATE as f64;
            tracing::debug!("Segment {:.2}s..{:.2}s: '{}'", start, end, text);
            segments.push(Segment { start, end, text });
            seek += segment_frames;
        }

        Ok(TranscriptionOutput {
            segments,
            language,
            language_probability,
        })
    }

    /// Identify the spoken language from the first audio window.
    ///
    /// Runs the encoder once and reads the decoder's distribution over the
    /// language tokens right after start-of-transcript.
    fn detect_language(&self, state: &mut Model, mel: &Tensor) -> Result<(String, f32)> {
        let candidates: Vec<(&str, u32)> = DETECTABLE_LANGUAGES
            .iter()
            .filter_map(|code| {
                self.tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();
        if candidates.is_empty() {
            return Err(anyhow!("Tokenizer exposes no language tokens"));
        }

        let audio_features = state.encoder_forward(mel, true)?;
        let tokens = Tensor::new(&[self.special.sot][..], &self.device)?.unsqueeze(0)?;
        let hidden = state.decoder_forward(&tokens, &audio_features, true)?;
        let logits = state
            .decoder_final_linear(&hidden.i(..1)?)?
            .i(0)?
            .i(0)?;

        let ids: Vec<u32> = candidates.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let lang_logits = logits.index_select(&ids, 0)?;
        let probs = candle_nn::ops::softmax(&lang_logits, 0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;

        let (best, probability) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, p)| (i, *p))
            .ok_or_else(|| anyhow!("Empty language distribution"))?;

        let code = candidates[best].0.to_string();
        tracing::debug!("Detected language '{}' ({:.3})", code, probability);
        Ok((code, probability))
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        self.tokenizer.token_to_id(&format!("<|{}|>", code))
    }

    /// Decode one mel window into text, retrying at increasing temperatures
    /// when the output degenerates into repetition.
    fn decode_segment(
        &self,
        state: &mut Model,
        mel_segment: &Tensor,
        lang_token: Option<u32>,
        beam_size: usize,
    ) -> Result<String> {
        let audio_features = state.encoder_forward(mel_segment, true)?;

        let mut prompt = vec![self.special.sot];
        if let Some(lang) = lang_token {
            prompt.push(lang);
        }
        prompt.push(self.special.transcribe);
        prompt.push(self.special.no_timestamps);

        let mut output_tokens: Vec<u32> = Vec::new();

        for &temperature in TEMPERATURES {
            let mut tokens = prompt.clone();
            output_tokens.clear();
            let mut degenerate = false;

            for step in 0..MAX_DECODE_TOKENS {
                let input = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
                let hidden = state.decoder_forward(&input, &audio_features, step == 0)?;
                let logits = state
                    .decoder_final_linear(&hidden)?
                    .i((0, tokens.len() - 1))?;

                let next_token =
                    self.pick_token(&logits, temperature, beam_size, &output_tokens)?;

                if next_token == self.special.eot {
                    break;
                }
                if is_repetitive(&output_tokens, next_token) {
                    degenerate = true;
                    break;
                }
                tokens.push(next_token);
                output_tokens.push(next_token);
            }

            if !degenerate {
                break;
            }
            tracing::debug!(
                "Decode degenerated at temperature {:.1}, retrying",
                temperature
            );
        }

        self.decode_tokens(&output_tokens)
    }

    /// Choose the next token from the top `beam_size` candidates.
    ///
    /// Candidates are ranked by temperature-scaled logit; a candidate that
    /// would extend an immediate repetition is skipped in favor of the next
    /// one in the pool.
    fn pick_token(
        &self,
        logits: &Tensor,
        temperature: f32,
        beam_size: usize,
        history: &[u32],
    ) -> Result<u32> {
        let logits = if temperature > 0.0 {
            (logits / temperature as f64)?
        } else {
            logits.clone()
        };
        let scores = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;

        let mut ranked: Vec<(u32, f32)> = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| (i as u32, s))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(beam_size.max(1));

        for &(token, _) in &ranked {
            if token == self.special.eot || !extends_repeat(history, token) {
                return Ok(token);
            }
        }
        Ok(ranked[0].0)
    }

    /// Decode tokens to text and strip residual special-token markup.
    fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text
            .replace("<|startoftranscript|>", "")
            .replace("<|endoftext|>", "")
            .replace("<|notimestamps|>", "")
            .trim()
            .to_string())
    }
}

/// Downloaded file locations for one model/precision combination.
struct ModelFiles {
    config: std::path::PathBuf,
    tokenizer: std::path::PathBuf,
    weights: std::path::PathBuf,
}

impl ModelFiles {
    /// Fetch config, tokenizer and weights for the model.
    ///
    /// Float modes read the official OpenAI safetensors repositories.
    /// Quantized modes read gguf weights, which exist only for the short
    /// model names; a missing quantized artifact is an invalid
    /// configuration, not a hard failure, so the fallback can continue.
    async fn fetch(
        api: &hf_hub::api::tokio::Api,
        model_id: &str,
        compute_type: ComputeType,
    ) -> Result<Self, LoadError> {
        if compute_type.is_quantized() {
            if model_id.contains('/') {
                return Err(LoadError::InvalidComputeType {
                    compute_type,
                    reason: format!(
                        "quantized weights are only published for the standard model \
                         names, not '{}'",
                        model_id
                    ),
                });
            }
            let repo = api.model("lmz/candle-whisper".to_string());
            let quantized = |e: hf_hub::api::tokio::ApiError| LoadError::InvalidComputeType {
                compute_type,
                reason: format!("no quantized weights for model '{}': {}", model_id, e),
            };
            let config = repo
                .get(&format!("config-{}.json", model_id))
                .await
                .map_err(quantized)?;
            let tokenizer = repo
                .get(&format!("tokenizer-{}.json", model_id))
                .await
                .map_err(quantized)?;
            let weights = repo
                .get(&format!("model-{}-q80.gguf", model_id))
                .await
                .map_err(quantized)?;
            return Ok(Self {
                config,
                tokenizer,
                weights,
            });
        }

        let repo_name = if model_id.contains('/') {
            model_id.to_string()
        } else {
            format!("openai/whisper-{}", model_id)
        };
        let repo = api.model(repo_name.clone());
        let download = |what: &'static str| {
            let repo_name = repo_name.clone();
            move |e: hf_hub::api::tokio::ApiError| {
                LoadError::Other(anyhow!("Failed to download {} from {}: {}", what, repo_name, e))
            }
        };
        let config = repo.get("config.json").await.map_err(download("config.json"))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .map_err(download("tokenizer.json"))?;
        let weights = repo
            .get("model.safetensors")
            .await
            .map_err(download("model.safetensors"))?;
        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

/// Build the hub client, honoring the usual HF_* environment variables.
fn build_hub_api() -> Result<hf_hub::api::tokio::Api> {
    use hf_hub::api::tokio::ApiBuilder;

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
    }
    builder
        .build()
        .map_err(|e| anyhow!("Failed to create HuggingFace API client: {}", e))
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32, LoadError> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| LoadError::Other(anyhow!("Tokenizer is missing token {}", token)))
}

/// Triangular mel filter bank matching the model's mel bin count.
fn mel_filter_bank(n_fft: usize, n_mels: usize) -> Vec<f32> {
    let mut filters = vec![0.0f32; n_fft * n_mels];
    for i in 0..n_mels {
        let center = (i + 1) * n_fft / (n_mels + 1);
        let width = n_fft / (n_mels + 1);
        for j in center.saturating_sub(width)..=(center + width).min(n_fft - 1) {
            let distance = (j as i32 - center as i32).abs() as f32;
            filters[i * n_fft + j] = (1.0 - distance / width as f32).max(0.0);
        }
    }
    filters
}

/// An immediate three-peat or a repeated trigram means the decode went bad.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() >= 2 {
        let n = tokens.len();
        if tokens[n - 1] == new_token && tokens[n - 2] == new_token {
            return true;
        }
    }
    if tokens.len() >= 5 {
        let n = tokens.len();
        let last = [tokens[n - 2], tokens[n - 1], new_token];
        let prev = [tokens[n - 5], tokens[n - 4], tokens[n - 3]];
        if last == prev {
            return true;
        }
    }
    false
}

/// Would appending `token` create an immediate repeat pair.
fn extends_repeat(tokens: &[u32], token: u32) -> bool {
    tokens.last() == Some(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetition_detection() {
        assert!(is_repetitive(&[5, 5], 5));
        assert!(!is_repetitive(&[4, 5], 5));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6));
        assert!(!is_repetitive(&[], 1));
    }

    #[test]
    fn test_extends_repeat() {
        assert!(extends_repeat(&[1, 2], 2));
        assert!(!extends_repeat(&[1, 2], 1));
        assert!(!extends_repeat(&[], 7));
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let n_fft = 400;
        let n_mels = 80;
        let filters = mel_filter_bank(n_fft, n_mels);
        assert_eq!(filters.len(), n_fft * n_mels);
        // Every filter has some mass
        for i in 0..n_mels {
            let sum: f32 = filters[i * n_fft..(i + 1) * n_fft].iter().sum();
            assert!(sum > 0.0, "filter {} is empty", i);
        }
    }

    #[test]
    fn test_load_error_display() {
        let err = LoadError::InvalidComputeType {
            compute_type: ComputeType::Float16,
            reason: "f16 arithmetic requires a GPU device".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("float16"));
        assert!(message.contains("GPU"));
    }
}
