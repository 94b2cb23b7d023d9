//! # Transcription Module
//!
//! Speech-to-text transcription using Whisper models via the Candle-rs
//! framework, pure Rust without FFI bindings to whisper.cpp.
//!
//! ## Key Components:
//! - **Compute Types**: Numeric precision modes and the fallback candidate list
//! - **Whisper Engine**: Model loading, mel frontend, decode loop, segments
//! - **Model Provider**: Lazy, single-flight construction of the process-wide
//!   engine handle with precision fallback
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy (the default)
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod compute;   // Precision modes and fallback candidates
pub mod model;     // Whisper engine (Candle)
pub mod provider;  // Lazy single-flight model handle

pub use compute::{candidate_compute_types, ComputeType};
pub use model::{LoadError, Segment, TranscriptionOutput, WhisperModel};
pub use provider::ModelProvider;
