//! # Compute Precision Types
//!
//! Numeric precision modes the Whisper engine can be constructed with, and
//! the ordered candidate list used when the preferred mode turns out to be
//! unsupported on the selected device.
//!
//! ## Fallback Order:
//! The configured mode is always tried first, followed by `int8`, `float16`
//! and `float32`. A mode never appears twice in the list, so configuring one
//! of the fallback modes simply promotes it to the front.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// A numeric compute-precision mode for model inference.
///
/// ## Trade-offs:
/// - **Int8**: quantized weights, smallest memory footprint, runs anywhere
/// - **Int8Float16**: quantized weights with f16 activations, GPU only
/// - **Float16**: half-precision weights and activations, GPU only
/// - **Float32**: full precision, largest but universally supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComputeType {
    Int8,
    Int8Float16,
    Float16,
    Float32,
}

impl ComputeType {
    /// Whether this mode loads quantized (gguf) weights.
    pub fn is_quantized(&self) -> bool {
        matches!(self, ComputeType::Int8 | ComputeType::Int8Float16)
    }

    /// Whether this mode needs a GPU device for its f16 arithmetic.
    pub fn requires_accelerator(&self) -> bool {
        matches!(self, ComputeType::Int8Float16 | ComputeType::Float16)
    }
}

impl std::str::FromStr for ComputeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "int8" => Ok(ComputeType::Int8),
            "int8_float16" => Ok(ComputeType::Int8Float16),
            "float16" | "fp16" => Ok(ComputeType::Float16),
            "float32" | "fp32" => Ok(ComputeType::Float32),
            _ => Err(anyhow!("Unknown compute type: {}", s)),
        }
    }
}

impl std::fmt::Display for ComputeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ComputeType::Int8 => "int8",
            ComputeType::Int8Float16 => "int8_float16",
            ComputeType::Float16 => "float16",
            ComputeType::Float32 => "float32",
        };
        write!(f, "{}", name)
    }
}

/// Fallback modes tried after the preferred one, in order.
const FALLBACK_COMPUTE_TYPES: [ComputeType; 3] = [
    ComputeType::Int8,
    ComputeType::Float16,
    ComputeType::Float32,
];

/// Build the ordered list of compute types to attempt during initialization.
///
/// The preferred mode comes first; the fixed fallback sequence follows with
/// any mode already present skipped, so the list preserves first-occurrence
/// order and contains no duplicates.
pub fn candidate_compute_types(preferred: ComputeType) -> Vec<ComputeType> {
    let mut candidates = vec![preferred];
    for fallback in FALLBACK_COMPUTE_TYPES {
        if !candidates.contains(&fallback) {
            candidates.push(fallback);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_type_parsing() {
        assert_eq!(
            "int8_float16".parse::<ComputeType>().unwrap(),
            ComputeType::Int8Float16
        );
        assert_eq!("FLOAT32".parse::<ComputeType>().unwrap(), ComputeType::Float32);
        assert_eq!("fp16".parse::<ComputeType>().unwrap(), ComputeType::Float16);
        assert!("bfloat16".parse::<ComputeType>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for ct in [
            ComputeType::Int8,
            ComputeType::Int8Float16,
            ComputeType::Float16,
            ComputeType::Float32,
        ] {
            assert_eq!(ct.to_string().parse::<ComputeType>().unwrap(), ct);
        }
    }

    #[test]
    fn test_candidates_start_with_preferred() {
        let candidates = candidate_compute_types(ComputeType::Int8Float16);
        assert_eq!(
            candidates,
            vec![
                ComputeType::Int8Float16,
                ComputeType::Int8,
                ComputeType::Float16,
                ComputeType::Float32,
            ]
        );
    }

    #[test]
    fn test_candidates_no_duplicates_when_preferred_is_a_fallback() {
        for preferred in FALLBACK_COMPUTE_TYPES {
            let candidates = candidate_compute_types(preferred);
            assert_eq!(candidates[0], preferred);
            assert_eq!(candidates.len(), 3);
            for fallback in FALLBACK_COMPUTE_TYPES {
                assert_eq!(
                    candidates.iter().filter(|&&c| c == fallback).count(),
                    1,
                    "{} should appear exactly once",
                    fallback
                );
            }
        }
    }
}
