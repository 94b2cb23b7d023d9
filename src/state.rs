//! # Application State
//!
//! Shared state handed to every request handler: the immutable configuration
//! snapshot, the resolved inference device, the lazy model provider and the
//! request counters.
//!
//! ## Sharing Model:
//! `AppState` is cheap to clone; the mutable pieces live behind `Arc`s. The
//! counters use a std `RwLock` (held only for quick increments), while the
//! model provider carries its own async locking for the one slow path in the
//! system, first-time model construction.

use crate::config::AppConfig;
use crate::transcription::{LoadError, ModelProvider, WhisperModel};
use anyhow::Result;
use candle_core::Device;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    config: AppConfig,

    /// Inference device, resolved once at startup
    device: Device,

    /// Lazily-initialized engine handle, shared by every request
    provider: Arc<ModelProvider<WhisperModel>>,

    metrics: Arc<RwLock<AppMetrics>>,
    start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Transcriptions currently being processed
    pub in_flight_transcriptions: u32,

    /// Per-endpoint request statistics, keyed by "METHOD /path"
    pub endpoints: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        let preferred = config.preferred_compute()?;
        let device = config.device_preference()?.resolve();
        Ok(Self {
            config,
            device,
            provider: Arc::new(ModelProvider::new(preferred)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Forced language code, or `None` for auto-detection.
    pub fn forced_language(&self) -> Option<&str> {
        self.config.whisper.language.as_deref()
    }

    pub fn provider(&self) -> &ModelProvider<WhisperModel> {
        &self.provider
    }

    /// The shared engine handle, constructed on first use.
    ///
    /// Concurrent callers during the first construction suspend until the
    /// winning caller finishes; afterwards this is a lock-free read.
    pub async fn model(&self) -> Result<Arc<WhisperModel>, LoadError> {
        let model_id = self.config.whisper.model.clone();
        let device = self.device.clone();
        self.provider
            .get_or_init(move |compute_type| {
                let model_id = model_id.clone();
                let device = device.clone();
                async move { WhisperModel::load(&model_id, device, compute_type).await }
            })
            .await
    }

    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }
        let entry = metrics.endpoints.entry(endpoint.to_string()).or_default();
        entry.request_count += 1;
        entry.total_duration_ms += duration_ms;
        if is_error {
            entry.error_count += 1;
        }
    }

    pub fn transcription_started(&self) {
        self.metrics.write().unwrap().in_flight_transcriptions += 1;
    }

    pub fn transcription_finished(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.in_flight_transcriptions > 0 {
            metrics.in_flight_transcriptions -= 1;
        }
    }

    /// Consistent copy of the counters for the metrics endpoint.
    pub fn metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            in_flight_transcriptions: metrics.in_flight_transcriptions,
            endpoints: metrics.endpoints.clone(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::new(AppConfig::default()).unwrap()
    }

    #[test]
    fn test_request_counters() {
        let state = test_state();
        state.record_request("POST /transcribe", 120, false);
        state.record_request("POST /transcribe", 80, true);
        state.record_request("GET /healthz", 1, false);

        let snapshot = state.metrics_snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.error_count, 1);

        let transcribe = &snapshot.endpoints["POST /transcribe"];
        assert_eq!(transcribe.request_count, 2);
        assert_eq!(transcribe.error_count, 1);
        assert_eq!(transcribe.average_duration_ms(), 100.0);
    }

    #[test]
    fn test_in_flight_counter_does_not_underflow() {
        let state = test_state();
        state.transcription_finished();
        assert_eq!(state.metrics_snapshot().in_flight_transcriptions, 0);
        state.transcription_started();
        state.transcription_started();
        state.transcription_finished();
        assert_eq!(state.metrics_snapshot().in_flight_transcriptions, 1);
    }

    #[tokio::test]
    async fn test_model_starts_uninitialized() {
        let state = test_state();
        assert!(!state.provider().initialized().await);
    }
}
