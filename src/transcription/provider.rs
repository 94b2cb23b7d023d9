//! # Model Provider
//!
//! Process-wide, lazily-created handle to the transcription engine.
//!
//! ## Initialization Protocol:
//! The handle starts empty. The first caller takes the init lock, re-checks
//! the handle (another caller may have won the race), then walks the compute
//! type candidate list until one construction succeeds. Later callers find
//! the stored handle on the lock-free read path and never touch the lock
//! again.
//!
//! ## Fallback Rules:
//! A construction attempt rejected as an invalid configuration moves on to
//! the next candidate. Any other failure (network, corrupt weights) aborts
//! initialization immediately. When every candidate is rejected, the last
//! rejection is surfaced.

use crate::transcription::compute::{candidate_compute_types, ComputeType};
use crate::transcription::model::LoadError;
use anyhow::anyhow;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub struct ModelProvider<T> {
    /// Precision modes to attempt, preferred mode first
    candidates: Vec<ComputeType>,

    /// The singleton handle, set exactly once on successful construction
    handle: RwLock<Option<Arc<T>>>,

    /// Held only while a first-time construction is in flight
    init_lock: Mutex<()>,
}

impl<T> ModelProvider<T> {
    pub fn new(preferred: ComputeType) -> Self {
        Self {
            candidates: candidate_compute_types(preferred),
            handle: RwLock::new(None),
            init_lock: Mutex::new(()),
        }
    }

    /// Whether a handle has been successfully constructed.
    pub async fn initialized(&self) -> bool {
        self.handle.read().await.is_some()
    }

    /// Return the shared handle, constructing it on first use.
    ///
    /// `build` is invoked once per candidate precision until it succeeds.
    /// Concurrent callers during the first construction suspend on the init
    /// lock and then observe the stored handle without building again.
    pub async fn get_or_init<F, Fut>(&self, mut build: F) -> Result<Arc<T>, LoadError>
    where
        F: FnMut(ComputeType) -> Fut,
        Fut: Future<Output = Result<T, LoadError>>,
    {
        if let Some(handle) = self.handle.read().await.as_ref() {
            return Ok(handle.clone());
        }

        let _init = self.init_lock.lock().await;

        // Re-check: another caller may have finished construction while we
        // waited for the lock.
        if let Some(handle) = self.handle.read().await.as_ref() {
            return Ok(handle.clone());
        }

        let mut last_rejection: Option<LoadError> = None;
        for &compute_type in &self.candidates {
            match build(compute_type).await {
                Ok(model) => {
                    let handle = Arc::new(model);
                    *self.handle.write().await = Some(handle.clone());
                    return Ok(handle);
                }
                Err(rejection @ LoadError::InvalidComputeType { .. }) => {
                    tracing::warn!("{}", rejection);
                    last_rejection = Some(rejection);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        Err(last_rejection
            .unwrap_or_else(|| LoadError::Other(anyhow!("No compute type candidates to try"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn rejected(compute_type: ComputeType) -> LoadError {
        LoadError::InvalidComputeType {
            compute_type,
            reason: "unsupported in test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_successful_candidate_wins() {
        let provider = ModelProvider::<ComputeType>::new(ComputeType::Int8Float16);
        let attempts = Arc::new(StdMutex::new(Vec::new()));

        let result = provider
            .get_or_init(|ct| {
                let attempts = attempts.clone();
                async move {
                    attempts.lock().unwrap().push(ct);
                    if ct == ComputeType::Float16 {
                        Ok(ct)
                    } else {
                        Err(rejected(ct))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(*result, ComputeType::Float16);
        // The two candidates before the success were attempted; float32,
        // which comes after it, was not.
        assert_eq!(
            *attempts.lock().unwrap(),
            vec![
                ComputeType::Int8Float16,
                ComputeType::Int8,
                ComputeType::Float16,
            ]
        );
        assert!(provider.initialized().await);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_rejection() {
        let provider = ModelProvider::<()>::new(ComputeType::Int8);

        let err = provider
            .get_or_init(|ct| async move { Err::<(), _>(rejected(ct)) })
            .await
            .unwrap_err();

        match err {
            LoadError::InvalidComputeType { compute_type, .. } => {
                assert_eq!(compute_type, ComputeType::Float32);
            }
            other => panic!("expected rejection, got {}", other),
        }
        assert!(!provider.initialized().await);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_fallback() {
        let provider = ModelProvider::<()>::new(ComputeType::Int8);
        let attempts = Arc::new(AtomicUsize::new(0));

        let err = provider
            .get_or_init(|ct| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if ct == ComputeType::Int8 {
                        Err::<(), _>(rejected(ct))
                    } else {
                        Err(LoadError::Other(anyhow!("weights corrupted")))
                    }
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::Other(_)));
        // int8 was rejected, float16 failed hard, float32 never attempted
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!provider.initialized().await);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_once() {
        let provider = ModelProvider::<u64>::new(ComputeType::Int8);
        let builds = Arc::new(AtomicUsize::new(0));

        let build = |builds: Arc<AtomicUsize>| {
            move |_ct| {
                let builds = builds.clone();
                async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    // Keep construction in flight long enough for the other
                    // callers to pile up on the init lock.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(42u64)
                }
            }
        };

        let (a, b, c) = tokio::join!(
            provider.get_or_init(build(builds.clone())),
            provider.get_or_init(build(builds.clone())),
            provider.get_or_init(build(builds.clone())),
        );

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[tokio::test]
    async fn test_second_call_reuses_handle_without_building() {
        let provider = ModelProvider::<u64>::new(ComputeType::Float32);
        let builds = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let builds = builds.clone();
            provider
                .get_or_init(|_ct| {
                    let builds = builds.clone();
                    async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        Ok(1u64)
                    }
                })
                .await
                .unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
