//! Neural embedding backends and embedder construction.
//!
//! The deterministic pseudo-embedding lives in the core crate and is
//! always available. This module adds optional model-backed
//! [`NeuralBackend`]s behind cargo features:
//!
//! | Feature | Backend |
//! |---------|---------|
//! | `local-embeddings-fastembed` | [`FastembedBackend`] (bundled ONNX Runtime) |
//! | `local-embeddings-tract` | `TractBackend` (pure Rust, musl / Intel Mac) |
//!
//! Use [`build_embedder`] to get an [`Embedder`] for the configuration:
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use traq_attribution::config::EmbeddingConfig;
//! use traq_attribution::embedding::build_embedder;
//!
//! let embedder = build_embedder(&EmbeddingConfig::default()).await?; // backend = "pseudo"
//! assert_eq!(embedder.active_strategy(), "pseudo");
//! # Ok(())
//! # }
//! ```
//!
//! A backend that fails to load is kept but reports not ready, so the
//! engine keeps working on pseudo-embeddings.

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use anyhow::{bail, Result};
use std::sync::Arc;

use traq_attribution_core::embedding::{Embedder, NeuralBackend};

use crate::config::EmbeddingConfig;

#[cfg(feature = "local-embeddings-tract")]
pub use local_tract::TractBackend;

/// Create the configured neural backend, if any.
///
/// # Supported Backends
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"pseudo"` | none (deterministic only) |
/// | `"local"` | fastembed or tract, see features |
pub async fn create_backend(config: &EmbeddingConfig) -> Result<Option<Arc<dyn NeuralBackend>>> {
    match config.backend.as_str() {
        "pseudo" => Ok(None),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Some(Arc::new(FastembedBackend::load(config).await?))),
        #[cfg(all(feature = "local-embeddings-tract", not(feature = "local-embeddings-fastembed")))]
        "local" => Ok(Some(Arc::new(TractBackend::load(config).await?))),
        #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
        "local" => bail!(
            "Local embedding backend requires one of: --features local-embeddings-fastembed, --features local-embeddings-tract"
        ),
        other => bail!("Unknown embedding backend: {}", other),
    }
}

/// Build the strategy selector used by the assignment service.
pub async fn build_embedder(config: &EmbeddingConfig) -> Result<Embedder> {
    let backend = create_backend(config).await?;
    if let Some(b) = &backend {
        tracing::info!(backend = b.name(), ready = b.is_ready(), "neural embedding backend configured");
    }
    Ok(Embedder::new(backend, config.dims))
}

// ============ Async Entry Points ============

/// Embed a batch of texts, running model inference on the blocking pool.
///
/// Pseudo-only embedders run inline. If the blocking task fails the batch
/// falls back to pseudo-embeddings, same as a failed model call.
pub async fn embed_batch(embedder: &Embedder, texts: Vec<String>) -> Vec<Vec<f32>> {
    if !embedder.has_ready_neural() {
        return texts.iter().map(|t| embedder.embed_text(t)).collect();
    }

    let worker = embedder.clone();
    let pending = texts.clone();
    match tokio::task::spawn_blocking(move || {
        pending.iter().map(|t| worker.embed_text(t)).collect::<Vec<_>>()
    })
    .await
    {
        Ok(vectors) => vectors,
        Err(e) => {
            tracing::warn!(error = %e, "embedding task failed; using pseudo-embeddings");
            let fallback = Embedder::pseudo(embedder.dims());
            texts.iter().map(|t| fallback.embed_text(t)).collect()
        }
    }
}

/// Embed one text off the async runtime. See [`embed_batch`].
pub async fn embed_text(embedder: &Embedder, text: &str) -> Vec<f32> {
    embed_batch(embedder, vec![text.to_string()])
        .await
        .pop()
        .unwrap_or_else(|| vec![0.0; embedder.dims()])
}

// ============ Fastembed Backend ============

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported 384-dim models: \
             all-minilm-l6-v2, bge-small-en-v1.5, multilingual-e5-small",
            other
        ),
    }
}

/// Local inference through fastembed (ONNX Runtime, downloaded and cached
/// on first use).
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastembedBackend {
    dims: usize,
    model: std::sync::Mutex<Option<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedBackend {
    /// Initialize the model off the async runtime. An unknown model name is
    /// an error; a model that fails to load yields a backend that is not
    /// ready.
    pub async fn load(config: &EmbeddingConfig) -> Result<Self> {
        let fastembed_model = config_to_fastembed_model(&config.model)?;
        let max_length = config.max_seq_len;

        let model = tokio::task::spawn_blocking(move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model)
                    .with_max_length(max_length)
                    .with_show_download_progress(false),
            )
        })
        .await?;

        let model = match model {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(error = %e, "failed to initialize fastembed model; using pseudo-embeddings");
                None
            }
        };

        Ok(Self {
            dims: config.dims,
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl traq_attribution_core::embedding::EmbeddingStrategy for FastembedBackend {
    fn name(&self) -> &str {
        "fastembed"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("fastembed model lock poisoned"))?;
        let model = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("fastembed model not loaded"))?;
        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl NeuralBackend for FastembedBackend {
    fn is_ready(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pseudo_backend_has_no_neural_part() {
        let config = EmbeddingConfig::default();
        assert!(create_backend(&config).await.unwrap().is_none());
        let embedder = build_embedder(&config).await.unwrap();
        assert_eq!(embedder.active_strategy(), "pseudo");
        assert_eq!(embedder.dims(), config.dims);
    }

    struct ThreadRecorder {
        threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl traq_attribution_core::embedding::EmbeddingStrategy for ThreadRecorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn dims(&self) -> usize {
            4
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            self.threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    impl NeuralBackend for ThreadRecorder {
        fn is_ready(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_neural_inference_runs_off_the_runtime_thread() {
        let backend = Arc::new(ThreadRecorder {
            threads: std::sync::Mutex::new(Vec::new()),
        });
        let neural: Arc<dyn NeuralBackend> = backend.clone();
        let embedder = Embedder::new(Some(neural), 4);

        let vectors = embed_batch(&embedder, vec!["app:code".into(), "repo:traq".into()]).await;
        assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0, 0.0]; 2]);
        assert_eq!(embed_text(&embedder, "app:code").await, vec![1.0, 0.0, 0.0, 0.0]);

        let runtime_thread = std::thread::current().id();
        let threads = backend.threads.lock().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|t| *t != runtime_thread));
    }

    #[tokio::test]
    async fn test_pseudo_batch_matches_inline_embedding() {
        let embedder = Embedder::pseudo(16);
        let vectors = embed_batch(&embedder, vec!["app:code".into(), String::new()]).await;
        assert_eq!(vectors[0], embedder.embed_text("app:code"));
        assert_eq!(vectors[1], vec![0.0; 16]);
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let config = EmbeddingConfig {
            backend: "openai".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_backend(&config).await.is_err());
    }

    #[cfg(not(any(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract")))]
    #[tokio::test]
    async fn test_local_without_features_explains() {
        let config = EmbeddingConfig {
            backend: "local".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = create_backend(&config).await.err().unwrap().to_string();
        assert!(err.contains("local-embeddings-fastembed"));
    }
}
