//! Tract-based local embedding backend (fallback for musl and Intel Mac).
//!
//! Pure-Rust path: loads the ONNX model with tract-onnx and tokenizes with
//! the tokenizers crate. Inputs are padded to a fixed sequence length,
//! token outputs are mean-pooled under the attention mask, then
//! L2-normalized. No ONNX Runtime or system deps.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::{anyhow, bail, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tract_onnx::prelude::*;

use traq_attribution_core::embedding::{mean_pool, normalize_l2, EmbeddingStrategy, NeuralBackend};

use crate::config::EmbeddingConfig;

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ALL_MINILM_DIMS: usize = 384;

type RunFn = Box<dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send>;

/// Model manifest: name -> (onnx path in repo, tokenizer path in repo, dims).
fn model_manifest(model_name: &str) -> Result<(&'static str, &'static str, usize)> {
    match model_name {
        "all-minilm-l6-v2" => Ok(("onnx/model.onnx", "tokenizer.json", ALL_MINILM_DIMS)),
        _ => bail!(
            "Tract backend supports only all-minilm-l6-v2 for now. Requested: '{}'",
            model_name
        ),
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base).join(".cache").join("traq").join("models");
    std::fs::create_dir_all(&dir).map_err(|e| anyhow!("Create cache dir: {}", e))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo,
        path.replace(' ', "%20")
    );
    tracing::info!(%url, "downloading embedding model file");
    let resp = reqwest::blocking::get(&url)
        .map_err(|e| anyhow!("Download {}: {}", url, e))?
        .error_for_status()
        .map_err(|e| anyhow!("Download {}: {}", url, e))?;
    let bytes = resp.bytes().map_err(|e| anyhow!("Read body: {}", e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| anyhow!("Create cache parent: {}", e))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| anyhow!("Write cache: {}", e))?;
    Ok(())
}

/// Ensure model and tokenizer are in cache; return (onnx path, tokenizer path).
fn ensure_cached(model_name: &str) -> Result<(PathBuf, PathBuf)> {
    let (onnx_rel, tokenizer_rel, _) = model_manifest(model_name)?;
    let model_dir = cache_dir()?.join(model_name);
    let onnx_path = model_dir.join(onnx_rel);
    let tokenizer_path = model_dir.join(tokenizer_rel);
    download_to_cache(ALL_MINILM_REPO, onnx_rel, &onnx_path)?;
    download_to_cache(ALL_MINILM_REPO, tokenizer_rel, &tokenizer_path)?;
    Ok((onnx_path, tokenizer_path))
}

struct LoadedModel {
    tokenizer: tokenizers::Tokenizer,
    run: RunFn,
}

fn load_model(model_name: &str) -> Result<LoadedModel> {
    let (onnx_path, tokenizer_path) = ensure_cached(model_name)?;

    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow!("Load tokenizer: {}", e))?;

    let plan = tract_onnx::onnx()
        .model_for_path(onnx_path)
        .map_err(|e| anyhow!("Load ONNX: {}", e))?
        .into_optimized()
        .map_err(|e| anyhow!("Optimize: {}", e))?
        .into_runnable()
        .map_err(|e| anyhow!("Build tract runnable: {}", e))?;

    Ok(LoadedModel {
        tokenizer,
        run: Box::new(move |inputs| plan.run(inputs)),
    })
}

/// Sentence embeddings via tract. Loaded once; not ready if loading failed.
pub struct TractBackend {
    dims: usize,
    max_seq_len: usize,
    model: Option<Mutex<LoadedModel>>,
}

impl TractBackend {
    pub async fn load(config: &EmbeddingConfig) -> Result<Self> {
        let (_, _, dims) = model_manifest(&config.model)?;
        let model_name = config.model.clone();

        let loaded = tokio::task::spawn_blocking(move || load_model(&model_name)).await?;
        let model = match loaded {
            Ok(m) => Some(Mutex::new(m)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load tract model; using pseudo-embeddings");
                None
            }
        };

        Ok(Self {
            dims,
            max_seq_len: config.max_seq_len,
            model,
        })
    }
}

impl EmbeddingStrategy for TractBackend {
    fn name(&self) -> &str {
        "tract"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract model not loaded"))?
            .lock()
            .map_err(|_| anyhow!("tract model lock poisoned"))?;

        let encoding = model
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenize: {}", e))?;

        // Fixed-length input: truncate, then pad with id 0 / mask 0.
        let seq_len = self.max_seq_len;
        let mut input_ids = vec![0i64; seq_len];
        let mut attention_mask = vec![0i64; seq_len];
        for (j, &id) in encoding.get_ids().iter().take(seq_len).enumerate() {
            input_ids[j] = id as i64;
            attention_mask[j] = 1;
        }
        let token_type_ids = vec![0i64; seq_len];

        let to_tensor = |v: Vec<i64>| -> Result<Tensor> {
            Ok(ndarray::Array2::from_shape_vec((1, seq_len), v)
                .map_err(|e| anyhow!("Input shape: {}", e))?
                .into())
        };
        let inputs: TVec<TValue> = tvec!(
            to_tensor(input_ids)?.into(),
            to_tensor(attention_mask.clone())?.into(),
            to_tensor(token_type_ids)?.into()
        );

        let result = (model.run)(inputs)?;
        let output = result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No output tensor"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| anyhow!("Output to array: {}", e))?;

        // [1, seq_len, hidden] token states, or [1, hidden] if already pooled.
        let shape = view.shape().to_vec();
        let flat: Vec<f32> = view.iter().copied().collect();
        let pooled = match shape.as_slice() {
            [1, hidden] => flat[..*hidden].to_vec(),
            [1, _, hidden] => mean_pool(&flat, &attention_mask, *hidden),
            other => bail!("Unexpected output shape: {:?}", other),
        };
        Ok(normalize_l2(pooled))
    }
}

impl NeuralBackend for TractBackend {
    fn is_ready(&self) -> bool {
        self.model.is_some()
    }
}
