//! Embedding strategies and vector utilities.
//!
//! Converts an [`AssignmentContext`] into a fixed-length, unit-normalized
//! vector. Two strategies share the same vector space:
//!
//! | Strategy | When used |
//! |----------|-----------|
//! | Neural ([`NeuralBackend`]) | A backend is configured and reports ready |
//! | Pseudo ([`PseudoEmbedder`]) | Always available; deterministic fallback |
//!
//! Concrete neural backends (fastembed, tract) live in the `traq-attribution`
//! app crate. This module also holds the pure helpers for vector
//! serialization and similarity computation.

use std::sync::Arc;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::context::AssignmentContext;

/// Dimensionality shared by every strategy.
pub const EMBEDDING_DIMS: usize = 384;

/// Window titles are truncated to this many characters before embedding.
pub const TITLE_MAX_CHARS: usize = 200;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A strategy that turns text into a vector.
pub trait EmbeddingStrategy: Send + Sync {
    /// Short identifier used in logs (e.g. `"pseudo"`, `"fastembed"`).
    fn name(&self) -> &str;
    /// Returns the vector dimensionality.
    fn dims(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// A model-backed strategy that may not be usable yet (model not
/// downloaded, runtime failed to load).
pub trait NeuralBackend: EmbeddingStrategy {
    fn is_ready(&self) -> bool;
}

/// Build the text that gets embedded for a context.
///
/// Present fields become `field:value` tokens in a fixed order, lower-cased
/// and joined with single spaces. An empty context yields an empty string.
///
/// ```rust
/// use traq_attribution_core::context::AssignmentContext;
/// use traq_attribution_core::embedding::build_context_text;
///
/// let ctx = AssignmentContext {
///     app_name: Some("Code".into()),
///     git_repo: Some("traq".into()),
///     ..Default::default()
/// };
/// assert_eq!(build_context_text(&ctx), "app:code repo:traq");
/// ```
pub fn build_context_text(ctx: &AssignmentContext) -> String {
    let title = ctx
        .window_title
        .as_deref()
        .map(|t| t.chars().take(TITLE_MAX_CHARS).collect::<String>());

    let fields = [
        ("app", ctx.app_name.as_deref()),
        ("title", title.as_deref()),
        ("repo", ctx.git_repo.as_deref()),
        ("branch", ctx.git_branch.as_deref()),
        ("domain", ctx.domain.as_deref()),
        ("file", ctx.file_path.as_deref()),
    ];

    fields
        .iter()
        .filter_map(|(label, value)| {
            value
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}:{}", label, v.to_lowercase()))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex digest of the context text, stored next to each embedding.
pub fn context_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn scatter(embedding: &mut [f32], token: &str, rounds: u64, damping: f32) {
    let dims = embedding.len() as u64;
    let mut hash = fnv1a_64(token.as_bytes());
    for round in 0..rounds {
        let idx = (hash % dims) as usize;
        hash = hash.wrapping_mul(31).wrapping_add(round);
        let val = ((hash >> 8) & 0xFF) as f32 / 255.0;
        embedding[idx] += (val - 0.5) * damping;
    }
}

/// Deterministic hash-based embedding.
///
/// Each lower-cased word scatters 8 hashed contributions, each adjacent
/// word pair 4 damped ones. The result is L2-normalized; text without
/// words produces the zero vector.
pub fn pseudo_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dims];
    if dims == 0 {
        return embedding;
    }

    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    for word in &words {
        scatter(&mut embedding, word, 8, 1.0);
    }
    for pair in words.windows(2) {
        let bigram = format!("{} {}", pair[0], pair[1]);
        scatter(&mut embedding, &bigram, 4, 0.5);
    }

    normalize_l2(embedding)
}

/// Scale a vector to unit length. The zero vector is returned unchanged.
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Attention-masked mean over token-level model outputs.
///
/// `hidden` is row-major `[seq_len, hidden_size]`; positions with a zero
/// mask are ignored.
pub fn mean_pool(hidden: &[f32], mask: &[i64], hidden_size: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden_size];
    if hidden_size == 0 {
        return pooled;
    }
    let mut count = 0.0f32;
    for (token, row) in hidden.chunks_exact(hidden_size).enumerate() {
        if mask.get(token).copied().unwrap_or(0) == 0 {
            continue;
        }
        for (acc, v) in pooled.iter_mut().zip(row) {
            *acc += v;
        }
        count += 1.0;
    }
    if count > 0.0 {
        for acc in &mut pooled {
            *acc /= count;
        }
    }
    pooled
}

/// The always-available deterministic strategy.
#[derive(Debug, Clone)]
pub struct PseudoEmbedder {
    dims: usize,
}

impl PseudoEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for PseudoEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMS)
    }
}

impl EmbeddingStrategy for PseudoEmbedder {
    fn name(&self) -> &str {
        "pseudo"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(pseudo_embedding(text, self.dims))
    }
}

/// Strategy selector: neural first when ready, pseudo otherwise.
///
/// Any neural failure, including a vector of the wrong length, falls
/// through silently to the deterministic strategy so both paths always
/// land in the same space.
#[derive(Clone)]
pub struct Embedder {
    neural: Option<Arc<dyn NeuralBackend>>,
    fallback: PseudoEmbedder,
}

impl Embedder {
    pub fn new(neural: Option<Arc<dyn NeuralBackend>>, dims: usize) -> Self {
        Self {
            neural,
            fallback: PseudoEmbedder::new(dims),
        }
    }

    /// Deterministic-only embedder.
    pub fn pseudo(dims: usize) -> Self {
        Self::new(None, dims)
    }

    pub fn dims(&self) -> usize {
        self.fallback.dims()
    }

    /// Whether the next call would run model inference.
    pub fn has_ready_neural(&self) -> bool {
        self.neural.as_ref().is_some_and(|b| b.is_ready())
    }

    /// Name of the strategy that would be tried first right now.
    pub fn active_strategy(&self) -> &str {
        match &self.neural {
            Some(backend) if backend.is_ready() => backend.name(),
            _ => self.fallback.name(),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        if text.is_empty() {
            return vec![0.0; self.dims()];
        }
        if let Some(backend) = self.neural.as_ref().filter(|b| b.is_ready()) {
            match try_neural(backend.as_ref(), text, self.dims()) {
                Ok(v) => return v,
                Err(e) => {
                    tracing::debug!(backend = backend.name(), error = %e, "neural embedding failed, using pseudo");
                }
            }
        }
        pseudo_embedding(text, self.dims())
    }

    pub fn embed(&self, ctx: &AssignmentContext) -> Vec<f32> {
        self.embed_text(&build_context_text(ctx))
    }
}

fn try_neural(backend: &dyn NeuralBackend, text: &str, dims: usize) -> Result<Vec<f32>> {
    let v = backend.embed(text)?;
    if v.len() != dims {
        bail!("expected {} dims, got {}", dims, v.len());
    }
    Ok(normalize_l2(v))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes, no header).
///
/// ```rust
/// use traq_attribution_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), Some(v));
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Returns `None` when the length is not a multiple of 4.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

/// Compute cosine similarity between two embedding vectors.
///
/// Accumulates in `f64`. Returns `0.0` for empty vectors, vectors of
/// different lengths, or a zero-norm operand, so the result is never NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBackend {
        ready: bool,
        out: Vec<f32>,
    }

    impl EmbeddingStrategy for FixedBackend {
        fn name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.out.len()
        }
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.out.clone())
        }
    }

    impl NeuralBackend for FixedBackend {
        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    fn ctx(app: &str, title: &str) -> AssignmentContext {
        AssignmentContext {
            app_name: Some(app.into()),
            window_title: Some(title.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob_to_vec(&blob), Some(vec));
    }

    #[test]
    fn test_blob_invalid_length() {
        assert_eq!(blob_to_vec(&[0u8, 1, 2]), None);
        assert_eq!(blob_to_vec(&[]), Some(vec![]));
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_context_text_order_and_truncation() {
        let long_title = "x".repeat(300);
        let ctx = AssignmentContext {
            app_name: Some("Code".into()),
            window_title: Some(long_title),
            git_repo: Some("Traq".into()),
            git_branch: Some("main".into()),
            domain: Some("docs.rs".into()),
            file_path: Some("/src/Main.go".into()),
            url: Some("https://ignored.example".into()),
        };
        let text = build_context_text(&ctx);
        let expected = format!(
            "app:code title:{} repo:traq branch:main domain:docs.rs file:/src/main.go",
            "x".repeat(TITLE_MAX_CHARS)
        );
        assert_eq!(text, expected);
        assert_eq!(build_context_text(&AssignmentContext::default()), "");
    }

    #[test]
    fn test_pseudo_embedding_is_deterministic_and_normalized() {
        let a = pseudo_embedding("app:code title:main.go repo:traq", EMBEDDING_DIMS);
        let b = pseudo_embedding("app:code title:main.go repo:traq", EMBEDDING_DIMS);
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMS);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(cosine_similarity(&a, &b) >= 0.99);
    }

    #[test]
    fn test_pseudo_embedding_empty_is_zero() {
        let v = pseudo_embedding("   ", 16);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_unrelated_contexts_are_not_similar() {
        let embedder = Embedder::pseudo(EMBEDDING_DIMS);
        let code = embedder.embed(&ctx("Code", "main.go - traq"));
        let video = embedder.embed(&ctx("Firefox", "YouTube"));
        assert!(cosine_similarity(&code, &video) < 0.95);
    }

    #[test]
    fn test_similar_contexts_score_higher() {
        let embedder = Embedder::pseudo(EMBEDDING_DIMS);
        let with_repo = |title: &str, file: &str| AssignmentContext {
            app_name: Some("Code".into()),
            window_title: Some(title.into()),
            git_repo: Some("traq".into()),
            file_path: Some(file.into()),
            ..Default::default()
        };
        let a = embedder.embed(&with_repo("main.go - traq", "/home/u/traq/main.go"));
        let b = embedder.embed(&with_repo("main.go - traq", "/home/u/traq/app.go"));
        let c = embedder.embed(&ctx("Firefox", "YouTube"));
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_mean_pool_respects_mask() {
        let hidden = vec![1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
        let pooled = mean_pool(&hidden, &[1, 1, 0], 2);
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn test_embedder_prefers_ready_backend() {
        let backend = Arc::new(FixedBackend {
            ready: true,
            out: vec![3.0, 4.0],
        });
        let embedder = Embedder::new(Some(backend), 2);
        assert_eq!(embedder.active_strategy(), "fixed");
        let v = embedder.embed_text("anything");
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_embedder_falls_back_on_wrong_dims_or_not_ready() {
        let wrong = Arc::new(FixedBackend {
            ready: true,
            out: vec![1.0; 3],
        });
        let embedder = Embedder::new(Some(wrong), 8);
        assert_eq!(embedder.embed_text("hello world"), pseudo_embedding("hello world", 8));

        let idle = Arc::new(FixedBackend {
            ready: false,
            out: vec![1.0; 8],
        });
        let embedder = Embedder::new(Some(idle), 8);
        assert_eq!(embedder.active_strategy(), "pseudo");
        assert_eq!(embedder.embed_text("hello world"), pseudo_embedding("hello world", 8));
    }

    #[test]
    fn test_context_hash_is_stable() {
        assert_eq!(context_hash("app:code"), context_hash("app:code"));
        assert_ne!(context_hash("app:code"), context_hash("app:vim"));
        assert_eq!(context_hash("").len(), 64);
    }
}
