//! Utterance encoders for the semantic router

use crate::core::config::EncoderKind;
use crate::core::gateway::LlmGateway;
use crate::routing::RouterError;
use async_trait::async_trait;
use std::sync::Arc;

/// Similarity threshold that suits OpenAI embedding models
const OPENAI_DEFAULT_THRESHOLD: f32 = 0.82;

/// Similarity threshold that suits hashed bag-of-words vectors
const HASHING_DEFAULT_THRESHOLD: f32 = 0.3;

/// Dimension of hashed feature vectors
const HASHING_DIMENSIONS: usize = 512;

/// Inputs per embeddings request
const EMBEDDING_BATCH_SIZE: usize = 256;

/// Turns texts into vectors comparable by cosine similarity
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encoder family, recorded in layer files
    fn kind(&self) -> EncoderKind;

    /// Model or scheme name; cached embeddings are reused only when it matches
    fn name(&self) -> &str;

    fn default_threshold(&self) -> f32;

    async fn encode(&self, docs: &[String]) -> Result<Vec<Vec<f32>>, RouterError>;
}

/// Encoder backed by an embeddings model reached through the gateway
pub struct OpenAIEncoder {
    gateway: Arc<LlmGateway>,
    model: String,
}

impl OpenAIEncoder {
    pub fn new(gateway: Arc<LlmGateway>, model: String) -> Self {
        Self { gateway, model }
    }
}

#[async_trait]
impl Encoder for OpenAIEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::OpenAI
    }

    fn name(&self) -> &str {
        &self.model
    }

    fn default_threshold(&self) -> f32 {
        OPENAI_DEFAULT_THRESHOLD
    }

    async fn encode(&self, docs: &[String]) -> Result<Vec<Vec<f32>>, RouterError> {
        let mut vectors = Vec::with_capacity(docs.len());
        for batch in docs.chunks(EMBEDDING_BATCH_SIZE) {
            vectors.extend(self.gateway.embed(&self.model, batch).await?);
        }
        Ok(vectors)
    }
}

/// Offline encoder: word unigrams and bigrams hashed into a fixed vector
///
/// Deterministic across runs, so layers encoded with it can be cached.
pub struct HashingEncoder {
    dimensions: usize,
    name: String,
}

impl HashingEncoder {
    pub fn new() -> Self {
        Self::with_dimensions(HASHING_DIMENSIONS)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            name: format!("hashing-{}", dimensions.max(1)),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }

    /// FNV-1a; stable across platforms and compiler versions
    fn hash(feature: &str) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in feature.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash
    }

    pub fn encode_one(&self, text: &str) -> Vec<f32> {
        let tokens = Self::tokenize(text);
        let mut vector = vec![0.0f32; self.dimensions];

        let bigrams = tokens.windows(2).map(|w| format!("{} {}", w[0], w[1]));
        for feature in tokens.iter().cloned().chain(bigrams) {
            let hash = Self::hash(&feature);
            let bucket = (hash % self.dimensions as u64) as usize;
            // The top bit picks the sign so collisions tend to cancel out
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Encoder for HashingEncoder {
    fn kind(&self) -> EncoderKind {
        EncoderKind::Hashing
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn default_threshold(&self) -> f32 {
        HASHING_DEFAULT_THRESHOLD
    }

    async fn encode(&self, docs: &[String]) -> Result<Vec<Vec<f32>>, RouterError> {
        Ok(docs.iter().map(|d| self.encode_one(d)).collect())
    }
}

/// Build the encoder selected by configuration
pub fn build_encoder(
    kind: EncoderKind,
    gateway: Arc<LlmGateway>,
    model: &str,
) -> Arc<dyn Encoder> {
    match kind {
        EncoderKind::OpenAI => Arc::new(OpenAIEncoder::new(gateway, model.to_string())),
        EncoderKind::Hashing => Arc::new(HashingEncoder::new()),
    }
}

/// Cosine similarity; zero vectors and length mismatches score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
