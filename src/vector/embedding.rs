//! Text encoders.
//!
//! The recommendation core treats the encoder as an opaque, injectable
//! text-to-vector function. It must be deterministic for identical input
//! within a model version and must always produce vectors of its declared
//! dimension. Failures surface as [`VectorError::EmbeddingFailed`] and are
//! never retried here.

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::vector::{VectorDimension, VectorError};

/// Text-to-vector capability consumed by the core.
///
/// Implementations must be thread-safe; the core calls them from worker
/// threads concurrently.
pub trait Encoder: Send + Sync {
    /// Encode a batch of texts, one vector per input, in input order.
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError>;

    /// Encode a single text.
    fn encode(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        self.encode_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| VectorError::EmbeddingFailed("encoder returned no vector".to_string()))
    }

    /// Dimension of the vectors this encoder produces.
    #[must_use]
    fn dimension(&self) -> VectorDimension;

    /// Human-readable model identifier, recorded alongside persisted data.
    fn model_name(&self) -> &str;
}

/// Parse a configuration string into a fastembed model.
///
/// Accepts the enum spelling used in settings files (`AllMiniLML6V2`) and
/// the Hugging Face style names (`all-minilm-l6-v2`), case-insensitively.
pub fn parse_embedding_model(name: &str) -> Result<EmbeddingModel, VectorError> {
    let normalized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "allminilml6v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "allminilml6v2q" => Ok(EmbeddingModel::AllMiniLML6V2Q),
        "allminilml12v2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "bgesmallenv15" => Ok(EmbeddingModel::BGESmallENV15),
        "bgebaseenv15" => Ok(EmbeddingModel::BGEBaseENV15),
        "paraphrasemlminilml12v2" => Ok(EmbeddingModel::ParaphraseMLMiniLML12V2),
        "multilinguale5small" => Ok(EmbeddingModel::MultilingualE5Small),
        _ => Err(VectorError::EmbeddingFailed(format!(
            "Unknown embedding model '{name}'. Supported: AllMiniLML6V2, AllMiniLML6V2Q, AllMiniLML12V2, BGESmallENV15, BGEBaseENV15, ParaphraseMLMiniLML12V2, MultilingualE5Small"
        ))),
    }
}

/// Canonical settings-file name for a model.
#[must_use]
pub fn model_to_string(model: &EmbeddingModel) -> String {
    match model {
        EmbeddingModel::AllMiniLML6V2 => "AllMiniLML6V2".to_string(),
        EmbeddingModel::AllMiniLML6V2Q => "AllMiniLML6V2Q".to_string(),
        EmbeddingModel::AllMiniLML12V2 => "AllMiniLML12V2".to_string(),
        EmbeddingModel::BGESmallENV15 => "BGESmallENV15".to_string(),
        EmbeddingModel::BGEBaseENV15 => "BGEBaseENV15".to_string(),
        EmbeddingModel::ParaphraseMLMiniLML12V2 => "ParaphraseMLMiniLML12V2".to_string(),
        EmbeddingModel::MultilingualE5Small => "MultilingualE5Small".to_string(),
        other => format!("{other:?}"),
    }
}

/// Default on-disk cache for downloaded models.
#[must_use]
pub fn default_models_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("folio")
        .join("models")
}

/// fastembed-backed encoder.
///
/// The ONNX session needs exclusive access while embedding, so the model
/// sits behind a mutex; concurrent callers serialize on it.
pub struct FastEmbedEncoder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimension: VectorDimension,
}

impl FastEmbedEncoder {
    /// Create an encoder for `model`, caching weights under `cache_dir`.
    ///
    /// The output dimension is probed with a test embedding so that models
    /// of any width work without a lookup table.
    ///
    /// # Errors
    /// Returns an error if the model fails to initialize or download.
    pub fn new(
        model: EmbeddingModel,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> Result<Self, VectorError> {
        let model_name = model_to_string(&model);
        let mut text_model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(show_download_progress),
        )
        .map_err(|e| VectorError::EmbeddingFailed(
            format!("Failed to initialize embedding model: {e}. Ensure you have internet connection for first-time model download")
        ))?;

        let probe = text_model
            .embed(vec!["probe"], None)
            .map_err(|e| VectorError::EmbeddingFailed(format!("Failed to probe model: {e}")))?;
        let width = probe.first().map(Vec::len).unwrap_or_default();
        let dimension = VectorDimension::new(width)?;

        tracing::info!("Loaded embedding model {model_name} ({width} dimensions)");

        Ok(Self {
            model: Mutex::new(text_model),
            model_name,
            dimension,
        })
    }

    /// Create an encoder from a settings-file model name.
    pub fn from_name(
        name: &str,
        cache_dir: Option<PathBuf>,
        show_download_progress: bool,
    ) -> Result<Self, VectorError> {
        let model = parse_embedding_model(name)?;
        Self::new(
            model,
            cache_dir.unwrap_or_else(default_models_dir),
            show_download_progress,
        )
    }
}

impl std::fmt::Debug for FastEmbedEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedEncoder")
            .field("model", &self.model_name)
            .field("dimension", &self.dimension.get())
            .finish()
    }
}

impl Encoder for FastEmbedEncoder {
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let embeddings = self
            .model
            .lock()
            .map_err(|_| {
                VectorError::EmbeddingFailed(
                    "Failed to acquire embedding model lock - model may be poisoned".to_string(),
                )
            })?
            .embed(texts.to_vec(), None)
            .map_err(|e| VectorError::EmbeddingFailed(format!("Failed to generate embeddings: {e}")))?;

        if embeddings.len() != texts.len() {
            return Err(VectorError::EmbeddingFailed(format!(
                "model returned {} embeddings for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }
        for embedding in &embeddings {
            self.dimension.validate_vector(embedding)?;
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Deterministic encoder for unit tests.
///
/// Texts are hashed token by token into a fixed number of buckets, so texts
/// sharing words point in similar directions. Texts containing `"FAIL"`
/// produce an encoding error.
#[cfg(test)]
pub struct MockEncoder {
    dimension: VectorDimension,
}

#[cfg(test)]
impl MockEncoder {
    /// Create a mock encoder with the given output width.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: VectorDimension::new(dimension).expect("non-zero test dimension"),
        }
    }
}

#[cfg(test)]
impl Encoder for MockEncoder {
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        let dim = self.dimension.get();
        texts
            .iter()
            .map(|text| {
                if text.contains("FAIL") {
                    return Err(VectorError::EmbeddingFailed("mock failure".to_string()));
                }
                let mut embedding = vec![0.0; dim];
                for token in text.split_whitespace() {
                    let bucket = token
                        .to_lowercase()
                        .bytes()
                        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                    embedding[bucket % dim] += 1.0;
                }
                if embedding.iter().all(|v| *v == 0.0) {
                    embedding[0] = 1.0;
                }
                Ok(embedding)
            })
            .collect()
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[test]
    fn test_parse_embedding_model() {
        assert!(matches!(
            parse_embedding_model("AllMiniLML6V2"),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_embedding_model("all-minilm-l6-v2"),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_embedding_model("bge-small-en-v1.5"),
            Ok(EmbeddingModel::BGESmallENV15)
        ));
        assert!(parse_embedding_model("word2vec").is_err());
    }

    #[test]
    fn test_model_name_round_trip() {
        let model = parse_embedding_model("MultilingualE5Small").unwrap();
        assert_eq!(model_to_string(&model), "MultilingualE5Small");
    }

    #[test]
    fn test_mock_encoder_is_deterministic() {
        let encoder = MockEncoder::new(16);
        let a = encoder.encode("a tale of two cities").unwrap();
        let b = encoder.encode("a tale of two cities").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_mock_encoder_shared_words_are_closer() {
        let encoder = MockEncoder::new(64);
        let dragon = encoder.encode("dragon fantasy quest").unwrap();
        let dragon2 = encoder.encode("dragon fantasy saga").unwrap();
        let finance = encoder.encode("quarterly finance report").unwrap();
        assert!(cosine_similarity(&dragon, &dragon2) > cosine_similarity(&dragon, &finance));
    }

    #[test]
    fn test_mock_encoder_failure() {
        let encoder = MockEncoder::new(8);
        assert!(matches!(
            encoder.encode("please FAIL"),
            Err(VectorError::EmbeddingFailed(_))
        ));
    }

    #[test]
    #[ignore = "Downloads 86MB model - run with --ignored for embedding tests"]
    fn test_fastembed_encoder_dimension() {
        let encoder = FastEmbedEncoder::from_name("AllMiniLML6V2", None, false).unwrap();
        assert_eq!(encoder.dimension().get(), 384);
        let vectors = encoder
            .encode_batch(&["The Hobbit", "The Lord of the Rings"])
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(cosine_similarity(&vectors[0], &vectors[1]) > 0.3);
    }
}
