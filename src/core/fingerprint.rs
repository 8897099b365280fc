use image::GenericImageView;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::core::exif::{EmbeddedMetadata, MetadataReader};
use crate::core::image::{ImageKind, Resolution};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not decode image: {message}")]
    Decode { message: String },

    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// Each grid cell compared against the grid's mean luminance.
    Mean,
    /// Each cell compared against its horizontal neighbour.
    Gradient,
    /// Horizontal and vertical gradients at half resolution.
    DoubleGradient,
}

impl HashAlgorithm {
    fn to_hash_alg(self) -> HashAlg {
        match self {
            Self::Mean => HashAlg::Mean,
            Self::Gradient => HashAlg::Gradient,
            Self::DoubleGradient => HashAlg::DoubleGradient,
        }
    }
}

/// Parameters of the perceptual hash. Stored with every fingerprint so that
/// hashes from different configurations are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    pub algorithm: HashAlgorithm,
    /// Side of the square luminance grid. Must be 8, 16 or 32.
    pub hash_size: u32,
    /// Run a DCT over the grid before quantizing (pHash).
    pub dct: bool,
}

impl FingerprintConfig {
    pub const HASH_SIZES: [u32; 3] = [8, 16, 32];
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Mean,
            hash_size: 16,
            dct: false,
        }
    }
}

impl std::fmt::Display for FingerprintConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.algorithm {
            HashAlgorithm::Mean => "mean",
            HashAlgorithm::Gradient => "gradient",
            HashAlgorithm::DoubleGradient => "double-gradient",
        };
        let dct = if self.dct { "-dct" } else { "" };
        write!(f, "{}{}-{}x{}", name, dct, self.hash_size, self.hash_size)
    }
}

/// Fixed-length perceptual hash bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub config: FingerprintConfig,
    #[serde(with = "base64_bits")]
    bits: Vec<u8>,
}

impl Fingerprint {
    pub fn new(config: FingerprintConfig, bits: Vec<u8>) -> Self {
        Self { config, bits }
    }

    pub fn bit_len(&self) -> u32 {
        self.bits.len() as u32 * 8
    }

    /// Hamming distance, or `None` when the two hashes are not comparable.
    pub fn distance(&self, other: &Fingerprint) -> Option<u32> {
        if self.config != other.config || self.bits.len() != other.bits.len() {
            return None;
        }
        Some(
            self.bits
                .iter()
                .zip(&other.bits)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }

    /// `1 - hamming / bit_len`, in [0, 1].
    pub fn similarity(&self, other: &Fingerprint) -> Option<f64> {
        let bits = self.bit_len();
        if bits == 0 {
            return None;
        }
        self.distance(other)
            .map(|distance| 1.0 - distance as f64 / bits as f64)
    }

    pub fn to_base64(&self) -> String {
        base64_bits::encode(&self.bits).unwrap_or_default()
    }
}

mod base64_bits {
    use image_hasher::ImageHash;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(bits: &[u8]) -> Result<String, String> {
        ImageHash::<Box<[u8]>>::from_bytes(bits)
            .map(|hash| hash.to_base64())
            .map_err(|e| format!("{:?}", e))
    }

    pub fn serialize<S: Serializer>(bits: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = encode(bits).map_err(S::Error::custom)?;
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        ImageHash::<Box<[u8]>>::from_base64(&encoded)
            .map(|hash| hash.as_bytes().to_vec())
            .map_err(|e| D::Error::custom(format!("invalid fingerprint: {:?}", e)))
    }
}

/// Everything the extractor derives from one image.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub fingerprint: Fingerprint,
    pub resolution: Resolution,
    pub format: ImageKind,
    pub metadata: Option<EmbeddedMetadata>,
}

impl ExtractedImage {
    pub fn metadata_signature(&self) -> Option<&str> {
        self.metadata.as_ref().map(|m| m.signature.as_str())
    }
}

/// Single source of fingerprints for both indexed files and query images.
pub struct FingerprintExtractor {
    config: FingerprintConfig,
    hasher: Hasher,
    metadata_reader: MetadataReader,
}

impl FingerprintExtractor {
    pub fn new(config: FingerprintConfig) -> Self {
        let mut hasher_config = HasherConfig::new()
            .hash_size(config.hash_size, config.hash_size)
            .hash_alg(config.algorithm.to_hash_alg());
        if config.dct {
            hasher_config = hasher_config.preproc_dct();
        }

        Self {
            hasher: hasher_config.to_hasher(),
            config,
            metadata_reader: MetadataReader::new(),
        }
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    pub fn extract(&self, bytes: &[u8]) -> Result<ExtractedImage, ExtractError> {
        let detected = image::guess_format(bytes).map_err(|e| ExtractError::Decode {
            message: e.to_string(),
        })?;
        let format = ImageKind::from_format(detected).ok_or_else(|| {
            ExtractError::UnsupportedFormat {
                format: format!("{:?}", detected),
            }
        })?;

        let img = image::load_from_memory_with_format(bytes, detected).map_err(|e| {
            ExtractError::Decode {
                message: e.to_string(),
            }
        })?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(ExtractError::Decode {
                message: "image has no pixels".to_string(),
            });
        }

        let hash: ImageHash = self.hasher.hash_image(&img);

        Ok(ExtractedImage {
            fingerprint: Fingerprint::new(self.config.clone(), hash.as_bytes().to_vec()),
            resolution: Resolution::new(width, height),
            format,
            metadata: self.metadata_reader.read(bytes),
        })
    }

    pub fn extract_file(&self, path: &Path) -> Result<ExtractedImage, ExtractError> {
        let bytes = fs::read(path)?;
        self.extract(&bytes)
    }
}

impl Default for FingerprintExtractor {
    fn default() -> Self {
        Self::new(FingerprintConfig::default())
    }
}
