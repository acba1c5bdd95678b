//! Journal payload codec
//!
//! UPSERT records carry their vector as a small JSON document,
//! `{"features": [f32, ...]}`. DELETE records carry an empty payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid feature payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("feature payload contains a non-finite value at position {0}")]
    NonFinite(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub features: Vec<f32>,
}

/// Encode a vector as an UPSERT payload.
pub fn encode_features(vector: &[f32]) -> Result<Vec<u8>, CodecError> {
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(pos));
    }
    #[derive(Serialize)]
    struct Borrowed<'a> {
        features: &'a [f32],
    }
    Ok(serde_json::to_vec(&Borrowed { features: vector })?)
}

/// Decode an UPSERT payload back into its vector.
pub fn decode_features(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    let decoded: Features = serde_json::from_slice(bytes)?;
    Ok(decoded.features)
}
