//! Blob file loading.
//!
//! A trained network ships as five little-endian binary files in one
//! directory: reordered weights and biases as `i16`, and three `i32`
//! quantization tables. Nothing here interprets the contents; sizing
//! against the network happens in [`crate::weights`] and
//! [`crate::quant`].

use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};

use crate::error::{ModelError, Result};

/// Weight blob, already reordered for the accelerator's tile order.
pub const WEIGHTS_FILE: &str = "weights_reorg_int16.bin";
/// Folded bias blob.
pub const BIAS_FILE: &str = "bias_int16.bin";
/// Per-convolution weight Q table.
pub const WEIGHT_Q_FILE: &str = "weight_int16_Q.bin";
/// Per-convolution bias Q table.
pub const BIAS_Q_FILE: &str = "bias_int16_Q.bin";
/// Activation Q table (input entry first, then one per convolution).
pub const ACT_Q_FILE: &str = "iofm_Q.bin";

fn read_file(path: &Path) -> Result<Bytes> {
    if !path.exists() {
        return Err(ModelError::FileNotFound {
            path: PathBuf::from(path),
        });
    }
    Ok(Bytes::from(std::fs::read(path)?))
}

/// Read a little-endian `i16` blob.
///
/// # Errors
///
/// Fails if the file is missing, unreadable, or has a trailing odd byte.
pub fn read_i16_le(path: &Path) -> Result<Vec<i16>> {
    let mut buf = read_file(path)?;
    if buf.len() % 2 != 0 {
        return Err(ModelError::invalid_input(format!(
            "{} is not a whole number of i16 words",
            path.display()
        )));
    }
    let mut out = Vec::with_capacity(buf.len() / 2);
    while buf.remaining() >= 2 {
        out.push(buf.get_i16_le());
    }
    Ok(out)
}

/// Read a little-endian `i32` table.
///
/// # Errors
///
/// Fails if the file is missing, unreadable, or not word-aligned.
pub fn read_i32_le(path: &Path) -> Result<Vec<i32>> {
    let mut buf = read_file(path)?;
    if buf.len() % 4 != 0 {
        return Err(ModelError::invalid_input(format!(
            "{} is not a whole number of i32 words",
            path.display()
        )));
    }
    let mut out = Vec::with_capacity(buf.len() / 4);
    while buf.remaining() >= 4 {
        out.push(buf.get_i32_le());
    }
    Ok(out)
}

/// Raw blob contents of a model directory.
#[derive(Debug)]
pub struct RawBlobs {
    /// Weight words in conv order.
    pub weights: Vec<i16>,
    /// Bias words in conv order.
    pub biases: Vec<i16>,
    /// Weight Q per conv.
    pub weight_q: Vec<i32>,
    /// Bias Q per conv.
    pub bias_q: Vec<i32>,
    /// Activation Q, input first.
    pub act_q: Vec<i32>,
}

impl RawBlobs {
    /// Read all five blob files from `dir`.
    ///
    /// # Errors
    ///
    /// Fails on the first missing or malformed file.
    pub fn load(dir: &Path) -> Result<Self> {
        tracing::info!(dir = %dir.display(), "Loading model blobs");
        Ok(Self {
            weights: read_i16_le(&dir.join(WEIGHTS_FILE))?,
            biases: read_i16_le(&dir.join(BIAS_FILE))?,
            weight_q: read_i32_le(&dir.join(WEIGHT_Q_FILE))?,
            bias_q: read_i32_le(&dir.join(BIAS_Q_FILE))?,
            act_q: read_i32_le(&dir.join(ACT_Q_FILE))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_sized_i16_file_is_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join("yolo2_models_odd_blob_test.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(read_i16_le(&path).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn i32_words_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join("yolo2_models_q_blob_test.bin");
        let mut raw = Vec::new();
        for v in [7i32, -1, 12] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, raw).unwrap();
        assert_eq!(read_i32_le(&path).unwrap(), vec![7, -1, 12]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_i16_le(Path::new("/nonexistent/blob.bin")).unwrap_err();
        assert!(matches!(err, ModelError::FileNotFound { .. }));
    }
}
