//! Model configuration.
//!
//! A strongly-typed, validated record enumerating every recognized option.
//! The configuration is built once, validated, and frozen; the only mutation
//! it ever sees is the shape planner overwriting the last kernel size.

use serde::{Deserialize, Serialize};

use crate::error::CaeError;

/// Convolution dimensionality.
///
/// Both ranks compute the same function. In 1-D mode the embedding dimension
/// acts as the input channel axis; in 2-D mode the input carries a singleton
/// channel axis and the first kernel spans the full embedding axis, collapsing
/// it to width 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvRank {
    One,
    Two,
}

/// Autoencoder configuration.
///
/// The per-layer lists must all have the same length. The last kernel size is
/// derived by the shape planner so that the encoder's final output length is
/// exactly 1; any value supplied there is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (token ids are 0..vocab_size)
    pub vocab_size: usize,
    /// Embedding dimension
    pub embed_dim: usize,
    /// Fixed sequence length of every input batch
    pub max_seq_len: usize,
    /// Per-layer kernel sizes; the last entry is recomputed by the planner
    pub kernel_sizes: Vec<usize>,
    /// Per-layer strides
    pub strides: Vec<usize>,
    /// Per-layer output paddings for the transposed convolutions
    pub output_paddings: Vec<usize>,
    /// Per-layer filter counts
    pub num_filters: Vec<usize>,
    /// Convolution dimensionality
    pub conv_rank: ConvRank,
    /// Apply batch normalization between intermediate layers
    pub batch_norm: bool,
    /// Dropout ratio between intermediate layers (0 disables)
    pub dropout: f32,
    /// Share each deconv layer's weight with its mirror conv layer
    pub tie_weights: bool,
    /// Softmax temperature for the tied-embedding projection
    pub tau: f64,
    /// Max gradient norm, applied per sub-network every step
    pub clip_norm: f64,
    /// Encoder learning rate
    pub encoder_lr: f64,
    /// Decoder learning rate
    pub decoder_lr: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10_000,
            embed_dim: 300,
            max_seq_len: 50,
            kernel_sizes: vec![5, 5, 0],
            strides: vec![2, 2, 1],
            output_paddings: vec![1, 0, 0],
            num_filters: vec![300, 600, 500],
            conv_rank: ConvRank::One,
            batch_norm: true,
            dropout: 0.0,
            tie_weights: true,
            tau: 0.01,
            clip_norm: 10.0,
            encoder_lr: 0.001,
            decoder_lr: 0.001,
        }
    }
}

impl ModelConfig {
    /// Number of convolution layers.
    pub fn num_layers(&self) -> usize {
        self.kernel_sizes.len()
    }

    /// Validate the configuration. Fatal at construction time; no layer is
    /// built from an invalid config.
    pub fn validate(&self) -> Result<(), CaeError> {
        let layers = self.kernel_sizes.len();
        if layers == 0 {
            return Err(CaeError::InvalidConfig(
                "at least one convolution layer is required".to_string(),
            ));
        }
        if self.strides.len() != layers
            || self.output_paddings.len() != layers
            || self.num_filters.len() != layers
        {
            return Err(CaeError::InvalidConfig(format!(
                "per-layer lists must have equal lengths: kernels={}, strides={}, output_paddings={}, filters={}",
                layers,
                self.strides.len(),
                self.output_paddings.len(),
                self.num_filters.len()
            )));
        }
        if self.vocab_size == 0 || self.embed_dim == 0 || self.max_seq_len == 0 {
            return Err(CaeError::InvalidConfig(
                "vocab_size, embed_dim and max_seq_len must be positive".to_string(),
            ));
        }
        // All but the last kernel size are user-supplied and must be usable;
        // the last one is derived by the shape planner.
        for (i, &k) in self.kernel_sizes.iter().take(layers - 1).enumerate() {
            if k == 0 {
                return Err(CaeError::InvalidConfig(format!(
                    "layer {i}: kernel size must be positive"
                )));
            }
        }
        for (i, &s) in self.strides.iter().enumerate() {
            if s == 0 {
                return Err(CaeError::InvalidConfig(format!(
                    "layer {i}: stride must be positive"
                )));
            }
            if self.output_paddings[i] >= s {
                return Err(CaeError::InvalidConfig(format!(
                    "layer {i}: output padding {} must be smaller than stride {s}",
                    self.output_paddings[i]
                )));
            }
        }
        for (i, &f) in self.num_filters.iter().enumerate() {
            if f == 0 {
                return Err(CaeError::InvalidConfig(format!(
                    "layer {i}: filter count must be positive"
                )));
            }
        }
        if !(self.dropout >= 0.0 && self.dropout < 1.0) {
            return Err(CaeError::InvalidConfig(format!(
                "dropout ratio {} must be in [0, 1)",
                self.dropout
            )));
        }
        if self.tau <= 0.0 {
            return Err(CaeError::InvalidConfig(format!(
                "temperature tau {} must be positive",
                self.tau
            )));
        }
        if self.clip_norm <= 0.0 {
            return Err(CaeError::InvalidConfig(format!(
                "gradient clip norm {} must be positive",
                self.clip_norm
            )));
        }
        if self.encoder_lr <= 0.0 || self.decoder_lr <= 0.0 {
            return Err(CaeError::InvalidConfig(
                "learning rates must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
