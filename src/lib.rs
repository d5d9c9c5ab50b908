//! Textcae - Convolutional Sequence Autoencoder
//!
//! Compresses a sequence of token ids into a fixed-size latent tensor with a
//! stack of strided convolutions, then reconstructs a per-position probability
//! distribution over the vocabulary with a mirrored stack of transposed
//! convolutions. The embedding table is shared between the two sub-networks:
//! the encoder uses it for lookup, the decoder reuses it as the output
//! projection (tied softmax), so no separate output layer is learned.
//!
//! Built on the candle tensor/autodiff engine.
//!
//! # Architecture
//!
//! ```text
//! token ids ──► Embedding ──► Conv stack ──► latent (batch, filters, 1)
//!                  ▲                              │
//!                  │ shared table                 ▼
//! log-probs ◄── tied softmax ◄── L2 norm ◄── Deconv stack
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use candle_core::Device;
//! use textcae::loss::NllLoss;
//! use textcae::model::{ModelConfig, TextConvAutoencoder};
//!
//! let config = ModelConfig {
//!     vocab_size: 10_000,
//!     max_seq_len: 50,
//!     kernel_sizes: vec![5, 5, 0],   // last entry is derived, not supplied
//!     strides: vec![2, 2, 1],
//!     output_paddings: vec![1, 0, 0],
//!     num_filters: vec![300, 600, 500],
//!     ..ModelConfig::default()
//! };
//!
//! let mut model = TextConvAutoencoder::new(Device::Cpu, config, Box::new(NllLoss))?;
//! model.train();
//! let loss = model.train_batch(&batch)?;
//! ```

#![warn(clippy::all)]

pub mod data;
pub mod error;
pub mod loss;
pub mod model;

pub use data::{BatchSource, SequenceBatcher, SequenceDataset};
pub use error::CaeError;
pub use loss::{Criterion, NllLoss};
pub use model::{ConvRank, Mode, ModelConfig, TextConvAutoencoder};
