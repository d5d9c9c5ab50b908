//! Convolutional sequence autoencoder.
//!
//! - [`config`]: validated, strongly-typed configuration
//! - [`shape`]: pure shape planner deriving the mirrored layer structure
//! - [`regularization`]: the batch-norm -> ReLU -> dropout block
//! - [`encoder`] / [`decoder`]: the two sub-networks
//! - [`autoencoder`]: controller owning the optimizers and the loops

use candle_core::Tensor;

use crate::error::CaeError;

pub mod autoencoder;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod regularization;
pub mod shape;

pub use autoencoder::TextConvAutoencoder;
pub use config::{ConvRank, ModelConfig};
pub use decoder::{Decoder, DeconvLayer};
pub use encoder::{ConvLayer, Encoder};
pub use regularization::{BatchNorm1d, RegularizationStage};
pub use shape::{LayerPlan, LayerSpec};

/// Execution mode, toggled on the controller and applied to both
/// sub-networks together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

const L2_EPS: f64 = 1e-12;

/// L2-normalize along `dim`. The denominator is clamped so a zero vector
/// maps to zero instead of NaN.
pub(crate) fn l2_normalize(x: &Tensor, dim: usize) -> Result<Tensor, CaeError> {
    let norm = x.sqr()?.sum_keepdim(dim)?.sqrt()?.maximum(L2_EPS)?;
    Ok(x.broadcast_div(&norm)?)
}
