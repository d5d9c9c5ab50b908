//! Shape planner.
//!
//! Derives the per-layer structure that makes the encoder and decoder exact
//! spatial inverses of each other. The last kernel size is not user-supplied:
//! it is set to the sequence length remaining after the first L-1 layers, so
//! the final convolution collapses the sequence to a single latent position.
//!
//! The channel algebra is the same for both convolution ranks: in 2-D mode
//! the singleton input channel and the kernel's embedding-axis extent fold
//! into the channel dimension, which is exactly the 1-D layout.

use crate::error::CaeError;
use crate::model::config::{ConvRank, ModelConfig};

/// Structure of one convolution layer, derived from the configuration.
///
/// The decoder's specs are the structural reverse of the encoder's with
/// in/out channels swapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub kernel: usize,
    pub stride: usize,
    pub output_padding: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

/// Derived layer structure for the full autoencoder.
#[derive(Debug, Clone)]
pub struct LayerPlan {
    /// Encoder layers, first to last
    pub encoder: Vec<LayerSpec>,
    /// Decoder layers, first deconv mirrors the last conv
    pub decoder: Vec<LayerSpec>,
    /// Sequence length after each encoder layer; the last entry is 1
    pub encoder_seq_lens: Vec<usize>,
    /// Kernel heights paired per layer for 2-D mode: embed_dim for the first
    /// layer, 1 afterwards
    pub paired_kernels: Vec<(usize, usize)>,
}

/// Standard convolution output-size formula (no dilation).
///
/// The caller must ensure `kernel <= input + 2 * padding`.
pub fn conv_output_len(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - kernel) / stride + 1
}

/// Transposed convolution output-size formula (no padding, no dilation).
pub fn deconv_output_len(input: usize, kernel: usize, stride: usize, output_padding: usize) -> usize {
    (input - 1) * stride + kernel + output_padding
}

/// Compute the layer plan for a configuration.
///
/// Overwrites `config.kernel_sizes[L-1]` with the derived size. Fails fast if
/// `max_seq_len` does not survive the stride/kernel reduction, or if the
/// configured output paddings do not restore every intermediate length (and
/// finally `max_seq_len`) exactly through the mirrored decoder stack.
pub fn plan(config: &mut ModelConfig) -> Result<LayerPlan, CaeError> {
    config.validate()?;

    let layers = config.num_layers();

    // Forward pass of the output-size formula over the first L-1 layers.
    let mut len = config.max_seq_len;
    let mut encoder_seq_lens = Vec::with_capacity(layers);
    for i in 0..layers - 1 {
        let kernel = config.kernel_sizes[i];
        if kernel > len {
            return Err(CaeError::InvalidConfig(format!(
                "layer {i}: kernel size {kernel} exceeds remaining sequence length {len} \
                 (max_seq_len too small for this stack)"
            )));
        }
        len = conv_output_len(len, kernel, config.strides[i], 0);
        encoder_seq_lens.push(len);
    }

    // The derived last kernel spans the whole remaining sequence.
    config.kernel_sizes[layers - 1] = len;
    encoder_seq_lens.push(1);

    let paired_kernels = config
        .kernel_sizes
        .iter()
        .enumerate()
        .map(|(i, &k)| (k, if i == 0 { config.embed_dim } else { 1 }))
        .collect();

    // Channel algebra, identical for both ranks (see module docs).
    let mut in_channels = match config.conv_rank {
        ConvRank::One | ConvRank::Two => config.embed_dim,
    };
    let mut encoder = Vec::with_capacity(layers);
    for i in 0..layers {
        encoder.push(LayerSpec {
            kernel: config.kernel_sizes[i],
            stride: config.strides[i],
            output_padding: config.output_paddings[i],
            in_channels,
            out_channels: config.num_filters[i],
        });
        in_channels = config.num_filters[i];
    }

    let decoder: Vec<LayerSpec> = encoder
        .iter()
        .rev()
        .map(|spec| LayerSpec {
            kernel: spec.kernel,
            stride: spec.stride,
            output_padding: spec.output_padding,
            in_channels: spec.out_channels,
            out_channels: spec.in_channels,
        })
        .collect();

    // Verify the mirrored stack restores every length exactly. Deconv layer j
    // mirrors conv layer L-1-j, so its output length must match that conv
    // layer's input length.
    let mut len = 1;
    for (j, spec) in decoder.iter().enumerate() {
        len = deconv_output_len(len, spec.kernel, spec.stride, spec.output_padding);
        let mirror = layers - 1 - j;
        let expected = if mirror == 0 {
            config.max_seq_len
        } else {
            encoder_seq_lens[mirror - 1]
        };
        if len != expected {
            return Err(CaeError::InvalidConfig(format!(
                "deconv layer {j} restores length {len} but its mirror conv layer {mirror} \
                 consumed length {expected}; adjust output_paddings[{mirror}]"
            )));
        }
    }

    Ok(LayerPlan {
        encoder,
        decoder,
        encoder_seq_lens,
        paired_kernels,
    })
}
