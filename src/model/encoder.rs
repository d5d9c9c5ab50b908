//! Encoder: embedding lookup followed by a stack of strided convolutions.
//!
//! The final convolution layer runs without any regularization stage; its raw
//! output is the latent representation, left un-squashed so the code space
//! stays linear.

use candle_core::{DType, Device, Tensor, Var};

use crate::error::CaeError;
use crate::model::config::{ConvRank, ModelConfig};
use crate::model::regularization::RegularizationStage;
use crate::model::shape::{LayerPlan, LayerSpec};
use crate::model::{l2_normalize, Mode};

/// Xavier-uniform bound for a conv/deconv kernel.
///
/// Fixed, reproducible scheme: it interacts with the unit-norm embedding
/// invariant, so it is part of the contract rather than a tuning detail.
pub(crate) fn xavier_bound(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out) as f64).sqrt() as f32
}

/// One convolution layer. Weight layout (out_channels, in_channels, kernel).
pub struct ConvLayer {
    pub(crate) weight: Var,
    pub(crate) bias: Var,
    stride: usize,
    out_channels: usize,
}

impl ConvLayer {
    pub fn new(spec: &LayerSpec, device: &Device) -> Result<Self, CaeError> {
        let fan_in = spec.in_channels * spec.kernel;
        let fan_out = spec.out_channels * spec.kernel;
        let bound = xavier_bound(fan_in, fan_out);
        let weight = Var::rand(
            -bound,
            bound,
            (spec.out_channels, spec.in_channels, spec.kernel),
            device,
        )?;
        let bias = Var::zeros(spec.out_channels, DType::F32, device)?;
        Ok(Self {
            weight,
            bias,
            stride: spec.stride,
            out_channels: spec.out_channels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor, CaeError> {
        let y = x.conv1d(self.weight.as_tensor(), 0, self.stride, 1, 1)?;
        Ok(y.broadcast_add(&self.bias.reshape((1, self.out_channels, 1))?)?)
    }

    /// The weight storage, shared with the mirror deconv layer when tying.
    pub fn weight(&self) -> &Var {
        &self.weight
    }
}

/// Convolutional encoder over embedded token sequences.
pub struct Encoder {
    embedding: Var,
    conv_layers: Vec<ConvLayer>,
    reg_layers: Vec<RegularizationStage>,
    rank: ConvRank,
}

impl Encoder {
    /// Build the encoder from a derived layer plan. `embedding` is the table
    /// shared with the decoder.
    pub fn new(
        config: &ModelConfig,
        plan: &LayerPlan,
        embedding: Var,
        device: &Device,
    ) -> Result<Self, CaeError> {
        let mut conv_layers = Vec::with_capacity(plan.encoder.len());
        for spec in &plan.encoder {
            conv_layers.push(ConvLayer::new(spec, device)?);
        }
        let mut reg_layers = Vec::with_capacity(plan.encoder.len() - 1);
        for spec in &plan.encoder[..plan.encoder.len() - 1] {
            reg_layers.push(RegularizationStage::new(
                spec.out_channels,
                config.batch_norm,
                config.dropout,
                device,
            )?);
        }
        Ok(Self {
            embedding,
            conv_layers,
            reg_layers,
            rank: config.conv_rank,
        })
    }

    /// Map token ids (batch, seq_len) to the latent tensor
    /// (batch, filters, 1).
    pub fn forward(&self, token_ids: &Tensor, mode: Mode) -> Result<Tensor, CaeError> {
        let (batch, seq_len) = token_ids.dims2()?;

        // Optimizer steps move embedding rows off the unit sphere; project
        // the table back before each training lookup so the tied softmax
        // always dots against unit-norm rows.
        if mode == Mode::Train {
            self.embedding
                .set(&l2_normalize(self.embedding.as_tensor(), 1)?)?;
        }

        let flat = token_ids.flatten_all()?;
        let x = self
            .embedding
            .index_select(&flat, 0)?
            .reshape((batch, seq_len, ()))?;

        // Channels-first layout for the conv stack. The 2-D path inserts a
        // singleton channel axis and immediately folds the embedding axis
        // into it, which matches a 2-D conv whose first kernel spans the
        // whole embedding width.
        let mut x = match self.rank {
            ConvRank::One => x.transpose(1, 2)?.contiguous()?,
            ConvRank::Two => x
                .unsqueeze(1)?
                .permute((0, 1, 3, 2))?
                .contiguous()?
                .reshape((batch, (), seq_len))?,
        };

        let last = self.conv_layers.len() - 1;
        for i in 0..last {
            x = self.conv_layers[i].forward(&x)?;
            x = self.reg_layers[i].forward(&x, mode)?;
        }
        // Final layer stays raw: no normalization, activation, or dropout.
        self.conv_layers[last].forward(&x)
    }

    pub fn conv_layers(&self) -> &[ConvLayer] {
        &self.conv_layers
    }

    /// Trainable parameters, embedding table included. The table is owned
    /// here: the decoder references the same storage but never registers it
    /// with its own optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = vec![self.embedding.clone()];
        for layer in &self.conv_layers {
            vars.push(layer.weight.clone());
            vars.push(layer.bias.clone());
        }
        for reg in &self.reg_layers {
            vars.extend(reg.trainable_vars());
        }
        vars
    }

    /// All tensors for persistence, running statistics included.
    pub fn named_tensors(&self) -> Vec<(String, Var)> {
        let mut tensors = vec![("embedding".to_string(), self.embedding.clone())];
        for (i, layer) in self.conv_layers.iter().enumerate() {
            tensors.push((format!("conv{i}.weight"), layer.weight.clone()));
            tensors.push((format!("conv{i}.bias"), layer.bias.clone()));
        }
        for (i, reg) in self.reg_layers.iter().enumerate() {
            tensors.extend(reg.named_tensors(&format!("reg{i}")));
        }
        tensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::shape;

    fn build(rank: ConvRank) -> (ModelConfig, Encoder) {
        let mut config = ModelConfig {
            vocab_size: 30,
            embed_dim: 8,
            max_seq_len: 12,
            kernel_sizes: vec![3, 0],
            strides: vec![2, 1],
            output_paddings: vec![1, 0],
            num_filters: vec![10, 16],
            conv_rank: rank,
            batch_norm: true,
            dropout: 0.0,
            ..ModelConfig::default()
        };
        let plan = shape::plan(&mut config).unwrap();
        let device = Device::Cpu;
        let embedding = Var::rand(
            -0.001f32,
            0.001,
            (config.vocab_size, config.embed_dim),
            &device,
        )
        .unwrap();
        let encoder = Encoder::new(&config, &plan, embedding, &device).unwrap();
        (config, encoder)
    }

    fn ids(batch: usize, seq_len: usize) -> Tensor {
        let data: Vec<u32> = (0..batch * seq_len).map(|i| (i % 30) as u32).collect();
        Tensor::from_vec(data, (batch, seq_len), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_latent_shape_collapses_sequence() {
        let (config, encoder) = build(ConvRank::One);
        let latent = encoder.forward(&ids(4, config.max_seq_len), Mode::Eval).unwrap();
        assert_eq!(latent.dims(), &[4, 16, 1]);
    }

    #[test]
    fn test_2d_mode_matches_latent_shape() {
        let (config, encoder) = build(ConvRank::Two);
        let latent = encoder.forward(&ids(2, config.max_seq_len), Mode::Eval).unwrap();
        assert_eq!(latent.dims(), &[2, 16, 1]);
    }

    #[test]
    fn test_trainable_vars_include_embedding_and_layers() {
        let (_, encoder) = build(ConvRank::One);
        // embedding + 2x(weight, bias) + 1 batch-norm stage (gamma, beta)
        assert_eq!(encoder.trainable_vars().len(), 1 + 4 + 2);
    }

    #[test]
    fn test_named_tensors_unique() {
        let (_, encoder) = build(ConvRank::One);
        let names: Vec<String> = encoder.named_tensors().into_iter().map(|(n, _)| n).collect();
        let mut dedup = names.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(names.len(), dedup.len());
    }
}
