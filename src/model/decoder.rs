//! Decoder: mirrored transposed-convolution stack with a tied-embedding
//! softmax head.
//!
//! The first deconv layer mirrors the encoder's last conv layer. With weight
//! tying enabled, each deconv layer holds the *same* storage as its mirror
//! conv layer's weight: a conv kernel (out, in, k) is exactly a transposed
//! conv kernel (in', out', k) with the channel roles swapped, so the tensor is
//! reused as-is. Tied weights belong to the encoder's parameter set and are
//! updated exactly once per step.
//!
//! The output projection is not a learned layer: the reconstructed
//! per-position vectors are L2-normalized onto the unit sphere the embedding
//! table lives on, then dotted against every embedding row and divided by the
//! temperature. Log-softmax over the vocabulary axis yields the result.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops::log_softmax;

use crate::error::CaeError;
use crate::model::config::ModelConfig;
use crate::model::encoder::{xavier_bound, Encoder};
use crate::model::regularization::RegularizationStage;
use crate::model::shape::{LayerPlan, LayerSpec};
use crate::model::{l2_normalize, Mode};

/// One transposed-convolution layer. Weight layout
/// (in_channels, out_channels, kernel).
pub struct DeconvLayer {
    weight: Var,
    bias: Var,
    stride: usize,
    output_padding: usize,
    out_channels: usize,
    /// Weight storage owned by the mirror conv layer
    tied: bool,
}

impl DeconvLayer {
    /// Build a layer owning a freshly initialized weight.
    pub fn new(spec: &LayerSpec, device: &Device) -> Result<Self, CaeError> {
        let fan_in = spec.in_channels * spec.kernel;
        let fan_out = spec.out_channels * spec.kernel;
        let bound = xavier_bound(fan_in, fan_out);
        let weight = Var::rand(
            -bound,
            bound,
            (spec.in_channels, spec.out_channels, spec.kernel),
            device,
        )?;
        Self::with_weight(spec, weight, false, device)
    }

    /// Build a layer bound to an existing weight storage. Fails fast on a
    /// shape that does not match the mirror layer.
    pub fn tied(spec: &LayerSpec, weight: Var, device: &Device) -> Result<Self, CaeError> {
        let expected = [spec.in_channels, spec.out_channels, spec.kernel];
        if weight.dims() != &expected[..] {
            return Err(CaeError::ShapeMismatch(format!(
                "tied weight has shape {:?}, mirror deconv layer needs {:?}",
                weight.dims(),
                expected
            )));
        }
        Self::with_weight(spec, weight, true, device)
    }

    fn with_weight(
        spec: &LayerSpec,
        weight: Var,
        tied: bool,
        device: &Device,
    ) -> Result<Self, CaeError> {
        let bias = Var::zeros(spec.out_channels, DType::F32, device)?;
        Ok(Self {
            weight,
            bias,
            stride: spec.stride,
            output_padding: spec.output_padding,
            out_channels: spec.out_channels,
            tied,
        })
    }

    /// Transposed convolution, written as zero-stuffing by the stride
    /// followed by a regular convolution with the spatially flipped,
    /// channel-swapped kernel. The engine's fused transposed-conv op has no
    /// backward pass, so training has to go through this decomposition; the
    /// two compute identical outputs.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor, CaeError> {
        let (batch, in_channels, len) = x.dims3()?;
        let stuffed = if self.stride > 1 {
            let gaps = Tensor::zeros(
                (batch, in_channels, len, self.stride - 1),
                x.dtype(),
                x.device(),
            )?;
            Tensor::cat(&[&x.unsqueeze(3)?, &gaps], 3)?
                .reshape((batch, in_channels, len * self.stride))?
                .narrow(2, 0, (len - 1) * self.stride + 1)?
        } else {
            x.clone()
        };

        // (in, out, k) -> (out, in, k) with the kernel axis reversed.
        let kernel = self.weight.dim(2)?;
        let flip = Tensor::from_vec(
            (0..kernel as u32).rev().collect::<Vec<u32>>(),
            kernel,
            x.device(),
        )?;
        let weight = self
            .weight
            .as_tensor()
            .transpose(0, 1)?
            .contiguous()?
            .index_select(&flip, 2)?
            .contiguous()?;

        let mut y = stuffed.conv1d(&weight, kernel - 1, 1, 1, 1)?;
        if self.output_padding > 0 {
            let tail = Tensor::zeros(
                (batch, self.out_channels, self.output_padding),
                y.dtype(),
                y.device(),
            )?;
            y = Tensor::cat(&[&y, &tail], 2)?;
        }
        Ok(y.broadcast_add(&self.bias.reshape((1, self.out_channels, 1))?)?)
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn is_tied(&self) -> bool {
        self.tied
    }
}

/// Transposed-convolution decoder with tied-embedding projection.
pub struct Decoder {
    embedding: Var,
    deconv_layers: Vec<DeconvLayer>,
    reg_layers: Vec<RegularizationStage>,
    tau: f64,
}

impl Decoder {
    /// Build the decoder as the structural mirror of `encoder`. `embedding`
    /// must be the same storage the encoder looks tokens up in.
    pub fn new(
        config: &ModelConfig,
        plan: &LayerPlan,
        embedding: Var,
        encoder: &Encoder,
        device: &Device,
    ) -> Result<Self, CaeError> {
        let layers = plan.decoder.len();
        let mut deconv_layers = Vec::with_capacity(layers);
        for (j, spec) in plan.decoder.iter().enumerate() {
            let layer = if config.tie_weights {
                // Deconv layer j mirrors conv layer L-1-j.
                let mirror = &encoder.conv_layers()[layers - 1 - j];
                DeconvLayer::tied(spec, mirror.weight().clone(), device)?
            } else {
                DeconvLayer::new(spec, device)?
            };
            deconv_layers.push(layer);
        }
        let mut reg_layers = Vec::with_capacity(layers - 1);
        for spec in &plan.decoder[..layers - 1] {
            reg_layers.push(RegularizationStage::new(
                spec.out_channels,
                config.batch_norm,
                config.dropout,
                device,
            )?);
        }
        Ok(Self {
            embedding,
            deconv_layers,
            reg_layers,
            tau: config.tau,
        })
    }

    /// Map a latent tensor (batch, filters, 1) to log-probabilities
    /// (batch, seq_len, vocab_size).
    pub fn forward(&self, latent: &Tensor, mode: Mode) -> Result<Tensor, CaeError> {
        let mut x = latent.clone();
        let last = self.deconv_layers.len() - 1;
        for i in 0..last {
            x = self.deconv_layers[i].forward(&x)?;
            x = self.reg_layers[i].forward(&x, mode)?;
        }
        // Final layer stays raw, restoring (batch, embed_dim, seq_len).
        let x = self.deconv_layers[last].forward(&x)?;

        // Back onto the unit sphere the embedding rows live on.
        let x = l2_normalize(&x, 1)?;

        // Tied softmax: dot every position against every embedding row.
        let table = self.embedding.unsqueeze(0)?;
        let logits = (table.broadcast_matmul(&x)? / self.tau)?;
        let log_probs = log_softmax(&logits, 1)?;
        Ok(log_probs.transpose(1, 2)?.contiguous()?)
    }

    pub fn deconv_layers(&self) -> &[DeconvLayer] {
        &self.deconv_layers
    }

    /// Trainable parameters owned by the decoder. Tied weights and the
    /// embedding table are excluded: the encoder owns those.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        for layer in &self.deconv_layers {
            if !layer.tied {
                vars.push(layer.weight.clone());
            }
            vars.push(layer.bias.clone());
        }
        for reg in &self.reg_layers {
            vars.extend(reg.trainable_vars());
        }
        vars
    }

    /// All decoder-owned tensors for persistence. Tied weights are persisted
    /// with the encoder.
    pub fn named_tensors(&self) -> Vec<(String, Var)> {
        let mut tensors = Vec::new();
        for (i, layer) in self.deconv_layers.iter().enumerate() {
            if !layer.tied {
                tensors.push((format!("deconv{i}.weight"), layer.weight.clone()));
            }
            tensors.push((format!("deconv{i}.bias"), layer.bias.clone()));
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

    fn build(tie_weights: bool) -> (ModelConfig, Encoder, Decoder) {
        let mut config = ModelConfig {
            vocab_size: 30,
            embed_dim: 8,
            max_seq_len: 12,
            kernel_sizes: vec![3, 0],
            strides: vec![2, 1],
            output_paddings: vec![1, 0],
            num_filters: vec![10, 16],
            batch_norm: false,
            dropout: 0.0,
            tie_weights,
            tau: 0.5,
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
        let encoder = Encoder::new(&config, &plan, embedding.clone(), &device).unwrap();
        let decoder = Decoder::new(&config, &plan, embedding, &encoder, &device).unwrap();
        (config, encoder, decoder)
    }

    fn ids(batch: usize, seq_len: usize) -> Tensor {
        let data: Vec<u32> = (0..batch * seq_len).map(|i| (i % 30) as u32).collect();
        Tensor::from_vec(data, (batch, seq_len), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_round_trip_restores_sequence_length() {
        let (config, encoder, decoder) = build(true);
        let latent = encoder.forward(&ids(3, config.max_seq_len), Mode::Eval).unwrap();
        let log_probs = decoder.forward(&latent, Mode::Eval).unwrap();
        assert_eq!(log_probs.dims(), &[3, config.max_seq_len, config.vocab_size]);
    }

    #[test]
    fn test_log_probs_normalize_over_vocab() {
        let (config, encoder, decoder) = build(true);
        let latent = encoder.forward(&ids(1, config.max_seq_len), Mode::Eval).unwrap();
        let log_probs = decoder.forward(&latent, Mode::Eval).unwrap();
        let probs: Vec<f32> = log_probs
            .get(0)
            .unwrap()
            .get(0)
            .unwrap()
            .to_vec1()
            .unwrap();
        let sum: f32 = probs.iter().map(|&lp| lp.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-4, "softmax mass {sum} != 1");
    }

    #[test]
    fn test_tied_layers_share_storage() {
        let (_, encoder, decoder) = build(true);
        // Mirror pairs: deconv 0 <-> conv 1, deconv 1 <-> conv 0.
        let zeros = Tensor::zeros(
            encoder.conv_layers()[0].weight().dims(),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        encoder.conv_layers()[0].weight().set(&zeros).unwrap();
        let sum: f32 = decoder.deconv_layers()[1]
            .weight()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(sum, 0.0);
        assert!(decoder.deconv_layers()[1].is_tied());
    }

    #[test]
    fn test_untied_layers_own_their_weights() {
        let (_, _, decoder) = build(false);
        assert!(decoder.deconv_layers().iter().all(|l| !l.is_tied()));
        // Both deconv weights appear in the decoder parameter set.
        assert_eq!(decoder.trainable_vars().len(), 4);
    }

    #[test]
    fn test_deconv_matches_native_transposed_conv() {
        let device = Device::Cpu;
        let spec = LayerSpec {
            kernel: 4,
            stride: 2,
            output_padding: 1,
            in_channels: 3,
            out_channels: 2,
        };
        let layer = DeconvLayer::new(&spec, &device).unwrap();
        let x = Tensor::rand(-1.0f32, 1.0, (2, 3, 5), &device).unwrap();

        let ours: Vec<f32> = layer
            .forward(&x)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let native: Vec<f32> = x
            .conv_transpose1d(layer.weight().as_tensor(), 0, 1, 2, 1, 1)
            .unwrap()
            .broadcast_add(&layer.bias.reshape((1, 2, 1)).unwrap())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        assert_eq!(ours.len(), native.len());
        for (a, b) in ours.iter().zip(native.iter()) {
            assert!((a - b).abs() < 1e-5, "mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn test_deconv_forward_is_differentiable() {
        let device = Device::Cpu;
        let spec = LayerSpec {
            kernel: 3,
            stride: 2,
            output_padding: 1,
            in_channels: 4,
            out_channels: 2,
        };
        let layer = DeconvLayer::new(&spec, &device).unwrap();
        let x = Tensor::rand(-1.0f32, 1.0, (1, 4, 6), &device).unwrap();

        let loss = layer.forward(&x).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(layer.weight().as_tensor());
        assert!(grad.is_some(), "no gradient reached the deconv weight");
        assert_eq!(grad.unwrap().dims(), layer.weight().dims());
    }

    #[test]
    fn test_tied_weight_shape_checked() {
        let device = Device::Cpu;
        let spec = LayerSpec {
            kernel: 3,
            stride: 1,
            output_padding: 0,
            in_channels: 4,
            out_channels: 2,
        };
        let wrong = Var::zeros((4, 2, 5), DType::F32, &device).unwrap();
        assert!(matches!(
            DeconvLayer::tied(&spec, wrong, &device),
            Err(CaeError::ShapeMismatch(_))
        ));
    }
}
