//! Regularization stage: batch norm -> ReLU -> dropout.
//!
//! Inserted after every convolution layer except the last of each stack. The
//! order is fixed; the activation is unconditional, the other two are
//! config-gated. Dropout only fires in train mode.

use candle_core::{DType, Device, Tensor, Var};

use crate::error::CaeError;
use crate::model::Mode;

const BN_EPS: f64 = 1e-5;
const BN_MOMENTUM: f64 = 0.1;

/// Batch normalization over the channel axis of a (batch, channels, len)
/// tensor.
///
/// Scale/shift are trainable; running statistics are buffers updated in place
/// during train-mode forwards and used verbatim in eval mode.
pub struct BatchNorm1d {
    gamma: Var,
    beta: Var,
    running_mean: Var,
    running_var: Var,
    channels: usize,
}

impl BatchNorm1d {
    pub fn new(channels: usize, device: &Device) -> Result<Self, CaeError> {
        Ok(Self {
            gamma: Var::ones(channels, DType::F32, device)?,
            beta: Var::zeros(channels, DType::F32, device)?,
            running_mean: Var::zeros(channels, DType::F32, device)?,
            running_var: Var::ones(channels, DType::F32, device)?,
            channels,
        })
    }

    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor, CaeError> {
        let c = self.channels;
        let x_hat = match mode {
            Mode::Train => {
                let mean = x.mean_keepdim((0, 2))?;
                let var = x.broadcast_sub(&mean)?.sqr()?.mean_keepdim((0, 2))?;

                let batch_mean = mean.detach().flatten_all()?;
                let batch_var = var.detach().flatten_all()?;
                self.running_mean.set(
                    &((self.running_mean.as_tensor() * (1.0 - BN_MOMENTUM))?
                        + (batch_mean * BN_MOMENTUM)?)?,
                )?;
                self.running_var.set(
                    &((self.running_var.as_tensor() * (1.0 - BN_MOMENTUM))?
                        + (batch_var * BN_MOMENTUM)?)?,
                )?;

                x.broadcast_sub(&mean)?
                    .broadcast_div(&(var + BN_EPS)?.sqrt()?)?
            }
            Mode::Eval => {
                let mean = self.running_mean.reshape((1, c, 1))?;
                let var = self.running_var.reshape((1, c, 1))?;
                x.broadcast_sub(&mean)?
                    .broadcast_div(&(var + BN_EPS)?.sqrt()?)?
            }
        };
        let y = x_hat
            .broadcast_mul(&self.gamma.reshape((1, c, 1))?)?
            .broadcast_add(&self.beta.reshape((1, c, 1))?)?;
        Ok(y)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    /// All tensors, including the running-statistics buffers, for persistence.
    pub fn named_tensors(&self, prefix: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{prefix}.gamma"), self.gamma.clone()),
            (format!("{prefix}.beta"), self.beta.clone()),
            (format!("{prefix}.running_mean"), self.running_mean.clone()),
            (format!("{prefix}.running_var"), self.running_var.clone()),
        ]
    }
}

/// The normalize -> activate -> dropout block.
pub struct RegularizationStage {
    batch_norm: Option<BatchNorm1d>,
    dropout: f32,
}

impl RegularizationStage {
    pub fn new(
        channels: usize,
        batch_norm: bool,
        dropout: f32,
        device: &Device,
    ) -> Result<Self, CaeError> {
        let batch_norm = if batch_norm {
            Some(BatchNorm1d::new(channels, device)?)
        } else {
            None
        };
        Ok(Self { batch_norm, dropout })
    }

    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor, CaeError> {
        let x = match &self.batch_norm {
            Some(bn) => bn.forward(x, mode)?,
            None => x.clone(),
        };
        let x = x.relu()?;
        if self.dropout > 0.0 && mode == Mode::Train {
            Ok(candle_nn::ops::dropout(&x, self.dropout)?)
        } else {
            Ok(x)
        }
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.batch_norm
            .as_ref()
            .map(|bn| bn.trainable_vars())
            .unwrap_or_default()
    }

    pub fn named_tensors(&self, prefix: &str) -> Vec<(String, Var)> {
        self.batch_norm
            .as_ref()
            .map(|bn| bn.named_tensors(&format!("{prefix}.bn")))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn input() -> Tensor {
        Tensor::from_vec(
            vec![-1.0f32, 2.0, -3.0, 4.0, 5.0, -6.0, 7.0, -8.0, 9.0, -10.0, 11.0, 12.0],
            (2, 2, 3),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_relu_only_stage() {
        let stage = RegularizationStage::new(2, false, 0.0, &Device::Cpu).unwrap();
        let y = stage.forward(&input(), Mode::Eval).unwrap();
        let flat: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(flat.iter().all(|&v| v >= 0.0));
        assert_eq!(flat[0], 0.0);
        assert_eq!(flat[1], 2.0);
    }

    #[test]
    fn test_batch_norm_centers_channels_in_train_mode() {
        let bn = BatchNorm1d::new(2, &Device::Cpu).unwrap();
        let y = bn.forward(&input(), Mode::Train).unwrap();
        // Per-channel mean of the normalized output is ~0.
        let means: Vec<f32> = y
            .mean_keepdim((0, 2))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for m in means {
            assert!(m.abs() < 1e-5, "channel mean {m} not centered");
        }
    }

    #[test]
    fn test_train_forward_updates_running_stats() {
        let bn = BatchNorm1d::new(2, &Device::Cpu).unwrap();
        bn.forward(&input(), Mode::Train).unwrap();
        let rm: Vec<f32> = bn.running_mean.to_vec1().unwrap();
        assert!(rm.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_eval_mode_is_deterministic_with_dropout() {
        let stage = RegularizationStage::new(2, false, 0.5, &Device::Cpu).unwrap();
        let a: Vec<f32> = stage
            .forward(&input(), Mode::Eval)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = stage
            .forward(&input(), Mode::Eval)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stage_named_tensors() {
        let stage = RegularizationStage::new(4, true, 0.0, &Device::Cpu).unwrap();
        let names: Vec<String> = stage
            .named_tensors("reg0")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.contains(&"reg0.bn.gamma".to_string()));
        assert!(names.contains(&"reg0.bn.running_var".to_string()));
        assert!(RegularizationStage::new(4, false, 0.0, &Device::Cpu)
            .unwrap()
            .named_tensors("reg0")
            .is_empty());
    }
}
