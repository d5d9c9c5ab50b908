//! Loss criteria.
//!
//! The controller is loss-agnostic: it is handed a criterion that maps one
//! example's per-position log-probabilities and its target token ids to
//! per-position loss values. The controller sums those per example, sums over
//! the batch, and divides by the batch size.

use candle_core::Tensor;

use crate::error::CaeError;

/// Per-example reconstruction criterion.
pub trait Criterion {
    /// `log_probs` has shape (seq_len, vocab_size); `target` holds seq_len
    /// token ids. Returns a (seq_len,) tensor of per-position losses.
    fn per_position(&self, log_probs: &Tensor, target: &Tensor) -> Result<Tensor, CaeError>;
}

/// Negative log likelihood of the target token at each position.
pub struct NllLoss;

impl Criterion for NllLoss {
    fn per_position(&self, log_probs: &Tensor, target: &Tensor) -> Result<Tensor, CaeError> {
        let picked = log_probs.gather(&target.unsqueeze(1)?, 1)?.squeeze(1)?;
        Ok(picked.neg()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_nll_picks_target_positions() {
        let device = Device::Cpu;
        let log_probs = Tensor::from_vec(
            vec![-0.1f32, -2.0, -3.0, -4.0, -0.5, -6.0],
            (2, 3),
            &device,
        )
        .unwrap();
        let target = Tensor::from_vec(vec![0u32, 1], (2,), &device).unwrap();
        let losses: Vec<f32> = NllLoss
            .per_position(&log_probs, &target)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(losses, vec![0.1, 0.5]);
    }
}
