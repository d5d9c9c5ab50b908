//! Autoencoder controller: orchestrates encoder + decoder, owns the two
//! optimizers, and implements the train/eval/generate loops.
//!
//! Single-threaded by design: the only shared mutable resources are the
//! embedding table and any tied weight tensors, and every update to them
//! happens inside one synchronous train step.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{safetensors, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::data::BatchSource;
use crate::error::CaeError;
use crate::loss::Criterion;
use crate::model::config::ModelConfig;
use crate::model::decoder::Decoder;
use crate::model::encoder::Encoder;
use crate::model::shape;
use crate::model::{l2_normalize, Mode};

/// Convolutional sequence autoencoder.
///
/// Encoder and decoder are trained by separate AdamW optimizers with
/// independent learning rates; a single mode flag governs both sub-networks
/// together.
pub struct TextConvAutoencoder {
    config: ModelConfig,
    device: Device,
    embedding: Var,
    encoder: Encoder,
    decoder: Decoder,
    criterion: Box<dyn Criterion>,
    encoder_opt: AdamW,
    decoder_opt: AdamW,
    encoder_lr: f64,
    decoder_lr: f64,
    mode: Mode,
}

impl TextConvAutoencoder {
    /// Build the full model on `device` from a validated configuration and an
    /// injected loss criterion.
    ///
    /// The shape planner overwrites the last kernel size before any layer is
    /// constructed; after construction the embedding table is renormalized so
    /// every row has unit L2 norm.
    pub fn new(
        device: Device,
        mut config: ModelConfig,
        criterion: Box<dyn Criterion>,
    ) -> Result<Self, CaeError> {
        let plan = shape::plan(&mut config)?;

        let embedding = Var::rand(
            -0.001f32,
            0.001,
            (config.vocab_size, config.embed_dim),
            &device,
        )?;
        let encoder = Encoder::new(&config, &plan, embedding.clone(), &device)?;
        let decoder = Decoder::new(&config, &plan, embedding.clone(), &encoder, &device)?;

        // Project every embedding row onto the unit sphere; the decoder's
        // output normalization lands reconstructions on the same sphere.
        embedding.set(&l2_normalize(embedding.as_tensor(), 1)?)?;

        let encoder_lr = config.encoder_lr;
        let decoder_lr = config.decoder_lr;
        let encoder_opt = AdamW::new(
            encoder.trainable_vars(),
            ParamsAdamW {
                lr: encoder_lr,
                ..Default::default()
            },
        )?;
        let decoder_opt = AdamW::new(
            decoder.trainable_vars(),
            ParamsAdamW {
                lr: decoder_lr,
                ..Default::default()
            },
        )?;

        Ok(Self {
            config,
            device,
            embedding,
            encoder,
            decoder,
            criterion,
            encoder_opt,
            decoder_opt,
            encoder_lr,
            decoder_lr,
            mode: Mode::Train,
        })
    }

    /// Switch both sub-networks to train mode.
    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    /// Switch both sub-networks to eval mode.
    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn learning_rates(&self) -> (f64, f64) {
        (self.encoder_lr, self.decoder_lr)
    }

    /// Forward pass plus loss: per-example losses are computed by the
    /// injected criterion, summed, then divided by the batch size. Gradient
    /// clipping later operates on this averaged loss, so the normalization
    /// order is part of the training contract.
    fn batch_loss(&self, inputs: &Tensor) -> Result<Tensor, CaeError> {
        let latent = self.encoder.forward(inputs, self.mode)?;
        let log_probs = self.decoder.forward(&latent, self.mode)?;

        let batch_size = inputs.dim(0)?;
        let mut per_example = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let row = log_probs.get(b)?;
            let target = inputs.get(b)?;
            let losses = self.criterion.per_position(&row, &target)?;
            per_example.push(losses.sum_all()?);
        }
        let total = Tensor::stack(&per_example, 0)?.sum_all()?;
        Ok((total / batch_size as f64)?)
    }

    /// One optimization step over a batch of token ids (batch, seq_len).
    /// Returns the scalar average loss.
    ///
    /// Gradients are a fresh store per backward pass, so there is no
    /// cross-step accumulation to clear. The gradient norm of each
    /// sub-network is clipped independently before either optimizer steps.
    pub fn train_batch(&mut self, inputs: &Tensor) -> Result<f32, CaeError> {
        let loss = self.batch_loss(inputs)?;
        let mut grads = loss.backward()?;

        clip_grad_norm(
            &self.encoder.trainable_vars(),
            &mut grads,
            self.config.clip_norm,
        )?;
        clip_grad_norm(
            &self.decoder.trainable_vars(),
            &mut grads,
            self.config.clip_norm,
        )?;

        self.encoder_opt.step(&grads)?;
        self.decoder_opt.step(&grads)?;

        Ok(loss.to_scalar::<f32>()?)
    }

    /// Loss over a batch without a gradient step.
    pub fn eval_batch(&self, inputs: &Tensor) -> Result<f32, CaeError> {
        Ok(self.batch_loss(inputs)?.to_scalar::<f32>()?)
    }

    /// Train over every batch of a source; returns the summed batch losses.
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        source: &mut dyn BatchSource,
        verbose: bool,
    ) -> Result<f64, CaeError> {
        let start = Instant::now();
        let num_batches = source.batch_count();
        let mut epoch_loss = 0.0;
        let mut seen = 0usize;
        let mut idx = 0usize;

        source.reset();
        while let Some(inputs) = source.next_batch()? {
            let inputs = inputs.to_device(&self.device)?;
            seen += inputs.dim(0)?;
            idx += 1;

            let batch_loss = self.train_batch(&inputs)?;
            epoch_loss += batch_loss as f64;

            if verbose {
                print!(
                    "\r[{:>5}s] epoch {} batch {}/{} training loss {:.8} lr {:.5}/{:.5}",
                    start.elapsed().as_secs(),
                    epoch + 1,
                    idx,
                    num_batches,
                    epoch_loss / seen as f64,
                    self.encoder_lr,
                    self.decoder_lr,
                );
                std::io::stdout().flush()?;
            }
        }
        if verbose {
            println!();
        }
        Ok(epoch_loss)
    }

    /// Evaluate over every batch of a source; returns the summed batch
    /// losses. No gradient step, no clipping.
    pub fn eval_epoch(
        &mut self,
        epoch: usize,
        source: &mut dyn BatchSource,
        verbose: bool,
    ) -> Result<f64, CaeError> {
        let start = Instant::now();
        let num_batches = source.batch_count();
        let mut epoch_loss = 0.0;
        let mut seen = 0usize;
        let mut idx = 0usize;

        source.reset();
        while let Some(inputs) = source.next_batch()? {
            let inputs = inputs.to_device(&self.device)?;
            seen += inputs.dim(0)?;
            idx += 1;

            let batch_loss = self.eval_batch(&inputs)?;
            epoch_loss += batch_loss as f64;

            if verbose {
                print!(
                    "\r[{:>5}s] epoch {} batch {}/{} eval loss {:.8}",
                    start.elapsed().as_secs(),
                    epoch + 1,
                    idx,
                    num_batches,
                    epoch_loss / seen as f64,
                );
                std::io::stdout().flush()?;
            }
        }
        if verbose {
            println!();
        }
        Ok(epoch_loss)
    }

    /// Reconstruct token sequences: arg-max over the vocabulary axis at every
    /// position. Returns ids of shape (batch, seq_len).
    pub fn generate(&self, inputs: &Tensor) -> Result<Tensor, CaeError> {
        let latent = self.encoder.forward(inputs, self.mode)?;
        let log_probs = self.decoder.forward(&latent, self.mode)?;
        Ok(log_probs.argmax(D::Minus1)?)
    }

    /// Multiplicatively decay both learning rates and re-apply them to the
    /// optimizers.
    pub fn update_learning_rates(&mut self, encoder_factor: f64, decoder_factor: f64) {
        let encoder_lr = self.encoder_lr * encoder_factor;
        let decoder_lr = self.decoder_lr * decoder_factor;
        self.set_learning_rates(encoder_lr, decoder_lr);
    }

    pub fn set_learning_rates(&mut self, encoder_lr: f64, decoder_lr: f64) {
        self.encoder_lr = encoder_lr;
        self.decoder_lr = decoder_lr;
        self.encoder_opt.set_learning_rate(encoder_lr);
        self.decoder_opt.set_learning_rate(decoder_lr);
    }

    /// (total, trainable) parameter counts across both sub-networks. Nothing
    /// is ever frozen here, so the two are equal.
    pub fn parameter_counts(&self) -> (usize, usize) {
        let total: usize = self
            .encoder
            .trainable_vars()
            .iter()
            .chain(self.decoder.trainable_vars().iter())
            .map(|v| v.elem_count())
            .sum();
        (total, total)
    }

    /// Persist each sub-network's parameters to its own safetensors file.
    pub fn save_models(
        &self,
        encoder_path: impl AsRef<Path>,
        decoder_path: impl AsRef<Path>,
    ) -> Result<(), CaeError> {
        save_named(&self.encoder.named_tensors(), encoder_path.as_ref())?;
        save_named(&self.decoder.named_tensors(), decoder_path.as_ref())?;
        Ok(())
    }

    /// Restore both parameter sets in place. Loaded values are written
    /// through the existing storage, so optimizer references and tied-weight
    /// bindings stay intact.
    pub fn load_models(
        &mut self,
        encoder_path: impl AsRef<Path>,
        decoder_path: impl AsRef<Path>,
    ) -> Result<(), CaeError> {
        load_named(
            &self.encoder.named_tensors(),
            encoder_path.as_ref(),
            &self.device,
        )?;
        load_named(
            &self.decoder.named_tensors(),
            decoder_path.as_ref(),
            &self.device,
        )?;
        Ok(())
    }

    /// The shared embedding table.
    pub fn embedding(&self) -> &Var {
        &self.embedding
    }
}

/// Scale a parameter set's gradients so their global L2 norm does not exceed
/// `max_norm`.
fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<(), CaeError> {
    let mut sq_sum = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sq_sum += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sq_sum.sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let _ = grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(())
}

fn save_named(tensors: &[(String, Var)], path: &Path) -> Result<(), CaeError> {
    let map: HashMap<String, Tensor> = tensors
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    safetensors::save(&map, path)
        .map_err(|e| CaeError::SaveFailed(format!("{}: {e}", path.display())))
}

fn load_named(tensors: &[(String, Var)], path: &Path, device: &Device) -> Result<(), CaeError> {
    let loaded = safetensors::load(path, device)
        .map_err(|e| CaeError::LoadFailed(format!("{}: {e}", path.display())))?;
    for (name, var) in tensors {
        let tensor = loaded.get(name).ok_or_else(|| {
            CaeError::LoadFailed(format!("{}: missing tensor {name}", path.display()))
        })?;
        var.set(tensor)?;
    }
    Ok(())
}
