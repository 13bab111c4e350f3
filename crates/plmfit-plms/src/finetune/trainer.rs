//! Mini-batch training loop shared by every fine-tuning strategy.
use super::{Partition, Predictor};
use crate::heads::activate;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use plmfit_core::{PlmfitError, Result, TaskKind};
use plmfit_io::{ActivationKind, FeatureScaler, OptimizerKind, TrainingParameters};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

const INITIAL_LOSS_SCALE: f64 = 65536.0;
const MIN_LOSS_SCALE: f64 = 1.0;
const SCALE_GROWTH_INTERVAL: usize = 2000;
const PROB_EPS: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_loss: f32,
    pub train_losses: Vec<f32>,
    pub val_losses: Vec<f32>,
    pub stopped_early: bool,
    pub stop_reason: Option<String>,
}

enum Optim {
    AdamW(AdamW),
    Sgd(SGD),
}

impl Optim {
    fn new(vars: Vec<Var>, params: &TrainingParameters) -> Result<Self> {
        Ok(match params.optimizer {
            OptimizerKind::Adam => Optim::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: params.learning_rate,
                    weight_decay: params.weight_decay,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => Optim::Sgd(SGD::new(vars, params.learning_rate)?),
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Optim::AdamW(opt) => opt.step(grads)?,
            Optim::Sgd(opt) => opt.step(grads)?,
        }
        Ok(())
    }
}

/// Dynamic loss scaling: halve on overflow, grow after a run of clean steps.
struct LossScaler {
    scale: f64,
    clean_steps: usize,
}

enum ScaledStep {
    Applied,
    Skipped,
    Exhausted,
}

impl LossScaler {
    fn new() -> Self {
        Self {
            scale: INITIAL_LOSS_SCALE,
            clean_steps: 0,
        }
    }

    fn step(&mut self, loss: &Tensor, vars: &[Var], optim: &mut Optim) -> Result<ScaledStep> {
        let mut grads = (loss * self.scale)?.backward()?;
        let mut finite = loss.to_scalar::<f32>()?.is_finite();
        for var in vars {
            if !finite {
                break;
            }
            if let Some(g) = grads.get(var) {
                finite = g.sqr()?.sum_all()?.to_scalar::<f32>()?.is_finite();
            }
        }
        if !finite {
            self.scale /= 2.0;
            self.clean_steps = 0;
            debug!("gradient overflow, loss scale now {}", self.scale);
            return Ok(if self.scale < MIN_LOSS_SCALE {
                ScaledStep::Exhausted
            } else {
                ScaledStep::Skipped
            });
        }
        for var in vars {
            if let Some(g) = grads.remove(var) {
                grads.insert(var, (g / self.scale)?);
            }
        }
        optim.step(&grads)?;
        self.clean_steps += 1;
        if self.clean_steps == SCALE_GROWTH_INTERVAL {
            self.scale *= 2.0;
            self.clean_steps = 0;
        }
        Ok(ScaledStep::Applied)
    }
}

/// Mean loss of `preds` against `targets`, both `[batch, 1]`.
fn loss_fn(preds: &Tensor, targets: &Tensor, task: TaskKind, probabilities: bool) -> Result<Tensor> {
    match task {
        TaskKind::Regression => Ok(candle_nn::loss::mse(preds, targets)?),
        TaskKind::Classification => {
            let probs = if probabilities {
                preds.clone()
            } else {
                activate(ActivationKind::Sigmoid, preds)?
            };
            let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
            let pos = (targets * probs.log()?)?;
            let neg = (targets.affine(-1.0, 1.0)? * probs.affine(-1.0, 1.0)?.log()?)?;
            Ok((pos + neg)?.neg()?.mean_all()?)
        }
    }
}

fn target_tensor(partition: &Partition, rows: &[usize], device: &candle_core::Device) -> Result<Tensor> {
    let values: Vec<f32> = rows.iter().map(|&r| partition.targets[r]).collect();
    Ok(Tensor::from_vec(values, (rows.len(), 1), device)?)
}

/// Batched inference over `rows`, returning one scalar per row.
///
/// Classification outputs are probabilities whatever the head's output activation.
pub fn predict<P: Predictor>(
    model: &P,
    input: &P::Input,
    rows: &[usize],
    batch_size: usize,
) -> Result<Vec<f32>> {
    let head = model
        .head()
        .ok_or_else(|| PlmfitError::configuration("no head attached"))?;
    let mut out = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(batch_size.max(1)) {
        let mut preds = model.predict_rows(input, chunk, false)?;
        if head.task() == TaskKind::Classification && !head.emits_probabilities() {
            preds = activate(ActivationKind::Sigmoid, &preds)?;
        }
        out.extend(preds.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?);
    }
    Ok(out)
}

fn mean_loss<P: Predictor>(
    model: &P,
    input: &P::Input,
    partition: &Partition,
    rows: &[usize],
    batch_size: usize,
    task: TaskKind,
) -> Result<f32> {
    let probabilities = model.head().is_some_and(|h| h.emits_probabilities());
    let mut total = 0f32;
    for chunk in rows.chunks(batch_size.max(1)) {
        let preds = model.predict_rows(input, chunk, false)?;
        let targets = target_tensor(partition, chunk, preds.device())?;
        let loss = loss_fn(&preds, &targets, task, probabilities)?.to_scalar::<f32>()?;
        total += loss * chunk.len() as f32;
    }
    Ok(total / rows.len().max(1) as f32)
}

fn snapshot(vars: &[Var]) -> Result<Vec<Tensor>> {
    Ok(vars
        .iter()
        .map(|v| v.as_tensor().copy())
        .collect::<candle_core::Result<Vec<_>>>()?)
}

fn restore(vars: &[Var], tensors: &[Tensor]) -> Result<()> {
    for (var, t) in vars.iter().zip(tensors) {
        var.set(t)?;
    }
    Ok(())
}

/// Train `model` on `partition.train`, monitoring `partition.validation`
/// (or the training loss when there are no validation rows). The best
/// parameters seen are restored before returning.
#[instrument(skip_all, fields(task = %task, epochs = params.epochs))]
pub fn fit<P: Predictor>(
    model: &P,
    input: &P::Input,
    partition: &Partition,
    task: TaskKind,
    params: &TrainingParameters,
) -> Result<TrainingSummary> {
    let head = model
        .head()
        .ok_or_else(|| PlmfitError::configuration("cannot train without a head"))?;
    if head.output_dim() != 1 {
        return Err(PlmfitError::configuration(format!(
            "heads are trained with a single output, got {}",
            head.output_dim()
        )));
    }
    let probabilities = head.emits_probabilities();
    let vars = model.trainable_vars();
    let trainable: usize = vars.iter().map(|v| v.elem_count()).sum();
    info!(
        "training {} parameters on {} rows ({} validation)",
        trainable,
        partition.train.len(),
        partition.validation.len()
    );

    let mut optim = Optim::new(vars.clone(), params)?;
    let mut scaler = params.loss_scaling.then(LossScaler::new);
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut order = partition.train.clone();

    let mut summary = TrainingSummary {
        epochs_run: 0,
        best_epoch: 0,
        best_loss: f32::INFINITY,
        train_losses: Vec::with_capacity(params.epochs),
        val_losses: Vec::with_capacity(params.epochs),
        stopped_early: false,
        stop_reason: None,
    };
    let mut best = snapshot(&vars)?;
    let mut since_best = 0usize;

    'epochs: for epoch in 0..params.epochs {
        order.shuffle(&mut rng);
        let mut epoch_loss = 0f32;
        let mut seen = 0usize;
        for chunk in order.chunks(params.batch_size.max(1)) {
            let preds = model.predict_rows(input, chunk, true)?;
            let targets = target_tensor(partition, chunk, preds.device())?;
            let loss = loss_fn(&preds, &targets, task, probabilities)?;
            let value = loss.to_scalar::<f32>()?;
            match scaler.as_mut() {
                Some(scaler) => match scaler.step(&loss, &vars, &mut optim)? {
                    ScaledStep::Applied => {}
                    ScaledStep::Skipped => continue,
                    ScaledStep::Exhausted => {
                        warn!("loss scale exhausted at epoch {epoch}, stopping early");
                        summary.stopped_early = true;
                        summary.stop_reason = Some("loss scale exhausted".to_string());
                        break 'epochs;
                    }
                },
                None => {
                    if !value.is_finite() {
                        return Err(PlmfitError::NonFiniteLoss { epoch });
                    }
                    let grads = loss.backward()?;
                    optim.step(&grads)?;
                }
            }
            epoch_loss += value * chunk.len() as f32;
            seen += chunk.len();
        }
        // NaN never compares below the best loss, so an epoch of skipped
        // steps cannot become the best one.
        let train_loss = if seen == 0 {
            warn!("every step of epoch {epoch} overflowed");
            f32::NAN
        } else {
            epoch_loss / seen as f32
        };
        summary.train_losses.push(train_loss);
        summary.epochs_run = epoch + 1;

        let monitored = if partition.validation.is_empty() {
            train_loss
        } else {
            let val = mean_loss(
                model,
                input,
                partition,
                &partition.validation,
                params.batch_size,
                task,
            )?;
            summary.val_losses.push(val);
            val
        };
        info!("epoch {epoch}: train loss {train_loss:.5}, monitored loss {monitored:.5}");

        if monitored < summary.best_loss {
            summary.best_loss = monitored;
            summary.best_epoch = epoch;
            best = snapshot(&vars)?;
            since_best = 0;
        } else {
            since_best += 1;
            if params.early_stopping.is_some_and(|patience| since_best >= patience) {
                info!("no improvement for {since_best} epochs, stopping early");
                summary.stopped_early = true;
                summary.stop_reason = Some("early stopping".to_string());
                break;
            }
        }
    }

    restore(&vars, &best)?;
    info!(
        "best epoch {} with loss {:.5}",
        summary.best_epoch, summary.best_loss
    );
    Ok(summary)
}

/// Column statistics fitted on training rows of an embedding matrix.
#[derive(Debug, Clone)]
pub struct FittedScaler {
    kind: FeatureScaler,
    shift: Tensor,
    scale: Tensor,
}

impl FittedScaler {
    pub fn fit(kind: FeatureScaler, features: &Tensor, train_rows: &[usize]) -> Result<Self> {
        let idx: Vec<u32> = train_rows.iter().map(|&r| r as u32).collect();
        let idx = Tensor::new(idx.as_slice(), features.device())?;
        let train = features.index_select(&idx, 0)?.to_dtype(DType::F32)?;
        let (shift, spread) = match kind {
            FeatureScaler::Standard => {
                let mean = train.mean_keepdim(0)?;
                let var = train.broadcast_sub(&mean)?.sqr()?.mean_keepdim(0)?;
                (mean, var.sqrt()?)
            }
            FeatureScaler::MinMax => {
                let min = train.min_keepdim(0)?;
                let max = train.max_keepdim(0)?;
                (min.clone(), (max - min)?)
            }
        };
        // constant columns are only shifted
        let degenerate = spread.le(1e-12)?.to_dtype(DType::F32)?;
        let scale = (spread + degenerate)?;
        Ok(Self {
            kind,
            shift,
            scale,
        })
    }

    pub fn kind(&self) -> FeatureScaler {
        self.kind
    }

    pub fn transform(&self, features: &Tensor) -> Result<Tensor> {
        Ok(features
            .to_dtype(DType::F32)?
            .broadcast_sub(&self.shift)?
            .broadcast_div(&self.scale)?)
    }
}
