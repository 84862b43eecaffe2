use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::autograd::Tape;

pub trait Optimizer {
    /// Applies one update from the gradients accumulated on `tape`.
    fn step(&mut self, tape: &mut Tape);

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Lars,
    Adam,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

#[derive(Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    t: u64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(tape: &Tape, lr: f64, weight_decay: f64) -> Self {
        let m = tape
            .params()
            .iter()
            .map(|p| vec![0.0; p.data.len()])
            .collect();
        let v = tape
            .params()
            .iter()
            .map(|p| vec![0.0; p.data.len()])
            .collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            t: 0,
            m,
            v,
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, tape: &mut Tape) {
        self.t += 1;
        let t = self.t as f64;
        for (param_idx, param) in tape.params_mut().iter_mut().enumerate() {
            for i in 0..param.data.len() {
                let grad = param.grad[i] + self.weight_decay * param.data[i];
                self.m[param_idx][i] =
                    self.beta1 * self.m[param_idx][i] + (1.0 - self.beta1) * grad;
                self.v[param_idx][i] =
                    self.beta2 * self.v[param_idx][i] + (1.0 - self.beta2) * grad * grad;

                let m_hat = self.m[param_idx][i] / (1.0 - self.beta1.powf(t));
                let v_hat = self.v[param_idx][i] / (1.0 - self.beta2.powf(t));
                param.data[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Layer-wise adaptive rate scaling on top of SGD with momentum.
///
/// Each weight matrix gets its own trust ratio
/// `eta * ||w|| / (||g|| + weight_decay * ||w||)`. Bias vectors are updated
/// with plain momentum SGD and no weight decay.
#[derive(Debug)]
pub struct Lars {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    nesterov: bool,
    eta: f64,
    velocity: Vec<Vec<f64>>,
}

impl Lars {
    pub const DEFAULT_ETA: f64 = 0.001;

    pub fn new(tape: &Tape, lr: f64, momentum: f64, weight_decay: f64, nesterov: bool) -> Self {
        let velocity = tape
            .params()
            .iter()
            .map(|p| vec![0.0; p.data.len()])
            .collect();
        Self {
            lr,
            momentum,
            weight_decay,
            nesterov,
            eta: Self::DEFAULT_ETA,
            velocity,
        }
    }

    pub fn with_eta(mut self, eta: f64) -> Self {
        self.eta = eta;
        self
    }
}

impl Optimizer for Lars {
    fn step(&mut self, tape: &mut Tape) {
        for (param_idx, param) in tape.params_mut().iter_mut().enumerate() {
            let adapt = !param.is_vector();
            let (weight_decay, trust_ratio) = if adapt {
                let w_norm = l2_norm(&param.data);
                let g_norm = l2_norm(&param.grad);
                let denom = g_norm + self.weight_decay * w_norm;
                let ratio = if w_norm > 0.0 && denom > 0.0 {
                    self.eta * w_norm / denom
                } else {
                    1.0
                };
                (self.weight_decay, ratio)
            } else {
                (0.0, 1.0)
            };

            let scaled_lr = self.lr * trust_ratio;
            let velocity = &mut self.velocity[param_idx];
            for i in 0..param.data.len() {
                let grad = param.grad[i] + weight_decay * param.data[i];
                velocity[i] = self.momentum * velocity[i] + scaled_lr * grad;
                let update = if self.nesterov {
                    self.momentum * velocity[i] + scaled_lr * grad
                } else {
                    velocity[i]
                };
                param.data[i] -= update;
            }
        }
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub trait LrScheduler {
    /// Learning rate for the current step.
    fn get_lr(&self) -> f64;

    fn step(&mut self);

    fn apply(&self, optimizer: &mut dyn Optimizer) {
        optimizer.set_lr(self.get_lr());
    }
}

/// `lr_t = lr_min + 0.5 * (lr_max - lr_min) * (1 + cos(pi * t / T))`
#[derive(Debug, Clone)]
pub struct CosineAnnealingLr {
    lr_max: f64,
    lr_min: f64,
    t_max: usize,
    current_step: usize,
}

impl CosineAnnealingLr {
    pub fn new(lr_max: f64, t_max: usize, lr_min: f64) -> Self {
        Self {
            lr_max,
            lr_min,
            t_max,
            current_step: 0,
        }
    }
}

impl LrScheduler for CosineAnnealingLr {
    fn get_lr(&self) -> f64 {
        if self.t_max == 0 || self.current_step >= self.t_max {
            return self.lr_min;
        }
        let progress = self.current_step as f64 / self.t_max as f64;
        self.lr_min + 0.5 * (self.lr_max - self.lr_min) * (1.0 + (PI * progress).cos())
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}

/// Builds the optimizer over every parameter on the tape, frozen or not, and
/// a cosine schedule whose period is the epoch count.
pub fn build_optimizer(
    tape: &Tape,
    epochs: usize,
    config: &OptimizerConfig,
) -> (Box<dyn Optimizer>, CosineAnnealingLr) {
    let optimizer: Box<dyn Optimizer> = match config.kind {
        OptimizerKind::Lars => Box::new(Lars::new(
            tape,
            config.lr,
            config.momentum,
            config.weight_decay,
            config.nesterov,
        )),
        OptimizerKind::Adam => Box::new(Adam::new(tape, config.lr, config.weight_decay)),
    };
    let scheduler = CosineAnnealingLr::new(config.lr, epochs, 0.0);
    (optimizer, scheduler)
}
