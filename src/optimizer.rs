//! Host-side Adam with global-norm gradient clipping, exponential learning
//! rate decay, and a per-parameter rate policy keyed on parameter names.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::config_err;
use crate::errors::Result;

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPS: f64 = 1e-8;

/// Learning-rate multipliers per parameter-name pattern, first match wins.
/// Scalar-site locations move slowly because every observation pulls on
/// them; scales, covariance factors, and decentered sites are damped to
/// keep early steps stable.
pub struct OptimizerPolicy {
    scalar_site_patterns: Vec<String>,
}

impl OptimizerPolicy {
    pub fn new(scalar_sites: &[&str]) -> Self {
        Self {
            scalar_site_patterns: scalar_sites
                .iter()
                .map(|s| format!("locs.{s}"))
                .collect(),
        }
    }

    pub fn multiplier(&self, name: &str) -> f64 {
        if self
            .scalar_site_patterns
            .iter()
            .any(|p| name.contains(p.as_str()))
        {
            0.2
        } else if name.contains("scales") {
            0.1
        } else if name.contains("cov_factor") {
            0.05
        } else if name.contains("weight") {
            0.05
        } else if name.contains("decentered") {
            0.1
        } else {
            1.0
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    multiplier: f64,
    m: Vec<f64>,
    v: Vec<f64>,
}

pub struct ClippedAdam {
    params: Vec<ParamState>,
    lr: f64,
    /// Per-step decay factor; after `num_steps` steps the rate has decayed
    /// by the configured total factor.
    factor: f64,
    clip_norm: f64,
    step: usize,
}

impl ClippedAdam {
    pub fn new(
        params: Vec<(String, Var)>,
        policy: &OptimizerPolicy,
        lr: f64,
        total_decay: f64,
        num_steps: usize,
        clip_norm: f64,
    ) -> Result<Self> {
        if !(lr > 0.0) || !(total_decay > 0.0) || !(clip_norm > 0.0) || num_steps == 0 {
            return Err(config_err!(
                "optimizer needs lr, decay, clip_norm > 0 and num_steps > 0"
            ));
        }
        let params = params
            .into_iter()
            .map(|(name, var)| {
                let n = var.as_tensor().elem_count();
                let multiplier = policy.multiplier(&name);
                ParamState {
                    name,
                    var,
                    multiplier,
                    m: vec![0.0; n],
                    v: vec![0.0; n],
                }
            })
            .collect();
        Ok(Self {
            params,
            lr,
            factor: total_decay.powf(1.0 / num_steps as f64),
            clip_norm,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr * self.factor.powi(self.step as i32)
    }

    /// Apply one update and report each parameter's pre-clip gradient
    /// infinity norm. Parameters absent from the gradient store are left
    /// untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<BTreeMap<String, f64>> {
        let mut flat: Vec<Option<Vec<f64>>> = Vec::with_capacity(self.params.len());
        let mut sq_norm = 0.0;
        let mut report = BTreeMap::new();
        for param in &self.params {
            match grads.get(param.var.as_tensor()) {
                Some(g) => {
                    let g = g.flatten_all()?.to_vec1::<f64>()?;
                    let inf = g.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
                    sq_norm += g.iter().map(|x| x * x).sum::<f64>();
                    report.insert(param.name.clone(), inf);
                    flat.push(Some(g));
                }
                None => flat.push(None),
            }
        }
        let norm = sq_norm.sqrt();
        let clip_scale = if norm > self.clip_norm {
            self.clip_norm / norm
        } else {
            1.0
        };

        let lr_t = self.learning_rate();
        self.step += 1;
        let t = self.step as i32;
        let bias1 = 1.0 - BETA1.powi(t);
        let bias2 = 1.0 - BETA2.powi(t);

        for (param, grad) in self.params.iter_mut().zip(flat) {
            let Some(grad) = grad else { continue };
            let old = param.var.as_tensor().flatten_all()?.to_vec1::<f64>()?;
            let mut new = old;
            let rate = lr_t * param.multiplier;
            for i in 0..new.len() {
                let g = grad[i] * clip_scale;
                param.m[i] = BETA1 * param.m[i] + (1.0 - BETA1) * g;
                param.v[i] = BETA2 * param.v[i] + (1.0 - BETA2) * g * g;
                let m_hat = param.m[i] / bias1;
                let v_hat = param.v[i] / bias2;
                new[i] -= rate * m_hat / (v_hat.sqrt() + EPS);
            }
            let shape = param.var.as_tensor().dims().to_vec();
            let updated =
                Tensor::from_vec(new, shape, param.var.as_tensor().device())?;
            param.var.set(&updated)?;
        }
        Ok(report)
    }
}
