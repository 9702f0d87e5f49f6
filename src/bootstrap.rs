//! Bootstrap uncertainty over places.
//!
//! Each replicate reweights whole places by multinomial counts, refits the
//! model from scratch with its own seed, and folds the fitted medians into
//! streaming moment accumulators. Resampling places rather than sequences
//! respects the strong within-place correlation of surveillance counts.

use std::collections::BTreeMap;
use std::time::Instant;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::dataset::Dataset;
use crate::errors::Result;
use crate::model::SiteMap;
use crate::predict::DEFAULT_ELEMENT_BUDGET;
use crate::stats::{CountMeanVariance, WelfordCovariance};
use crate::svi::{fit_svi, FitConfig, InitData};

/// Sites at most this large get a full replicate covariance; larger ones are
/// summarized by elementwise moments only.
const COVARIANCE_SIZE_LIMIT: usize = 1024;

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub model_type: String,
    pub guide_type: String,
    pub learning_rate: f64,
    pub learning_rate_decay: f64,
    pub num_steps: usize,
    pub clip_norm: f64,
    pub rank: usize,
    /// Number of bootstrap replicates.
    pub num_samples: usize,
    /// Progress-log period inside each replicate fit; the default logs only
    /// the first step.
    pub log_every: Option<usize>,
    pub seed: u64,
    pub element_budget: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            model_type: String::new(),
            guide_type: "map".to_string(),
            learning_rate: 0.05,
            learning_rate_decay: 0.1,
            num_steps: 3001,
            clip_norm: 10.0,
            rank: 10,
            num_samples: 100,
            log_every: None,
            seed: 20210319,
            element_budget: DEFAULT_ELEMENT_BUDGET,
        }
    }
}

pub struct BootstrapResult {
    pub mean: SiteMap,
    pub std: SiteMap,
    /// Full replicate covariance for small sites, flattened row-major.
    pub covariance: BTreeMap<String, DMatrix<f64>>,
    pub walltime: f64,
}

/// Multinomial place weights: `num_places` uniform draws, counted per place.
/// Weights average one, so reweighted datasets keep their overall size.
pub fn resample_weights(num_places: usize, rng: &mut StdRng) -> Vec<f64> {
    let mut weights = vec![0.0; num_places];
    for _ in 0..num_places {
        weights[rng.random_range(0..num_places)] += 1.0;
    }
    weights
}

enum SiteAccumulator {
    Full(WelfordCovariance, Vec<usize>),
    Moments(CountMeanVariance),
}

pub fn fit_bootstrap(dataset: &Dataset, config: &BootstrapConfig) -> Result<BootstrapResult> {
    let start = Instant::now();
    let (_t, p, _s, _f) = dataset.dims();
    let log_every = config
        .log_every
        .unwrap_or_else(|| config.num_steps.saturating_sub(1).max(1));
    log::info!(
        "bootstrapping {} replicates over {} places",
        config.num_samples,
        p
    );

    let bar = ProgressBar::new(config.num_samples as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} replicates {elapsed}") {
        bar.set_style(style);
    }

    let mut accs: BTreeMap<String, SiteAccumulator> = BTreeMap::new();
    for step in 0..config.num_samples {
        let replicate_seed = config.seed + step as u64;
        let mut rng = StdRng::seed_from_u64(replicate_seed);
        let weights = resample_weights(p, &mut rng);
        let reweighted = dataset.with_reweighted_counts(&weights)?;

        let fit = fit_svi(
            &reweighted,
            &FitConfig {
                model_type: config.model_type.clone(),
                guide_type: config.guide_type.clone(),
                init_data: InitData::Empirical,
                learning_rate: config.learning_rate,
                learning_rate_decay: config.learning_rate_decay,
                num_steps: config.num_steps,
                num_samples: 1,
                clip_norm: config.clip_norm,
                rank: config.rank,
                log_every,
                seed: replicate_seed,
                check_loss: false,
                element_budget: config.element_budget,
            },
        )?;

        for (name, value) in &fit.median {
            let n = value.elem_count();
            if n > config.element_budget {
                continue;
            }
            let acc = accs.entry(name.clone()).or_insert_with(|| {
                if n <= COVARIANCE_SIZE_LIMIT {
                    SiteAccumulator::Full(WelfordCovariance::new(n), value.dims().to_vec())
                } else {
                    SiteAccumulator::Moments(CountMeanVariance::new(value.dims()))
                }
            });
            match acc {
                SiteAccumulator::Full(w, _) => {
                    w.update(&value.flatten_all()?.to_vec1::<f64>()?)?
                }
                SiteAccumulator::Moments(m) => m.update(value)?,
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    let mut mean = SiteMap::new();
    let mut std = SiteMap::new();
    let mut covariance = BTreeMap::new();
    for (name, acc) in accs {
        match acc {
            SiteAccumulator::Full(w, dims) => {
                let m: Vec<f64> = w.mean().iter().copied().collect();
                mean.insert(name.clone(), Tensor::from_vec(m, dims.clone(), &Device::Cpu)?);
                if w.count() >= 2 {
                    let cov = w.covariance()?;
                    let sd: Vec<f64> = cov.diagonal().iter().map(|v| v.sqrt()).collect();
                    std.insert(name.clone(), Tensor::from_vec(sd, dims, &Device::Cpu)?);
                    covariance.insert(name, cov);
                }
            }
            SiteAccumulator::Moments(m) => {
                mean.insert(name.clone(), m.mean_tensor()?);
                if m.count() >= 2 {
                    std.insert(name, m.std_tensor()?);
                }
            }
        }
    }

    let walltime = start.elapsed().as_secs_f64();
    log::info!(
        "bootstrap took {:.1} seconds for {} replicates",
        walltime,
        config.num_samples
    );
    Ok(BootstrapResult {
        mean,
        std,
        covariance,
        walltime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{simulate, SimulateConfig};
    use approx::assert_abs_diff_eq;

    #[test]
    fn weights_count_places_and_are_deterministic() {
        let mut r1 = StdRng::seed_from_u64(17);
        let mut r2 = StdRng::seed_from_u64(17);
        let a = resample_weights(7, &mut r1);
        let b = resample_weights(7, &mut r2);
        assert_eq!(a, b);
        assert_abs_diff_eq!(a.iter().sum::<f64>(), 7.0, epsilon = 1e-12);
        assert!(a.iter().all(|w| *w >= 0.0 && w.fract() == 0.0));
    }

    #[test]
    fn single_replicate_matches_a_direct_reweighted_fit() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(9);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let config = BootstrapConfig {
            num_steps: 30,
            num_samples: 1,
            seed: 123,
            ..BootstrapConfig::default()
        };
        let boot = fit_bootstrap(&ds, &config)?;
        assert!(boot.std.is_empty());
        assert!(boot.covariance.is_empty());

        let mut rng = StdRng::seed_from_u64(123);
        let weights = resample_weights(3, &mut rng);
        let direct = fit_svi(
            &ds.with_reweighted_counts(&weights)?,
            &FitConfig {
                guide_type: "map".to_string(),
                num_steps: 30,
                num_samples: 1,
                log_every: 29,
                seed: 123,
                ..FitConfig::default()
            },
        )?;
        let got = boot.mean["rate_coef"].to_vec1::<f64>()?;
        let want = direct.median["rate_coef"].to_vec1::<f64>()?;
        for (g, w) in got.iter().zip(&want) {
            assert_abs_diff_eq!(*g, *w, epsilon = 1e-12);
        }
        Ok(())
    }
}
