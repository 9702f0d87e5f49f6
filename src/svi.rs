//! Stochastic variational inference driver.
//!
//! Each step draws once from the guide, evaluates the joint density at the
//! (graph-connected) draw, and descends the negative ELBO with clipped Adam.
//! Fits are reproducible from a single seed because every random number runs
//! through one generator.

use std::collections::BTreeMap;
use std::time::Instant;

use candle_core::Tensor;
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::dataset::Dataset;
use crate::errors::{Error, Result};
use crate::guide::{Guide, GuideType};
use crate::init::{InitOverrides, InitializationPolicy};
use crate::model::{GrowthModel, ModelType, SiteMap};
use crate::numerics::named_params;
use crate::optimizer::{ClippedAdam, OptimizerPolicy};
use crate::predict::{predict, DEFAULT_ELEMENT_BUDGET};
use crate::stats::median_of;

/// Parameter snapshots above this total size are not kept in the result.
const PARAM_SNAPSHOT_BUDGET: usize = 10_000_000;

/// Loss-trace window for the divergence heuristic.
const CHECK_LOSS_WINDOW: usize = 50;

/// How to seed the guide's initial location parameters.
#[derive(Clone, Debug, Default)]
pub enum InitData {
    /// Smoothed empirical proportions and small fixed scales.
    #[default]
    Empirical,
    /// Run a short MAP fit first and seed from its median. The string picks
    /// the warm fit's model_type; empty means reuse the main one.
    WarmStart(String),
    /// Explicit per-site values, typically from an earlier fit.
    Overrides(InitOverrides),
}

#[derive(Clone, Debug)]
pub struct FitConfig {
    pub model_type: String,
    pub guide_type: String,
    pub init_data: InitData,
    pub learning_rate: f64,
    pub learning_rate_decay: f64,
    pub num_steps: usize,
    /// Posterior samples for the moment summaries after fitting.
    pub num_samples: usize,
    pub clip_norm: f64,
    /// Rank of the full low-rank guide; ignored by the other guides.
    pub rank: usize,
    pub log_every: usize,
    pub seed: u64,
    /// Abort when the loss trace starts climbing.
    pub check_loss: bool,
    pub element_budget: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            model_type: String::new(),
            guide_type: String::new(),
            init_data: InitData::Empirical,
            learning_rate: 0.05,
            learning_rate_decay: 0.1,
            num_steps: 3001,
            num_samples: 1000,
            clip_norm: 10.0,
            rank: 10,
            log_every: 50,
            seed: 20210319,
            check_loss: false,
            element_budget: DEFAULT_ELEMENT_BUDGET,
        }
    }
}

pub struct FitResult {
    pub median: SiteMap,
    pub mean: SiteMap,
    pub std: SiteMap,
    pub losses: Vec<f64>,
    /// Per-step gradient norms and logged scalar medians, keyed by name;
    /// also carries the loss trace under "loss".
    pub series: BTreeMap<String, Vec<f64>>,
    /// Raw parameter snapshot, omitted for very large fits.
    pub params: BTreeMap<String, Tensor>,
    pub walltime: f64,
}

/// Abbreviate a site name by the initials of its underscore-separated words,
/// so progress lines stay on one row.
fn abbreviate(name: &str) -> String {
    name.split('_')
        .filter_map(|w| w.chars().next())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Trailing-median divergence check over the last [`CHECK_LOSS_WINDOW`]
/// losses: the median of the most recent quarter-window must not exceed the
/// preceding one by more than the nonzero-observation count.
fn check_loss_trace(losses: &[f64], num_obs: f64) -> Result<()> {
    let n = losses.len();
    let half = CHECK_LOSS_WINDOW / 2;
    let prev = median_of(losses[n - CHECK_LOSS_WINDOW..n - half].to_vec());
    let curr = median_of(losses[n - half..].to_vec());
    if curr - prev >= num_obs {
        return Err(Error::DivergenceHeuristic(format!(
            "loss is increasing at step {}: median {:.1} -> {:.1}",
            n - 1,
            prev,
            curr
        )));
    }
    Ok(())
}

fn resolve_overrides(dataset: &Dataset, config: &FitConfig) -> Result<InitOverrides> {
    match &config.init_data {
        InitData::Empirical => Ok(InitOverrides::default()),
        InitData::Overrides(overrides) => Ok(overrides.clone()),
        InitData::WarmStart(model_type) => {
            let warm_model_type = if model_type.is_empty() {
                config.model_type.clone()
            } else {
                model_type.clone()
            };
            log::info!("warm start: MAP fit of '{}' model", warm_model_type);
            let warm = fit_svi(
                dataset,
                &FitConfig {
                    model_type: warm_model_type,
                    guide_type: "map".to_string(),
                    init_data: InitData::Empirical,
                    learning_rate: 0.05,
                    learning_rate_decay: 1.0,
                    num_steps: 1001,
                    num_samples: 1,
                    check_loss: false,
                    ..config.clone()
                },
            )?;
            InitOverrides::from_site_map(&warm.median)
        }
    }
}

pub fn fit_svi(dataset: &Dataset, config: &FitConfig) -> Result<FitResult> {
    let start = Instant::now();
    let model_type = ModelType::parse(&config.model_type)?;
    let guide_type = GuideType::parse(&config.guide_type)?;
    let overrides = resolve_overrides(dataset, config)?;

    let (t, p, s, f) = dataset.dims();
    let num_obs = dataset.num_nonzero()? as f64;
    log::info!(
        "fitting {} model with {:?} guide over T x P x S x F = {} x {} x {} x {} ({} nonzero bins)",
        model_type,
        guide_type,
        t,
        p,
        s,
        f,
        num_obs
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let varmap = VarMap::new();
    let model = GrowthModel::new(dataset, model_type, &varmap)?;
    let init = InitializationPolicy::new(dataset, overrides)?;
    let guide = Guide::new(&model, guide_type, config.rank, &init, &varmap, &mut rng)?;

    let params = named_params(&varmap);
    let total_params: usize = params
        .iter()
        .map(|(_, v)| v.as_tensor().elem_count())
        .sum();
    log::info!("{} parameters in {} tensors", total_params, params.len());

    let scalar_sites = model.scalar_sites();
    let policy = OptimizerPolicy::new(&scalar_sites);
    let mut opt = ClippedAdam::new(
        params,
        &policy,
        config.learning_rate,
        config.learning_rate_decay,
        config.num_steps,
        config.clip_norm,
    )?;

    let mut losses = Vec::with_capacity(config.num_steps);
    let mut series: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for step in 0..config.num_steps {
        let draw = guide.draw(&mut rng)?;
        let trace = model.eval(&draw.latents, true)?;
        let elbo = ((trace.log_joint + draw.log_jac)? - draw.log_q)?;
        let loss = elbo.neg()?;
        let loss_val = loss.to_scalar::<f64>()?;
        if !loss_val.is_finite() {
            return Err(Error::NumericalDivergence(format!(
                "loss became {} at step {}",
                loss_val, step
            )));
        }
        let grads = loss.backward()?;
        for (name, inf_norm) in opt.step(&grads)? {
            series.entry(name).or_default().push(inf_norm);
        }
        losses.push(loss_val);

        let scalars = guide.median_scalars()?;
        for (name, value) in &scalars {
            series.entry(name.clone()).or_default().push(*value);
        }

        // log_every of zero disables progress lines.
        if config.log_every != 0 && step % config.log_every == 0 {
            let mut line = format!("step {:>4} loss = {:.6}", step, loss_val / num_obs);
            for (name, value) in &scalars {
                line.push_str(&format!(", {} = {:.3}", abbreviate(name), value));
            }
            log::info!("{line}");
        }

        if config.check_loss && step >= CHECK_LOSS_WINDOW {
            check_loss_trace(&losses, num_obs)?;
        }
    }

    let prediction = predict(
        &model,
        &guide,
        config.num_samples,
        config.element_budget,
        None,
        &mut rng,
    )?;

    let mut param_snapshot = BTreeMap::new();
    if total_params < PARAM_SNAPSHOT_BUDGET {
        for (name, var) in named_params(&varmap) {
            param_snapshot.insert(name, var.as_tensor().detach());
        }
    }

    series.insert("loss".to_string(), losses.clone());
    let walltime = start.elapsed().as_secs_f64();
    log::info!("SVI took {:.1} seconds, {} steps", walltime, config.num_steps);

    Ok(FitResult {
        median: prediction.median,
        mean: prediction.mean,
        std: prediction.std,
        losses,
        series,
        params: param_snapshot,
        walltime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{simulate, SimulateConfig};

    fn tiny_config(steps: usize) -> FitConfig {
        FitConfig {
            guide_type: "map".to_string(),
            num_steps: steps,
            num_samples: 1,
            log_every: 1000,
            ..FitConfig::default()
        }
    }

    #[test]
    fn map_fit_decreases_the_loss() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let fit = fit_svi(&ds, &tiny_config(100))?;
        assert_eq!(fit.losses.len(), 100);
        assert!(fit.losses.iter().all(|l| l.is_finite()));
        assert!(
            fit.losses[99] < fit.losses[0],
            "loss went from {} to {}",
            fit.losses[0],
            fit.losses[99]
        );
        Ok(())
    }

    #[test]
    fn fits_are_deterministic_for_a_fixed_seed() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let ds = simulate(
            &SimulateConfig {
                num_times: 4,
                num_places: 2,
                num_strains: 3,
                num_features: 2,
                ..SimulateConfig::default()
            },
            &mut rng,
        )?;
        let config = FitConfig {
            guide_type: "normal".to_string(),
            num_steps: 20,
            num_samples: 2,
            log_every: 1000,
            ..FitConfig::default()
        };
        let a = fit_svi(&ds, &config)?;
        let b = fit_svi(&ds, &config)?;
        assert_eq!(a.losses, b.losses);
        assert_eq!(
            a.median["rate_coef"].to_vec1::<f64>()?,
            b.median["rate_coef"].to_vec1::<f64>()?
        );
        Ok(())
    }

    #[test]
    fn series_carries_loss_and_gradient_norms() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let fit = fit_svi(&ds, &tiny_config(10))?;
        assert_eq!(fit.series["loss"].len(), 10);
        assert_eq!(fit.series["map.locs.rate_coef"].len(), 10);
        assert!(!fit.params.is_empty());
        Ok(())
    }

    #[test]
    fn zero_log_every_disables_progress_logging() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(14);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let fit = fit_svi(
            &ds,
            &FitConfig {
                log_every: 0,
                ..tiny_config(10)
            },
        )?;
        assert_eq!(fit.losses.len(), 10);
        Ok(())
    }

    #[test]
    fn scalar_traces_cover_every_step() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(15);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        // log_every far beyond num_steps: traces must not depend on logging.
        let fit = fit_svi(&ds, &tiny_config(10))?;
        assert_eq!(fit.series["feature_scale"].len(), 10);
        Ok(())
    }

    #[test]
    fn non_finite_loss_aborts_with_numerical_divergence() {
        let mut rng = StdRng::seed_from_u64(16);
        let ds = simulate(&SimulateConfig::default(), &mut rng).unwrap();
        // A zero feature_scale puts the coefficient prior at a singularity.
        let mut overrides = crate::init::InitOverrides::default();
        overrides.feature_scale = Some(crate::numerics::scalar(0.0).unwrap());
        let r = fit_svi(
            &ds,
            &FitConfig {
                init_data: InitData::Overrides(overrides),
                ..tiny_config(5)
            },
        );
        assert!(matches!(r, Err(Error::NumericalDivergence(_))));
    }

    #[test]
    fn rising_loss_trace_trips_the_divergence_check() {
        let rising: Vec<f64> = (0..60).map(|i| i as f64 * 10.0).collect();
        let r = check_loss_trace(&rising, 10.0);
        assert!(matches!(r, Err(Error::DivergenceHeuristic(_))));

        let flat = vec![100.0; 60];
        assert!(check_loss_trace(&flat, 10.0).is_ok());

        // Increases below the observation-count tolerance pass.
        let slow: Vec<f64> = (0..60).map(|i| i as f64 * 0.01).collect();
        assert!(check_loss_trace(&slow, 10.0).is_ok());
    }

    #[test]
    fn abbreviation_uses_word_initials() {
        assert_eq!(abbreviate("feature_scale"), "FS");
        assert_eq!(abbreviate("logits_scale"), "LS");
        assert_eq!(abbreviate("init"), "I");
    }
}
