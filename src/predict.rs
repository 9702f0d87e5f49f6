//! Posterior summarization: medians from the guide's location parameters and
//! Monte Carlo moments over fresh guide draws.
//!
//! Small outputs are stacked and reduced in one shot; large ones fall back to
//! streaming accumulators so memory stays flat in the sample count.

use candle_core::Tensor;
use rand::rngs::StdRng;

use crate::errors::Result;
use crate::guide::Guide;
use crate::model::{GrowthModel, SiteMap};
use crate::stats::CountMeanVariance;

/// Elementwise outputs above this size are summarized by streaming.
pub const DEFAULT_ELEMENT_BUDGET: usize = 100_000;

/// Derived sites always kept in summaries, whatever their size.
pub const SAVE_PARAMS: [&str; 2] = ["rate", "probs"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MomentsStrategy {
    /// Stack all samples and reduce once.
    Vectorized,
    /// Fold samples into Welford accumulators one at a time.
    Streaming,
}

pub fn choose_strategy(output_elems: usize, budget: usize) -> MomentsStrategy {
    if output_elems < budget {
        MomentsStrategy::Vectorized
    } else {
        MomentsStrategy::Streaming
    }
}

pub struct Prediction {
    pub median: SiteMap,
    pub mean: SiteMap,
    pub std: SiteMap,
}

fn keep_site(name: &str, value: &Tensor, budget: usize) -> bool {
    SAVE_PARAMS.contains(&name) || value.elem_count() <= budget
}

/// Summarize the fitted posterior. `num_samples` guide draws feed the moment
/// estimates; the standard deviation is omitted below two samples.
pub fn predict(
    model: &GrowthModel,
    guide: &Guide,
    num_samples: usize,
    budget: usize,
    strategy: Option<MomentsStrategy>,
    rng: &mut StdRng,
) -> Result<Prediction> {
    let median_trace = model.eval(&guide.median()?, false)?;
    let mut median = SiteMap::new();
    for (name, value) in median_trace.sites {
        if keep_site(&name, &value, budget) {
            median.insert(name, value.detach());
        }
    }

    let mut mean = SiteMap::new();
    let mut std = SiteMap::new();
    if num_samples == 0 {
        return Ok(Prediction { median, mean, std });
    }

    // Strategy keys on one draw's output size, not the total across samples:
    // streaming exists to bound peak memory, and the stacked buffers grow
    // with the per-draw footprint times a small constant.
    let per_draw: usize = median.values().map(Tensor::elem_count).sum();
    let strategy = strategy.unwrap_or_else(|| choose_strategy(per_draw, budget));
    log::debug!(
        "summarizing {} samples x {} elements via {:?}",
        num_samples,
        per_draw,
        strategy
    );

    match strategy {
        MomentsStrategy::Vectorized => {
            let mut stacks: Vec<(String, Vec<Tensor>)> =
                median.keys().map(|k| (k.clone(), Vec::new())).collect();
            for _ in 0..num_samples {
                let draw = guide.draw(rng)?;
                let trace = model.eval(&draw.latents, false)?;
                for (name, stack) in stacks.iter_mut() {
                    if let Some(value) = trace.sites.get(name) {
                        stack.push(value.detach());
                    }
                }
            }
            for (name, stack) in stacks {
                if stack.is_empty() {
                    continue;
                }
                let all = Tensor::stack(&stack, 0)?;
                let m = all.mean(0)?;
                mean.insert(name.clone(), m.clone());
                if num_samples >= 2 {
                    let dev = all.broadcast_sub(&m.unsqueeze(0)?)?;
                    let var = (dev.sqr()?.sum(0)? / (num_samples - 1) as f64)?;
                    std.insert(name, var.sqrt()?);
                }
            }
        }
        MomentsStrategy::Streaming => {
            let mut accs: Vec<(String, Option<CountMeanVariance>)> =
                median.keys().map(|k| (k.clone(), None)).collect();
            for _ in 0..num_samples {
                let draw = guide.draw(rng)?;
                let trace = model.eval(&draw.latents, false)?;
                for (name, acc) in accs.iter_mut() {
                    if let Some(value) = trace.sites.get(name) {
                        let value = value.detach();
                        acc.get_or_insert_with(|| CountMeanVariance::new(value.dims()))
                            .update(&value)?;
                    }
                }
            }
            for (name, acc) in accs {
                let Some(acc) = acc else { continue };
                mean.insert(name.clone(), acc.mean_tensor()?);
                if acc.count() >= 2 {
                    std.insert(name, acc.std_tensor()?);
                }
            }
        }
    }
    Ok(Prediction { median, mean, std })
}
