//! Immutable genomic-surveillance dataset: weekly strain counts per place,
//! a strain-by-mutation feature matrix, and per-place centered time scales.
//!
//! Upstream ETL (feed sharding, sequence clustering, crosswalking) is assumed
//! to have produced these tensors; this module only validates, subsets, and
//! simulates them.

use std::collections::HashMap;

use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;
use log::info;
use rand::rngs::StdRng;
use rand::Rng;

use crate::errors::Result;
use crate::numerics::DTYPE;
use crate::{config_err, shape_err};

/// Observation bin width in days.
pub const TIMESTEP_DAYS: f64 = 14.0;
/// Mean viral generation interval in days; converts bins to generations.
pub const GENERATION_DAYS: f64 = 5.5;

/// Feature columns whose value range falls below this are dropped during
/// subsetting, since near-constant columns carry no growth signal.
const FEATURE_GAP_MIN: f64 = 0.5;

#[derive(Clone)]
pub struct Dataset {
    weekly_strains: Tensor, // [T,P,S] nonnegative counts
    features: Tensor,       // [S,F]
    local_time: Tensor,     // [T,P] centered per place
    locations: Vec<Box<str>>,
    lineages: Vec<Box<str>>,
    mutations: Vec<Box<str>>,
    location_lookup: HashMap<Box<str>, usize>,
    lineage_lookup: HashMap<Box<str>, usize>,
}

/// Place/strain filters applied by [`Dataset::subset`].
#[derive(Clone, Debug, Default)]
pub struct SubsetQuery {
    /// Keep locations whose name contains any of these substrings.
    pub location_queries: Option<Vec<String>>,
    /// Keep at most this many strains, by descending total count.
    pub max_strains: Option<usize>,
}

fn lookup_of(names: &[Box<str>], what: &str) -> Result<HashMap<Box<str>, usize>> {
    let mut map = HashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        if map.insert(name.clone(), i).is_some() {
            return Err(config_err!("duplicate {} name '{}'", what, name));
        }
    }
    Ok(map)
}

impl Dataset {
    pub fn new(
        weekly_strains: Tensor,
        features: Tensor,
        local_time: Tensor,
        locations: Vec<Box<str>>,
        lineages: Vec<Box<str>>,
        mutations: Vec<Box<str>>,
    ) -> Result<Self> {
        let (t, p, s) = weekly_strains.dims3()?;
        let (s2, f) = features.dims2()?;
        if s2 != s {
            return Err(shape_err!(
                "features has {} strains but weekly_strains has {}",
                s2,
                s
            ));
        }
        if local_time.dims2()? != (t, p) {
            return Err(shape_err!(
                "local_time {:?} does not match weekly_strains [{},{}]",
                local_time.dims(),
                t,
                p
            ));
        }
        if locations.len() != p || lineages.len() != s || mutations.len() != f {
            return Err(shape_err!(
                "name lists ({},{},{}) do not match dims (P={},S={},F={})",
                locations.len(),
                lineages.len(),
                mutations.len(),
                p,
                s,
                f
            ));
        }
        for plane in weekly_strains.to_vec3::<f64>()? {
            for row in plane {
                for x in row {
                    if !(x.is_finite() && x >= 0.0) {
                        return Err(config_err!("weekly_strains contains invalid count {}", x));
                    }
                }
            }
        }
        let location_lookup = lookup_of(&locations, "location")?;
        let lineage_lookup = lookup_of(&lineages, "lineage")?;
        Ok(Self {
            weekly_strains,
            features,
            local_time,
            locations,
            lineages,
            mutations,
            location_lookup,
            lineage_lookup,
        })
    }

    /// (T, P, S, F)
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        let (t, p, s) = self.weekly_strains.dims3().expect("validated at build");
        let f = self.mutations.len();
        (t, p, s, f)
    }

    pub fn weekly_strains(&self) -> &Tensor {
        &self.weekly_strains
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn local_time(&self) -> &Tensor {
        &self.local_time
    }

    pub fn locations(&self) -> &[Box<str>] {
        &self.locations
    }

    pub fn lineages(&self) -> &[Box<str>] {
        &self.lineages
    }

    pub fn mutations(&self) -> &[Box<str>] {
        &self.mutations
    }

    pub fn location_id(&self, name: &str) -> Option<usize> {
        self.location_lookup.get(name).copied()
    }

    pub fn lineage_id(&self, name: &str) -> Option<usize> {
        self.lineage_lookup.get(name).copied()
    }

    /// Number of nonzero count cells; scales the loss-divergence tolerance
    /// and normalizes progress-log losses.
    pub fn num_nonzero(&self) -> Result<usize> {
        let mut n = 0;
        for plane in self.weekly_strains.to_vec3::<f64>()? {
            for row in plane {
                n += row.iter().filter(|&&x| x > 0.0).count();
            }
        }
        Ok(n)
    }

    /// Derive a new dataset filtered by place/strain queries, then drop
    /// near-constant feature columns. Subsetting is idempotent: applying the
    /// same query to the result is a no-op.
    pub fn subset(&self, query: &SubsetQuery) -> Result<Dataset> {
        let dev = &Device::Cpu;
        let mut weekly = self.weekly_strains.clone();
        let mut local_time = self.local_time.clone();
        let mut features = self.features.clone();
        let mut locations = self.locations.clone();
        let mut lineages = self.lineages.clone();

        if let Some(queries) = &query.location_queries {
            let mut keep: Vec<(Box<str>, usize)> = self
                .locations
                .iter()
                .enumerate()
                .filter(|(_, name)| queries.iter().any(|q| name.contains(q.as_str())))
                .map(|(i, name)| (name.clone(), i))
                .collect();
            keep.sort_by(|a, b| a.0.cmp(&b.0));
            let ids: Vec<u32> = keep.iter().map(|(_, i)| *i as u32).collect();
            let idx = Tensor::from_vec(ids, (keep.len(),), dev)?;
            weekly = weekly.index_select(&idx, 1)?;
            local_time = local_time.index_select(&idx, 1)?;
            locations = keep.into_iter().map(|(name, _)| name).collect();
        }

        let num_strains = weekly.dim(2)?;
        if let Some(max_strains) = query.max_strains {
            if num_strains > max_strains {
                let totals = weekly.sum(0)?.sum(0)?.to_vec1::<f64>()?;
                let mut order: Vec<usize> = (0..num_strains).collect();
                order.sort_by(|&a, &b| {
                    totals[b]
                        .partial_cmp(&totals[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.cmp(&b))
                });
                order.truncate(max_strains);
                let ids: Vec<u32> = order.iter().map(|&i| i as u32).collect();
                let idx = Tensor::from_vec(ids, (order.len(),), dev)?;
                weekly = weekly.index_select(&idx, 2)?;
                features = features.index_select(&idx, 0)?;
                lineages = order.iter().map(|&i| lineages[i].clone()).collect();
            }
        }

        // Drop feature columns that became near-constant under the filters.
        let gaps = (features.max(0)? - features.min(0)?)?.to_vec1::<f64>()?;
        let keep: Vec<usize> = (0..gaps.len()).filter(|&j| gaps[j] >= FEATURE_GAP_MIN).collect();
        let ids: Vec<u32> = keep.iter().map(|&j| j as u32).collect();
        let idx = Tensor::from_vec(ids, (keep.len(),), dev)?;
        let features = features.index_select(&idx, 1)?;
        let mutations: Vec<Box<str>> = keep.iter().map(|&j| self.mutations[j].clone()).collect();

        info!(
            "Selected {}/{} places, {}/{} strains, {}/{} mutations",
            locations.len(),
            self.locations.len(),
            lineages.len(),
            self.lineages.len(),
            mutations.len(),
            self.mutations.len()
        );

        Dataset::new(weekly, features, local_time, locations, lineages, mutations)
    }

    /// Same dataset with counts reweighted per place; used by the place-level
    /// block bootstrap.
    pub fn with_reweighted_counts(&self, place_weights: &[f64]) -> Result<Dataset> {
        let (_, p, _, _) = self.dims();
        if place_weights.len() != p {
            return Err(shape_err!(
                "got {} place weights for {} places",
                place_weights.len(),
                p
            ));
        }
        let w = Tensor::from_vec(place_weights.to_vec(), (1, p, 1), &Device::Cpu)?;
        let weekly = self.weekly_strains.broadcast_mul(&w)?;
        let mut out = self.clone();
        out.weekly_strains = weekly;
        Ok(out)
    }
}

/// Per-place time scale in generations, centered at the observation-weighted
/// mean time so that `init` and `rate` are identified separately.
pub fn centered_local_time(
    weekly_strains: &Tensor,
    timestep_days: f64,
    generation_days: f64,
) -> Result<Tensor> {
    let (t, p, _) = weekly_strains.dims3()?;
    let num_obs = weekly_strains.sum(D::Minus1)?; // [T,P]
    let per_place = num_obs.sum(0)?.to_vec1::<f64>()?;
    for (j, total) in per_place.iter().enumerate() {
        if *total <= 0.0 {
            return Err(config_err!("place index {} has no observations", j));
        }
    }
    let scale = timestep_days / generation_days;
    let times: Vec<f64> = (0..t).map(|i| i as f64 * scale).collect();
    let times = Tensor::from_vec(times, (t, 1), &Device::Cpu)?.broadcast_as((t, p))?;
    let weighted = (&times * &num_obs)?.sum(0)?;
    let center = (&weighted / &num_obs.sum(0)?)?; // [P]
    let out = times.broadcast_sub(&center.unsqueeze(0)?)?;
    out.contiguous().map_err(Into::into)
}

/// Configuration for the synthetic-data generator used by tests and demos.
#[derive(Clone, Debug)]
pub struct SimulateConfig {
    pub num_times: usize,
    pub num_places: usize,
    pub num_strains: usize,
    pub num_features: usize,
    /// Multinomial total per (time, place) bin.
    pub counts_per_bin: usize,
    /// Per-feature growth coefficients on the `0.01 * coef` scale of the
    /// model; random when unset.
    pub rate_coef: Option<Vec<f64>>,
    /// Strain-by-mutation indicators; random binary when unset.
    pub features: Option<Vec<Vec<f64>>>,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            num_times: 12,
            num_places: 3,
            num_strains: 4,
            num_features: 3,
            counts_per_bin: 500,
            rate_coef: None,
            features: None,
        }
    }
}

fn sample_multinomial(rng: &mut StdRng, total: usize, probs: &[f64]) -> Vec<f64> {
    let mut counts = vec![0f64; probs.len()];
    for _ in 0..total {
        let mut u: f64 = rng.random::<f64>();
        let mut chosen = probs.len() - 1;
        for (i, p) in probs.iter().enumerate() {
            if u < *p {
                chosen = i;
                break;
            }
            u -= p;
        }
        counts[chosen] += 1.0;
    }
    counts
}

/// Draw a dataset from the base growth model: multinomial counts around
/// softmax logits that drift linearly in local time.
pub fn simulate(config: &SimulateConfig, rng: &mut StdRng) -> Result<Dataset> {
    let (t, p, s, f) = (
        config.num_times,
        config.num_places,
        config.num_strains,
        config.num_features,
    );
    let dev = &Device::Cpu;

    let feat_rows: Vec<Vec<f64>> = match &config.features {
        Some(rows) => rows.clone(),
        None => (0..s)
            .map(|_| (0..f).map(|_| if rng.random::<f64>() < 0.5 { 1.0 } else { 0.0 }).collect())
            .collect(),
    };
    let coef: Vec<f64> = match &config.rate_coef {
        Some(c) => c.clone(),
        None => (0..f).map(|_| rng.random_range(-30.0..30.0)).collect(),
    };
    if feat_rows.len() != s || feat_rows.iter().any(|r| r.len() != f) || coef.len() != f {
        return Err(shape_err!("simulate: features/rate_coef do not match S={}, F={}", s, f));
    }

    let rate: Vec<f64> = feat_rows
        .iter()
        .map(|row| 0.01 * row.iter().zip(&coef).map(|(x, c)| x * c).sum::<f64>())
        .collect();
    let init: Vec<f64> = (0..s).map(|_| rng.random_range(-0.5..0.5)).collect();

    let scale = TIMESTEP_DAYS / GENERATION_DAYS;
    let mid = (t as f64 - 1.0) / 2.0;
    let mut counts = Vec::with_capacity(t * p * s);
    for ti in 0..t {
        let lt = (ti as f64 - mid) * scale;
        for _ in 0..p {
            let logits: Vec<f64> = (0..s).map(|si| init[si] + rate[si] * lt).collect();
            let logits_t = Tensor::from_vec(logits, (1, s), dev)?;
            let probs = softmax(&logits_t, D::Minus1)?.to_vec2::<f64>()?;
            counts.extend(sample_multinomial(rng, config.counts_per_bin, &probs[0]));
        }
    }

    let weekly = Tensor::from_vec(counts, (t, p, s), dev)?.to_dtype(DTYPE)?;
    let features = Tensor::from_vec(feat_rows.concat(), (s, f), dev)?;
    let local_time = centered_local_time(&weekly, TIMESTEP_DAYS, GENERATION_DAYS)?;
    Dataset::new(
        weekly,
        features,
        local_time,
        (0..p).map(|i| format!("place/{i}").into()).collect(),
        (0..s).map(|i| format!("lineage.{i}").into()).collect(),
        (0..f).map(|i| format!("S:M{i}").into()).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn local_time_is_observation_centered() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let num_obs = ds.weekly_strains().sum(D::Minus1)?.to_vec2::<f64>()?;
        let lt = ds.local_time().to_vec2::<f64>()?;
        let (t, p, _, _) = ds.dims();
        for j in 0..p {
            let weighted: f64 = (0..t).map(|i| lt[i][j] * num_obs[i][j]).sum();
            assert_abs_diff_eq!(weighted, 0.0, epsilon = 1e-8);
        }
        Ok(())
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let dev = &Device::Cpu;
        let weekly = Tensor::zeros((3, 2, 4), DTYPE, dev).unwrap();
        let features = Tensor::zeros((5, 2), DTYPE, dev).unwrap(); // wrong S
        let local_time = Tensor::zeros((3, 2), DTYPE, dev).unwrap();
        let r = Dataset::new(
            weekly,
            features,
            local_time,
            vec!["a".into(), "b".into()],
            (0..4).map(|i| format!("l{i}").into()).collect(),
            vec!["m0".into(), "m1".into()],
        );
        assert!(matches!(r, Err(crate::errors::Error::ShapeMismatch(_))));
    }
}
