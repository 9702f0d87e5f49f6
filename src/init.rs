//! Initial values for latent sites, in constrained space.
//!
//! Initial logits come from smoothed empirical strain proportions; scale
//! sites start small so the first steps stay inside the well-behaved region
//! of the posterior. Warm starts override any subset of sites with values
//! taken from an earlier fit.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;

use crate::config_err;
use crate::dataset::Dataset;
use crate::errors::Result;
use crate::model::{Site, SiteMap};
use crate::numerics::{rand_uniform, scalar};
use crate::stats::median_of;

/// Per-site override values, typically harvested from a warm-start fit.
#[derive(Clone, Debug, Default)]
pub struct InitOverrides {
    pub feature_scale: Option<Tensor>,
    pub logits_scale: Option<Tensor>,
    pub rate_coef: Option<Tensor>,
    pub rate_coef_decentered: Option<Tensor>,
    pub rate_scale: Option<Tensor>,
    pub strain_scale: Option<Tensor>,
    pub place_scale: Option<Tensor>,
    pub rate: Option<Tensor>,
    pub rate_decentered: Option<Tensor>,
    pub init: Option<Tensor>,
    pub logits: Option<Tensor>,
    pub logits_decentered: Option<Tensor>,
}

impl InitOverrides {
    /// Build overrides from a recorded site map. Derived `probs` entries are
    /// ignored; any other unrecognized name is an error.
    pub fn from_site_map(sites: &SiteMap) -> Result<Self> {
        let mut out = Self::default();
        for (name, value) in sites {
            let slot = match name.as_str() {
                "probs" => continue,
                "feature_scale" => &mut out.feature_scale,
                "logits_scale" => &mut out.logits_scale,
                "rate_coef" => &mut out.rate_coef,
                "rate_coef_decentered" => &mut out.rate_coef_decentered,
                "rate_scale" => &mut out.rate_scale,
                "strain_scale" => &mut out.strain_scale,
                "place_scale" => &mut out.place_scale,
                "rate" => &mut out.rate,
                "rate_decentered" => &mut out.rate_decentered,
                "init" => &mut out.init,
                "logits" => &mut out.logits,
                "logits_decentered" => &mut out.logits_decentered,
                _ => return Err(config_err!("unknown init override site '{}'", name)),
            };
            *slot = Some(value.clone());
        }
        Ok(out)
    }

    fn get(&self, name: &str) -> Option<&Tensor> {
        match name {
            "feature_scale" => self.feature_scale.as_ref(),
            "logits_scale" => self.logits_scale.as_ref(),
            "rate_coef" => self.rate_coef.as_ref(),
            "rate_coef_decentered" => self.rate_coef_decentered.as_ref(),
            "rate_scale" => self.rate_scale.as_ref(),
            "strain_scale" => self.strain_scale.as_ref(),
            "place_scale" => self.place_scale.as_ref(),
            "rate" => self.rate.as_ref(),
            "rate_decentered" => self.rate_decentered.as_ref(),
            "init" => self.init.as_ref(),
            "logits" => self.logits.as_ref(),
            "logits_decentered" => self.logits_decentered.as_ref(),
            _ => None,
        }
    }
}

pub struct InitializationPolicy {
    overrides: InitOverrides,
    /// Empirical initial logits [P,S] from time-summed counts.
    empirical_init: Tensor,
    /// Empirical per-bin logits [T,P,S] from smoothed counts.
    empirical_logits: Tensor,
}

impl InitializationPolicy {
    pub fn new(dataset: &Dataset, mut overrides: InitOverrides) -> Result<Self> {
        let weekly = dataset.weekly_strains();
        let (_t, _p, s, _f) = dataset.dims();
        let smooth = 1.0 / s as f64;

        // init[p,s] = log of smoothed strain proportions, median-centered per
        // place so a typical strain starts at zero.
        let totals = (weekly.sum(0)? + smooth)?; // [P,S]
        let norm = totals.sum_keepdim(1)?;
        let init = totals.broadcast_div(&norm)?.log()?;
        let rows = init.to_vec2::<f64>()?;
        let centers: Vec<f64> = rows.iter().map(|r| median_of(r.clone())).collect();
        let centers = Tensor::from_vec(centers, (rows.len(), 1), &Device::Cpu)?;
        let init = init.broadcast_sub(&centers)?;

        let logits = (weekly + smooth)?.log()?;
        let empirical_logits = logits.broadcast_sub(&logits.mean_keepdim(2)?)?;

        let mean = init.mean_all()?.to_scalar::<f64>()?;
        let var = init
            .broadcast_sub(&init.mean_all()?)?
            .sqr()?
            .mean_all()?
            .to_scalar::<f64>()?;
        log::info!("init stddev = {:.3e} (mean {:.3e})", var.sqrt(), mean);

        // A warm start that recorded rate and init but predates the
        // overdispersed logits site can still seed it.
        if overrides.logits.is_none() {
            if let (Some(rate), Some(init)) = (&overrides.rate, &overrides.init) {
                let lt = dataset.local_time().unsqueeze(2)?;
                let logits = init
                    .unsqueeze(0)?
                    .broadcast_add(&rate.unsqueeze(0)?.broadcast_mul(&lt)?)?;
                overrides.logits = Some(logits);
            }
        }

        Ok(Self {
            overrides,
            empirical_init: init,
            empirical_logits,
        })
    }

    /// Constrained-space initial value for one site.
    pub fn init_value(&self, site: &Site, rng: &mut StdRng) -> Result<Tensor> {
        if let Some(value) = self.overrides.get(site.name) {
            if value.dims() != site.dims.as_slice() {
                return Err(crate::shape_err!(
                    "init override for '{}' has shape {:?}, site wants {:?}",
                    site.name,
                    value.dims(),
                    site.dims
                ));
            }
            return Ok(value.clone());
        }
        match site.name {
            "feature_scale" => Ok(scalar(1.0)?),
            "logits_scale" => Ok(scalar(0.002)?),
            "rate_scale" | "place_scale" | "strain_scale" => {
                let base = scalar(0.01)?;
                if site.dims.is_empty() {
                    Ok(base)
                } else {
                    Ok(base.broadcast_as(site.dims.as_slice())?.contiguous()?)
                }
            }
            "rate_coef" | "rate_coef_decentered" | "rate" | "rate_decentered" => {
                Ok(rand_uniform(rng, -0.005, 0.005, &site.dims)?)
            }
            "init" => Ok(self.empirical_init.clone()),
            "logits" | "logits_decentered" => {
                let jitter = rand_uniform(rng, -0.0005, 0.0005, &site.dims)?;
                Ok((&self.empirical_logits + &jitter)?)
            }
            other => Err(config_err!("no initialization rule for site '{}'", other)),
        }
    }
}
