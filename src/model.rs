//! Hierarchical growth-rate model.
//!
//! Relative growth is assumed to depend strongly on amino-acid mutations and
//! weakly on place: `rate_loc = 0.01 * rate_coef @ features^T`, with logits
//! drifting linearly in place-local time and multinomial (or
//! Dirichlet-multinomial) observations per (time, place) bin.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{Tensor, Var, D};
use candle_nn::ops::softmax;
use candle_nn::VarMap;

use crate::config_err;
use crate::dataset::Dataset;
use crate::distributions::{
    dirichlet_multinomial_lp, lognormal_lp, multinomial_log_coeff, multinomial_logits_lp,
    normal_lp, soft_laplace_lp, std_normal_lp, uniform_lp,
};
use crate::errors::Result;
use crate::numerics::{register_param, scalar};

/// Named latent (or derived) site values, in constrained space.
pub type SiteMap = BTreeMap<String, Tensor>;

/// Rate-multiplier applied to `rate_coef`, keeping coefficients on a
/// readable per-mutation scale.
pub const RATE_COEF_SCALE: f64 = 0.01;

/// Support bounds of the overdispersion scale.
const LOGITS_SCALE_LO: f64 = 1e-3;
const LOGITS_SCALE_HI: f64 = 1e-1;

/// Floor keeping Dirichlet-multinomial concentrations strictly positive.
const CONCENTRATION_FLOOR: f64 = 1e-20;

/// Independent model toggles, parsed by substring membership.
///
/// `dirichlet` and `overdispersed` are two alternative overdispersion
/// mechanisms and may not be combined; other combinations are accepted as
/// given, though not every one has been exercised on real data.
#[derive(Clone, Debug, Default)]
pub struct ModelType {
    raw: String,
    pub reparam: bool,
    pub biased: bool,
    pub locally: bool,
    pub overdispersed: bool,
    pub dirichlet: bool,
}

impl ModelType {
    pub fn parse(raw: &str) -> Result<Self> {
        let mt = Self {
            raw: raw.to_string(),
            reparam: raw.contains("reparam"),
            biased: raw.contains("biased"),
            locally: raw.contains("locally"),
            overdispersed: raw.contains("overdispersed"),
            dirichlet: raw.contains("dirichlet"),
        };
        let mut rest = raw.to_string();
        for token in ["overdispersed", "dirichlet", "locally", "reparam", "biased"] {
            rest = rest.replace(token, "");
        }
        rest.retain(|c| c.is_alphanumeric());
        if !rest.is_empty() {
            return Err(config_err!("unknown model_type tokens in '{}'", raw));
        }
        if mt.dirichlet && mt.overdispersed {
            return Err(config_err!(
                "model_type '{}' combines dirichlet and overdispersed; pick one overdispersion mechanism",
                raw
            ));
        }
        Ok(mt)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "base")
        } else {
            write!(f, "{}", self.raw)
        }
    }
}

/// Constrained support of a latent site, used by guides to transform
/// unconstrained Gaussians into the model's parameter space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Support {
    Real,
    Positive,
    Interval(f64, f64),
}

/// Declaration of one latent site: name, constrained shape, support.
#[derive(Clone, Debug)]
pub struct Site {
    pub name: &'static str,
    pub dims: Vec<usize>,
    pub support: Support,
}

impl Site {
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

pub struct ModelTrace {
    /// Joint log-probability of latents (and observations when requested).
    pub log_joint: Tensor,
    /// Every sampled site plus derived quantities (rate, probs, logits).
    pub sites: SiteMap,
}

pub struct GrowthModel {
    model_type: ModelType,
    num_times: usize,
    num_places: usize,
    num_strains: usize,
    num_features: usize,
    weekly_strains: Tensor, // [T,P,S]
    features_t: Tensor,     // [F,S]
    local_time: Tensor,     // [T,P,1]
    log_coeff: f64,
    /// Learned per-place-per-strain time offset, only under `reparam`.
    time_offset: Option<Var>,
}

impl GrowthModel {
    pub fn new(dataset: &Dataset, model_type: ModelType, params: &VarMap) -> Result<Self> {
        let (t, p, s, f) = dataset.dims();
        if t == 0 || p == 0 || s == 0 || f == 0 {
            return Err(config_err!(
                "degenerate dataset with dims T={}, P={}, S={}, F={}",
                t,
                p,
                s,
                f
            ));
        }
        let weekly_strains = dataset.weekly_strains().clone();
        let features_t = dataset.features().t()?.contiguous()?;
        let local_time = dataset.local_time().unsqueeze(2)?;
        let log_coeff = multinomial_log_coeff(&weekly_strains)?;
        let time_offset = if model_type.reparam {
            let zeros = Tensor::zeros((p, s), crate::numerics::DTYPE, &candle_core::Device::Cpu)?;
            Some(register_param(params, "local_time_offset", zeros)?)
        } else {
            None
        };
        Ok(Self {
            model_type,
            num_times: t,
            num_places: p,
            num_strains: s,
            num_features: f,
            weekly_strains,
            features_t,
            local_time,
            log_coeff,
            time_offset,
        })
    }

    pub fn model_type(&self) -> &ModelType {
        &self.model_type
    }

    /// Latent sites of this configuration, in sampling order.
    pub fn sites(&self) -> Vec<Site> {
        let (t, p, s, f) = (
            self.num_times,
            self.num_places,
            self.num_strains,
            self.num_features,
        );
        let mt = &self.model_type;
        let mut sites = vec![Site {
            name: "feature_scale",
            dims: vec![],
            support: Support::Positive,
        }];
        if mt.overdispersed || mt.dirichlet {
            sites.push(Site {
                name: "logits_scale",
                dims: vec![],
                support: Support::Interval(LOGITS_SCALE_LO, LOGITS_SCALE_HI),
            });
        }
        sites.push(Site {
            name: if mt.reparam { "rate_coef_decentered" } else { "rate_coef" },
            dims: vec![f],
            support: Support::Real,
        });
        if mt.biased {
            if mt.locally {
                sites.push(Site {
                    name: "strain_scale",
                    dims: vec![s],
                    support: Support::Positive,
                });
                sites.push(Site {
                    name: "place_scale",
                    dims: vec![p],
                    support: Support::Positive,
                });
            } else {
                sites.push(Site {
                    name: "rate_scale",
                    dims: vec![],
                    support: Support::Positive,
                });
            }
            sites.push(Site {
                name: if mt.reparam { "rate_decentered" } else { "rate" },
                dims: vec![p, s],
                support: Support::Real,
            });
        }
        sites.push(Site {
            name: "init",
            dims: vec![p, s],
            support: Support::Real,
        });
        if mt.overdispersed {
            sites.push(Site {
                name: if mt.reparam { "logits_decentered" } else { "logits" },
                dims: vec![t, p, s],
                support: Support::Real,
            });
        }
        sites
    }

    /// Names of size-1 latent sites; these get a reduced learning rate.
    pub fn scalar_sites(&self) -> Vec<&'static str> {
        self.sites()
            .iter()
            .filter(|s| s.numel() == 1)
            .map(|s| s.name)
            .collect()
    }

    fn latent<'a>(&self, latents: &'a SiteMap, name: &str) -> Result<&'a Tensor> {
        latents
            .get(name)
            .ok_or_else(|| config_err!("model requires latent site '{}'", name))
    }

    /// Evaluate the joint log-probability at the given constrained latents
    /// and record every site value, including derived ones. Shapes were
    /// verified at construction, so none are re-checked here.
    pub fn eval(&self, latents: &SiteMap, with_obs: bool) -> Result<ModelTrace> {
        let (p, s, f) = (self.num_places, self.num_strains, self.num_features);
        let mt = self.model_type.clone();
        let mut sites = latents.clone();

        let feature_scale = self.latent(latents, "feature_scale")?;
        let mut lp = lognormal_lp(feature_scale, (0.1f64).ln(), 1.0)?.sum_all()?;

        let logits_scale = if mt.overdispersed || mt.dirichlet {
            lp = (lp + uniform_lp(LOGITS_SCALE_LO, LOGITS_SCALE_HI))?;
            Some(self.latent(latents, "logits_scale")?)
        } else {
            None
        };

        let one = scalar(1.0)?;
        let rate_coef = if mt.reparam {
            let dec = self.latent(latents, "rate_coef_decentered")?;
            lp = (lp + soft_laplace_lp(dec, &one)?.sum_all()?)?;
            let centered = dec.broadcast_mul(feature_scale)?;
            sites.insert("rate_coef".to_string(), centered.clone());
            centered
        } else {
            let rc = self.latent(latents, "rate_coef")?;
            lp = (lp + soft_laplace_lp(rc, feature_scale)?.sum_all()?)?;
            rc.clone()
        };

        let rate_loc = (rate_coef.reshape((1, f))?.matmul(&self.features_t)? * RATE_COEF_SCALE)?;

        let rate = if mt.biased {
            let rate_scale = if mt.locally {
                let strain_scale = self.latent(latents, "strain_scale")?;
                let place_scale = self.latent(latents, "place_scale")?;
                lp = (lp + lognormal_lp(strain_scale, -4.0, 2.0)?.sum_all()?)?;
                lp = (lp + lognormal_lp(place_scale, -4.0, 2.0)?.sum_all()?)?;
                place_scale
                    .sqr()?
                    .unsqueeze(1)?
                    .broadcast_add(&strain_scale.sqr()?.unsqueeze(0)?)?
                    .sqrt()?
            } else {
                let rs = self.latent(latents, "rate_scale")?;
                lp = (lp + lognormal_lp(rs, -4.0, 2.0)?.sum_all()?)?;
                rs.clone()
            };
            if mt.reparam {
                let dec = self.latent(latents, "rate_decentered")?;
                lp = (lp + std_normal_lp(dec)?.sum_all()?)?;
                let rate = dec.broadcast_mul(&rate_scale)?.broadcast_add(&rate_loc)?;
                sites.insert("rate".to_string(), rate.clone());
                rate
            } else {
                let rate = self.latent(latents, "rate")?;
                lp = (lp + normal_lp(rate, &rate_loc, &rate_scale)?.sum_all()?)?;
                rate.clone()
            }
        } else {
            let rate = rate_loc.broadcast_as((p, s))?.contiguous()?;
            sites.insert("rate".to_string(), rate.clone());
            rate
        };

        let init = self.latent(latents, "init")?;
        lp = (lp + soft_laplace_lp(init, &scalar(10.0)?)?.sum_all()?)?;

        let local_time = match &self.time_offset {
            Some(offset) => self
                .local_time
                .broadcast_add(&offset.as_tensor().unsqueeze(0)?)?,
            None => self.local_time.clone(),
        };
        let logits_loc = init
            .unsqueeze(0)?
            .broadcast_add(&rate.unsqueeze(0)?.broadcast_mul(&local_time)?)?;
        sites.insert(
            "probs".to_string(),
            softmax(&logits_loc.detach(), D::Minus1)?,
        );

        if mt.overdispersed {
            let ls = logits_scale.ok_or_else(|| config_err!("logits_scale was not sampled"))?;
            let logits = if mt.reparam {
                let dec = self.latent(latents, "logits_decentered")?;
                lp = (lp + std_normal_lp(dec)?.sum_all()?)?;
                logits_loc.broadcast_add(&dec.broadcast_mul(ls)?)?
            } else {
                let logits = self.latent(latents, "logits")?;
                lp = (lp + normal_lp(logits, &logits_loc, ls)?.sum_all()?)?;
                logits.clone()
            };
            sites.insert("logits".to_string(), logits.clone());
            if with_obs {
                lp = (lp + multinomial_logits_lp(&self.weekly_strains, &logits, self.log_coeff)?)?;
            }
        } else if mt.dirichlet {
            let ls = logits_scale.ok_or_else(|| config_err!("logits_scale was not sampled"))?;
            let concentration =
                (softmax(&logits_loc, D::Minus1)?.broadcast_div(ls)? + CONCENTRATION_FLOOR)?;
            if with_obs {
                lp = (lp
                    + dirichlet_multinomial_lp(
                        &self.weekly_strains,
                        &concentration,
                        self.log_coeff,
                    )?)?;
            }
        } else {
            sites.insert("logits".to_string(), logits_loc.clone());
            if with_obs {
                lp =
                    (lp + multinomial_logits_lp(&self.weekly_strains, &logits_loc, self.log_coeff)?)?;
            }
        }

        Ok(ModelTrace {
            log_joint: lp,
            sites,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_parsing() {
        let mt = ModelType::parse("reparam-biased-locally").unwrap();
        assert!(mt.reparam && mt.biased && mt.locally);
        assert!(!mt.overdispersed && !mt.dirichlet);
        assert!(ModelType::parse("").unwrap().raw.is_empty());
        assert!(ModelType::parse("mvn").is_err());
        assert!(ModelType::parse("dirichlet-overdispersed").is_err());
    }

    #[test]
    fn site_lists_follow_toggles() {
        let names = |raw: &str| -> Vec<&'static str> {
            use crate::dataset::{simulate, SimulateConfig};
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(0);
            let ds = simulate(&SimulateConfig::default(), &mut rng).unwrap();
            let varmap = VarMap::new();
            let model =
                GrowthModel::new(&ds, ModelType::parse(raw).unwrap(), &varmap).unwrap();
            model.sites().iter().map(|s| s.name).collect()
        };
        assert_eq!(names(""), vec!["feature_scale", "rate_coef", "init"]);
        assert_eq!(
            names("reparam-biased"),
            vec![
                "feature_scale",
                "rate_coef_decentered",
                "rate_scale",
                "rate_decentered",
                "init"
            ]
        );
        assert_eq!(
            names("dirichlet"),
            vec!["feature_scale", "logits_scale", "rate_coef", "init"]
        );
    }
}
