//! Variational families over the model's latent sites.
//!
//! Every guide works in unconstrained space: each site gets a bijection onto
//! its support (identity, exp, or a scaled sigmoid) and the accumulated
//! log-Jacobian joins the objective. The default guide is composite, with a
//! low-rank multivariate normal capturing the strong coupling between
//! `feature_scale` and the mutation coefficients and a mean-field normal over
//! everything else.

use std::collections::BTreeMap;

use candle_core::{Tensor, Var};
use candle_nn::ops::sigmoid;
use candle_nn::VarMap;
use rand::rngs::StdRng;

use crate::config_err;
use crate::distributions::{low_rank_normal_lp, normal_lp};
use crate::errors::Result;
use crate::init::InitializationPolicy;
use crate::model::{GrowthModel, Site, SiteMap, Support};
use crate::numerics::{randn, register_param, scalar, softplus};

/// Rank of the composite guide's multivariate-normal block, before clamping
/// to the block's dimension.
const COMPOSITE_RANK: usize = 200;

/// Sites covered by the composite guide's multivariate-normal block.
const COMPOSITE_MVN_SITES: [&str; 3] = ["feature_scale", "rate_coef", "rate_coef_decentered"];

/// Initial posterior scale, in unconstrained space.
const INIT_SCALE: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuideType {
    /// Point estimate (MAP in unconstrained space).
    Map,
    /// Mean-field normal.
    Normal,
    /// Low-rank multivariate normal over all sites jointly.
    Full,
    /// Low-rank block over mutation coefficients, mean field elsewhere.
    Composite,
}

impl GuideType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "map" => Ok(Self::Map),
            "normal" => Ok(Self::Normal),
            "full" => Ok(Self::Full),
            "" | "composite" => Ok(Self::Composite),
            other => Err(config_err!("unknown guide_type '{}'", other)),
        }
    }
}

/// Map an unconstrained tensor onto the site's support, returning the value
/// and the summed log-Jacobian of the transform.
fn constrain(u: &Tensor, support: Support) -> Result<(Tensor, Tensor)> {
    match support {
        Support::Real => Ok((u.clone(), scalar(0.0)?)),
        Support::Positive => Ok((u.exp()?, u.sum_all()?)),
        Support::Interval(lo, hi) => {
            let sig = sigmoid(u)?;
            let x = (sig * (hi - lo))?.broadcast_add(&scalar(lo)?)?;
            let n = u.elem_count() as f64;
            let lj = ((softplus(u)? + softplus(&u.neg()?)?)?.sum_all()?.neg()?
                + n * (hi - lo).ln())?;
            Ok((x, lj))
        }
    }
}

/// Inverse of [`constrain`], used to seed parameters from constrained-space
/// initial values.
fn unconstrain(x: &Tensor, support: Support) -> Result<Tensor> {
    match support {
        Support::Real => Ok(x.clone()),
        Support::Positive => Ok(x.log()?),
        Support::Interval(lo, hi) => {
            let p = ((x - lo)? / (hi - lo))?;
            Ok((p.log()? - (p.neg()? + 1.0)?.log()?)?)
        }
    }
}

/// One stochastic draw from a guide: constrained latents still connected to
/// the parameter graph, plus the terms the objective needs.
pub struct GuideDraw {
    pub latents: SiteMap,
    pub log_q: Tensor,
    pub log_jac: Tensor,
}

/// Point-estimate block holding one unconstrained location per site.
///
/// The support-transform Jacobian stays in the objective, so this maximizes
/// the posterior density in unconstrained space. For positive-support sites
/// the estimate therefore differs from the constrained-space mode by the
/// volume term of the exp transform.
pub struct DeltaBlock {
    sites: Vec<Site>,
    locs: Vec<Var>,
}

impl DeltaBlock {
    fn new(
        sites: Vec<Site>,
        init: &InitializationPolicy,
        params: &VarMap,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut locs = Vec::with_capacity(sites.len());
        for site in &sites {
            let u = unconstrain(&init.init_value(site, rng)?, site.support)?;
            locs.push(register_param(params, &format!("map.locs.{}", site.name), u)?);
        }
        Ok(Self { sites, locs })
    }

    fn draw(&self, _rng: &mut StdRng) -> Result<GuideDraw> {
        let mut latents = SiteMap::new();
        let mut log_jac = scalar(0.0)?;
        for (site, loc) in self.sites.iter().zip(&self.locs) {
            let (x, lj) = constrain(loc.as_tensor(), site.support)?;
            log_jac = (log_jac + lj)?;
            latents.insert(site.name.to_string(), x);
        }
        Ok(GuideDraw {
            latents,
            log_q: scalar(0.0)?,
            log_jac,
        })
    }

    fn median(&self) -> Result<SiteMap> {
        let mut out = SiteMap::new();
        for (site, loc) in self.sites.iter().zip(&self.locs) {
            let (x, _) = constrain(&loc.as_tensor().detach(), site.support)?;
            out.insert(site.name.to_string(), x);
        }
        Ok(out)
    }
}

/// Mean-field normal block with per-site location and log-scale parameters.
pub struct NormalBlock {
    sites: Vec<Site>,
    locs: Vec<Var>,
    log_scales: Vec<Var>,
}

impl NormalBlock {
    fn new(
        prefix: &str,
        sites: Vec<Site>,
        init: &InitializationPolicy,
        params: &VarMap,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut locs = Vec::with_capacity(sites.len());
        let mut log_scales = Vec::with_capacity(sites.len());
        for site in &sites {
            let u = unconstrain(&init.init_value(site, rng)?, site.support)?;
            let ls = u.zeros_like()?.broadcast_add(&scalar(INIT_SCALE.ln())?)?;
            locs.push(register_param(
                params,
                &format!("{prefix}.locs.{}", site.name),
                u,
            )?);
            log_scales.push(register_param(
                params,
                &format!("{prefix}.scales.{}", site.name),
                ls,
            )?);
        }
        Ok(Self {
            sites,
            locs,
            log_scales,
        })
    }

    fn draw(&self, rng: &mut StdRng) -> Result<GuideDraw> {
        let mut latents = SiteMap::new();
        let mut log_q = scalar(0.0)?;
        let mut log_jac = scalar(0.0)?;
        for ((site, loc), log_scale) in self.sites.iter().zip(&self.locs).zip(&self.log_scales) {
            let loc = loc.as_tensor();
            let scale = log_scale.as_tensor().exp()?;
            let eps = randn(rng, &site.dims)?;
            let u = (loc + (&scale * &eps)?)?;
            log_q = (log_q + normal_lp(&u, loc, &scale)?.sum_all()?)?;
            let (x, lj) = constrain(&u, site.support)?;
            log_jac = (log_jac + lj)?;
            latents.insert(site.name.to_string(), x);
        }
        Ok(GuideDraw {
            latents,
            log_q,
            log_jac,
        })
    }

    fn median(&self) -> Result<SiteMap> {
        let mut out = SiteMap::new();
        for (site, loc) in self.sites.iter().zip(&self.locs) {
            let (x, _) = constrain(&loc.as_tensor().detach(), site.support)?;
            out.insert(site.name.to_string(), x);
        }
        Ok(out)
    }
}

/// Low-rank multivariate normal over the concatenation of several sites'
/// unconstrained values, N(loc, diag(d)^2 + W^T W).
pub struct LowRankBlock {
    sites: Vec<Site>,
    offsets: Vec<usize>,
    total: usize,
    rank: usize,
    loc: Var,
    log_scales: Var,
    cov_factor: Var,
}

impl LowRankBlock {
    fn new(
        prefix: &str,
        sites: Vec<Site>,
        rank: usize,
        init: &InitializationPolicy,
        params: &VarMap,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut offsets = Vec::with_capacity(sites.len());
        let mut parts = Vec::with_capacity(sites.len());
        let mut total = 0;
        for site in &sites {
            offsets.push(total);
            total += site.numel();
            let u = unconstrain(&init.init_value(site, rng)?, site.support)?;
            parts.push(u.flatten_all()?);
        }
        if total == 0 {
            return Err(config_err!("low-rank guide block over zero latents"));
        }
        let rank = rank.min(total).max(1);
        let loc = Tensor::cat(&parts, 0)?;
        let log_scales = loc.zeros_like()?.broadcast_add(&scalar(INIT_SCALE.ln())?)?;
        let cov_factor = (randn(rng, &[rank, total])? * (INIT_SCALE / (rank as f64).sqrt()))?;
        Ok(Self {
            sites,
            offsets,
            total,
            rank,
            loc: register_param(params, &format!("{prefix}.loc"), loc)?,
            log_scales: register_param(params, &format!("{prefix}.scales"), log_scales)?,
            cov_factor: register_param(params, &format!("{prefix}.cov_factor"), cov_factor)?,
        })
    }

    fn split(&self, z: &Tensor) -> Result<(SiteMap, Tensor)> {
        let mut latents = SiteMap::new();
        let mut log_jac = scalar(0.0)?;
        for (site, offset) in self.sites.iter().zip(&self.offsets) {
            let u = z.narrow(0, *offset, site.numel())?.reshape(site.dims.clone())?;
            let (x, lj) = constrain(&u, site.support)?;
            log_jac = (log_jac + lj)?;
            latents.insert(site.name.to_string(), x);
        }
        Ok((latents, log_jac))
    }

    fn draw(&self, rng: &mut StdRng) -> Result<GuideDraw> {
        let d = self.log_scales.as_tensor().exp()?;
        let w = self.cov_factor.as_tensor();
        let eps_factor = randn(rng, &[self.rank])?;
        let eps_diag = randn(rng, &[self.total])?;
        let r = (w.t()?.matmul(&eps_factor.unsqueeze(1)?)?.squeeze(1)? + (&d * &eps_diag)?)?;
        let z = (self.loc.as_tensor() + &r)?;
        let log_q = low_rank_normal_lp(&r, &d, w)?;
        let (latents, log_jac) = self.split(&z)?;
        Ok(GuideDraw {
            latents,
            log_q,
            log_jac,
        })
    }

    fn median(&self) -> Result<SiteMap> {
        let (latents, _) = self.split(&self.loc.as_tensor().detach())?;
        Ok(latents)
    }
}

pub enum Guide {
    Map(DeltaBlock),
    Normal(NormalBlock),
    Full(LowRankBlock),
    Composite { mvn: LowRankBlock, rest: NormalBlock },
}

impl Guide {
    pub fn new(
        model: &GrowthModel,
        guide_type: GuideType,
        rank: usize,
        init: &InitializationPolicy,
        params: &VarMap,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let sites = model.sites();
        match guide_type {
            GuideType::Map => Ok(Self::Map(DeltaBlock::new(sites, init, params, rng)?)),
            GuideType::Normal => Ok(Self::Normal(NormalBlock::new(
                "normal", sites, init, params, rng,
            )?)),
            GuideType::Full => Ok(Self::Full(LowRankBlock::new(
                "mvn", sites, rank, init, params, rng,
            )?)),
            GuideType::Composite => {
                let (mvn_sites, rest_sites): (Vec<Site>, Vec<Site>) = sites
                    .into_iter()
                    .partition(|s| COMPOSITE_MVN_SITES.contains(&s.name));
                let mvn =
                    LowRankBlock::new("mvn", mvn_sites, COMPOSITE_RANK, init, params, rng)?;
                let rest = NormalBlock::new("normal", rest_sites, init, params, rng)?;
                Ok(Self::Composite { mvn, rest })
            }
        }
    }

    /// Sample constrained latents along with the variational density and the
    /// transform Jacobian. The draw stays connected to the parameter graph.
    pub fn draw(&self, rng: &mut StdRng) -> Result<GuideDraw> {
        match self {
            Self::Map(block) => block.draw(rng),
            Self::Normal(block) => block.draw(rng),
            Self::Full(block) => block.draw(rng),
            Self::Composite { mvn, rest } => {
                let a = mvn.draw(rng)?;
                let b = rest.draw(rng)?;
                let mut latents = a.latents;
                latents.extend(b.latents);
                Ok(GuideDraw {
                    latents,
                    log_q: (a.log_q + b.log_q)?,
                    log_jac: (a.log_jac + b.log_jac)?,
                })
            }
        }
    }

    /// Posterior median of every latent site, in constrained space.
    pub fn median(&self) -> Result<SiteMap> {
        match self {
            Self::Map(block) => block.median(),
            Self::Normal(block) => block.median(),
            Self::Full(block) => block.median(),
            Self::Composite { mvn, rest } => {
                let mut out = mvn.median()?;
                out.extend(rest.median()?);
                Ok(out)
            }
        }
    }

    /// Medians of the size-1 sites only, for compact progress logging.
    pub fn median_scalars(&self) -> Result<BTreeMap<String, f64>> {
        let mut out = BTreeMap::new();
        for (name, value) in self.median()? {
            if value.elem_count() == 1 {
                out.insert(name, value.reshape(())?.to_scalar::<f64>()?);
            }
        }
        Ok(out)
    }
}
