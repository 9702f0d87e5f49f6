//! Log-probabilities of the distributions used by the growth model, computed
//! on candle tensors so gradients flow through every parameter-dependent term.
//!
//! Observation-side normalizers that do not depend on parameters (multinomial
//! coefficients) are folded into a single host-side constant per dataset.

use candle_core::{Result, Tensor, D};
use candle_nn::ops::log_softmax;
use special::Gamma;

use crate::numerics::{ln_gamma, softplus, LN_2PI};

/// log(2 / pi), the SoftLaplace normalizer.
const LN_2_OVER_PI: f64 = -0.4515827052894548;

/// Elementwise Normal log-density with broadcasting between `x`, `loc`, `scale`.
pub fn normal_lp(x: &Tensor, loc: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let z = x.broadcast_sub(loc)?.broadcast_div(scale)?;
    ((z.sqr()? * -0.5)? - 0.5 * LN_2PI)?.broadcast_sub(&scale.log()?)
}

/// Elementwise standard-Normal log-density.
pub fn std_normal_lp(x: &Tensor) -> Result<Tensor> {
    (x.sqr()? * -0.5)? - 0.5 * LN_2PI
}

/// Elementwise LogNormal log-density with fixed hyperparameters.
pub fn lognormal_lp(x: &Tensor, loc: f64, scale: f64) -> Result<Tensor> {
    let lx = x.log()?;
    let z = ((lx.clone() - loc)? / scale)?;
    (((z.sqr()? * -0.5)? - (0.5 * LN_2PI + scale.ln()))? - &lx)?.contiguous()
}

/// Elementwise zero-centered SoftLaplace log-density: smooth near the mode
/// with Laplace-like tails, `p(x) = 1 / (pi * scale * cosh(x / scale))`.
pub fn soft_laplace_lp(x: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let az = x.broadcast_div(scale)?.abs()?;
    // logaddexp(z, -z) = |z| + softplus(-2|z|)
    let lae = (&az + &softplus(&(az.clone() * -2.0)?)?)?;
    ((lae.neg()? + LN_2_OVER_PI)?).broadcast_sub(&scale.log()?)
}

/// Log-density constant of a Uniform(lo, hi) prior; zero gradient inside the
/// support, which the guide transforms guarantee.
pub fn uniform_lp(lo: f64, hi: f64) -> f64 {
    -(hi - lo).ln()
}

/// Count-dependent multinomial coefficient `sum_{t,p} [lnΓ(n+1) − Σ_s lnΓ(x+1)]`,
/// shared between the multinomial and Dirichlet-multinomial observation models.
pub fn multinomial_log_coeff(counts: &Tensor) -> Result<f64> {
    let mut total = 0.0;
    for plane in counts.to_vec3::<f64>()? {
        for row in plane {
            let n: f64 = row.iter().sum();
            total += Gamma::ln_gamma(n + 1.0).0;
            for x in row {
                total -= Gamma::ln_gamma(x + 1.0).0;
            }
        }
    }
    Ok(total)
}

/// Total multinomial log-likelihood of `counts` [T,P,S] under per-bin logits,
/// normalized over the strain axis. `log_coeff` is the precomputed
/// count-dependent constant.
pub fn multinomial_logits_lp(counts: &Tensor, logits: &Tensor, log_coeff: f64) -> Result<Tensor> {
    let lsm = log_softmax(logits, D::Minus1)?;
    (counts * &lsm)?.sum_all()? + log_coeff
}

/// Total Dirichlet-multinomial log-likelihood of `counts` [T,P,S] with a
/// parameter-dependent concentration of the same shape.
pub fn dirichlet_multinomial_lp(
    counts: &Tensor,
    concentration: &Tensor,
    log_coeff: f64,
) -> Result<Tensor> {
    let a0 = concentration.sum(D::Minus1)?;
    let n = counts.sum(D::Minus1)?;
    let t1 = ln_gamma(&a0)?.sum_all()?;
    let t2 = ln_gamma(&(&a0 + &n)?)?.sum_all()?;
    let t3 = ln_gamma(&(concentration + counts)?)?.sum_all()?;
    let t4 = ln_gamma(concentration)?.sum_all()?;
    (((t1 - t2)? + (t3 - t4)?)?) + log_coeff
}

/// Log-density of a low-rank-plus-diagonal Gaussian, N(0, diag(d)^2 + W^T W),
/// evaluated at the residual `resid` [n] with `diag` = d [n] and `factor` =
/// W [k,n]. Uses the Woodbury identity and matrix determinant lemma so that
/// only a k x k factorization is needed.
pub fn low_rank_normal_lp(resid: &Tensor, diag: &Tensor, factor: &Tensor) -> Result<Tensor> {
    let n = resid.dims1()? as f64;
    let s = (resid / diag)?;
    let c = factor.broadcast_div(&diag.unsqueeze(0)?)?;
    let k = factor.dims2()?.0;
    let cap = (c.matmul(&c.t()?)? + crate::numerics::eye(k)?)?;
    let cs = c.matmul(&s.unsqueeze(1)?)?;
    let cap_inv = crate::numerics::psd_inverse(&cap)?;
    let corr = cs.t()?.matmul(&cap_inv)?.matmul(&cs)?.reshape(())?;
    let quad = (s.sqr()?.sum_all()? - corr)?;
    let logdet = ((diag.log()?.sum_all()? * 2.0)? + crate::numerics::psd_logdet(&cap)?)?;
    ((quad + logdet)? + n * LN_2PI)? * -0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use nalgebra::{DMatrix, DVector};

    fn t1(data: Vec<f64>) -> Tensor {
        let n = data.len();
        Tensor::from_vec(data, (n,), &Device::Cpu).unwrap()
    }

    #[test]
    fn normal_lp_standard_point() -> Result<()> {
        let x = t1(vec![0.0]);
        let lp = normal_lp(&x, &t1(vec![0.0]), &t1(vec![1.0]))?.to_vec1::<f64>()?;
        assert_abs_diff_eq!(lp[0], -0.9189385332046727, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn soft_laplace_mode_density() -> Result<()> {
        // p(0) = 1 / pi for unit scale.
        let lp = soft_laplace_lp(&t1(vec![0.0]), &t1(vec![1.0]))?.to_vec1::<f64>()?;
        assert_abs_diff_eq!(lp[0], -std::f64::consts::PI.ln(), epsilon = 1e-12);
        // Far tails decay like |x| / scale.
        let lp = soft_laplace_lp(&t1(vec![50.0]), &t1(vec![1.0]))?.to_vec1::<f64>()?;
        assert_abs_diff_eq!(lp[0], LN_2_OVER_PI - 50.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn multinomial_small_example() -> Result<()> {
        // counts (2,1) under equal probabilities: 3!/(2!1!) * 0.5^3 = 3/8.
        let counts = Tensor::from_vec(vec![2.0f64, 1.0], (1, 1, 2), &Device::Cpu)?;
        let logits = Tensor::from_vec(vec![0.0f64, 0.0], (1, 1, 2), &Device::Cpu)?;
        let coeff = multinomial_log_coeff(&counts)?;
        let lp = multinomial_logits_lp(&counts, &logits, coeff)?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(lp, (3.0f64 / 8.0).ln(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn dirichlet_multinomial_uniform_example() -> Result<()> {
        // n=2 over two strains with unit concentrations: P(1,1) = 1/3.
        let counts = Tensor::from_vec(vec![1.0f64, 1.0], (1, 1, 2), &Device::Cpu)?;
        let conc = Tensor::from_vec(vec![1.0f64, 1.0], (1, 1, 2), &Device::Cpu)?;
        let coeff = multinomial_log_coeff(&counts)?;
        let lp = dirichlet_multinomial_lp(&counts, &conc, coeff)?.to_scalar::<f64>()?;
        assert_abs_diff_eq!(lp, (1.0f64 / 3.0).ln(), epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn low_rank_normal_matches_dense() -> Result<()> {
        let n = 6;
        let k = 2;
        let d: Vec<f64> = (0..n).map(|i| 0.3 + 0.1 * i as f64).collect();
        let w: Vec<f64> = (0..k * n).map(|i| 0.05 * ((i % 5) as f64 - 2.0)).collect();
        let r: Vec<f64> = (0..n).map(|i| 0.2 * (i as f64 - 2.5)).collect();

        let lp = low_rank_normal_lp(
            &t1(r.clone()),
            &t1(d.clone()),
            &Tensor::from_vec(w.clone(), (k, n), &Device::Cpu)?,
        )?
        .to_scalar::<f64>()?;

        // Dense reference: Sigma = diag(d)^2 + W^T W.
        let wm = DMatrix::from_row_slice(k, n, &w);
        let mut sigma = wm.transpose() * &wm;
        for i in 0..n {
            sigma[(i, i)] += d[i] * d[i];
        }
        let chol = sigma.clone().cholesky().unwrap();
        let logdet: f64 = chol.l().diagonal().map(|v| v.ln()).sum() * 2.0;
        let rv = DVector::from_row_slice(&r);
        let quad = rv.dot(&chol.solve(&rv));
        let want = -0.5 * (n as f64 * LN_2PI + logdet + quad);
        assert_abs_diff_eq!(lp, want, epsilon = 1e-9);
        Ok(())
    }
}
