//! Streaming moment accumulators and post-fit diagnostics.

use candle_core::{Device, Tensor};
use nalgebra::{DMatrix, DVector};

use crate::config_err;
use crate::dataset::Dataset;
use crate::errors::Result;
use crate::shape_err;
use crate::svi::FitResult;

/// Welford accumulator for elementwise mean and variance over tensors of a
/// fixed shape, keeping only two buffers regardless of sample count.
pub struct CountMeanVariance {
    dims: Vec<usize>,
    count: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl CountMeanVariance {
    pub fn new(dims: &[usize]) -> Self {
        let n = dims.iter().product();
        Self {
            dims: dims.to_vec(),
            count: 0,
            mean: vec![0.0; n],
            m2: vec![0.0; n],
        }
    }

    pub fn update(&mut self, sample: &Tensor) -> Result<()> {
        if sample.dims() != self.dims.as_slice() {
            return Err(shape_err!(
                "moment update with shape {:?}, accumulator wants {:?}",
                sample.dims(),
                self.dims
            ));
        }
        let data = sample.flatten_all()?.to_vec1::<f64>()?;
        self.count += 1;
        let n = self.count as f64;
        for i in 0..data.len() {
            let delta = data[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (data[i] - self.mean[i]);
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean_tensor(&self) -> Result<Tensor> {
        if self.count == 0 {
            return Err(config_err!("moment accumulator has no samples"));
        }
        Ok(Tensor::from_vec(
            self.mean.clone(),
            self.dims.clone(),
            &Device::Cpu,
        )?)
    }

    /// Sample standard deviation with the n-1 correction.
    pub fn std_tensor(&self) -> Result<Tensor> {
        if self.count < 2 {
            return Err(config_err!(
                "standard deviation needs at least two samples, got {}",
                self.count
            ));
        }
        let denom = (self.count - 1) as f64;
        let std: Vec<f64> = self.m2.iter().map(|v| (v / denom).sqrt()).collect();
        Ok(Tensor::from_vec(std, self.dims.clone(), &Device::Cpu)?)
    }
}

/// Welford accumulator for the full covariance of flattened samples, used by
/// the bootstrap to summarize replicate medians.
pub struct WelfordCovariance {
    count: usize,
    mean: DVector<f64>,
    m2: DMatrix<f64>,
}

impl WelfordCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: DVector::zeros(dim),
            m2: DMatrix::zeros(dim, dim),
        }
    }

    pub fn update(&mut self, sample: &[f64]) -> Result<()> {
        if sample.len() != self.mean.len() {
            return Err(shape_err!(
                "covariance update with {} entries, accumulator wants {}",
                sample.len(),
                self.mean.len()
            ));
        }
        let x = DVector::from_row_slice(sample);
        self.count += 1;
        let delta = &x - &self.mean;
        self.mean += &delta / self.count as f64;
        let delta2 = &x - &self.mean;
        self.m2 += &delta * delta2.transpose();
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Sample covariance with the n-1 correction.
    pub fn covariance(&self) -> Result<DMatrix<f64>> {
        if self.count < 2 {
            return Err(config_err!(
                "covariance needs at least two samples, got {}",
                self.count
            ));
        }
        Ok(&self.m2 / (self.count - 1) as f64)
    }
}

pub fn pearson_correlation(a: &Tensor, b: &Tensor) -> Result<f64> {
    let x = a.flatten_all()?.to_vec1::<f64>()?;
    let y = b.flatten_all()?.to_vec1::<f64>()?;
    if x.len() != y.len() || x.is_empty() {
        return Err(shape_err!(
            "correlation over mismatched lengths {} and {}",
            x.len(),
            y.len()
        ));
    }
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (xi, yi) in x.iter().zip(&y) {
        sxy += (xi - mx) * (yi - my);
        sxx += (xi - mx) * (xi - mx);
        syy += (yi - my) * (yi - my);
    }
    Ok(sxy / (sxx * syy).sqrt())
}

pub(crate) fn median_of(mut v: Vec<f64>) -> f64 {
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n == 0 {
        f64::NAN
    } else if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}

/// Log a compact summary of a fit: coefficient significance, the most
/// significant mutations, and the fit of predicted strain proportions
/// against smoothed empirical ones.
pub fn log_stats(dataset: &Dataset, fit: &FitResult) -> Result<()> {
    if let (Some(mean), Some(std)) = (fit.mean.get("rate_coef"), fit.std.get("rate_coef")) {
        let mean = mean.flatten_all()?.to_vec1::<f64>()?;
        let std = std.flatten_all()?.to_vec1::<f64>()?;
        let sig: Vec<f64> = mean
            .iter()
            .zip(&std)
            .map(|(m, s)| m.abs() / s.max(1e-20))
            .collect();
        let max_sig = sig.iter().fold(0.0f64, |a, b| a.max(*b));
        log::info!(
            "|rate_coef| / std: median {:.3}, max {:.3}",
            median_of(sig.clone()),
            max_sig
        );
        let mut order: Vec<usize> = (0..sig.len()).collect();
        order.sort_by(|a, b| sig[*b].total_cmp(&sig[*a]));
        for &i in order.iter().take(10) {
            log::info!(
                "  {}: rate_coef = {:+.4} ({:.1} sigma)",
                dataset.mutations()[i],
                mean[i],
                sig[i]
            );
        }
    }

    if let Some(probs) = fit.median.get("probs") {
        let (_t, _p, s, _f) = dataset.dims();
        let smooth = 1.0 / s as f64;
        let counts = (dataset.weekly_strains() + smooth)?;
        let empirical = counts.broadcast_div(&counts.sum_keepdim(2)?)?;
        let err = probs.broadcast_sub(&empirical)?;
        let mae = err.abs()?.mean_all()?.to_scalar::<f64>()?;
        let rmse = err.sqr()?.mean_all()?.to_scalar::<f64>()?.sqrt();
        log::info!("probs error vs empirical: MAE {:.4}, RMSE {:.4}", mae, rmse);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn streaming_moments_match_direct_formulas() -> Result<()> {
        let samples = [
            vec![1.0f64, 2.0, 3.0],
            vec![2.0, 0.0, 3.0],
            vec![3.0, 4.0, 3.0],
        ];
        let mut acc = CountMeanVariance::new(&[3]);
        for s in &samples {
            acc.update(&Tensor::from_vec(s.clone(), (3,), &Device::Cpu)?)?;
        }
        let mean = acc.mean_tensor()?.to_vec1::<f64>()?;
        let std = acc.std_tensor()?.to_vec1::<f64>()?;
        assert_abs_diff_eq!(mean[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(mean[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(std[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(std[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(std[2], 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn covariance_matches_two_point_sample() -> Result<()> {
        let mut acc = WelfordCovariance::new(2);
        assert!(acc.covariance().is_err());
        acc.update(&[0.0, 0.0])?;
        acc.update(&[2.0, 4.0])?;
        let cov = acc.covariance()?;
        assert_abs_diff_eq!(cov[(0, 0)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(0, 1)], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[(1, 1)], 8.0, epsilon = 1e-12);
        assert_abs_diff_eq!(acc.mean()[0], 1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn correlation_of_linear_data_is_one() -> Result<()> {
        let a = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], (4,), &Device::Cpu)?;
        let b = Tensor::from_vec(vec![2.0f64, 4.0, 6.0, 8.0], (4,), &Device::Cpu)?;
        assert_abs_diff_eq!(pearson_correlation(&a, &b)?, 1.0, epsilon = 1e-12);
        let c = Tensor::from_vec(vec![8.0f64, 6.0, 4.0, 2.0], (4,), &Device::Cpu)?;
        assert_abs_diff_eq!(pearson_correlation(&a, &c)?, -1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_abs_diff_eq!(median_of(vec![3.0, 1.0, 2.0]), 2.0);
        assert_abs_diff_eq!(median_of(vec![4.0, 1.0, 2.0, 3.0]), 2.5);
    }
}
