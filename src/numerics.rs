//! Numeric kernels shared across the model, guide, and summarization code.
//!
//! Everything runs on CPU `f64` tensors. The two PSD helpers wrap nalgebra
//! Cholesky factorizations as candle custom ops with hand-written backward
//! passes, so low-rank Gaussian densities stay differentiable without a
//! general linear-algebra autodiff.

use candle_core::{CpuStorage, CustomOp1, DType, Device, Layout, Result, Shape, Tensor, Var};
use candle_nn::VarMap;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

pub const DTYPE: DType = DType::F64;

pub const LN_2PI: f64 = 1.8378770664093453;

/// Scalar f64 tensor.
pub fn scalar(v: f64) -> Result<Tensor> {
    Tensor::new(v, &Device::Cpu)
}

/// Identity matrix as an f64 tensor.
pub fn eye(n: usize) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(data, (n, n), &Device::Cpu)
}

/// Standard-normal draws shaped `dims`, driven by the caller's rng so that
/// fits are reproducible from a single seed.
pub fn randn(rng: &mut StdRng, dims: &[usize]) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let data: Vec<f64> = (0..n).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_vec(data, dims.to_vec(), &Device::Cpu)
}

/// Uniform draws in `lo..hi` shaped `dims`.
pub fn rand_uniform(rng: &mut StdRng, lo: f64, hi: f64, dims: &[usize]) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let data: Vec<f64> = (0..n).map(|_| rng.random_range(lo..hi)).collect();
    Tensor::from_vec(data, dims.to_vec(), &Device::Cpu)
}

/// Register a named trainable parameter with an explicit initial value.
///
/// `VarMap::get` only supports the stock initializers, so parameter stores
/// are populated directly; names follow a `{block}.{kind}.{site}` scheme that
/// the optimizer policy matches on.
pub fn register_param(varmap: &VarMap, name: &str, value: Tensor) -> Result<Var> {
    let var = Var::from_tensor(&value)?;
    varmap
        .data()
        .lock()
        .expect("parameter store poisoned")
        .insert(name.to_string(), var.clone());
    Ok(var)
}

/// Snapshot of all named parameters, sorted by name for deterministic
/// iteration order.
pub fn named_params(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().expect("parameter store poisoned");
    let mut params: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

/// Numerically stable `ln(1 + exp(x))`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let linear = x.relu()?;
    let tail = ((x.abs()?.neg()?.exp()? + 1.0)?).log()?;
    &linear + &tail
}

const LN_GAMMA_SHIFT: usize = 8;

/// Differentiable elementwise log-gamma for strictly positive tensors.
///
/// Uses the recurrence `lnΓ(x) = lnΓ(x+8) − Σ ln(x+k)` to push the argument
/// into the regime where a short Stirling series is accurate (absolute error
/// below 1e-9 for any x > 0), composed entirely from differentiable ops.
pub fn ln_gamma(x: &Tensor) -> Result<Tensor> {
    let mut shift = x.log()?;
    for k in 1..LN_GAMMA_SHIFT {
        shift = (shift + (x + k as f64)?.log()?)?;
    }
    let z = (x + LN_GAMMA_SHIFT as f64)?;
    let zinv = z.recip()?;
    let zinv2 = zinv.sqr()?;
    let t1 = (zinv.clone() * (1.0 / 12.0))?;
    let t2 = ((&zinv * &zinv2)? * (1.0 / 360.0))?;
    let t3 = ((&zinv * &zinv2.sqr()?)? * (1.0 / 1260.0))?;
    let stirling = (((&z - 0.5)? * &z.log()?)? - &z)?;
    let stirling = ((stirling + 0.5 * LN_2PI)? + t1)?;
    let stirling = ((stirling - t2)? + t3)?;
    stirling - shift
}

fn dmatrix_from_storage(storage: &CpuStorage, layout: &Layout, op: &str) -> Result<DMatrix<f64>> {
    let (rows, cols) = layout.shape().dims2()?;
    if rows != cols {
        candle_core::bail!("{op} expects a square matrix, got {:?}", layout.shape());
    }
    let (start, end) = match layout.contiguous_offsets() {
        Some(se) => se,
        None => candle_core::bail!("{op} expects a contiguous matrix"),
    };
    let vs = match storage {
        CpuStorage::F64(vs) => &vs[start..end],
        _ => candle_core::bail!("{op} expects an f64 matrix"),
    };
    Ok(DMatrix::from_row_slice(rows, cols, vs))
}

/// Candle tensor from a symmetric nalgebra matrix. Symmetry lets us reuse
/// the column-major backing slice as row-major data.
pub fn tensor_from_symmetric(m: &DMatrix<f64>) -> Result<Tensor> {
    let (rows, cols) = m.shape();
    Tensor::from_vec(m.as_slice().to_vec(), (rows, cols), &Device::Cpu)
}

pub fn dmatrix_from_tensor(t: &Tensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = t.dims2()?;
    let data = t.to_vec2::<f64>()?;
    Ok(DMatrix::from_fn(rows, cols, |i, j| data[i][j]))
}

struct PsdLogDet;

impl CustomOp1 for PsdLogDet {
    fn name(&self) -> &'static str {
        "psd-logdet"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let m = dmatrix_from_storage(storage, layout, "psd-logdet")?;
        let chol = match m.cholesky() {
            Some(c) => c,
            None => candle_core::bail!("psd-logdet: matrix is not positive definite"),
        };
        let logdet = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        Ok((CpuStorage::F64(vec![logdet]), Shape::from(())))
    }

    // d logdet(M) / dM = M^{-1} for symmetric M.
    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let m = dmatrix_from_tensor(&arg.detach())?;
        let chol = match m.cholesky() {
            Some(c) => c,
            None => candle_core::bail!("psd-logdet: matrix is not positive definite"),
        };
        let inv = tensor_from_symmetric(&chol.inverse())?;
        Ok(Some(inv.broadcast_mul(grad_res)?))
    }
}

struct PsdInverse;

impl CustomOp1 for PsdInverse {
    fn name(&self) -> &'static str {
        "psd-inverse"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let m = dmatrix_from_storage(storage, layout, "psd-inverse")?;
        let shape = layout.shape().clone();
        let chol = match m.cholesky() {
            Some(c) => c,
            None => candle_core::bail!("psd-inverse: matrix is not positive definite"),
        };
        Ok((CpuStorage::F64(chol.inverse().as_slice().to_vec()), shape))
    }

    // d(M^{-1}) = -M^{-1} dM M^{-1}, so dL/dM = -M^{-T} G M^{-T}.
    fn bwd(&self, _arg: &Tensor, res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let rt = res.t()?;
        Ok(Some(rt.matmul(grad_res)?.matmul(&rt)?.neg()?))
    }
}

/// Log-determinant of a symmetric positive-definite matrix, differentiable.
pub fn psd_logdet(m: &Tensor) -> Result<Tensor> {
    m.contiguous()?.apply_op1(PsdLogDet)
}

/// Inverse of a symmetric positive-definite matrix, differentiable.
pub fn psd_inverse(m: &Tensor) -> Result<Tensor> {
    m.contiguous()?.apply_op1(PsdInverse)
}
