//! JSON serialization of datasets and fit summaries.
//!
//! Tensors travel as a shape plus flat row-major data. `local_time` may be
//! omitted from dataset files; it is then derived from the counts with the
//! default timestep and generation interval.

use std::fs;
use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::bootstrap::BootstrapResult;
use crate::dataset::{centered_local_time, Dataset, GENERATION_DAYS, TIMESTEP_DAYS};
use crate::model::SiteMap;
use crate::svi::FitResult;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TensorJson {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl TensorJson {
    pub fn from_tensor(t: &Tensor) -> crate::errors::Result<Self> {
        Ok(Self {
            shape: t.dims().to_vec(),
            data: t.flatten_all()?.to_vec1::<f64>()?,
        })
    }

    pub fn to_tensor(&self) -> crate::errors::Result<Tensor> {
        let want: usize = self.shape.iter().product();
        if self.data.len() != want {
            return Err(crate::shape_err!(
                "tensor data has {} values for shape {:?}",
                self.data.len(),
                self.shape
            ));
        }
        Ok(Tensor::from_vec(
            self.data.clone(),
            self.shape.clone(),
            &Device::Cpu,
        )?)
    }
}

fn site_map_json(sites: &SiteMap) -> crate::errors::Result<Vec<(String, TensorJson)>> {
    sites
        .iter()
        .map(|(name, value)| Ok((name.clone(), TensorJson::from_tensor(value)?)))
        .collect()
}

#[derive(Serialize, Deserialize)]
pub struct DatasetJson {
    pub locations: Vec<String>,
    pub lineages: Vec<String>,
    pub mutations: Vec<String>,
    pub weekly_strains: TensorJson,
    pub features: TensorJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_time: Option<TensorJson>,
}

impl DatasetJson {
    pub fn from_dataset(dataset: &Dataset) -> crate::errors::Result<Self> {
        Ok(Self {
            locations: dataset.locations().iter().map(|s| s.to_string()).collect(),
            lineages: dataset.lineages().iter().map(|s| s.to_string()).collect(),
            mutations: dataset.mutations().iter().map(|s| s.to_string()).collect(),
            weekly_strains: TensorJson::from_tensor(dataset.weekly_strains())?,
            features: TensorJson::from_tensor(dataset.features())?,
            local_time: Some(TensorJson::from_tensor(dataset.local_time())?),
        })
    }

    pub fn into_dataset(self) -> crate::errors::Result<Dataset> {
        let weekly = self.weekly_strains.to_tensor()?;
        let local_time = match self.local_time {
            Some(lt) => lt.to_tensor()?,
            None => centered_local_time(&weekly, TIMESTEP_DAYS, GENERATION_DAYS)?,
        };
        Dataset::new(
            weekly,
            self.features.to_tensor()?,
            local_time,
            self.locations.into_iter().map(Into::into).collect(),
            self.lineages.into_iter().map(Into::into).collect(),
            self.mutations.into_iter().map(Into::into).collect(),
        )
    }
}

pub fn read_dataset(path: &Path) -> anyhow::Result<Dataset> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let json: DatasetJson = serde_json::from_str(&text)
        .with_context(|| format!("parsing dataset {}", path.display()))?;
    Ok(json.into_dataset()?)
}

pub fn write_dataset(path: &Path, dataset: &Dataset) -> anyhow::Result<()> {
    let json = DatasetJson::from_dataset(dataset)?;
    fs::write(path, serde_json::to_string(&json)?)
        .with_context(|| format!("writing dataset {}", path.display()))?;
    Ok(())
}

#[derive(Serialize)]
pub struct FitResultJson {
    pub median: Vec<(String, TensorJson)>,
    pub mean: Vec<(String, TensorJson)>,
    pub std: Vec<(String, TensorJson)>,
    pub losses: Vec<f64>,
    pub walltime: f64,
}

pub fn write_fit_result(path: &Path, fit: &FitResult) -> anyhow::Result<()> {
    let json = FitResultJson {
        median: site_map_json(&fit.median)?,
        mean: site_map_json(&fit.mean)?,
        std: site_map_json(&fit.std)?,
        losses: fit.losses.clone(),
        walltime: fit.walltime,
    };
    fs::write(path, serde_json::to_string(&json)?)
        .with_context(|| format!("writing fit result {}", path.display()))?;
    Ok(())
}

#[derive(Serialize)]
pub struct BootstrapResultJson {
    pub mean: Vec<(String, TensorJson)>,
    pub std: Vec<(String, TensorJson)>,
    pub covariance: Vec<(String, TensorJson)>,
    pub walltime: f64,
}

pub fn write_bootstrap_result(path: &Path, boot: &BootstrapResult) -> anyhow::Result<()> {
    let covariance = boot
        .covariance
        .iter()
        .map(|(name, cov)| {
            let (rows, cols) = cov.shape();
            let data: Vec<f64> = (0..rows)
                .flat_map(|i| (0..cols).map(move |j| cov[(i, j)]))
                .collect();
            (
                name.clone(),
                TensorJson {
                    shape: vec![rows, cols],
                    data,
                },
            )
        })
        .collect();
    let json = BootstrapResultJson {
        mean: site_map_json(&boot.mean)?,
        std: site_map_json(&boot.std)?,
        covariance,
        walltime: boot.walltime,
    };
    fs::write(path, serde_json::to_string(&json)?)
        .with_context(|| format!("writing bootstrap result {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{simulate, SimulateConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn dataset_roundtrips_through_json() -> crate::errors::Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let json = DatasetJson::from_dataset(&ds)?;
        let text = serde_json::to_string(&json).unwrap();
        let back: DatasetJson = serde_json::from_str(&text).unwrap();
        let ds2 = back.into_dataset()?;
        assert_eq!(ds.dims(), ds2.dims());
        assert_eq!(
            ds.weekly_strains().to_vec3::<f64>()?,
            ds2.weekly_strains().to_vec3::<f64>()?
        );
        assert_eq!(ds.locations(), ds2.locations());
        Ok(())
    }

    #[test]
    fn missing_local_time_is_derived_from_counts() -> crate::errors::Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let ds = simulate(&SimulateConfig::default(), &mut rng)?;
        let mut json = DatasetJson::from_dataset(&ds)?;
        json.local_time = None;
        let ds2 = json.into_dataset()?;
        let a = ds.local_time().to_vec2::<f64>()?;
        let b = ds2.local_time().to_vec2::<f64>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn tensor_json_rejects_bad_lengths() {
        let bad = TensorJson {
            shape: vec![2, 2],
            data: vec![1.0, 2.0, 3.0],
        };
        assert!(bad.to_tensor().is_err());
    }
}
