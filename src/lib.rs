//! Relative growth-rate estimation for viral lineages from genomic
//! surveillance counts.
//!
//! The model regresses per-strain logistic growth on amino-acid mutations
//! across places, fitted by stochastic variational inference on CPU `f64`
//! tensors. Uncertainty comes from the variational posterior or, more
//! conservatively, from a place-level block bootstrap.

pub mod bootstrap;
pub mod dataset;
pub mod distributions;
pub mod errors;
pub mod guide;
pub mod init;
pub mod io;
pub mod model;
pub mod numerics;
pub mod optimizer;
pub mod predict;
pub mod stats;
pub mod svi;

pub use candle_core;
pub use candle_nn;

pub use bootstrap::{fit_bootstrap, BootstrapConfig, BootstrapResult};
pub use dataset::{simulate, Dataset, SimulateConfig, SubsetQuery};
pub use errors::{Error, Result};
pub use svi::{fit_svi, FitConfig, FitResult, InitData};
