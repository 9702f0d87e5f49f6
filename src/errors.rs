use std::fmt;

/// Errors that can abort a fit. All of these are fatal within a single fit;
/// there is no retry or partial-result salvage. Recovery (another seed, other
/// hyperparameters) is the caller's responsibility.
#[derive(Debug)]
pub enum Error {
    /// The ELBO became non-finite during optimization.
    NumericalDivergence(String),
    /// Unrecognized latent site, guide type, or model type.
    Configuration(String),
    /// Inconsistent tensor dimensions between dataset components.
    ShapeMismatch(String),
    /// The trailing-median loss check detected a diverging fit.
    DivergenceHeuristic(String),
    /// Error from the tensor backend.
    Candle(candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NumericalDivergence(msg) => write!(f, "numerical divergence: {}", msg),
            Error::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Error::ShapeMismatch(msg) => write!(f, "shape mismatch: {}", msg),
            Error::DivergenceHeuristic(msg) => write!(f, "loss divergence: {}", msg),
            Error::Candle(e) => write!(f, "tensor backend error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Candle(e) => Some(e),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::Candle(e)
    }
}

#[macro_export]
macro_rules! config_err {
    ($($arg:tt)*) => {
        $crate::errors::Error::Configuration(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! shape_err {
    ($($arg:tt)*) => {
        $crate::errors::Error::ShapeMismatch(format!($($arg)*))
    };
}
