//! # bt-gp
//!
//! Gaussian-process machinery for BayesTune.
//!
//! Provides ARD covariance kernels and their input gradients, a dense Cholesky
//! toolkit, the GP marginal likelihood and predictive equations, and slice
//! samplers that maintain a posterior pool of hyperparameters (plus an optional
//! latent feasibility classifier for constrained objectives).

pub mod feasibility;
pub mod gp;
pub mod kernel;
pub mod linalg;
pub mod normal;
pub mod sampler;
pub mod slice;

pub use feasibility::{FeasibilityConfig, FeasibilityModel, FeasibilitySample, FeasibilitySampler};
pub use gp::{
    cross_covariance, log_marginal_likelihood, predict, prior_variance, train_covariance,
    GaussianProcess, GpHypers, JITTER,
};
pub use kernel::{covariance, covariance_gradient, squared_distance, CovarianceKind};
pub use sampler::{HyperSampler, SamplerConfig, NOISELESS_NOISE};
pub use slice::{elliptical_slice, slice_sample, SliceConfig};
