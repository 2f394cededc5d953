//! # bt-optimizer
//!
//! Acquisition and next-experiment choice for BayesTune.
//!
//! Provides Expected Improvement marginalized over a GP hyperparameter pool
//! and over fantasies of pending jobs, a candidate selector that refines the
//! best-scoring points in parallel, and the [`Chooser`] that ties both to the
//! experiment's job table.

pub mod acquisition;
mod chooser;
mod selector;

pub use acquisition::{ei_from_moments, expected_improvement, ExpectedImprovement};
pub use chooser::{Choice, Chooser, ChooserConfig, ChooserState};
pub use selector::{refine, CandidateSelector, Selection, SelectorConfig};
