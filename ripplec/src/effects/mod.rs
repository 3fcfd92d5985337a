//! # Effect System Support
//!
//! - [`registry`]: the canonical table of declared effects and operations
//! - [`clause`]: handler clause checks and resumption counting
//! - [`table`]: effect table section emission

pub mod clause;
pub mod registry;
pub mod table;

pub use clause::{analyze_program, ClauseAnalysis, ClauseSummary, ResumeCount};
pub use registry::{EffectInfo, OperationInfo, Registry, RegistryError};
