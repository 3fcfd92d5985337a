//! # Mid-level IR
//!
//! Control flow graph form of the typed input, one body per function and
//! per lifted `handle` body and clause set. Suspension points are block
//! terminators, so every continuation starts at the beginning of a block.
//!
//! ## Passes
//!
//! 1. [`lowering`]: HIR to MIR, lambda lifting of handlers
//! 2. [`sites`]: continuation site collection and live-binding analysis
//! 3. [`specialize`]: instances of generic functions and per-instance
//!    environment layouts

pub mod body;
pub mod lowering;
pub mod sites;
pub mod specialize;
pub mod types;

pub use body::{ArgPartition, Body, BodyKind, HandlerInfo, LocalDecl, MirProgram};
pub use lowering::lower_program;
pub use sites::{collect_sites, ContinuationSite, EnvField, SiteKind, SiteOwner, SiteTable};
pub use specialize::{instance_name, val_type, Instance, InstanceId, Instances, SiteSpecializer};
pub use types::{BasicBlock, BlockId, BodyId, Constant, FnRef, Local, Operand, Rvalue, SiteId, Statement, StatementKind, Terminator, TerminatorKind};
