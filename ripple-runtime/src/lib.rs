//! # Ripple Runtime Library
//!
//! The Ripple runtime provides:
//!
//! - **Effect ABI**: effect and operation identities, the binary effect table,
//!   and the self-describing wire format for host requests
//! - **Artifacts**: the target module format produced by `ripplec`
//! - **Reference Machine**: an explicit-stack executor for artifacts, with the
//!   per-run handler arena, tail guards, and fibers
//! - **Host Side**: sessions, the cooperative run scheduler, and reference
//!   host adapters
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         RIPPLE RUNTIME                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐          │
//! │  │  Scheduler   │──►│   Session    │──►│   Machine    │          │
//! │  │(scheduler.rs)│   │ (session.rs) │   │   (vm.rs)    │          │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘          │
//! │         │                  │                  │                   │
//! │  ┌──────▼───────┐   ┌──────▼───────┐   ┌──────▼───────┐          │
//! │  │   Adapters   │   │ Effect Table │   │  Handlers /  │          │
//! │  │(adapters.rs) │   │   + Wire     │   │ Fibers/Guard │          │
//! │  └──────────────┘   └──────────────┘   └──────────────┘          │
//! │                                                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(rust_2018_idioms)]

pub mod abi;
pub mod adapters;
pub mod artifact;
pub mod builtins;
pub mod config;
pub mod effect_table;
pub mod error;
pub mod fiber;
pub mod handlers;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod value;
pub mod vm;
pub mod wire;

// Re-exports
pub use abi::{EffectId, OpId, OpIndex, ResumptionKind};
pub use adapters::{
    CapabilityReport, ClockAdapter, FetchAdapter, FnHandler, HandlerRegistry, HostContinuation, HostHandler,
    LogAdapter, OperationSpec, TimerAdapter,
};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use effect_table::{EffectTable, EffectTableEntry, TableError};
pub use error::{HostError, Trap};
pub use scheduler::{RunId, RunOutcome, RunStatus, Scheduler, TickReport};
pub use session::{HostRequest, Instance, Session, Step};
pub use vm::{Machine, MachineConfig};
pub use wire::{EffectResult, WireError, WireSchema, WireShape, WireValue};
