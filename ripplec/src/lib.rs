//! # Ripple Compiler Library
//!
//! The continuation backend of the Ripple compiler: it turns a typed,
//! effect-annotated program into an artifact that the `ripple-runtime`
//! machine executes and a host drives through the effect ABI.
//!
//! ## Pipeline
//!
//! ```text
//! HIR -> effect registry -> MIR (lambda-lifted handlers)
//!     -> continuation sites -> instances -> trampoline | stack switching
//!     -> Module { functions, env layouts, exports, effect table, wire schema }
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use ripplec::config::CompilerConfig;
//! use ripplec::hir::build::*;
//! use ripplec::hir::{EffectDecl, EffectRow, FnDecl, OpDecl, Program, Type};
//!
//! let program = Program::new()
//!     .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)))
//!     .function(
//!         FnDecl::new("main", Type::Int)
//!             .row(EffectRow::of(&["Async"]))
//!             .export()
//!             .body(add(perform("Async", "await", vec![int(1)]), int(1))),
//!     );
//!
//! let output = ripplec::compile(&program, &CompilerConfig::default());
//! assert!(!output.has_errors());
//! let module = output.module.unwrap();
//! assert!(module.export("main").is_some());
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Backend selection and artifact options
//! - [`diagnostics`] - Coded diagnostics rendered with ariadne
//! - [`hir`] - Typed input program
//! - [`effects`] - Effect registry, clause checks, effect table emission
//! - [`mir`] - Control flow IR, continuation sites, specialization
//! - [`codegen`] - Trampoline and stack switching backends, dispatch, host boundary
//! - [`compiler`] - The driver

#![warn(rust_2018_idioms)]

pub mod codegen;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod effects;
pub mod hir;
pub mod mir;
pub mod span;

pub use codegen::CodegenStats;
pub use compiler::{compile, CompileOutput, Compiler};
pub use config::{BackendKind, CompilerConfig};
pub use diagnostics::{Diagnostic, ErrorCode};
pub use effects::Registry;
