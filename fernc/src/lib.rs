//! # fernc
//!
//! Compiler core for Fern, a statically-typed, garbage-collected language
//! with lightweight tasks, compiled ahead of time into small, statically
//! linked binaries for microcontrollers and WebAssembly.
//!
//! This crate is the SSA-to-LLVM lowering engine. The front end (parsing,
//! type checking, SSA construction, the whole analysis suite) and the
//! runtime library (allocator, scheduler, hashmap, string helpers) are
//! separate components; what lives here is the translation of an
//! already-checked SSA program into LLVM IR that implements the language's
//! runtime model — strings, slices, maps, interfaces, closures, multiple
//! returns, `defer`, `panic`/`recover` and goroutines — on top of LLVM's
//! type system.
//!
//! ## Pipeline
//!
//! ```text
//! SSA program -> Session::compile -> LLVM module -> verify -> late passes
//!             -> object / bitcode / textual IR
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use fernc::codegen::{Config, Session};
//! use fernc::ssa::Program;
//! use inkwell::context::Context;
//!
//! let program = Program::default(); // normally built by the front end
//! let context = Context::create();
//! let mut session = Session::new(&context, "demo", Config::default()).unwrap();
//! session.compile(&program).unwrap();
//! session.verify("IR construction").unwrap();
//! println!("{}", session.ir());
//! ```
//!
//! ## Module overview
//!
//! - [`ssa`] — the typed SSA input model and dominator utilities
//! - [`codegen`] — the compile session and every lowering stage
//! - [`diagnostics`] — the session error type
//! - [`span`] — source positions carried by SSA nodes

pub mod codegen;
pub mod diagnostics;
pub mod span;
pub mod ssa;

pub use codegen::{Config, Session};
pub use diagnostics::{CompileError, Result};
pub use span::Position;
