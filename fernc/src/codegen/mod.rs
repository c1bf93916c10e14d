//! LLVM code generation for Fern.
//!
//! This is the core of the compiler: it walks a typed SSA program once and
//! emits an LLVM module implementing the language's runtime model on top of
//! LLVM's type system. The generator uses inkwell as a safe wrapper around
//! LLVM.
//!
//! # Architecture
//!
//! ```text
//! SSA program -> Session -> LLVM IR -> object / bitcode / textual IR
//! ```
//!
//! One [`Session`] owns the LLVM module, builder and target data for the
//! whole compile and is strictly single-threaded. Lowering happens leaves
//! first:
//!
//! - type lowering and zero values ([`types`])
//! - constants and interpreted initializers ([`consts`])
//! - function declarations ([`decl`])
//! - instruction lowering ([`lower`])
//! - blocking-function (task) transformation ([`tasks`])
//! - defer frames and thunks ([`defers`])
//! - verification, section assignment, ABI fixups, emission ([`passes`])
//!
//! The runtime support library (allocator, scheduler, hashmap, string
//! helpers, printing) is an external collaborator: the session declares the
//! helpers by name ([`runtime`]) and the linker resolves them.

pub mod consts;
pub mod debug_info;
pub mod decl;
pub mod defers;
pub mod lower;
pub mod passes;
pub mod runtime;
pub mod session;
pub mod tasks;
pub mod types;

#[cfg(test)]
mod tests;

pub use session::Session;

use serde::{Deserialize, Serialize};

/// Compile-session configuration.
///
/// The out-of-scope build driver assembles this from the target
/// specification and command line; the serde derives let it round-trip
/// through the driver's spec files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// LLVM target triple, e.g. `x86_64-unknown-linux-gnu`. Empty means the
    /// host default.
    pub triple: String,
    /// Build tags selecting target-specific sources. Empty means the
    /// OS/arch defaults. Consumed by the front end; recorded here so one
    /// config value describes the whole build.
    pub build_tags: Vec<String>,
    /// Root of the Fern source tree (the language's standard library).
    pub root_dir: String,
    /// Package search path, like the front end's environment default.
    pub package_path: String,
    /// Attach DWARF debug metadata.
    pub debug: bool,
    /// Print the SSA to stdout while lowering, for compiler debugging.
    pub dump_ssa: bool,
    /// The external partial evaluator will run after IR construction, so
    /// the session skips its own initializer interpretation.
    pub init_interp: bool,
}
