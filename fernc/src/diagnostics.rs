//! Compile-session error reporting.
//!
//! Every fallible step of lowering returns [`CompileError`]. The policy is
//! abort-on-first-error: errors propagate to the driver and end the session.
//! The single exception is [`CompileError::ForeignGlue`], a sentinel raised
//! when lowering encounters a symbol reserved for foreign-function glue; the
//! instruction lowerer catches it and skips the node.

use thiserror::Error;

/// Convenience alias used throughout the codegen modules.
pub type Result<T> = std::result::Result<T, CompileError>;

/// An error raised while lowering an SSA program to LLVM IR.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A source type the type lowerer cannot map to an LLVM type.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// A constant or interpreted initializer shape the materialiser cannot
    /// build.
    #[error("unsupported constant: {0}")]
    UnsupportedConstant(String),

    /// An SSA instruction the lowerer does not implement.
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),

    /// A blocking function declared with results. Blocking functions return
    /// their task handle; result values are not representable.
    #[error("blocking function {0} cannot have result values")]
    UnsupportedBlockingReturn(String),

    /// A compile-time map literal keyed by a type the static bucket builder
    /// cannot hash.
    #[error("unsupported map key type in constant initializer: {0}")]
    UnsupportedMapKey(String),

    /// A call references a function with no declaration in the module.
    #[error("undefined function: {0}")]
    UndefinedFunction(String),

    /// An operand references a global with no declaration in the module.
    #[error("undefined global: {0}")]
    UndefinedGlobal(String),

    /// Sentinel for symbols reserved for foreign-function glue. Not a real
    /// error: callers catch it and skip the node.
    #[error("foreign glue symbol skipped")]
    ForeignGlue,

    /// Malformed inline-assembly intrinsic call: unknown register reference
    /// or an operand type with no constraint mapping.
    #[error("inline assembly: {0}")]
    InlineAsm(String),

    /// Target triple or target machine construction failed.
    #[error("target: {0}")]
    Target(String),

    /// LLVM module verification failed after the named phase.
    #[error("verification error after {phase}: {message}")]
    Verify {
        /// The phase that produced the broken module.
        phase: &'static str,
        /// LLVM's verifier output.
        message: String,
    },

    /// An invariant of the lowering itself was violated; always a bug in the
    /// front end's input or in this crate.
    #[error("internal error: {0}")]
    Internal(String),

    /// An LLVM IR builder call failed.
    #[error("llvm builder: {0}")]
    Llvm(#[from] inkwell::builder::BuilderError),

    /// Output file I/O failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    /// Shorthand for [`CompileError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}
