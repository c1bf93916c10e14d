//! Source position tracking.
//!
//! The core never sees source text; SSA nodes arrive annotated with the
//! positions the front end recorded, and the core threads them through to
//! diagnostics and DWARF metadata.

use serde::{Deserialize, Serialize};

/// A resolved source position: file, 1-indexed line and column.
///
/// Synthesized nodes (package initializers, wrappers) carry
/// [`Position::none`], which debug-info generation maps to line 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    /// Path of the defining source file, as the front end recorded it.
    pub file: String,
    /// 1-indexed line number; 0 for synthesized code.
    pub line: u32,
    /// 1-indexed column number; 0 for synthesized code.
    pub column: u32,
}

impl Position {
    /// Create a position.
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Position for synthesized code with no source syntax.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether this position refers to real source syntax.
    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_known() {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        } else {
            write!(f, "<synthetic>")
        }
    }
}
