//! Code generation errors.
//!
//! Most variants are internal compiler errors: the front-end hands us a
//! checked program, so a failure here means a bug upstream or in this crate,
//! not a user mistake. The two exceptions are `InvalidType` (a structural
//! refusal the user can trigger) and the diagnostics sink for unsupported
//! defer targets, which is reported with a position and does not abort
//! construction.

use std::fmt;

use ember_ssa::Pos;

/// Code generation error with context for debugging.
#[derive(Debug, Clone)]
pub enum CodegenError {
    /// A type that cannot participate in the requested encoding, e.g. a
    /// foreign-union struct placed inside an interface.
    InvalidType { context: &'static str, ty: String },

    /// Function, method, or global not found.
    NotFound { kind: &'static str, name: String },

    /// Internal invariant violation (compiler bug).
    Internal {
        message: &'static str,
        context: Option<String>,
    },

    /// Error reported by the Cranelift module layer.
    Module { message: String },
}

impl CodegenError {
    pub fn invalid_type(context: &'static str, ty: impl Into<String>) -> Self {
        CodegenError::InvalidType {
            context,
            ty: ty.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        CodegenError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn internal(message: &'static str) -> Self {
        CodegenError::Internal {
            message,
            context: None,
        }
    }

    pub fn internal_with_context(message: &'static str, context: impl Into<String>) -> Self {
        CodegenError::Internal {
            message,
            context: Some(context.into()),
        }
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::InvalidType { context, ty } => {
                write!(f, "{}: invalid type {}", context, ty)
            }
            CodegenError::NotFound { kind, name } => {
                write!(f, "{} not found: {}", kind, name)
            }
            CodegenError::Internal { message, context } => {
                write!(f, "internal error: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            CodegenError::Module { message } => {
                write!(f, "module error: {}", message)
            }
        }
    }
}

impl std::error::Error for CodegenError {}

impl From<cranelift_module::ModuleError> for CodegenError {
    fn from(err: cranelift_module::ModuleError) -> Self {
        CodegenError::Module {
            message: err.to_string(),
        }
    }
}

/// Result type alias for codegen operations.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// A user-facing problem found during construction. Recorded and skipped so
/// that further errors in the same program still surface.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Link name of the enclosing function.
    pub function: String,
    pub pos: Pos,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in {}, pos {})", self.message, self.function, self.pos.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_type_display() {
        let err = CodegenError::invalid_type("interface boxing", "struct{...}");
        assert_eq!(err.to_string(), "interface boxing: invalid type struct{...}");
    }

    #[test]
    fn internal_with_context_display() {
        let err = CodegenError::internal_with_context("malformed tuple access", "index 2");
        assert_eq!(
            err.to_string(),
            "internal error: malformed tuple access (index 2)"
        );
    }

    #[test]
    fn not_found_display() {
        let err = CodegenError::not_found("interface method", "Print");
        assert_eq!(err.to_string(), "interface method not found: Print");
    }
}
