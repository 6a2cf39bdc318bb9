//! Ember code generation: Cranelift IR construction for interface values,
//! first-class function values, and deferred calls.
//!
//! Construction walks the typed SSA form produced by the front-end and
//! emits straight-line IR plus placeholder globals (typecodes, method sets,
//! signature identities) that a later whole-program lowering pass resolves
//! into closed-world dispatch. Finalization then emits the bodies of the
//! invocation wrappers accumulated along the way.

mod context;
mod defer;
mod func_value;
mod interface;
mod values;
mod wrappers;

pub mod config;
pub mod errors;
pub mod jit;
pub mod object;
pub mod runtime;
pub mod type_code;

pub use config::{Config, FuncValueMode};
pub use context::Compiler;
pub use errors::{CodegenError, CodegenResult, Diagnostic};
pub use jit::JitContext;
pub use object::object_module;
pub use runtime::RuntimeFn;
pub use type_code::{method_signature, type_code_name};
pub use values::CompiledValue;
