//! Typed SSA program form consumed by the Ember code generator.
//!
//! The front-end (parsing, type checking, SSA construction) lives upstream;
//! this crate defines the shape of what it hands over: a source-type model
//! and a small instruction set with resolved types. Values are instruction
//! indices, in conventional SSA style.

pub mod ssa;
pub mod types;

pub use ssa::{BinOp, Callee, CallSite, Const, Function, FunctionId, Instr, Pos, Program, ValueId};
pub use types::{BasicKind, Field, Method, MethodSig, NamedType, Signature, Type};
