// Ahead-of-time module construction for cross targets.

use cranelift_codegen::settings::{self, Configurable};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::errors::{CodegenError, CodegenResult};

/// Build an object-emitting module for the given target triple.
pub fn object_module(triple: &str, name: &str) -> CodegenResult<ObjectModule> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("is_pic", "true")
        .map_err(|e| CodegenError::Module {
            message: e.to_string(),
        })?;
    flag_builder
        .set("enable_multi_ret_implicit_sret", "true")
        .map_err(|e| CodegenError::Module {
            message: e.to_string(),
        })?;

    let isa_builder =
        cranelift_codegen::isa::lookup_by_name(triple).map_err(|e| CodegenError::Module {
            message: format!("unsupported target {}: {}", triple, e),
        })?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| CodegenError::Module {
            message: e.to_string(),
        })?;

    let builder = ObjectBuilder::new(isa, name, cranelift_module::default_libcall_names())
        .map_err(|e| CodegenError::Module {
            message: e.to_string(),
        })?;
    Ok(ObjectModule::new(builder))
}
