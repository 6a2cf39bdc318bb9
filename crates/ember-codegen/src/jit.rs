// In-process execution of constructed IR.
//
// The production path hands the module to an ahead-of-time backend; this
// harness exists for drivers and tests that want to run the constructed
// code directly. Runtime symbols (the collector entry points at minimum)
// must be registered up front, since the module's runtime intrinsics are
// declared with import linkage.

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Module};

use crate::errors::CodegenResult;

/// A JIT module over the native ISA with caller-provided runtime symbols.
pub struct JitContext {
    pub module: JITModule,
}

impl JitContext {
    pub fn new(symbols: &[(&str, *const u8)]) -> Self {
        let mut flag_builder = settings::builder();
        flag_builder.set("use_colocated_libcalls", "false").unwrap();
        flag_builder.set("is_pic", "false").unwrap();
        // Multi-result source functions lower to multi-return signatures.
        flag_builder
            .set("enable_multi_ret_implicit_sret", "true")
            .unwrap();

        let isa_builder = cranelift_native::builder().unwrap_or_else(|msg| {
            panic!("native ISA not available: {}", msg);
        });
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .unwrap();

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for &(name, ptr) in symbols {
            builder.symbol(name, ptr);
        }
        JitContext {
            module: JITModule::new(builder),
        }
    }

    /// Resolve relocations and make compiled code callable.
    pub fn finalize(&mut self) -> CodegenResult<()> {
        self.module.finalize_definitions()?;
        Ok(())
    }

    /// Address of a finalized function.
    pub fn function_ptr(&self, id: FuncId) -> *const u8 {
        self.module.get_finalized_function(id)
    }

    pub fn pointer_type(&self) -> Type {
        self.module.target_config().pointer_type()
    }
}
