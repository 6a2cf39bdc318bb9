// Invocation wrappers.
//
// Interface calls pass the receiver as one opaque pointer-sized slot, but a
// concrete method may expect an unboxed (possibly multi-scalar) receiver. A
// thin `$invoke` adapter bridges the two: it unpacks the opaque slot into
// the receiver's native leaves and forwards everything else unchanged.
// Methods whose receiver is a single pointer need no adapter; the method-
// set entry holds the raw function address.
//
// Wrappers are declared during construction but their bodies are emitted in
// the finalization phase, after every function body exists.

use cranelift::prelude::*;
use cranelift_module::{FuncId, Linkage, Module};

use ember_ssa::{FunctionId, Type as SrcType};

use crate::context::Compiler;
use crate::errors::{CodegenError, CodegenResult};
use crate::values::{pointer_unpack, scalar_leaves};

/// A wrapper declared during construction whose body is still owed.
pub(crate) struct PendingWrapper {
    pub(crate) func: FunctionId,
    pub(crate) wrapper: FuncId,
    pub(crate) recv: SrcType,
}

impl<M: Module> Compiler<'_, M> {
    /// Get or declare the invocation wrapper for a method, or the method
    /// itself when no adaptation is needed.
    pub(crate) fn interface_invoke_wrapper(&mut self, func: FunctionId) -> CodegenResult<FuncId> {
        let method = self.program.function(func);
        let recv = method.sig.recv.clone().ok_or_else(|| {
            CodegenError::internal_with_context(
                "method-set entry without a receiver",
                method.name.clone(),
            )
        })?;
        let name = format!("{}$invoke", method.name);
        if let Some(&id) = self.wrapper_funcs.get(&name) {
            return Ok(id);
        }

        let leaves = scalar_leaves(&recv, self.ptr_type);
        if leaves.len() == 1 && recv.is_pointer() {
            // A pointer receiver already has the opaque-slot shape.
            return self.declared_func(func);
        }

        let sig = self.raw_signature_opaque_recv(&method.sig);
        let wrapper = self.module.declare_function(&name, Linkage::Local, &sig)?;
        tracing::debug!(name = %name, "declared invocation wrapper");
        self.wrapper_funcs.insert(name, wrapper);
        self.pending_wrappers.push(PendingWrapper {
            func,
            wrapper,
            recv,
        });
        Ok(wrapper)
    }

    /// Finalization phase: emit the body of every wrapper declared during
    /// construction.
    pub fn finalize(&mut self) -> CodegenResult<()> {
        let pending = std::mem::take(&mut self.pending_wrappers);
        for wrapper in &pending {
            self.create_invoke_wrapper(wrapper)?;
        }
        tracing::debug!(wrappers = pending.len(), "finalized invocation wrappers");
        Ok(())
    }

    fn create_invoke_wrapper(&mut self, pending: &PendingWrapper) -> CodegenResult<()> {
        let method = self.program.function(pending.func);
        let method_sig = method.sig.clone();
        let wrapper_name = format!("{}$invoke", method.name);

        let mut mctx = self.module.make_context();
        mctx.func.signature = self.raw_signature_opaque_recv(&method_sig);
        let mut builder_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut mctx.func, &mut builder_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);

            let params = builder.block_params(entry).to_vec();
            let recv_leaves = scalar_leaves(&pending.recv, self.ptr_type);
            let recv_parts = pointer_unpack(&mut builder, params[0], &recv_leaves, self.ptr_type);

            // Receiver leaves first, then every remaining parameter
            // (arguments, context, task handle) forwarded verbatim.
            let mut flat: Vec<Value> = recv_parts.to_vec();
            flat.extend(params[1..].iter().copied());

            let func_ref = self.func_ref(&mut builder, pending.func)?;
            let inst = builder.ins().call(func_ref, &flat);
            let results = builder.inst_results(inst).to_vec();
            builder.ins().return_(&results);
            builder.finalize();
        }

        if self.config.dump_ir {
            let ir = mctx.func.display().to_string();
            self.record_ir(wrapper_name, ir);
        }
        self.module.define_function(pending.wrapper, &mut mctx)?;
        self.module.clear_context(&mut mctx);
        Ok(())
    }
}
