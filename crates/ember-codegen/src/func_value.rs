// Function values and closures.
//
// A function value is a {context, scalar} record. In doubleword mode the
// scalar is the raw function address and calls are direct; in
// signature-tagged mode it is the address of a constant {function address,
// signature placeholder} record and calls go through the `get_func_ptr`
// helper, which the lowering pass turns into a per-signature switch.
//
// Every declared function, wrappers included, uses the extended calling
// convention: expanded parameter leaves followed by a context pointer and a
// parent-task handle. Dynamic dispatch never needs to know at the call site
// whether the callee closes over state or may suspend.

use cranelift::prelude::*;
use cranelift_module::{DataDescription, DataId, Linkage, Module};

use ember_ssa::{FunctionId, Signature as SrcSignature, Type as SrcType};

use crate::config::FuncValueMode;
use crate::context::{Compiler, Produced};
use crate::errors::{CodegenError, CodegenResult};
use crate::runtime::RuntimeFn;
use crate::values::{CompiledValue, LeafVec, PartVec, layout, pointer_pack, scalar_leaves};

impl<M: Module> Compiler<'_, M> {
    /// Lower a source signature to the extended calling convention:
    /// receiver and parameter leaves, then the context pointer and the
    /// parent-task handle. Results use the native multi-return.
    pub(crate) fn raw_signature(&self, sig: &SrcSignature) -> cranelift::prelude::Signature {
        let mut cl_sig = self.module.make_signature();
        for ty in sig.recv.iter().chain(sig.params.iter()) {
            for leaf in scalar_leaves(ty, self.ptr_type) {
                cl_sig.params.push(AbiParam::new(leaf));
            }
        }
        cl_sig.params.push(AbiParam::new(self.ptr_type)); // context
        cl_sig.params.push(AbiParam::new(self.ptr_type)); // parent task handle
        for ty in &sig.results {
            for leaf in scalar_leaves(ty, self.ptr_type) {
                cl_sig.returns.push(AbiParam::new(leaf));
            }
        }
        cl_sig
    }

    /// As `raw_signature`, but the receiver is a single opaque pointer.
    /// This is the convention of interface calls and invocation wrappers.
    pub(crate) fn raw_signature_opaque_recv(
        &self,
        sig: &SrcSignature,
    ) -> cranelift::prelude::Signature {
        let mut cl_sig = self.module.make_signature();
        cl_sig.params.push(AbiParam::new(self.ptr_type)); // opaque receiver
        for ty in &sig.params {
            for leaf in scalar_leaves(ty, self.ptr_type) {
                cl_sig.params.push(AbiParam::new(leaf));
            }
        }
        cl_sig.params.push(AbiParam::new(self.ptr_type)); // context
        cl_sig.params.push(AbiParam::new(self.ptr_type)); // parent task handle
        for ty in &sig.results {
            for leaf in scalar_leaves(ty, self.ptr_type) {
                cl_sig.returns.push(AbiParam::new(leaf));
            }
        }
        cl_sig
    }

    /// Signature-identity global for function values, used by
    /// `get_func_ptr` and in `$withSignature` records.
    pub(crate) fn func_signature_global(&mut self, sig: &SrcSignature) -> CodegenResult<DataId> {
        let code = crate::type_code::type_code_name(&SrcType::func(sig.clone()))?;
        let name = format!("reflect/types.type:{}", code);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(id);
        }
        let id = self.module.declare_data(&name, Linkage::Local, false, false)?;
        let mut data = DataDescription::new();
        data.define(vec![0u8].into_boxed_slice());
        self.module.define_data(id, &data)?;
        self.data_ids.insert(name, id);
        Ok(id)
    }

    /// Build a function value from a function and a context pointer.
    pub(crate) fn create_func_value(
        &mut self,
        builder: &mut FunctionBuilder,
        func: FunctionId,
        context: Value,
        sig: &SrcSignature,
    ) -> CodegenResult<CompiledValue> {
        let scalar = match self.config.func_values {
            FuncValueMode::Doubleword => {
                let func_ref = self.func_ref(builder, func)?;
                builder.ins().func_addr(self.ptr_type, func_ref)
            }
            FuncValueMode::SignatureTagged => {
                let record = self.with_signature_global(func, sig)?;
                self.data_addr(builder, record)
            }
        };
        Ok(CompiledValue::new(
            PartVec::from_slice(&[context, scalar]),
            SrcType::func(SrcSignature::new(sig.params.clone(), sig.results.clone())),
        ))
    }

    /// The interned `{function address, signature placeholder}` record
    /// backing signature-tagged function values.
    fn with_signature_global(
        &mut self,
        func: FunctionId,
        sig: &SrcSignature,
    ) -> CodegenResult<DataId> {
        let name = format!("{}$withSignature", self.program.function(func).name);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(id);
        }
        let signature_id = self.func_signature_global(sig)?;
        let func_id = self.declared_func(func)?;

        let id = self.module.declare_data(&name, Linkage::Local, false, false)?;
        let word = self.ptr_type.bytes();
        let mut data = DataDescription::new();
        data.define_zeroinit((2 * word) as usize);
        data.set_align(word as u64);
        let func_ref = self.module.declare_func_in_data(func_id, &mut data);
        data.write_function_addr(0, func_ref);
        let signature_gv = self.module.declare_data_in_data(signature_id, &mut data);
        data.write_data_addr(word, signature_gv, 0);
        self.module.define_data(id, &data)?;
        tracing::debug!(name = %name, "emitted signature-tagged function record");
        self.data_ids.insert(name, id);
        Ok(id)
    }

    /// Recover `(context, callable address)` from a function value. Cheap
    /// in doubleword mode; one runtime call in signature-tagged mode.
    pub(crate) fn decode_func_value(
        &mut self,
        builder: &mut FunctionBuilder,
        fv: &CompiledValue,
    ) -> CodegenResult<(Value, Value)> {
        let (context, scalar) = fv.pair()?;
        let fn_ptr = match self.config.func_values {
            FuncValueMode::Doubleword => scalar,
            FuncValueMode::SignatureTagged => {
                let sig = match fv.ty.underlying() {
                    SrcType::Func(sig) => sig.clone(),
                    _ => {
                        return Err(CodegenError::internal(
                            "function value with non-function type",
                        ));
                    }
                };
                let signature_id = self.func_signature_global(&sig)?;
                let signature_addr = self.data_addr(builder, signature_id);
                self.call_runtime(builder, RuntimeFn::GetFuncPtr, &[scalar, signature_addr])?
            }
        };
        Ok((context, fn_ptr))
    }

    /// Call through a function value.
    pub(crate) fn call_func_value(
        &mut self,
        builder: &mut FunctionBuilder,
        fv: &CompiledValue,
        args: &[CompiledValue],
    ) -> CodegenResult<Produced> {
        let sig = match fv.ty.underlying() {
            SrcType::Func(sig) => sig.clone(),
            _ => return Err(CodegenError::internal("call through a non-function value")),
        };
        let (context, fn_ptr) = self.decode_func_value(builder, fv)?;

        let cl_sig = self.raw_signature(&sig);
        let sig_ref = builder.import_signature(cl_sig);

        let mut flat: Vec<Value> = Vec::new();
        for arg in args {
            flat.extend(arg.parts.iter().copied());
        }
        flat.push(context);
        let undef = builder.ins().iconst(self.ptr_type, 0);
        flat.push(undef); // parent task handle

        let inst = builder.ins().call_indirect(sig_ref, fn_ptr, &flat);
        let values = builder.inst_results(inst).to_vec();
        Ok(self.group_results(values, &sig.results))
    }

    /// Build a function value binding the given captured variables.
    #[tracing::instrument(skip(self, builder, bindings), fields(bindings = bindings.len()))]
    pub(crate) fn make_closure(
        &mut self,
        builder: &mut FunctionBuilder,
        func: FunctionId,
        bindings: &[CompiledValue],
    ) -> CodegenResult<CompiledValue> {
        if bindings.is_empty() {
            return Err(CodegenError::internal("closure without bound variables"));
        }

        // Pack the bound variables into a single context record.
        let mut leaves = LeafVec::new();
        let mut parts = PartVec::new();
        for binding in bindings {
            leaves.extend(scalar_leaves(&binding.ty, self.ptr_type));
            parts.extend(binding.parts.iter().copied());
        }
        let gc_alloc = if layout(&leaves).1 > self.ptr_type.bytes() {
            Some(self.runtime_ref(builder, RuntimeFn::GcAlloc)?)
        } else {
            None
        };
        let context = pointer_pack(builder, &parts, &leaves, self.ptr_type, gc_alloc)?;

        let sig = self.program.function(func).sig.clone();
        self.create_func_value(builder, func, context, &sig)
    }
}
