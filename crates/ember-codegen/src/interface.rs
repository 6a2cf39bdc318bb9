// Interface values: boxing, type assertions, and dynamic dispatch.
//
// An interface value is a {typecode, value} pair. The typecode is the
// address of the concrete type's descriptor global; the lowering pass
// rewrites every use of these placeholders into dense integer constants
// once the closed world is known. Nothing here decides type identity
// inline, even when an assertion is locally obvious: the lowering pass
// depends on seeing every decision point as an intrinsic call.

use cranelift::prelude::*;
use cranelift_codegen::ir::BlockArg;
use cranelift_module::{DataDescription, DataId, Linkage, Module};

use ember_ssa::{MethodSig, Type as SrcType};

use crate::context::{Compiler, Frame, Produced};
use crate::errors::{CodegenError, CodegenResult};
use crate::runtime::RuntimeFn;
use crate::type_code::{method_signature, type_code_name};
use crate::values::{
    CompiledValue, PartVec, pointer_pack, pointer_unpack, scalar_leaves, type_size, zero_value,
};

impl<M: Module> Compiler<'_, M> {
    /// Placeholder global whose address stands in for the typecode of `ty`
    /// until the lowering pass assigns real numbers.
    pub(crate) fn type_code_global(&mut self, ty: &SrcType) -> CodegenResult<DataId> {
        let name = format!("type:{}", type_code_name(ty)?);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(id);
        }
        let id = self.module.declare_data(&name, Linkage::Import, false, false)?;
        self.data_ids.insert(name, id);
        Ok(id)
    }

    /// Placeholder global identifying a method signature. Interned by
    /// signature identity: two methods with the same name and parameter and
    /// result types share one placeholder.
    pub(crate) fn method_signature_global(&mut self, method: &MethodSig) -> CodegenResult<DataId> {
        let name = format!("func {}", method_signature(method)?);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(id);
        }
        let id = self.module.declare_data(&name, Linkage::Import, false, false)?;
        self.data_ids.insert(name, id);
        Ok(id)
    }

    /// Method-set table of a concrete type: one {signature, wrapper} entry
    /// per method in declaration order. Types without methods yield no
    /// global at all; boxing stores a null method-set pointer instead.
    pub(crate) fn type_method_set(&mut self, ty: &SrcType) -> CodegenResult<Option<DataId>> {
        let name = format!("{}$methodset", type_code_name(ty)?);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(Some(id));
        }
        let methods = ty.methods();
        if methods.is_empty() {
            return Ok(None);
        }

        let id = self.module.declare_data(&name, Linkage::Local, false, false)?;
        let word = self.ptr_type.bytes();
        let mut data = DataDescription::new();
        data.define_zeroinit((2 * word * methods.len() as u32) as usize);
        data.set_align(word as u64);

        for (index, method) in methods.iter().enumerate() {
            let method_sig = MethodSig {
                name: method.name.clone(),
                sig: self.program.function(method.func).sig.clone(),
            };
            let signature_id = self.method_signature_global(&method_sig)?;
            let wrapper = self.interface_invoke_wrapper(method.func)?;

            let offset = 2 * word * index as u32;
            let signature_gv = self.module.declare_data_in_data(signature_id, &mut data);
            data.write_data_addr(offset, signature_gv, 0);
            let wrapper_ref = self.module.declare_func_in_data(wrapper, &mut data);
            data.write_function_addr(offset + word, wrapper_ref);
        }

        self.module.define_data(id, &data)?;
        tracing::debug!(name = %name, methods = methods.len(), "emitted method set");
        self.data_ids.insert(name, id);
        Ok(Some(id))
    }

    /// Shape descriptor of an interface type: its method signature
    /// placeholders in interface declaration order. Consumed by the
    /// `interface_implements` lowering.
    pub(crate) fn interface_shape(&mut self, ty: &SrcType) -> CodegenResult<DataId> {
        let name = format!("{}$interface", type_code_name(ty)?);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(id);
        }
        let methods = ty
            .interface_methods()
            .ok_or_else(|| CodegenError::internal("shape descriptor of a non-interface type"))?
            .to_vec();

        let id = self.module.declare_data(&name, Linkage::Local, false, false)?;
        let word = self.ptr_type.bytes();
        let mut data = DataDescription::new();
        data.define_zeroinit(((word * methods.len() as u32) as usize).max(1));
        data.set_align(word as u64);
        for (index, method) in methods.iter().enumerate() {
            let signature_id = self.method_signature_global(method)?;
            let signature_gv = self.module.declare_data_in_data(signature_id, &mut data);
            data.write_data_addr(word * index as u32, signature_gv, 0);
        }
        self.module.define_data(id, &data)?;
        tracing::debug!(name = %name, methods = methods.len(), "emitted interface shape");
        self.data_ids.insert(name, id);
        Ok(id)
    }

    /// The concrete-type descriptor {typecode placeholder, method set}.
    /// Boxing uses this global's address as the typecode word, so a type
    /// boxed twice refers to the same descriptor.
    pub(crate) fn concrete_type_descriptor(&mut self, ty: &SrcType) -> CodegenResult<DataId> {
        let code_id = self.type_code_global(ty)?;
        let name = format!("typeInInterface:type:{}", type_code_name(ty)?);
        if let Some(&id) = self.data_ids.get(&name) {
            return Ok(id);
        }
        let method_set = self.type_method_set(ty)?;

        let id = self.module.declare_data(&name, Linkage::Local, false, false)?;
        let word = self.ptr_type.bytes();
        let mut data = DataDescription::new();
        data.define_zeroinit((2 * word) as usize);
        data.set_align(word as u64);
        let code_gv = self.module.declare_data_in_data(code_id, &mut data);
        data.write_data_addr(0, code_gv, 0);
        if let Some(method_set) = method_set {
            let set_gv = self.module.declare_data_in_data(method_set, &mut data);
            data.write_data_addr(word, set_gv, 0);
        }
        self.module.define_data(id, &data)?;
        self.data_ids.insert(name, id);
        Ok(id)
    }

    /// Box a concrete value into an interface value of type `itf_ty`.
    #[tracing::instrument(skip(self, builder, value, itf_ty))]
    pub(crate) fn make_interface(
        &mut self,
        builder: &mut FunctionBuilder,
        value: &CompiledValue,
        itf_ty: &SrcType,
    ) -> CodegenResult<CompiledValue> {
        let descriptor = self.concrete_type_descriptor(&value.ty)?;
        let typecode = self.data_addr(builder, descriptor);

        let gc_alloc = if type_size(&value.ty, self.ptr_type) > self.ptr_type.bytes() {
            Some(self.runtime_ref(builder, RuntimeFn::GcAlloc)?)
        } else {
            None
        };
        let leaves = scalar_leaves(&value.ty, self.ptr_type);
        let packed = pointer_pack(builder, &value.parts, &leaves, self.ptr_type, gc_alloc)?;

        Ok(CompiledValue::new(
            PartVec::from_slice(&[typecode, packed]),
            itf_ty.clone(),
        ))
    }

    /// Type assertion on an interface value.
    ///
    /// The check itself is an opaque runtime call either way: `type_assert`
    /// against a concrete type's placeholder, `interface_implements` against
    /// an interface's shape. The unboxing happens only on the success edge;
    /// the value slot holds an unrelated bit pattern when the check fails,
    /// and the failing path must produce the zero value.
    pub(crate) fn emit_type_assert(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
        itf: &CompiledValue,
        asserted: &SrcType,
        comma_ok: bool,
    ) -> CodegenResult<Produced> {
        let (typecode, value_slot) = itf.pair()?;

        let ok = if asserted.is_interface() {
            let shape = self.interface_shape(asserted)?;
            let shape_addr = self.data_addr(builder, shape);
            self.call_runtime(
                builder,
                RuntimeFn::InterfaceImplements,
                &[typecode, shape_addr],
            )?
        } else {
            let code = self.type_code_global(asserted)?;
            let placeholder = self.data_addr(builder, code);
            self.call_runtime(builder, RuntimeFn::TypeAssert, &[typecode, placeholder])?
        };

        let leaves = scalar_leaves(asserted, self.ptr_type);
        let ok_block = builder.create_block();
        let next_block = builder.create_block();
        for &leaf in &leaves {
            builder.append_block_param(next_block, leaf);
        }
        // The failing path substitutes the zero value of the asserted type.
        let zero = zero_value(builder, asserted, self.ptr_type);
        let zero_args: Vec<BlockArg> = zero.parts.iter().map(|&part| BlockArg::from(part)).collect();
        builder
            .ins()
            .brif(ok, ok_block, &[], next_block, &zero_args);

        builder.switch_to_block(ok_block);
        builder.seal_block(ok_block);
        let ok_parts: PartVec = if asserted.is_interface() {
            // Asserting to an interface keeps the original value; no
            // re-boxing happens.
            itf.parts.clone()
        } else {
            pointer_unpack(builder, value_slot, &leaves, self.ptr_type)
        };
        let ok_args: Vec<BlockArg> = ok_parts.iter().map(|&part| BlockArg::from(part)).collect();
        builder.ins().jump(next_block, &ok_args);

        builder.switch_to_block(next_block);
        builder.seal_block(next_block);
        frame.block = next_block;

        let parts: PartVec = builder.block_params(next_block).iter().copied().collect();
        let result = CompiledValue::new(parts, asserted.clone());

        if comma_ok {
            let flag = CompiledValue::new(
                PartVec::from_slice(&[ok]),
                SrcType::basic(ember_ssa::BasicKind::Bool),
            );
            Ok(Produced::Tuple(vec![result, flag]))
        } else {
            // Trap when the assertion failed.
            self.call_runtime_void(builder, RuntimeFn::InterfaceAssert, &[ok])?;
            Ok(Produced::Value(result))
        }
    }

    /// Resolve an interface method to a callable address through the
    /// `interface_method` intrinsic.
    pub(crate) fn invoke_fn_ptr(
        &mut self,
        builder: &mut FunctionBuilder,
        typecode: Value,
        itf_ty: &SrcType,
        method: &MethodSig,
    ) -> CodegenResult<Value> {
        let shape = self.interface_shape(itf_ty)?;
        let shape_addr = self.data_addr(builder, shape);
        let signature_id = self.method_signature_global(method)?;
        let signature_addr = self.data_addr(builder, signature_id);
        self.call_runtime(
            builder,
            RuntimeFn::InterfaceMethod,
            &[typecode, shape_addr, signature_addr],
        )
    }

    /// Dynamic method dispatch: `itf.M(args)`.
    pub(crate) fn emit_invoke(
        &mut self,
        builder: &mut FunctionBuilder,
        itf: &CompiledValue,
        method: &str,
        args: &[CompiledValue],
    ) -> CodegenResult<Produced> {
        let method_sig = itf
            .ty
            .interface_methods()
            .and_then(|methods| methods.iter().find(|m| m.name == method))
            .cloned()
            .ok_or_else(|| CodegenError::not_found("interface method", method))?;

        let (typecode, receiver) = itf.pair()?;
        let fn_ptr = self.invoke_fn_ptr(builder, typecode, &itf.ty, &method_sig)?;

        let sig = self.raw_signature_opaque_recv(&method_sig.sig);
        let sig_ref = builder.import_signature(sig);

        let mut flat: Vec<Value> = vec![receiver];
        for arg in args {
            flat.extend(arg.parts.iter().copied());
        }
        // An interface call never carries a context, but the extended
        // calling convention requires both trailing parameters.
        let undef = builder.ins().iconst(self.ptr_type, 0);
        flat.push(undef);
        flat.push(undef);

        let inst = builder.ins().call_indirect(sig_ref, fn_ptr, &flat);
        let values = builder.inst_results(inst).to_vec();
        Ok(self.group_results(values, &method_sig.sig.results))
    }
}
