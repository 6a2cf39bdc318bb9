// Deferred calls.
//
// Each function that defers gets one stack slot holding the head of an
// intrusive singly-linked list of defer frames. A defer site stack-
// allocates a structurally unique frame {callback index, next, ...call
// state} and pushes it; the epilogue walks the list, switching on the
// callback index and reconstructing the exact frame type of each case to
// read the call state back out. Frames run in LIFO order and the chain is
// empty by the time control leaves the function.
//
// Static calls, interface invokes, and applied closure literals each intern
// their own callback index; their frame layouts differ (receiver third for
// invokes, context last for closures), so one universal frame type would
// not be able to read the arguments back.

use cranelift::frontend::Switch;
use cranelift::prelude::*;
use cranelift_codegen::ir::StackSlot;
use cranelift_module::Module;
use rustc_hash::FxHashMap;

use ember_ssa::{Callee, CallSite, FunctionId, Instr, MethodSig, Pos, Type as SrcType};

use crate::context::{Compiler, Frame};
use crate::errors::{CodegenError, CodegenResult};
use crate::runtime::RuntimeFn;
use crate::type_code::type_code_name;
use crate::values::{CompiledValue, LeafVec, PartVec, layout, scalar_leaves};

/// One deferred-call shape, dispatched by index in the epilogue.
pub(crate) enum DeferCallback {
    /// Direct call of a statically known function.
    Static { func: FunctionId },
    /// Interface method call. The typecode comes from the interface value
    /// of the first defer site that registered this method.
    Invoke {
        itf_ty: SrcType,
        method: MethodSig,
        typecode: Value,
    },
    /// Immediately applied function literal with free variables. The
    /// closure's context pointer rides in the frame.
    Closure { func: FunctionId },
}

/// Per-function defer state.
pub(crate) struct DeferState {
    /// Stack slot holding the head of the defer chain, null when empty.
    pub(crate) head_slot: StackSlot,
    static_indices: FxHashMap<FunctionId, usize>,
    invoke_indices: FxHashMap<String, usize>,
    closure_indices: FxHashMap<FunctionId, usize>,
    pub(crate) callbacks: Vec<DeferCallback>,
}

impl DeferState {
    fn new(head_slot: StackSlot) -> Self {
        DeferState {
            head_slot,
            static_indices: FxHashMap::default(),
            invoke_indices: FxHashMap::default(),
            closure_indices: FxHashMap::default(),
            callbacks: Vec::new(),
        }
    }
}

impl<M: Module> Compiler<'_, M> {
    /// Emit one defer site: classify the call, intern its callback index,
    /// and push a frame onto the chain.
    pub(crate) fn emit_defer(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
        call: &CallSite,
        pos: Pos,
    ) -> CodegenResult<()> {
        if frame.defer.is_none() {
            let word = self.ptr_type.bytes();
            let slot = builder.create_sized_stack_slot(StackSlotData::new(
                StackSlotKind::ExplicitSlot,
                word,
                word.trailing_zeros() as u8,
            ));
            let null = builder.ins().iconst(self.ptr_type, 0);
            builder.ins().stack_store(null, slot, 0);
            frame.defer = Some(DeferState::new(slot));
            tracing::debug!(function = %frame.func.name, "set up defer chain");
        }

        let args: Vec<CompiledValue> = call
            .args
            .iter()
            .map(|&id| frame.value(id).cloned())
            .collect::<CodegenResult<_>>()?;

        // The pointer to the previous frame; replaced below to link.
        let head_slot = frame.defer.as_ref().map(|s| s.head_slot).unwrap();
        let next = builder.ins().stack_load(self.ptr_type, head_slot, 0);

        // Frame fields beyond the common {callback, next} prefix.
        let mut leaves = LeafVec::new();
        let mut fields = PartVec::new();

        let index = match &call.callee {
            Callee::Function(func) => {
                let state = frame.defer.as_mut().unwrap();
                let index = match state.static_indices.get(func) {
                    Some(&index) => index,
                    None => {
                        let index = state.callbacks.len();
                        state.static_indices.insert(*func, index);
                        state.callbacks.push(DeferCallback::Static { func: *func });
                        index
                    }
                };
                for arg in &args {
                    leaves.extend(scalar_leaves(&arg.ty, self.ptr_type));
                    fields.extend(arg.parts.iter().copied());
                }
                index
            }
            Callee::Invoke { value, method } => {
                let itf = frame.value(*value)?.clone();
                let method_sig = itf
                    .ty
                    .interface_methods()
                    .and_then(|methods| methods.iter().find(|m| m.name == *method))
                    .cloned()
                    .ok_or_else(|| CodegenError::not_found("interface method", method.clone()))?;
                let (typecode, receiver) = itf.pair()?;
                let qualified = format!("({}).{}", type_code_name(&itf.ty)?, method);

                let state = frame.defer.as_mut().unwrap();
                let index = match state.invoke_indices.get(&qualified) {
                    Some(&index) => index,
                    None => {
                        let index = state.callbacks.len();
                        state.invoke_indices.insert(qualified, index);
                        state.callbacks.push(DeferCallback::Invoke {
                            itf_ty: itf.ty.clone(),
                            method: method_sig,
                            typecode,
                        });
                        index
                    }
                };
                leaves.push(self.ptr_type);
                fields.push(receiver);
                for arg in &args {
                    leaves.extend(scalar_leaves(&arg.ty, self.ptr_type));
                    fields.extend(arg.parts.iter().copied());
                }
                index
            }
            Callee::Value(value) => {
                // Only an immediately applied closure literal is a
                // recognized value-callee form here.
                let defining = frame.func.body.get(value.0 as usize);
                let Some(Instr::MakeClosure { func, .. }) = defining else {
                    self.push_diagnostic(
                        &frame.func.name,
                        pos,
                        "unsupported defer: call through a function value",
                    );
                    return Ok(());
                };
                let func = *func;
                let closure = frame.value(*value)?.clone();
                let (context, _) = closure.pair()?;

                let state = frame.defer.as_mut().unwrap();
                let index = match state.closure_indices.get(&func) {
                    Some(&index) => index,
                    None => {
                        let index = state.callbacks.len();
                        state.closure_indices.insert(func, index);
                        state.callbacks.push(DeferCallback::Closure { func });
                        index
                    }
                };
                for arg in &args {
                    leaves.extend(scalar_leaves(&arg.ty, self.ptr_type));
                    fields.extend(arg.parts.iter().copied());
                }
                leaves.push(self.ptr_type);
                fields.push(context);
                index
            }
        };
        let callback = builder.ins().iconst(self.ptr_type, index as i64);
        let mut all_leaves = LeafVec::new();
        all_leaves.push(self.ptr_type);
        all_leaves.push(self.ptr_type);
        all_leaves.extend(leaves);
        let mut all_fields = PartVec::new();
        all_fields.push(callback);
        all_fields.push(next);
        all_fields.extend(fields);

        // Materialize the frame in its own stack slot.
        let (offsets, size) = layout(&all_leaves);
        let word = self.ptr_type.bytes();
        let slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            word.trailing_zeros() as u8,
        ));
        for (&field, &offset) in all_fields.iter().zip(&offsets) {
            builder.ins().stack_store(field, slot, offset as i32);
        }
        let frame_addr = builder.ins().stack_addr(self.ptr_type, slot, 0);
        if self.config.track_stack_objects {
            self.call_runtime_void(builder, RuntimeFn::GcTrack, &[frame_addr])?;
        }

        // Push onto the chain.
        builder.ins().stack_store(frame_addr, head_slot, 0);
        Ok(())
    }

    /// Emit the epilogue dispatcher: walk the chain head-first, switch on
    /// the callback index, and invoke each pending call.
    #[tracing::instrument(skip(self, builder, frame), fields(function = %frame.func.name))]
    pub(crate) fn emit_run_defers(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
    ) -> CodegenResult<()> {
        let Some(state) = frame.defer.take() else {
            return Ok(());
        };
        if state.callbacks.is_empty() {
            // Every defer site in this function was rejected; the chain is
            // still null and there is nothing to dispatch.
            return Ok(());
        }
        let word = self.ptr_type.bytes();

        let loophead = builder.create_block();
        let loop_block = builder.create_block();
        let default_block = builder.create_block();
        let end_block = builder.create_block();
        builder.ins().jump(loophead, &[]);

        // loophead: for head != null {
        builder.switch_to_block(loophead);
        let head = builder.ins().stack_load(self.ptr_type, state.head_slot, 0);
        let is_empty = builder.ins().icmp_imm(IntCC::Equal, head, 0);
        builder
            .ins()
            .brif(is_empty, end_block, &[], loop_block, &[]);
        builder.seal_block(loop_block);

        // loop: pop the head, switch on its callback index.
        builder.switch_to_block(loop_block);
        let next = builder
            .ins()
            .load(self.ptr_type, MemFlags::new(), head, word as i32);
        builder.ins().stack_store(next, state.head_slot, 0);
        let callback = builder.ins().load(self.ptr_type, MemFlags::new(), head, 0);

        let case_blocks: Vec<Block> = state
            .callbacks
            .iter()
            .map(|_| builder.create_block())
            .collect();
        let mut switch = Switch::new();
        for (index, &block) in case_blocks.iter().enumerate() {
            switch.set_entry(index as u128, block);
        }
        switch.emit(builder, callback, default_block);

        // A frame with an index outside the table cannot exist.
        builder.switch_to_block(default_block);
        builder.seal_block(default_block);
        builder.ins().trap(TrapCode::unwrap_user(1));

        for (index, callback) in state.callbacks.iter().enumerate() {
            builder.switch_to_block(case_blocks[index]);
            builder.seal_block(case_blocks[index]);
            self.emit_defer_case(builder, callback, head)?;
            builder.ins().jump(loophead, &[]);
        }
        builder.seal_block(loophead);

        builder.switch_to_block(end_block);
        builder.seal_block(end_block);
        frame.block = end_block;
        tracing::debug!(callbacks = state.callbacks.len(), "emitted defer dispatcher");
        Ok(())
    }

    /// One dispatcher arm: rebuild the concrete frame layout of this
    /// callback, read the call state back out, and call.
    fn emit_defer_case(
        &mut self,
        builder: &mut FunctionBuilder,
        callback: &DeferCallback,
        head: Value,
    ) -> CodegenResult<()> {
        let undef = builder.ins().iconst(self.ptr_type, 0);
        match callback {
            DeferCallback::Static { func } => {
                let sig = self.program.function(*func).sig.clone();
                let mut leaves = LeafVec::new();
                leaves.push(self.ptr_type);
                leaves.push(self.ptr_type);
                for ty in sig.recv.iter().chain(sig.params.iter()) {
                    leaves.extend(scalar_leaves(ty, self.ptr_type));
                }
                let (offsets, _) = layout(&leaves);
                let mut flat: Vec<Value> = Vec::new();
                for (&leaf, &offset) in leaves.iter().zip(&offsets).skip(2) {
                    flat.push(builder.ins().load(leaf, MemFlags::new(), head, offset as i32));
                }
                flat.push(undef);
                flat.push(undef);
                let func_ref = self.func_ref(builder, *func)?;
                builder.ins().call(func_ref, &flat);
            }
            DeferCallback::Invoke {
                itf_ty,
                method,
                typecode,
            } => {
                let mut leaves = LeafVec::new();
                leaves.push(self.ptr_type);
                leaves.push(self.ptr_type);
                leaves.push(self.ptr_type); // receiver
                for ty in &method.sig.params {
                    leaves.extend(scalar_leaves(ty, self.ptr_type));
                }
                let (offsets, _) = layout(&leaves);
                let mut flat: Vec<Value> = Vec::new();
                for (&leaf, &offset) in leaves.iter().zip(&offsets).skip(2) {
                    flat.push(builder.ins().load(leaf, MemFlags::new(), head, offset as i32));
                }
                flat.push(undef);
                flat.push(undef);
                let fn_ptr = self.invoke_fn_ptr(builder, *typecode, itf_ty, method)?;
                let sig = self.raw_signature_opaque_recv(&method.sig);
                let sig_ref = builder.import_signature(sig);
                builder.ins().call_indirect(sig_ref, fn_ptr, &flat);
            }
            DeferCallback::Closure { func } => {
                let sig = self.program.function(*func).sig.clone();
                let mut leaves = LeafVec::new();
                leaves.push(self.ptr_type);
                leaves.push(self.ptr_type);
                for ty in &sig.params {
                    leaves.extend(scalar_leaves(ty, self.ptr_type));
                }
                leaves.push(self.ptr_type); // context
                let (offsets, _) = layout(&leaves);
                let mut flat: Vec<Value> = Vec::new();
                for (&leaf, &offset) in leaves.iter().zip(&offsets).skip(2) {
                    flat.push(builder.ins().load(leaf, MemFlags::new(), head, offset as i32));
                }
                flat.push(undef); // parent task handle
                let func_ref = self.func_ref(builder, *func)?;
                builder.ins().call(func_ref, &flat);
            }
        }
        Ok(())
    }
}
