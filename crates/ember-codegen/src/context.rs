// Compiler state and the SSA walk.
//
// One `Compiler` holds the module under construction together with every
// intern map keyed by global name; lazily created globals (typecode
// placeholders, method sets, signature placeholders, invocation wrappers)
// are appended on first request and returned as-is afterwards. Construction
// is strictly first-visit, first-emit.
//
// Methods are implemented across multiple files using split impl blocks:
// - interface.rs: boxing, type asserts, dynamic dispatch, method sets
// - func_value.rs: function values, closures, raw signatures
// - defer.rs: defer frames and the epilogue dispatcher
// - wrappers.rs: invocation wrappers

use cranelift::prelude::*;
use cranelift_codegen::ir::FuncRef;
use cranelift_module::{DataId, FuncId, Linkage, Module};
use rustc_hash::FxHashMap;

use ember_ssa::{
    BinOp, Callee, CallSite, Const, Function, FunctionId, Instr, Pos, Program, ValueId,
};

use crate::config::Config;
use crate::defer::DeferState;
use crate::errors::{CodegenError, CodegenResult, Diagnostic};
use crate::runtime::RuntimeFn;
use crate::values::{CompiledValue, PartVec, scalar_leaves};
use crate::wrappers::PendingWrapper;

/// What one instruction produced.
#[derive(Debug, Clone)]
pub(crate) enum Produced {
    Value(CompiledValue),
    Tuple(Vec<CompiledValue>),
    Void,
}

/// Per-function construction state.
pub(crate) struct Frame<'p> {
    pub(crate) func: &'p Function,
    /// Current insertion block. Operations that split control flow (type
    /// asserts) move this to their merge block so downstream instructions
    /// land with the right predecessors.
    pub(crate) block: Block,
    formals: Vec<CompiledValue>,
    /// The trailing context parameter of the extended calling convention.
    pub(crate) context_param: Value,
    values: Vec<Option<Produced>>,
    pub(crate) defer: Option<DeferState>,
    captures: Option<Vec<CompiledValue>>,
    returned: bool,
}

impl<'p> Frame<'p> {
    fn new(
        func: &'p Function,
        entry: Block,
        builder: &FunctionBuilder,
        ptr: Type,
    ) -> CodegenResult<Self> {
        let params = builder.block_params(entry);
        let mut formals = Vec::new();
        let mut cursor = 0usize;
        for ty in func.sig.recv.iter().chain(func.sig.params.iter()) {
            let leaves = scalar_leaves(ty, ptr);
            let parts: PartVec = params[cursor..cursor + leaves.len()].iter().copied().collect();
            cursor += leaves.len();
            formals.push(CompiledValue::new(parts, ty.clone()));
        }
        if params.len() != cursor + 2 {
            return Err(CodegenError::internal_with_context(
                "entry block parameter count mismatch",
                func.name.clone(),
            ));
        }
        let context_param = params[cursor];
        Ok(Frame {
            func,
            block: entry,
            formals,
            context_param,
            values: vec![None; func.body.len()],
            defer: None,
            captures: None,
            returned: false,
        })
    }

    fn set(&mut self, index: usize, produced: Produced) {
        self.values[index] = Some(produced);
    }

    pub(crate) fn value(&self, id: ValueId) -> CodegenResult<&CompiledValue> {
        match self.values.get(id.0 as usize).and_then(Option::as_ref) {
            Some(Produced::Value(value)) => Ok(value),
            Some(_) => Err(CodegenError::internal_with_context(
                "tuple used where a single value was expected",
                format!("v{}", id.0),
            )),
            None => Err(CodegenError::internal_with_context(
                "use of undefined SSA value",
                format!("v{}", id.0),
            )),
        }
    }

    fn element(&self, id: ValueId, index: usize) -> CodegenResult<CompiledValue> {
        match self.values.get(id.0 as usize).and_then(Option::as_ref) {
            Some(Produced::Tuple(elements)) => elements.get(index).cloned().ok_or_else(|| {
                CodegenError::internal_with_context(
                    "tuple index out of range",
                    format!("v{}.{}", id.0, index),
                )
            }),
            _ => Err(CodegenError::internal_with_context(
                "extract from a non-tuple value",
                format!("v{}", id.0),
            )),
        }
    }
}

/// IR construction over one Cranelift module.
pub struct Compiler<'a, M: Module> {
    pub(crate) module: &'a mut M,
    pub(crate) program: &'a Program,
    pub(crate) config: Config,
    pub(crate) ptr_type: Type,
    pub(crate) func_ids: FxHashMap<FunctionId, FuncId>,
    /// Named globals, the module's interned namespace.
    pub(crate) data_ids: FxHashMap<String, DataId>,
    /// Invocation wrappers by name; elided wrappers map to the real function.
    pub(crate) wrapper_funcs: FxHashMap<String, FuncId>,
    runtime_ids: FxHashMap<RuntimeFn, FuncId>,
    pub(crate) pending_wrappers: Vec<PendingWrapper>,
    diagnostics: Vec<Diagnostic>,
    func_irs: FxHashMap<String, String>,
}

impl<'a, M: Module> Compiler<'a, M> {
    /// Set up a compiler over `module` and declare every program function
    /// with the extended calling convention.
    pub fn new(module: &'a mut M, program: &'a Program, config: Config) -> CodegenResult<Self> {
        let ptr_type = module.target_config().pointer_type();
        let mut compiler = Compiler {
            module,
            program,
            config,
            ptr_type,
            func_ids: FxHashMap::default(),
            data_ids: FxHashMap::default(),
            wrapper_funcs: FxHashMap::default(),
            runtime_ids: FxHashMap::default(),
            pending_wrappers: Vec::new(),
            diagnostics: Vec::new(),
            func_irs: FxHashMap::default(),
        };
        for (index, func) in program.functions.iter().enumerate() {
            let id = FunctionId(index as u32);
            let sig = compiler.raw_signature(&func.sig);
            let linkage = if func.is_external() {
                Linkage::Import
            } else {
                Linkage::Export
            };
            let func_id = compiler.module.declare_function(&func.name, linkage, &sig)?;
            compiler.func_ids.insert(id, func_id);
        }
        tracing::debug!(functions = program.functions.len(), "declared program functions");
        Ok(compiler)
    }

    /// Construction phase over the whole program, then finalization.
    pub fn compile(&mut self) -> CodegenResult<()> {
        for index in 0..self.program.functions.len() {
            let id = FunctionId(index as u32);
            if !self.program.function(id).is_external() {
                self.compile_function(id)?;
            }
        }
        self.finalize()
    }

    /// Emit the body of one function.
    #[tracing::instrument(skip(self), fields(function = %self.program.function(id).name))]
    pub fn compile_function(&mut self, id: FunctionId) -> CodegenResult<FuncId> {
        let func = self.program.function(id);
        if func.is_external() {
            return Err(CodegenError::internal_with_context(
                "cannot compile external function",
                func.name.clone(),
            ));
        }
        let func_id = self.declared_func(id)?;

        let mut mctx = self.module.make_context();
        mctx.func.signature = self.raw_signature(&func.sig);
        let mut builder_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut mctx.func, &mut builder_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);

            let mut frame = Frame::new(func, entry, &builder, self.ptr_type)?;
            for (index, instr) in func.body.iter().enumerate() {
                self.visit_instr(&mut builder, &mut frame, index, instr)?;
            }
            if !frame.returned {
                return Err(CodegenError::internal_with_context(
                    "function body missing return",
                    func.name.clone(),
                ));
            }
            builder.finalize();
        }

        if self.config.dump_ir {
            self.record_ir(func.name.clone(), mctx.func.display().to_string());
        }
        self.module.define_function(func_id, &mut mctx)?;
        self.module.clear_context(&mut mctx);
        Ok(func_id)
    }

    fn visit_instr(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
        index: usize,
        instr: &Instr,
    ) -> CodegenResult<()> {
        let produced = match instr {
            Instr::Param { index: formal } => Produced::Value(
                frame.formals.get(*formal).cloned().ok_or_else(|| {
                    CodegenError::internal_with_context(
                        "parameter index out of range",
                        format!("{} in {}", formal, frame.func.name),
                    )
                })?,
            ),
            Instr::Const(constant) => Produced::Value(self.emit_const(builder, constant)),
            Instr::BinOp { op, lhs, rhs } => {
                let lhs = frame.value(*lhs)?.clone();
                let rhs = frame.value(*rhs)?.clone();
                Produced::Value(self.emit_binop(builder, *op, &lhs, &rhs)?)
            }
            Instr::MakeInterface { value, ty } => {
                let value = frame.value(*value)?.clone();
                Produced::Value(self.make_interface(builder, &value, ty)?)
            }
            Instr::FuncConst { func } => {
                // No captures: the context slot stays undefined.
                let context = builder.ins().iconst(self.ptr_type, 0);
                let sig = self.program.function(*func).sig.clone();
                Produced::Value(self.create_func_value(builder, *func, context, &sig)?)
            }
            Instr::TypeAssert {
                value,
                asserted,
                comma_ok,
            } => {
                let itf = frame.value(*value)?.clone();
                self.emit_type_assert(builder, frame, &itf, asserted, *comma_ok)?
            }
            Instr::Extract { tuple, index: at } => Produced::Value(frame.element(*tuple, *at)?),
            Instr::Call { call } => self.emit_call(builder, frame, call)?,
            Instr::MakeClosure { func, bindings } => {
                let bound: Vec<CompiledValue> = bindings
                    .iter()
                    .map(|&id| frame.value(id).cloned())
                    .collect::<CodegenResult<_>>()?;
                Produced::Value(self.make_closure(builder, *func, &bound)?)
            }
            Instr::Capture { index: capture } => {
                Produced::Value(self.capture_value(builder, frame, *capture)?)
            }
            Instr::FuncScalar { value } => {
                let fv = frame.value(*value)?;
                let (_, scalar) = fv.pair()?;
                Produced::Value(CompiledValue::new(
                    PartVec::from_slice(&[scalar]),
                    ember_ssa::Type::basic(ember_ssa::BasicKind::Uintptr),
                ))
            }
            Instr::FuncContext { value } => {
                let fv = frame.value(*value)?;
                let (context, _) = fv.pair()?;
                Produced::Value(CompiledValue::new(
                    PartVec::from_slice(&[context]),
                    ember_ssa::Type::basic(ember_ssa::BasicKind::UnsafePointer),
                ))
            }
            Instr::Defer { call, pos } => {
                self.emit_defer(builder, frame, call, *pos)?;
                Produced::Void
            }
            Instr::Return { values } => {
                self.emit_return(builder, frame, values)?;
                Produced::Void
            }
        };
        frame.set(index, produced);
        Ok(())
    }

    fn emit_const(&mut self, builder: &mut FunctionBuilder, constant: &Const) -> CompiledValue {
        let ty = constant.ty();
        let leaf = scalar_leaves(&ty, self.ptr_type)[0];
        let value = match constant {
            Const::Int(_, v) => builder.ins().iconst(leaf, *v),
            Const::Float(_, v) => {
                if leaf == types::F32 {
                    builder.ins().f32const(*v as f32)
                } else {
                    builder.ins().f64const(*v)
                }
            }
            Const::Bool(v) => builder.ins().iconst(types::I8, i64::from(*v)),
        };
        CompiledValue::new(PartVec::from_slice(&[value]), ty)
    }

    fn emit_binop(
        &mut self,
        builder: &mut FunctionBuilder,
        op: BinOp,
        lhs: &CompiledValue,
        rhs: &CompiledValue,
    ) -> CodegenResult<CompiledValue> {
        let l = lhs.single()?;
        let r = rhs.single()?;
        let is_float = builder.func.dfg.value_type(l).is_float();
        let value = match (op, is_float) {
            (BinOp::Add, false) => builder.ins().iadd(l, r),
            (BinOp::Sub, false) => builder.ins().isub(l, r),
            (BinOp::Mul, false) => builder.ins().imul(l, r),
            (BinOp::Add, true) => builder.ins().fadd(l, r),
            (BinOp::Sub, true) => builder.ins().fsub(l, r),
            (BinOp::Mul, true) => builder.ins().fmul(l, r),
        };
        Ok(CompiledValue::new(
            PartVec::from_slice(&[value]),
            lhs.ty.clone(),
        ))
    }

    fn emit_call(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
        call: &CallSite,
    ) -> CodegenResult<Produced> {
        let args: Vec<CompiledValue> = call
            .args
            .iter()
            .map(|&id| frame.value(id).cloned())
            .collect::<CodegenResult<_>>()?;
        match &call.callee {
            Callee::Function(id) => {
                let callee = self.program.function(*id);
                let results = callee.sig.results.clone();
                let func_ref = self.func_ref(builder, *id)?;
                let mut flat: Vec<Value> = Vec::new();
                for arg in &args {
                    flat.extend(arg.parts.iter().copied());
                }
                // A direct call never carries a context, but the extended
                // calling convention requires the parameter anyway.
                let undef = builder.ins().iconst(self.ptr_type, 0);
                flat.push(undef);
                flat.push(undef);
                let inst = builder.ins().call(func_ref, &flat);
                let values = builder.inst_results(inst).to_vec();
                Ok(self.group_results(values, &results))
            }
            Callee::Value(id) => {
                let fv = frame.value(*id)?.clone();
                self.call_func_value(builder, &fv, &args)
            }
            Callee::Invoke { value, method } => {
                let itf = frame.value(*value)?.clone();
                self.emit_invoke(builder, &itf, method, &args)
            }
        }
    }

    fn emit_return(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
        values: &[ValueId],
    ) -> CodegenResult<()> {
        let results: Vec<CompiledValue> = values
            .iter()
            .map(|&id| frame.value(id).cloned())
            .collect::<CodegenResult<_>>()?;
        debug_assert_eq!(builder.current_block(), Some(frame.block));
        if frame.defer.is_some() {
            self.emit_run_defers(builder, frame)?;
        }
        let mut flat: Vec<Value> = Vec::new();
        for result in &results {
            flat.extend(result.parts.iter().copied());
        }
        builder.ins().return_(&flat);
        frame.returned = true;
        Ok(())
    }

    /// Regroup flat call results into per-result values.
    pub(crate) fn group_results(
        &self,
        values: Vec<Value>,
        results: &[ember_ssa::Type],
    ) -> Produced {
        match results {
            [] => Produced::Void,
            [ty] => Produced::Value(CompiledValue::new(values.into_iter().collect(), ty.clone())),
            _ => {
                let mut grouped = Vec::with_capacity(results.len());
                let mut cursor = 0usize;
                for ty in results {
                    let count = scalar_leaves(ty, self.ptr_type).len();
                    let parts: PartVec = values[cursor..cursor + count].iter().copied().collect();
                    cursor += count;
                    grouped.push(CompiledValue::new(parts, ty.clone()));
                }
                Produced::Tuple(grouped)
            }
        }
    }

    fn capture_value(
        &mut self,
        builder: &mut FunctionBuilder,
        frame: &mut Frame,
        index: usize,
    ) -> CodegenResult<CompiledValue> {
        if frame.func.captures.is_empty() {
            return Err(CodegenError::internal_with_context(
                "capture access in a function without captures",
                frame.func.name.clone(),
            ));
        }
        if frame.captures.is_none() {
            let mut all_leaves = crate::values::LeafVec::new();
            for ty in &frame.func.captures {
                all_leaves.extend(scalar_leaves(ty, self.ptr_type));
            }
            let parts = crate::values::pointer_unpack(
                builder,
                frame.context_param,
                &all_leaves,
                self.ptr_type,
            );
            let mut unpacked = Vec::with_capacity(frame.func.captures.len());
            let mut cursor = 0usize;
            for ty in &frame.func.captures {
                let count = scalar_leaves(ty, self.ptr_type).len();
                let leaf_parts: PartVec = parts[cursor..cursor + count].iter().copied().collect();
                cursor += count;
                unpacked.push(CompiledValue::new(leaf_parts, ty.clone()));
            }
            frame.captures = Some(unpacked);
        }
        frame
            .captures
            .as_ref()
            .and_then(|captures| captures.get(index))
            .cloned()
            .ok_or_else(|| {
                CodegenError::internal_with_context(
                    "capture index out of range",
                    format!("{} in {}", index, frame.func.name),
                )
            })
    }

    // ========== Module access helpers ==========

    pub(crate) fn declared_func(&self, id: FunctionId) -> CodegenResult<FuncId> {
        self.func_ids.get(&id).copied().ok_or_else(|| {
            CodegenError::internal_with_context("undeclared function", format!("f{}", id.0))
        })
    }

    pub(crate) fn func_ref(
        &mut self,
        builder: &mut FunctionBuilder,
        id: FunctionId,
    ) -> CodegenResult<FuncRef> {
        let func_id = self.declared_func(id)?;
        Ok(self.module.declare_func_in_func(func_id, builder.func))
    }

    /// Declare a runtime intrinsic on first use.
    pub(crate) fn runtime_func(&mut self, runtime: RuntimeFn) -> CodegenResult<FuncId> {
        if let Some(&id) = self.runtime_ids.get(&runtime) {
            return Ok(id);
        }
        let sig = runtime.signature(self.module, self.ptr_type);
        let id = self
            .module
            .declare_function(runtime.name(), Linkage::Import, &sig)?;
        self.runtime_ids.insert(runtime, id);
        Ok(id)
    }

    pub(crate) fn runtime_ref(
        &mut self,
        builder: &mut FunctionBuilder,
        runtime: RuntimeFn,
    ) -> CodegenResult<FuncRef> {
        let func_id = self.runtime_func(runtime)?;
        Ok(self.module.declare_func_in_func(func_id, builder.func))
    }

    /// Call a runtime intrinsic and return its single result.
    pub(crate) fn call_runtime(
        &mut self,
        builder: &mut FunctionBuilder,
        runtime: RuntimeFn,
        args: &[Value],
    ) -> CodegenResult<Value> {
        let func_ref = self.runtime_ref(builder, runtime)?;
        let inst = builder.ins().call(func_ref, args);
        let results = builder.inst_results(inst);
        results.first().copied().ok_or_else(|| {
            CodegenError::internal_with_context("runtime function returned no value", runtime.name())
        })
    }

    /// Call a runtime intrinsic that returns nothing.
    pub(crate) fn call_runtime_void(
        &mut self,
        builder: &mut FunctionBuilder,
        runtime: RuntimeFn,
        args: &[Value],
    ) -> CodegenResult<()> {
        let func_ref = self.runtime_ref(builder, runtime)?;
        builder.ins().call(func_ref, args);
        Ok(())
    }

    /// Address of a named data object.
    pub(crate) fn data_addr(&mut self, builder: &mut FunctionBuilder, data: DataId) -> Value {
        let gv = self.module.declare_data_in_func(data, builder.func);
        builder.ins().global_value(self.ptr_type, gv)
    }

    pub(crate) fn push_diagnostic(&mut self, function: &str, pos: Pos, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            function: function.to_string(),
            pos,
            message: message.into(),
        };
        tracing::debug!(%diagnostic, "recorded diagnostic");
        self.diagnostics.push(diagnostic);
    }

    // ========== Introspection ==========

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Whether a named global has been created in this module.
    pub fn has_global(&self, name: &str) -> bool {
        self.data_ids.contains_key(name)
    }

    /// Names of every global created so far, in no particular order.
    pub fn global_names(&self) -> impl Iterator<Item = &str> {
        self.data_ids.keys().map(String::as_str)
    }

    /// Whether an invocation wrapper with this name was generated (elided
    /// wrappers are not recorded as generated).
    pub fn has_wrapper(&self, name: &str) -> bool {
        self.wrapper_funcs.contains_key(name)
    }

    /// Textual IR of a compiled function, when `Config::dump_ir` is set.
    pub fn function_ir(&self, name: &str) -> Option<&str> {
        self.func_irs.get(name).map(String::as_str)
    }

    pub(crate) fn record_ir(&mut self, name: String, ir: String) {
        self.func_irs.insert(name, ir);
    }

    /// Module-level id of a declared program function.
    pub fn function_id(&self, id: FunctionId) -> Option<FuncId> {
        self.func_ids.get(&id).copied()
    }

    /// Whether a runtime intrinsic has been declared (i.e. injected at
    /// least once) in this module.
    pub fn runtime_declared(&self, runtime: RuntimeFn) -> bool {
        self.runtime_ids.contains_key(&runtime)
    }

    pub fn ptr_type(&self) -> Type {
        self.ptr_type
    }
}
