// Value representation: exploded scalar leaves, natural layout, and
// pointer packing.
//
// Codegen carries every source value as its flattened scalar leaves: a
// struct is its fields' leaves in order, a slice is {ptr, len, cap}, a
// string is {ptr, len}, an interface value is {typecode, value}, a function
// value is {context, scalar}. The raw calling convention concatenates
// exactly these leaves, so a value crosses a call boundary without any
// repacking.

use cranelift::prelude::*;
use smallvec::SmallVec;

use ember_ssa::{BasicKind, Type as SrcType};

use crate::errors::{CodegenError, CodegenResult};

/// Scalar leaf types of one source value.
pub(crate) type LeafVec = SmallVec<[Type; 8]>;

/// Scalar leaf values of one source value.
pub(crate) type PartVec = SmallVec<[Value; 2]>;

/// A compiled source value: its scalar leaves plus the source type they
/// spell out.
#[derive(Debug, Clone)]
pub struct CompiledValue {
    pub parts: PartVec,
    pub ty: SrcType,
}

impl CompiledValue {
    pub fn new(parts: PartVec, ty: SrcType) -> Self {
        CompiledValue { parts, ty }
    }

    /// The single scalar of a one-leaf value.
    pub fn single(&self) -> CodegenResult<Value> {
        match self.parts.as_slice() {
            [value] => Ok(*value),
            parts => Err(CodegenError::internal_with_context(
                "expected single-scalar value",
                format!("got {} leaves", parts.len()),
            )),
        }
    }

    /// The two scalars of a two-leaf record (interface or function value).
    pub fn pair(&self) -> CodegenResult<(Value, Value)> {
        match self.parts.as_slice() {
            [first, second] => Ok((*first, *second)),
            parts => Err(CodegenError::internal_with_context(
                "expected two-field record value",
                format!("got {} leaves", parts.len()),
            )),
        }
    }
}

/// Expand a source type into its scalar leaf types.
pub(crate) fn scalar_leaves(ty: &SrcType, ptr: Type) -> LeafVec {
    let mut leaves = LeafVec::new();
    push_leaves(ty, ptr, &mut leaves);
    leaves
}

fn push_leaves(ty: &SrcType, ptr: Type, out: &mut LeafVec) {
    match ty {
        SrcType::Basic(kind) => match kind {
            BasicKind::Bool | BasicKind::Int8 | BasicKind::Uint8 => out.push(types::I8),
            BasicKind::Int16 | BasicKind::Uint16 => out.push(types::I16),
            BasicKind::Int32 | BasicKind::Uint32 => out.push(types::I32),
            BasicKind::Int64 | BasicKind::Uint64 => out.push(types::I64),
            BasicKind::Int | BasicKind::Uint | BasicKind::Uintptr | BasicKind::UnsafePointer => {
                out.push(ptr)
            }
            BasicKind::Float32 => out.push(types::F32),
            BasicKind::Float64 => out.push(types::F64),
            // {data, len}
            BasicKind::String => {
                out.push(ptr);
                out.push(ptr);
            }
        },
        SrcType::Pointer(_) | SrcType::Chan(_) | SrcType::Map(_, _) => out.push(ptr),
        // {data, len, cap}
        SrcType::Slice(_) => {
            out.push(ptr);
            out.push(ptr);
            out.push(ptr);
        }
        SrcType::Array(len, elem) => {
            for _ in 0..*len {
                push_leaves(elem, ptr, out);
            }
        }
        SrcType::Struct(fields) => {
            for field in fields {
                push_leaves(&field.ty, ptr, out);
            }
        }
        // {context, scalar}
        SrcType::Func(_) => {
            out.push(ptr);
            out.push(ptr);
        }
        // {typecode, value}
        SrcType::Interface(_) => {
            out.push(ptr);
            out.push(ptr);
        }
        SrcType::Named(named) => push_leaves(&named.underlying, ptr, out),
    }
}

/// Natural layout of a leaf sequence: byte offset of each leaf plus the
/// total (alignment-padded) size. Each leaf is aligned to its own size.
pub(crate) fn layout(leaves: &[Type]) -> (SmallVec<[u32; 8]>, u32) {
    let mut offsets = SmallVec::new();
    let mut offset = 0u32;
    let mut max_align = 1u32;
    for &leaf in leaves {
        let size = leaf.bytes();
        let align = size.max(1);
        max_align = max_align.max(align);
        offset = offset.next_multiple_of(align);
        offsets.push(offset);
        offset += size;
    }
    (offsets, offset.next_multiple_of(max_align))
}

/// Total in-memory size of a source value.
pub(crate) fn type_size(ty: &SrcType, ptr: Type) -> u32 {
    layout(&scalar_leaves(ty, ptr)).1
}

/// The zero value of one scalar leaf.
pub(crate) fn zero_leaf(builder: &mut FunctionBuilder, leaf: Type) -> Value {
    match leaf {
        types::F32 => builder.ins().f32const(0.0),
        types::F64 => builder.ins().f64const(0.0),
        _ => builder.ins().iconst(leaf, 0),
    }
}

/// The zero value of a whole source type, leaf by leaf.
pub(crate) fn zero_value(builder: &mut FunctionBuilder, ty: &SrcType, ptr: Type) -> CompiledValue {
    let parts = scalar_leaves(ty, ptr)
        .into_iter()
        .map(|leaf| zero_leaf(builder, leaf))
        .collect();
    CompiledValue::new(parts, ty.clone())
}

/// Widen one scalar leaf to a word, bit-preserving.
fn leaf_to_word(builder: &mut FunctionBuilder, value: Value, leaf: Type, ptr: Type) -> Value {
    let as_int = match leaf {
        types::F32 => builder.ins().bitcast(types::I32, MemFlags::new(), value),
        types::F64 => builder.ins().bitcast(types::I64, MemFlags::new(), value),
        _ => value,
    };
    let int_ty = builder.func.dfg.value_type(as_int);
    if int_ty == ptr {
        as_int
    } else {
        builder.ins().uextend(ptr, as_int)
    }
}

/// Narrow a word back to one scalar leaf, bit-preserving.
fn word_to_leaf(builder: &mut FunctionBuilder, word: Value, leaf: Type, ptr: Type) -> Value {
    match leaf {
        types::F32 => {
            let bits = builder.ins().ireduce(types::I32, word);
            builder.ins().bitcast(types::F32, MemFlags::new(), bits)
        }
        types::F64 => {
            let bits = if ptr == types::I64 {
                word
            } else {
                builder.ins().uextend(types::I64, word)
            };
            builder.ins().bitcast(types::F64, MemFlags::new(), bits)
        }
        leaf if leaf == ptr => word,
        leaf => builder.ins().ireduce(leaf, word),
    }
}

/// Pack scalar leaves into a single pointer-sized slot. Values whose layout
/// fits in a word are bit-packed at their natural offsets; larger values go
/// through the collector allocator, which the caller supplies.
pub(crate) fn pointer_pack(
    builder: &mut FunctionBuilder,
    parts: &[Value],
    leaves: &[Type],
    ptr: Type,
    gc_alloc: Option<cranelift_codegen::ir::FuncRef>,
) -> CodegenResult<Value> {
    let (offsets, size) = layout(leaves);

    if size <= ptr.bytes() {
        let mut word = builder.ins().iconst(ptr, 0);
        for ((&part, &leaf), &offset) in parts.iter().zip(leaves).zip(&offsets) {
            let bits = leaf_to_word(builder, part, leaf, ptr);
            let shifted = if offset == 0 {
                bits
            } else {
                builder.ins().ishl_imm(bits, (offset * 8) as i64)
            };
            word = builder.ins().bor(word, shifted);
        }
        return Ok(word);
    }

    let gc_alloc = gc_alloc.ok_or_else(|| {
        CodegenError::internal("collector allocator required for pointer packing")
    })?;
    let size_val = builder.ins().iconst(ptr, size as i64);
    let call = builder.ins().call(gc_alloc, &[size_val]);
    let alloc_ptr = builder.inst_results(call)[0];
    for ((&part, _), &offset) in parts.iter().zip(leaves).zip(&offsets) {
        builder
            .ins()
            .store(MemFlags::new(), part, alloc_ptr, offset as i32);
    }
    Ok(alloc_ptr)
}

/// Recover scalar leaves out of a pointer-sized slot produced by
/// `pointer_pack`.
pub(crate) fn pointer_unpack(
    builder: &mut FunctionBuilder,
    word: Value,
    leaves: &[Type],
    ptr: Type,
) -> PartVec {
    let (offsets, size) = layout(leaves);
    let mut parts = PartVec::new();

    if size <= ptr.bytes() {
        for (&leaf, &offset) in leaves.iter().zip(&offsets) {
            let shifted = if offset == 0 {
                word
            } else {
                builder.ins().ushr_imm(word, (offset * 8) as i64)
            };
            parts.push(word_to_leaf(builder, shifted, leaf, ptr));
        }
    } else {
        for (&leaf, &offset) in leaves.iter().zip(&offsets) {
            parts.push(
                builder
                    .ins()
                    .load(leaf, MemFlags::new(), word, offset as i32),
            );
        }
    }
    parts
}
