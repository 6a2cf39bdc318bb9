// Runtime intrinsics injected during construction.
//
// Every function here is declared with import linkage and called like a
// normal function; the lowering pass replaces the interface and function
// value intrinsics with closed-world code, while the collector entry points
// are provided by the runtime proper.

use cranelift::prelude::{AbiParam, Signature, Type, types};
use cranelift_module::Module;

/// Macro defining the runtime function table with a single source of truth.
/// Each entry defines the enum variant and its corresponding symbol name.
macro_rules! runtime_fns {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RuntimeFn {
            $($variant),*
        }

        impl RuntimeFn {
            pub const ALL: &'static [RuntimeFn] = &[
                $(RuntimeFn::$variant),*
            ];

            pub fn name(self) -> &'static str {
                match self {
                    $(RuntimeFn::$variant => $name),*
                }
            }
        }
    };
}

runtime_fns! {
    TypeAssert => "ember_type_assert",
    InterfaceImplements => "ember_interface_implements",
    InterfaceMethod => "ember_interface_method",
    InterfaceAssert => "ember_interface_assert",
    GetFuncPtr => "ember_get_func_ptr",
    GcAlloc => "ember_gc_alloc",
    GcTrack => "ember_gc_track",
}

impl RuntimeFn {
    /// Build the Cranelift signature of this intrinsic. Typecodes, sizes,
    /// and recovered function addresses are all pointer-sized words.
    pub fn signature<M: Module>(self, module: &M, ptr: Type) -> Signature {
        let mut sig = module.make_signature();
        let (params, ret): (Vec<Type>, Option<Type>) = match self {
            RuntimeFn::TypeAssert => (vec![ptr, ptr], Some(types::I8)),
            RuntimeFn::InterfaceImplements => (vec![ptr, ptr], Some(types::I8)),
            RuntimeFn::InterfaceMethod => (vec![ptr, ptr, ptr], Some(ptr)),
            RuntimeFn::InterfaceAssert => (vec![types::I8], None),
            RuntimeFn::GetFuncPtr => (vec![ptr, ptr], Some(ptr)),
            RuntimeFn::GcAlloc => (vec![ptr], Some(ptr)),
            RuntimeFn::GcTrack => (vec![ptr], None),
        };
        for param in params {
            sig.params.push(AbiParam::new(param));
        }
        if let Some(ret) = ret {
            sig.returns.push(AbiParam::new(ret));
        }
        sig
    }
}
