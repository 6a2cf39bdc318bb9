// Source-language type model.
//
// Types are structural except for `Named`, which wraps an underlying type
// with a qualified name and owns the type's method list. Interfaces carry
// their method signatures in declaration order.

use std::rc::Rc;

use crate::ssa::FunctionId;

/// Kind tag for the built-in scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicKind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    String,
    UnsafePointer,
}

impl BasicKind {
    pub fn name(self) -> &'static str {
        match self {
            BasicKind::Bool => "bool",
            BasicKind::Int => "int",
            BasicKind::Int8 => "int8",
            BasicKind::Int16 => "int16",
            BasicKind::Int32 => "int32",
            BasicKind::Int64 => "int64",
            BasicKind::Uint => "uint",
            BasicKind::Uint8 => "uint8",
            BasicKind::Uint16 => "uint16",
            BasicKind::Uint32 => "uint32",
            BasicKind::Uint64 => "uint64",
            BasicKind::Uintptr => "uintptr",
            BasicKind::Float32 => "float32",
            BasicKind::Float64 => "float64",
            BasicKind::String => "string",
            BasicKind::UnsafePointer => "unsafeptr",
        }
    }
}

/// One struct field. Field names never participate in structural identity,
/// but the foreign-union marker field is detected by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

/// A function signature with resolved types. The receiver is present only
/// for methods.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    pub recv: Option<Type>,
    pub params: Vec<Type>,
    pub results: Vec<Type>,
}

impl Signature {
    pub fn new(params: Vec<Type>, results: Vec<Type>) -> Self {
        Signature {
            recv: None,
            params,
            results,
        }
    }

    pub fn with_recv(recv: Type, params: Vec<Type>, results: Vec<Type>) -> Self {
        Signature {
            recv: Some(recv),
            params,
            results,
        }
    }
}

/// A method as declared by an interface: name plus signature, no body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub name: String,
    pub sig: Signature,
}

/// A method attached to a named concrete type. The signature lives on the
/// referenced function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Bare method name, e.g. `Print`.
    pub name: String,
    pub func: FunctionId,
}

/// A named type: qualified name, underlying type, methods in declaration
/// order.
#[derive(Debug, PartialEq)]
pub struct NamedType {
    /// Qualified name, e.g. `main.Point`.
    pub name: String,
    pub underlying: Type,
    pub methods: Vec<Method>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Basic(BasicKind),
    Pointer(Rc<Type>),
    Slice(Rc<Type>),
    Array(u64, Rc<Type>),
    Map(Rc<Type>, Rc<Type>),
    Chan(Rc<Type>),
    Struct(Vec<Field>),
    Func(Rc<Signature>),
    Interface(Vec<MethodSig>),
    Named(Rc<NamedType>),
}

impl Type {
    pub fn basic(kind: BasicKind) -> Type {
        Type::Basic(kind)
    }

    pub fn pointer(elem: Type) -> Type {
        Type::Pointer(Rc::new(elem))
    }

    pub fn slice(elem: Type) -> Type {
        Type::Slice(Rc::new(elem))
    }

    pub fn array(len: u64, elem: Type) -> Type {
        Type::Array(len, Rc::new(elem))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::Map(Rc::new(key), Rc::new(value))
    }

    pub fn chan(elem: Type) -> Type {
        Type::Chan(Rc::new(elem))
    }

    pub fn func(sig: Signature) -> Type {
        Type::Func(Rc::new(sig))
    }

    pub fn named(name: impl Into<String>, underlying: Type, methods: Vec<Method>) -> Type {
        Type::Named(Rc::new(NamedType {
            name: name.into(),
            underlying,
            methods,
        }))
    }

    /// Peel `Named` wrappers down to the structural type.
    pub fn underlying(&self) -> &Type {
        let mut ty = self;
        while let Type::Named(named) = ty {
            ty = &named.underlying;
        }
        ty
    }

    /// The interface method list, if this is (a named wrapper around) an
    /// interface type. Declaration order.
    pub fn interface_methods(&self) -> Option<&[MethodSig]> {
        match self.underlying() {
            Type::Interface(methods) => Some(methods),
            _ => None,
        }
    }

    /// The methods attached to this type, in declaration order. Methods
    /// live on named types; a pointer to a named type carries the named
    /// type's method list (the front-end has already filtered it by
    /// receiver form).
    pub fn methods(&self) -> &[Method] {
        match self {
            Type::Named(named) => &named.methods,
            Type::Pointer(elem) => match &**elem {
                Type::Named(named) => &named.methods,
                _ => &[],
            },
            _ => &[],
        }
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.underlying(), Type::Interface(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.underlying(), Type::Pointer(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underlying_peels_nested_names() {
        let inner = Type::named("pkg.A", Type::basic(BasicKind::Int32), vec![]);
        let outer = Type::named("pkg.B", inner, vec![]);
        assert_eq!(outer.underlying(), &Type::Basic(BasicKind::Int32));
    }

    #[test]
    fn interface_methods_through_named() {
        let itf = Type::Interface(vec![MethodSig {
            name: "Print".to_string(),
            sig: Signature::default(),
        }]);
        let named = Type::named("pkg.Printer", itf, vec![]);
        assert_eq!(named.interface_methods().map(|ms| ms.len()), Some(1));
        assert!(named.is_interface());
    }

    #[test]
    fn unnamed_types_have_no_methods() {
        let ty = Type::Struct(vec![]);
        assert!(ty.methods().is_empty());
    }
}
