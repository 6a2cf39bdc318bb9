// Type-identity mangling.
//
// Every source type gets a canonical textual identity, stable across
// compilations, built by structural recursion with one prefix tag per type
// constructor. Named types wrap their underlying identity with a leading
// `~<qualified name>:` segment. Field and method names never appear in
// structural positions; only the recursively mangled type identifiers do.
//
// The lowering pass assigns dense typecodes from these identities, so two
// types are identical iff their identities compare equal.

use ember_ssa::{MethodSig, Signature, Type as SrcType};

use crate::errors::{CodegenError, CodegenResult};

/// Reserved field name the FFI layer puts on foreign-union structs. Such
/// structs have no stable layout and cannot be placed inside an interface.
pub const FOREIGN_UNION_FIELD: &str = "ffi$union";

/// Canonical identity of a source type.
pub fn type_code_name(ty: &SrcType) -> CodegenResult<String> {
    match ty {
        SrcType::Named(named) => Ok(format!(
            "~{}:{}",
            named.name,
            type_code_name(&named.underlying)?
        )),
        SrcType::Basic(kind) => Ok(format!("basic:{}", kind.name())),
        SrcType::Pointer(elem) => Ok(format!("pointer:{}", type_code_name(elem)?)),
        SrcType::Slice(elem) => Ok(format!("slice:{}", type_code_name(elem)?)),
        SrcType::Array(len, elem) => Ok(format!("array:{}:{}", len, type_code_name(elem)?)),
        SrcType::Map(key, value) => Ok(format!(
            "map:{{{},{}}}",
            type_code_name(key)?,
            type_code_name(value)?
        )),
        SrcType::Chan(elem) => Ok(format!("chan:{}", type_code_name(elem)?)),
        SrcType::Struct(fields) => {
            if fields.iter().any(|f| f.name == FOREIGN_UNION_FIELD) {
                return Err(CodegenError::invalid_type(
                    "foreign unions are not allowed in interfaces",
                    format!("struct with {} field(s)", fields.len()),
                ));
            }
            let elems = fields
                .iter()
                .map(|f| type_code_name(&f.ty))
                .collect::<CodegenResult<Vec<_>>>()?;
            Ok(format!("struct:{{{}}}", elems.join(",")))
        }
        SrcType::Func(sig) => Ok(format!("func:{}", signature_code(sig)?)),
        SrcType::Interface(methods) => {
            let sigs = methods
                .iter()
                .map(|m| type_code_name(&SrcType::func(m.sig.clone())))
                .collect::<CodegenResult<Vec<_>>>()?;
            Ok(format!("interface:{{{}}}", sigs.join(",")))
        }
    }
}

/// The `{params}{results}` tail of a function identity. The receiver is not
/// part of a signature's structural identity.
fn signature_code(sig: &Signature) -> CodegenResult<String> {
    let params = sig
        .params
        .iter()
        .map(type_code_name)
        .collect::<CodegenResult<Vec<_>>>()?;
    let results = sig
        .results
        .iter()
        .map(type_code_name)
        .collect::<CodegenResult<Vec<_>>>()?;
    Ok(format!("{{{}}}{{{}}}", params.join(","), results.join(",")))
}

/// Identity of a method signature: name plus parameter and result types in
/// source order. Two methods share a signature placeholder iff these
/// identities are equal.
pub fn method_signature(method: &MethodSig) -> CodegenResult<String> {
    Ok(format!("{}:{}", method.name, signature_code(&method.sig)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_ssa::{BasicKind, Field, Type};

    fn int32_pair() -> Vec<Field> {
        vec![
            Field {
                name: "x".to_string(),
                ty: Type::basic(BasicKind::Int32),
            },
            Field {
                name: "y".to_string(),
                ty: Type::basic(BasicKind::Int32),
            },
        ]
    }

    #[test]
    fn basic_identities() {
        assert_eq!(
            type_code_name(&Type::basic(BasicKind::Int8)).unwrap(),
            "basic:int8"
        );
        assert_eq!(
            type_code_name(&Type::pointer(Type::basic(BasicKind::Bool))).unwrap(),
            "pointer:basic:bool"
        );
        assert_eq!(
            type_code_name(&Type::array(4, Type::basic(BasicKind::Uint8))).unwrap(),
            "array:4:basic:uint8"
        );
        assert_eq!(
            type_code_name(&Type::map(
                Type::basic(BasicKind::String),
                Type::basic(BasicKind::Int)
            ))
            .unwrap(),
            "map:{basic:string,basic:int}"
        );
    }

    #[test]
    fn named_wrapping_differs_from_unnamed() {
        let unnamed = Type::Struct(int32_pair());
        let named = Type::named("pkg.Point", Type::Struct(int32_pair()), vec![]);
        let unnamed_code = type_code_name(&unnamed).unwrap();
        let named_code = type_code_name(&named).unwrap();
        assert_eq!(unnamed_code, "struct:{basic:int32,basic:int32}");
        assert_eq!(named_code, "~pkg.Point:struct:{basic:int32,basic:int32}");
        assert_ne!(unnamed_code, named_code);
    }

    #[test]
    fn structural_identity_is_deterministic() {
        let a = Type::Struct(int32_pair());
        let b = Type::Struct(int32_pair());
        assert_eq!(type_code_name(&a).unwrap(), type_code_name(&b).unwrap());
    }

    #[test]
    fn field_names_do_not_change_identity() {
        let mut renamed = int32_pair();
        renamed[0].name = "a".to_string();
        renamed[1].name = "b".to_string();
        assert_eq!(
            type_code_name(&Type::Struct(int32_pair())).unwrap(),
            type_code_name(&Type::Struct(renamed)).unwrap()
        );
    }

    #[test]
    fn func_identity_includes_params_and_results() {
        let sig = Signature::new(
            vec![Type::basic(BasicKind::Int64)],
            vec![Type::basic(BasicKind::Bool)],
        );
        assert_eq!(
            type_code_name(&Type::func(sig)).unwrap(),
            "func:{basic:int64}{basic:bool}"
        );
    }

    #[test]
    fn interface_identity_uses_method_types_not_names() {
        let a = Type::Interface(vec![MethodSig {
            name: "Print".to_string(),
            sig: Signature::default(),
        }]);
        let b = Type::Interface(vec![MethodSig {
            name: "Write".to_string(),
            sig: Signature::default(),
        }]);
        assert_eq!(type_code_name(&a).unwrap(), type_code_name(&b).unwrap());
    }

    #[test]
    fn foreign_union_is_rejected() {
        let ty = Type::Struct(vec![
            Field {
                name: FOREIGN_UNION_FIELD.to_string(),
                ty: Type::basic(BasicKind::Uint32),
            },
            Field {
                name: "pad".to_string(),
                ty: Type::basic(BasicKind::Uint32),
            },
        ]);
        assert!(matches!(
            type_code_name(&ty),
            Err(CodegenError::InvalidType { .. })
        ));
    }

    #[test]
    fn method_signatures_intern_by_name_and_types() {
        let sig = Signature::new(vec![Type::basic(BasicKind::Int32)], vec![]);
        let a = MethodSig {
            name: "Print".to_string(),
            sig: sig.clone(),
        };
        let b = MethodSig {
            name: "Print".to_string(),
            sig,
        };
        assert_eq!(method_signature(&a).unwrap(), method_signature(&b).unwrap());
        let c = MethodSig {
            name: "Print".to_string(),
            sig: Signature::new(vec![Type::basic(BasicKind::Int64)], vec![]),
        };
        assert_ne!(method_signature(&a).unwrap(), method_signature(&c).unwrap());
    }
}
