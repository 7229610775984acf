//! Type signatures and the local variable signature blob.
//!
//! Only the element types the runtime can represent are modelled. Local variable
//! signatures (ECMA-335 II.23.2.6) are read with [`parse_local_var_signature`] during
//! decoding and written with [`encode_local_var_signature`] during encoding, where class
//! references become TypeDefOrRef coded indexes in the token space of the target body.

mod encoder;
mod parser;

use std::fmt;

pub use encoder::encode_local_var_signature;
pub use parser::{parse_local_var_signature, SignatureParser};

use crate::runtime::TypeHandle;

/// Element type bytes of a signature blob (ECMA-335 II.23.1.16).
#[allow(non_snake_case, missing_docs)]
pub mod ELEMENT_TYPE {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const I4: u8 = 0x08;
    pub const I8: u8 = 0x0a;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const BYREF: u8 = 0x10;
    pub const CLASS: u8 = 0x12;
    pub const OBJECT: u8 = 0x1c;
}

/// Leading byte of a local variable signature.
pub const LOCAL_SIG: u8 = 0x07;

/// The type of a parameter, local, field or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSignature {
    /// void
    Void,
    /// bool
    Boolean,
    /// signed 32bit integer
    I4,
    /// signed 64bit integer
    I8,
    /// 64bit floating-point
    R8,
    /// System.String
    String,
    /// System.Object
    Object,
    /// A class defined in the runtime module
    Class(TypeHandle),
    /// Type by reference
    ByRef(Box<TypeSignature>),
}

impl TypeSignature {
    /// Wraps `inner` into a by-reference type.
    #[must_use]
    pub fn by_ref(inner: TypeSignature) -> Self {
        TypeSignature::ByRef(Box::new(inner))
    }

    /// `true` for `void`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, TypeSignature::Void)
    }

    /// `true` for by-reference types.
    #[must_use]
    pub fn is_byref(&self) -> bool {
        matches!(self, TypeSignature::ByRef(_))
    }

    /// The referenced type of a by-reference type, `self` otherwise.
    #[must_use]
    pub fn base(&self) -> &TypeSignature {
        match self {
            TypeSignature::ByRef(inner) => inner.base(),
            other => other,
        }
    }

    /// `true` for object references.
    #[must_use]
    pub fn is_reference_type(&self) -> bool {
        matches!(
            self,
            TypeSignature::String | TypeSignature::Object | TypeSignature::Class(_)
        )
    }

    /// `true` if a value of type `source` can be stored in a location of this type.
    ///
    /// By-reference types are compared through their referenced type.
    #[must_use]
    pub fn is_assignable_from(&self, source: &TypeSignature) -> bool {
        match (self.base(), source.base()) {
            (TypeSignature::Object, other) => other.is_reference_type(),
            (TypeSignature::Class(target), TypeSignature::Class(source)) => {
                source.is_subclass_of(target)
            }
            (target, source) => target == source,
        }
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSignature::Void => f.write_str("void"),
            TypeSignature::Boolean => f.write_str("bool"),
            TypeSignature::I4 => f.write_str("int32"),
            TypeSignature::I8 => f.write_str("int64"),
            TypeSignature::R8 => f.write_str("float64"),
            TypeSignature::String => f.write_str("string"),
            TypeSignature::Object => f.write_str("object"),
            TypeSignature::Class(ty) => write!(f, "{ty}"),
            TypeSignature::ByRef(inner) => write!(f, "{inner}&"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byref_base() {
        let sig = TypeSignature::by_ref(TypeSignature::I4);
        assert!(sig.is_byref());
        assert_eq!(sig.base(), &TypeSignature::I4);
        assert_eq!(sig.to_string(), "int32&");
    }

    #[test]
    fn assignability() {
        assert!(TypeSignature::Object.is_assignable_from(&TypeSignature::String));
        assert!(!TypeSignature::Object.is_assignable_from(&TypeSignature::I4));
        assert!(TypeSignature::I4.is_assignable_from(&TypeSignature::by_ref(TypeSignature::I4)));
        assert!(!TypeSignature::I4.is_assignable_from(&TypeSignature::Boolean));
    }
}
