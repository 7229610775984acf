//! Token resolution for instruction streams.
//!
//! Instruction operands reference members through 32-bit tokens that only mean something
//! relative to the body they were read from. A [`TokenResolver`] turns them into handles:
//!
//! - [`ModuleResolver`] reads the runtime module tables, for ordinarily defined methods.
//! - [`DynamicResolver`] reads the private token table of a generated artifact.
//! - [`NullResolver`] resolves nothing, for bytes whose origin is unknown.
//!
//! Resolvers report a miss as `None`. The decoder converts a miss into
//! [`crate::Error::Resolution`] and abandons the whole body.

use std::{fmt, sync::Arc};

use crate::{
    metadata::token::Token,
    runtime::{dynamic::DynamicEntry, DynamicMethod, FieldHandle, MethodHandle, Module, TypeHandle},
};

/// Any resolvable member.
#[derive(Debug, Clone)]
pub enum Member {
    /// A method
    Method(MethodHandle),
    /// A field
    Field(FieldHandle),
    /// A type
    Type(TypeHandle),
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Member::Method(a), Member::Method(b)) => Arc::ptr_eq(a, b),
            (Member::Field(a), Member::Field(b)) => Arc::ptr_eq(a, b),
            (Member::Type(a), Member::Type(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Method(method) => write!(f, "{method}"),
            Member::Field(field) => write!(f, "{field}"),
            Member::Type(ty) => write!(f, "{ty}"),
        }
    }
}

/// Resolves the tokens found in one body's instruction stream.
pub trait TokenResolver: Send + Sync {
    /// Resolves a method, field or type token by its table.
    fn resolve_member(&self, token: Token) -> Option<Member> {
        match token.table() {
            Token::METHOD_DEF | Token::MEMBER_REF => self.resolve_method(token).map(Member::Method),
            Token::FIELD => self.resolve_field(token).map(Member::Field),
            Token::TYPE_DEF => self.resolve_type(token).map(Member::Type),
            _ => None,
        }
    }

    /// Resolves a type token.
    fn resolve_type(&self, token: Token) -> Option<TypeHandle>;

    /// Resolves a method token.
    fn resolve_method(&self, token: Token) -> Option<MethodHandle>;

    /// Resolves a field token.
    fn resolve_field(&self, token: Token) -> Option<FieldHandle>;

    /// Resolves a user string token.
    fn resolve_string(&self, token: Token) -> Option<Arc<str>>;

    /// Resolves a stand-alone signature token to its blob.
    fn resolve_signature(&self, token: Token) -> Option<Vec<u8>>;
}

/// Resolver backed by the tables of the runtime module.
pub struct ModuleResolver<'a> {
    module: &'a Module,
}

impl<'a> ModuleResolver<'a> {
    /// Creates a resolver over `module`.
    #[must_use]
    pub fn new(module: &'a Module) -> Self {
        ModuleResolver { module }
    }
}

impl TokenResolver for ModuleResolver<'_> {
    fn resolve_type(&self, token: Token) -> Option<TypeHandle> {
        (token.table() == Token::TYPE_DEF)
            .then(|| self.module.type_at(token))
            .flatten()
    }

    fn resolve_method(&self, token: Token) -> Option<MethodHandle> {
        (token.table() == Token::METHOD_DEF)
            .then(|| self.module.method_at(token))
            .flatten()
    }

    fn resolve_field(&self, token: Token) -> Option<FieldHandle> {
        (token.table() == Token::FIELD)
            .then(|| self.module.field_at(token))
            .flatten()
    }

    fn resolve_string(&self, token: Token) -> Option<Arc<str>> {
        (token.table() == Token::USER_STRING)
            .then(|| self.module.string_at(token))
            .flatten()
    }

    fn resolve_signature(&self, token: Token) -> Option<Vec<u8>> {
        (token.table() == Token::STANDALONE_SIG)
            .then(|| self.module.signature_at(token))
            .flatten()
    }
}

/// Resolver backed by the private token table of a generated artifact.
pub struct DynamicResolver<'a> {
    method: &'a DynamicMethod,
}

impl<'a> DynamicResolver<'a> {
    /// Creates a resolver over the token table of `method`.
    #[must_use]
    pub fn new(method: &'a DynamicMethod) -> Self {
        DynamicResolver { method }
    }

    fn entry(&self, token: Token) -> Option<&'a DynamicEntry> {
        self.method.token_table().get(token)
    }
}

impl TokenResolver for DynamicResolver<'_> {
    fn resolve_type(&self, token: Token) -> Option<TypeHandle> {
        match self.entry(token)? {
            DynamicEntry::Type(ty) => Some(ty.clone()),
            _ => None,
        }
    }

    fn resolve_method(&self, token: Token) -> Option<MethodHandle> {
        match self.entry(token)? {
            DynamicEntry::Method(method) => Some(method.clone()),
            _ => None,
        }
    }

    fn resolve_field(&self, token: Token) -> Option<FieldHandle> {
        match self.entry(token)? {
            DynamicEntry::Field(field) => Some(field.clone()),
            _ => None,
        }
    }

    fn resolve_string(&self, token: Token) -> Option<Arc<str>> {
        match self.entry(token)? {
            DynamicEntry::String(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn resolve_signature(&self, token: Token) -> Option<Vec<u8>> {
        match self.entry(token)? {
            DynamicEntry::Signature(blob) => Some(blob.clone()),
            _ => None,
        }
    }
}

/// Resolver that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResolver;

impl TokenResolver for NullResolver {
    fn resolve_type(&self, _token: Token) -> Option<TypeHandle> {
        None
    }

    fn resolve_method(&self, _token: Token) -> Option<MethodHandle> {
        None
    }

    fn resolve_field(&self, _token: Token) -> Option<FieldHandle> {
        None
    }

    fn resolve_string(&self, _token: Token) -> Option<Arc<str>> {
        None
    }

    fn resolve_signature(&self, _token: Token) -> Option<Vec<u8>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_resolver_misses() {
        let resolver = NullResolver;
        assert!(resolver.resolve_member(Token(0x06000001)).is_none());
        assert!(resolver.resolve_string(Token(0x70000001)).is_none());
        assert!(resolver.resolve_signature(Token(0x11000001)).is_none());
    }
}
