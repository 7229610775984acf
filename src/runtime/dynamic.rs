//! Generated methods and their private token tables.
//!
//! A [`DynamicMethod`] is a method body produced at runtime, typically the composed body of
//! a patched function. Its tokens do not point into the module tables: they index a
//! [`DynamicTokenTable`] owned by the method, where the table byte of each token records the
//! kind of entry. Once materialised into the code heap it becomes an [`Artifact`]; the code
//! stays allocated for as long as any clone of the artifact is alive.

use std::{fmt, sync::Arc};

use crate::{
    assembly::TokenSink,
    metadata::{resolver::DynamicResolver, token::Token},
    runtime::{FieldHandle, MethodHandle, TypeHandle},
    Result,
};

/// One entry of a [`DynamicTokenTable`].
#[derive(Debug, Clone)]
pub enum DynamicEntry {
    /// A referenced method
    Method(MethodHandle),
    /// A referenced field
    Field(FieldHandle),
    /// A referenced type
    Type(TypeHandle),
    /// A string literal
    String(Arc<str>),
    /// A stand-alone signature blob
    Signature(Vec<u8>),
}

impl DynamicEntry {
    fn table(&self) -> u8 {
        match self {
            DynamicEntry::Method(_) => Token::MEMBER_REF,
            DynamicEntry::Field(_) => Token::FIELD,
            DynamicEntry::Type(_) => Token::TYPE_DEF,
            DynamicEntry::String(_) => Token::USER_STRING,
            DynamicEntry::Signature(_) => Token::STANDALONE_SIG,
        }
    }

    fn same_as(&self, other: &DynamicEntry) -> bool {
        match (self, other) {
            (DynamicEntry::Method(a), DynamicEntry::Method(b)) => a.token == b.token,
            (DynamicEntry::Field(a), DynamicEntry::Field(b)) => a.token == b.token,
            (DynamicEntry::Type(a), DynamicEntry::Type(b)) => a.token == b.token,
            (DynamicEntry::String(a), DynamicEntry::String(b)) => a == b,
            (DynamicEntry::Signature(a), DynamicEntry::Signature(b)) => a == b,
            _ => false,
        }
    }
}

/// The private token space of a generated method.
#[derive(Debug, Default, Clone)]
pub struct DynamicTokenTable {
    entries: Vec<DynamicEntry>,
}

impl DynamicTokenTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        DynamicTokenTable::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds `entry`, reusing the token of an identical entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the table is full.
    pub fn push(&mut self, entry: DynamicEntry) -> Result<Token> {
        let table = entry.table();
        let index = match self.entries.iter().position(|e| e.same_as(&entry)) {
            Some(index) => index,
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };

        let row = u32::try_from(index + 1)
            .ok()
            .filter(|row| *row <= 0x00FF_FFFF)
            .ok_or_else(|| malformed_error!("Dynamic token table is full"))?;
        Ok(Token::from_parts(table, row))
    }

    /// Looks up `token`; the table byte must match the kind of the entry.
    #[must_use]
    pub fn get(&self, token: Token) -> Option<&DynamicEntry> {
        let entry = self.entries.get(token.index()?)?;
        (entry.table() == token.table()).then_some(entry)
    }
}

impl TokenSink for DynamicTokenTable {
    fn method_token(&mut self, method: &MethodHandle) -> Result<Token> {
        self.push(DynamicEntry::Method(method.clone()))
    }

    fn field_token(&mut self, field: &FieldHandle) -> Result<Token> {
        self.push(DynamicEntry::Field(field.clone()))
    }

    fn type_token(&mut self, ty: &TypeHandle) -> Result<Token> {
        self.push(DynamicEntry::Type(ty.clone()))
    }

    fn string_token(&mut self, value: &str) -> Result<Token> {
        self.push(DynamicEntry::String(Arc::from(value)))
    }

    fn signature_token(&mut self, blob: &[u8]) -> Result<Token> {
        self.push(DynamicEntry::Signature(blob.to_vec()))
    }
}

/// A generated method body, not yet placed in the code heap.
pub struct DynamicMethod {
    name: String,
    owner: MethodHandle,
    body: Vec<u8>,
    tokens: DynamicTokenTable,
}

impl DynamicMethod {
    /// Creates a generated method with the signature of `owner`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        owner: MethodHandle,
        body: Vec<u8>,
        tokens: DynamicTokenTable,
    ) -> Self {
        DynamicMethod {
            name: name.into(),
            owner,
            body,
            tokens,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The method whose signature this body implements.
    #[must_use]
    pub fn owner(&self) -> &MethodHandle {
        &self.owner
    }

    /// The encoded method body, header included.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Resolver over the private token table.
    #[must_use]
    pub fn resolver(&self) -> DynamicResolver<'_> {
        DynamicResolver::new(self)
    }

    pub(crate) fn token_table(&self) -> &DynamicTokenTable {
        &self.tokens
    }
}

impl fmt::Debug for DynamicMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicMethod")
            .field("name", &self.name)
            .field("owner", &self.owner.full_name())
            .field("body_len", &self.body.len())
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct ArtifactInner {
    pub(crate) method: DynamicMethod,
    pub(crate) address: u64,
}

/// A materialised [`DynamicMethod`]. Holding a clone pins its code in the heap.
#[derive(Debug, Clone)]
pub struct Artifact(pub(crate) Arc<ArtifactInner>);

impl Artifact {
    /// Entry address of the generated body.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.0.address
    }

    /// The generated method.
    #[must_use]
    pub fn method(&self) -> &DynamicMethod {
        &self.0.method
    }

    /// Number of live pins.
    #[must_use]
    pub fn pins(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_byte_selects_kind() {
        let mut table = DynamicTokenTable::new();
        let hello = table.string_token("hello").unwrap();
        let sig = table.signature_token(&[0x07, 0x00]).unwrap();

        assert_eq!(hello, Token(0x70000001));
        assert_eq!(sig, Token(0x11000002));
        assert!(matches!(table.get(hello), Some(DynamicEntry::String(s)) if &**s == "hello"));
        // same row, wrong table
        assert!(table.get(Token(0x11000001)).is_none());
        assert!(table.get(Token(0x70000009)).is_none());
    }

    #[test]
    fn identical_entries_share_a_token() {
        let mut table = DynamicTokenTable::new();
        let a = table.string_token("x").unwrap();
        let b = table.string_token("x").unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }
}
