//! Metadata tables of the runtime module.
//!
//! Types, fields, methods, user strings and stand-alone signatures are appended to
//! lock-free [`boxcar::Vec`] tables and never removed, so a token handed out once stays
//! valid for the life of the runtime. Rows are 1-based, the table byte of the token
//! selects the table.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    metadata::{signatures::TypeSignature, token::Token},
    patch::HookPriority,
    runtime::value::{new_slot, Slot, Value},
    Error, Result,
};

/// Shared handle to a type definition.
pub type TypeHandle = Arc<TypeDef>;
/// Shared handle to a field definition.
pub type FieldHandle = Arc<FieldDef>;
/// Shared handle to a method definition.
pub type MethodHandle = Arc<MethodDef>;

/// Host implementation of a method: receives the arguments (with `this` first for
/// instance methods) and returns the result for non-void methods.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync>;

/// A class.
#[derive(Debug)]
pub struct TypeDef {
    /// `TypeDef` token
    pub token: Token,
    /// Namespace, may be empty
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Base class
    pub extends: Option<TypeHandle>,
}

impl TypeDef {
    /// `Namespace.Name`, or `Name` without namespace.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// `true` if this type is `other` or derives from it.
    #[must_use]
    pub fn is_subclass_of(&self, other: &TypeDef) -> bool {
        if self.token == other.token {
            return true;
        }
        match &self.extends {
            Some(base) => base.is_subclass_of(other),
            None => false,
        }
    }
}

impl PartialEq for TypeDef {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl fmt::Display for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// A field of a class.
pub struct FieldDef {
    /// `Field` token
    pub token: Token,
    /// Field name
    pub name: String,
    /// Declaring class
    pub declaring_type: TypeHandle,
    /// Field type
    pub signature: TypeSignature,
    /// Static fields live in one slot owned by the definition
    pub is_static: bool,
    pub(crate) static_slot: Slot,
}

impl FieldDef {
    /// The storage of a static field.
    #[must_use]
    pub fn static_slot(&self) -> Option<&Slot> {
        self.is_static.then_some(&self.static_slot)
    }
}

impl fmt::Display for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type, self.name)
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("is_static", &self.is_static)
            .finish_non_exhaustive()
    }
}

/// A named, typed parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    /// Parameter name, used for hook binding
    pub name: String,
    /// Parameter type, `ByRef` for by-reference parameters
    pub signature: TypeSignature,
}

/// A method.
///
/// CIL methods live in the code heap at [`MethodDef::entry`]; native methods carry a
/// [`NativeFn`] and have no entry.
pub struct MethodDef {
    /// `MethodDef` token
    pub token: Token,
    /// Method name
    pub name: String,
    /// Declaring class
    pub declaring_type: TypeHandle,
    /// Declared parameters, without `this`
    pub params: Vec<ParamDef>,
    /// Return type
    pub returns: TypeSignature,
    /// `false` if argument 0 is `this`
    pub is_static: bool,
    /// Priority when used as a hook
    pub priority: Option<HookPriority>,
    entry: AtomicU64,
    pub(crate) native: Option<NativeFn>,
}

impl MethodDef {
    /// `Namespace.Type::Name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }

    /// Entry address in the code heap, 0 if the method has no body yet.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry.load(Ordering::Acquire)
    }

    pub(crate) fn set_entry(&self, address: u64) -> Result<()> {
        self.entry
            .compare_exchange(0, address, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::AlreadyImplemented(self.full_name()))
    }

    /// `true` for host-implemented methods.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// `true` if the method returns a value.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        !self.returns.is_void()
    }

    /// Number of arguments including `this`.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }

    /// Argument index of the parameter called `name`.
    #[must_use]
    pub fn param_index(&self, name: &str) -> Option<u16> {
        let position = self.params.iter().position(|param| param.name == name)?;
        u16::try_from(position + usize::from(!self.is_static)).ok()
    }

    /// Name and type of argument `index`, with `this` at 0 for instance methods.
    #[must_use]
    pub fn argument(&self, index: u16) -> Option<(String, TypeSignature)> {
        let index = usize::from(index);
        if self.is_static {
            let param = self.params.get(index)?;
            return Some((param.name.clone(), param.signature.clone()));
        }

        match index {
            0 => Some((
                "this".to_string(),
                TypeSignature::Class(self.declaring_type.clone()),
            )),
            _ => {
                let param = self.params.get(index - 1)?;
                Some((param.name.clone(), param.signature.clone()))
            }
        }
    }
}

impl fmt::Display for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("token", &self.token)
            .field("name", &self.full_name())
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("is_static", &self.is_static)
            .field("entry", &format_args!("0x{:x}", self.entry()))
            .finish_non_exhaustive()
    }
}

/// Describes a method to define with [`crate::Runtime::define_method`].
///
/// ```rust,ignore
/// let check = runtime.define_method(
///     MethodBuilder::new(&program, "Check")
///         .param("x", TypeSignature::I4)
///         .returns(TypeSignature::Boolean),
/// )?;
/// ```
pub struct MethodBuilder {
    declaring_type: TypeHandle,
    name: String,
    params: Vec<ParamDef>,
    returns: TypeSignature,
    is_static: bool,
    priority: Option<HookPriority>,
    native: Option<NativeFn>,
}

impl MethodBuilder {
    /// A static `void` method without parameters named `name` in `declaring_type`.
    #[must_use]
    pub fn new(declaring_type: &TypeHandle, name: impl Into<String>) -> Self {
        MethodBuilder {
            declaring_type: declaring_type.clone(),
            name: name.into(),
            params: Vec::new(),
            returns: TypeSignature::Void,
            is_static: true,
            priority: None,
            native: None,
        }
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, signature: TypeSignature) -> Self {
        self.params.push(ParamDef {
            name: name.into(),
            signature,
        });
        self
    }

    /// Sets the return type.
    #[must_use]
    pub fn returns(mut self, signature: TypeSignature) -> Self {
        self.returns = signature;
        self
    }

    /// Makes the method an instance method.
    #[must_use]
    pub fn instance(mut self) -> Self {
        self.is_static = false;
        self
    }

    /// Sets the priority used when the method is registered as a hook.
    #[must_use]
    pub fn priority(mut self, priority: impl Into<HookPriority>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Implements the method in Rust instead of CIL.
    #[must_use]
    pub fn native<F>(mut self, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.native = Some(Arc::new(function));
        self
    }
}

/// The metadata tables.
pub struct Module {
    types: boxcar::Vec<TypeHandle>,
    fields: boxcar::Vec<FieldHandle>,
    methods: boxcar::Vec<MethodHandle>,
    strings: boxcar::Vec<Arc<str>>,
    signatures: boxcar::Vec<Vec<u8>>,
    define: Mutex<()>,
}

fn row_of(index: usize) -> Result<u32> {
    u32::try_from(index + 1)
        .ok()
        .filter(|row| *row <= 0x00FF_FFFF)
        .ok_or_else(|| malformed_error!("Metadata table is full"))
}

impl Module {
    /// Creates empty tables.
    #[must_use]
    pub fn new() -> Self {
        Module {
            types: boxcar::Vec::new(),
            fields: boxcar::Vec::new(),
            methods: boxcar::Vec::new(),
            strings: boxcar::Vec::new(),
            signatures: boxcar::Vec::new(),
            define: Mutex::new(()),
        }
    }

    /// Defines a class.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn define_type(
        &self,
        namespace: &str,
        name: &str,
        extends: Option<&TypeHandle>,
    ) -> Result<TypeHandle> {
        let _guard = lock!(self.define);
        let ty = Arc::new(TypeDef {
            token: Token::from_parts(Token::TYPE_DEF, row_of(self.types.count())?),
            namespace: namespace.to_string(),
            name: name.to_string(),
            extends: extends.cloned(),
        });
        self.types.push(ty.clone());
        Ok(ty)
    }

    /// Defines a field.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn define_field(
        &self,
        declaring_type: &TypeHandle,
        name: &str,
        signature: TypeSignature,
        is_static: bool,
    ) -> Result<FieldHandle> {
        let _guard = lock!(self.define);
        let field = Arc::new(FieldDef {
            token: Token::from_parts(Token::FIELD, row_of(self.fields.count())?),
            name: name.to_string(),
            declaring_type: declaring_type.clone(),
            static_slot: new_slot(Value::default_for(&signature)),
            signature,
            is_static,
        });
        self.fields.push(field.clone());
        Ok(field)
    }

    /// Defines a method from `builder`.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn define_method(&self, builder: MethodBuilder) -> Result<MethodHandle> {
        let _guard = lock!(self.define);
        let method = Arc::new(MethodDef {
            token: Token::from_parts(Token::METHOD_DEF, row_of(self.methods.count())?),
            name: builder.name,
            declaring_type: builder.declaring_type,
            params: builder.params,
            returns: builder.returns,
            is_static: builder.is_static,
            priority: builder.priority,
            entry: AtomicU64::new(0),
            native: builder.native,
        });
        self.methods.push(method.clone());
        Ok(method)
    }

    /// Adds a user string and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn add_string(&self, value: &str) -> Result<Token> {
        let _guard = lock!(self.define);
        if let Some((index, _)) = self.strings.iter().find(|(_, s)| &***s == value) {
            return Ok(Token::from_parts(Token::USER_STRING, row_of(index)?));
        }
        let token = Token::from_parts(Token::USER_STRING, row_of(self.strings.count())?);
        self.strings.push(Arc::from(value));
        Ok(token)
    }

    /// Adds a stand-alone signature blob and returns its token.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn add_signature(&self, blob: Vec<u8>) -> Result<Token> {
        let _guard = lock!(self.define);
        if let Some((index, _)) = self.signatures.iter().find(|(_, s)| **s == blob) {
            return Ok(Token::from_parts(Token::STANDALONE_SIG, row_of(index)?));
        }
        let token = Token::from_parts(Token::STANDALONE_SIG, row_of(self.signatures.count())?);
        self.signatures.push(blob);
        Ok(token)
    }

    /// Type for a `TypeDef` token.
    #[must_use]
    pub fn type_at(&self, token: Token) -> Option<TypeHandle> {
        self.types.get(token.index()?).cloned()
    }

    /// Field for a `Field` token.
    #[must_use]
    pub fn field_at(&self, token: Token) -> Option<FieldHandle> {
        self.fields.get(token.index()?).cloned()
    }

    /// Method for a `MethodDef` token.
    #[must_use]
    pub fn method_at(&self, token: Token) -> Option<MethodHandle> {
        self.methods.get(token.index()?).cloned()
    }

    /// String for a user string token.
    #[must_use]
    pub fn string_at(&self, token: Token) -> Option<Arc<str>> {
        self.strings.get(token.index()?).cloned()
    }

    /// Blob for a stand-alone signature token.
    #[must_use]
    pub fn signature_at(&self, token: Token) -> Option<Vec<u8>> {
        self.signatures.get(token.index()?).cloned()
    }

    /// Finds a type by full name.
    #[must_use]
    pub fn find_type(&self, full_name: &str) -> Option<TypeHandle> {
        self.types
            .iter()
            .map(|(_, ty)| ty)
            .find(|ty| ty.full_name() == full_name)
            .cloned()
    }

    /// Finds a method by declaring type full name and method name.
    #[must_use]
    pub fn find_method(&self, type_name: &str, name: &str) -> Option<MethodHandle> {
        self.methods
            .iter()
            .map(|(_, method)| method)
            .find(|method| method.name == name && method.declaring_type.full_name() == type_name)
            .cloned()
    }

    /// Finds a field by declaring type full name and field name.
    #[must_use]
    pub fn find_field(&self, type_name: &str, name: &str) -> Option<FieldHandle> {
        self.fields
            .iter()
            .map(|(_, field)| field)
            .find(|field| field.name == name && field.declaring_type.full_name() == type_name)
            .cloned()
    }

    /// Instance fields of `ty` and all of its base classes.
    #[must_use]
    pub fn instance_fields(&self, ty: &TypeDef) -> Vec<FieldHandle> {
        self.fields
            .iter()
            .map(|(_, field)| field)
            .filter(|field| !field.is_static && ty.is_subclass_of(&field.declaring_type))
            .cloned()
            .collect()
    }

    /// Every defined method.
    pub fn methods(&self) -> impl Iterator<Item = &MethodHandle> {
        self.methods.iter().map(|(_, method)| method)
    }
}

impl Default for Module {
    fn default() -> Self {
        Module::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_sequential_rows() {
        let module = Module::new();
        let a = module.define_type("App", "A", None).unwrap();
        let b = module.define_type("App", "B", Some(&a)).unwrap();

        assert_eq!(a.token, Token(0x02000001));
        assert_eq!(b.token, Token(0x02000002));
        assert!(b.is_subclass_of(&a));
        assert!(!a.is_subclass_of(&b));
        assert_eq!(module.type_at(b.token).unwrap().full_name(), "App.B");
        assert!(module.type_at(Token(0x02000000)).is_none());
    }

    #[test]
    fn strings_are_deduplicated() {
        let module = Module::new();
        let first = module.add_string("hello").unwrap();
        let second = module.add_string("hello").unwrap();
        let other = module.add_string("world").unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(&*module.string_at(other).unwrap(), "world");
    }

    #[test]
    fn method_arguments() {
        let module = Module::new();
        let ty = module.define_type("App", "Counter", None).unwrap();
        let method = module
            .define_method(
                MethodBuilder::new(&ty, "Add")
                    .instance()
                    .param("amount", TypeSignature::I4)
                    .returns(TypeSignature::I4),
            )
            .unwrap();

        assert_eq!(method.arg_count(), 2);
        assert_eq!(method.param_index("amount"), Some(1));
        assert_eq!(method.argument(0).unwrap().0, "this");
        assert_eq!(method.argument(1).unwrap().1, TypeSignature::I4);
        assert_eq!(method.full_name(), "App.Counter::Add");

        method.set_entry(0x1000).unwrap();
        assert!(matches!(
            method.set_entry(0x2000),
            Err(Error::AlreadyImplemented(_))
        ));
    }

    #[test]
    fn inherited_instance_fields() {
        let module = Module::new();
        let base = module.define_type("App", "Base", None).unwrap();
        let derived = module.define_type("App", "Derived", Some(&base)).unwrap();
        module
            .define_field(&base, "a", TypeSignature::I4, false)
            .unwrap();
        module
            .define_field(&derived, "b", TypeSignature::I4, false)
            .unwrap();
        module
            .define_field(&derived, "s", TypeSignature::I4, true)
            .unwrap();

        assert_eq!(module.instance_fields(&derived).len(), 2);
        assert_eq!(module.instance_fields(&base).len(), 1);
    }
}
