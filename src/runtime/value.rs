//! Values on the evaluation stack and in argument, local and field slots.
//!
//! Booleans are `I4` values 0 and 1, as on a CIL evaluation stack. A [`Slot`] is a shared
//! storage location: taking the address of an argument, local or field yields a
//! [`Value::Ref`] to its slot, which is how by-reference parameters observe writes.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use crate::{
    metadata::{resolver::Member, signatures::TypeSignature, token::Token},
    runtime::{FieldHandle, TypeHandle},
    Result,
};

/// A shared, mutable storage location.
pub type Slot = Arc<RwLock<Value>>;

/// Creates a new slot holding `value`.
#[must_use]
pub fn new_slot(value: Value) -> Slot {
    Arc::new(RwLock::new(value))
}

/// Reads the value stored in `slot`.
///
/// # Errors
/// Returns [`crate::Error::LockError`] if the slot lock is poisoned.
pub fn load(slot: &Slot) -> Result<Value> {
    Ok(read_lock!(slot).clone())
}

/// Replaces the value stored in `slot`.
///
/// # Errors
/// Returns [`crate::Error::LockError`] if the slot lock is poisoned.
pub fn store(slot: &Slot, value: Value) -> Result<()> {
    *write_lock!(slot) = value;
    Ok(())
}

/// An instance of a class, with one slot per instance field.
#[derive(Debug)]
pub struct Object {
    ty: TypeHandle,
    fields: HashMap<Token, Slot>,
}

/// Shared reference to an [`Object`].
pub type ObjectRef = Arc<Object>;

impl Object {
    /// Creates an instance of `ty` with every field set to its default.
    #[must_use]
    pub fn new<'a>(ty: TypeHandle, fields: impl IntoIterator<Item = &'a FieldHandle>) -> Self {
        let fields = fields
            .into_iter()
            .map(|field| (field.token, new_slot(Value::default_for(&field.signature))))
            .collect();
        Object { ty, fields }
    }

    /// The runtime type of the object.
    #[must_use]
    pub fn ty(&self) -> &TypeHandle {
        &self.ty
    }

    /// The slot of instance field `token`.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&Slot> {
        self.fields.get(&token)
    }
}

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    /// The null reference
    Null,
    /// 32-bit integer, also used for `bool`
    I4(i32),
    /// 64-bit integer
    I8(i64),
    /// Floating point
    R8(f64),
    /// String reference
    Str(Arc<str>),
    /// Object reference
    Object(ObjectRef),
    /// Managed pointer to a slot
    Ref(Slot),
    /// Runtime handle produced by `ldtoken`
    Handle(Member),
}

impl Value {
    /// The zero value of a location of type `ty`.
    #[must_use]
    pub fn default_for(ty: &TypeSignature) -> Self {
        match ty {
            TypeSignature::Boolean | TypeSignature::I4 => Value::I4(0),
            TypeSignature::I8 => Value::I8(0),
            TypeSignature::R8 => Value::R8(0.0),
            TypeSignature::Void
            | TypeSignature::String
            | TypeSignature::Object
            | TypeSignature::Class(_)
            | TypeSignature::ByRef(_) => Value::Null,
        }
    }

    /// A boolean as `I4` 0 or 1.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        Value::I4(i32::from(value))
    }

    /// A string value.
    #[must_use]
    pub fn string(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }

    /// Returns the integer of an `I4`.
    #[must_use]
    pub fn as_i4(&self) -> Option<i32> {
        match self {
            Value::I4(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the integer of an `I4` or `I8`, widened.
    #[must_use]
    pub fn as_i8(&self) -> Option<i64> {
        match self {
            Value::I4(value) => Some(i64::from(*value)),
            Value::I8(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the float of an `R8`.
    #[must_use]
    pub fn as_r8(&self) -> Option<f64> {
        match self {
            Value::R8(value) => Some(*value),
            _ => None,
        }
    }

    /// Interprets an `I4` as a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i4().map(|value| value != 0)
    }

    /// Returns the string of a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the object of an `Object`.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// `brtrue` semantics: non-zero numbers and non-null references.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I4(value) => *value != 0,
            Value::I8(value) => *value != 0,
            Value::R8(value) => *value != 0.0,
            Value::Str(_) | Value::Object(_) | Value::Ref(_) | Value::Handle(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::I4(a), Value::I4(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::R8(a), Value::R8(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Ref(a), Value::Ref(b)) => Arc::ptr_eq(a, b),
            (Value::Handle(a), Value::Handle(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::I4(value) => write!(f, "{value}"),
            Value::I8(value) => write!(f, "{value}L"),
            Value::R8(value) => write!(f, "{value:?}"),
            Value::Str(value) => write!(f, "{value:?}"),
            Value::Object(object) => write!(f, "<{}>", object.ty()),
            Value::Ref(_) => f.write_str("&slot"),
            Value::Handle(member) => write!(f, "handle({member})"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I4(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I8(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::R8(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::from_bool(value)
    }
}
