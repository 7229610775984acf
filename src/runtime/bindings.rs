//! Named host members resolved at startup.
//!
//! Hosts usually know the members they want to patch or call by name only. A
//! [`BindingRegistry`] collects such names up front and resolves them all at once through
//! the module's token tables, so a missing member is reported before any patch is made.
//!
//! ```rust
//! use dotpatch::runtime::{BindingKind, BindingRegistry, MethodBuilder, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let ty = runtime.define_type("Game", "Player", None)?;
//! runtime.define_method(MethodBuilder::new(&ty, "Jump"))?;
//!
//! let mut bindings = BindingRegistry::new();
//! bindings.declare(BindingKind::Method, "Game.Player", "Jump");
//! bindings.resolve(runtime.module())?;
//! assert_eq!(bindings.method("Game.Player", "Jump")?.name, "Jump");
//! # Ok::<(), dotpatch::Error>(())
//! ```

use dashmap::DashMap;
use log::debug;
use strum::{Display, EnumString};

use crate::{
    metadata::resolver::{Member, ModuleResolver, TokenResolver},
    runtime::{FieldHandle, MethodHandle, Module, TypeHandle},
    Error, Result,
};

/// Kind of a declared binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BindingKind {
    /// A method, named by its declaring type and simple name
    Method,
    /// A field, named by its declaring type and name
    Field,
    /// A type, named by its full name
    Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    kind: BindingKind,
    type_name: String,
    member: String,
}

impl BindingKey {
    fn new(kind: BindingKind, type_name: &str, member: &str) -> Self {
        BindingKey {
            kind,
            type_name: type_name.to_string(),
            member: member.to_string(),
        }
    }

    fn describe(&self) -> String {
        match self.kind {
            BindingKind::Type => self.type_name.clone(),
            _ => format!("{}::{}", self.type_name, self.member),
        }
    }
}

/// Declared bindings and their resolved members.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    declared: Vec<BindingKey>,
    resolved: DashMap<BindingKey, Member>,
}

impl BindingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        BindingRegistry::default()
    }

    /// Declares a binding. `member` is ignored for [`BindingKind::Type`].
    pub fn declare(&mut self, kind: BindingKind, type_name: &str, member: &str) -> &mut Self {
        let member = if kind == BindingKind::Type { "" } else { member };
        let key = BindingKey::new(kind, type_name, member);
        if !self.declared.contains(&key) {
            self.declared.push(key);
        }
        self
    }

    /// Number of declared bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.declared.len()
    }

    /// `true` if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Resolves every declared binding against `module`.
    ///
    /// Names are looked up in the module, then the found token goes through a
    /// [`ModuleResolver`] like a token read from a body would.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`], [`Error::MethodNotFound`] or
    /// [`Error::FieldNotFound`] for the first binding that does not exist.
    pub fn resolve(&self, module: &Module) -> Result<()> {
        let resolver = ModuleResolver::new(module);

        for key in &self.declared {
            let token = match key.kind {
                BindingKind::Type => module.find_type(&key.type_name).map(|ty| ty.token),
                BindingKind::Method => module
                    .find_method(&key.type_name, &key.member)
                    .map(|method| method.token),
                BindingKind::Field => module
                    .find_field(&key.type_name, &key.member)
                    .map(|field| field.token),
            };

            let member = token
                .and_then(|token| resolver.resolve_member(token))
                .ok_or_else(|| not_found(key))?;
            debug!("Bound {} {}", key.kind, key.describe());
            self.resolved.insert(key.clone(), member);
        }
        Ok(())
    }

    /// The resolved member of a binding.
    ///
    /// # Errors
    /// Returns the matching not-found error if the binding was not resolved.
    pub fn get(&self, kind: BindingKind, type_name: &str, member: &str) -> Result<Member> {
        let member = if kind == BindingKind::Type { "" } else { member };
        let key = BindingKey::new(kind, type_name, member);
        self.resolved
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(&key))
    }

    /// The resolved method `type_name::name`.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotFound`] if the binding was not resolved.
    pub fn method(&self, type_name: &str, name: &str) -> Result<MethodHandle> {
        match self.get(BindingKind::Method, type_name, name)? {
            Member::Method(method) => Ok(method),
            _ => Err(Error::MethodNotFound(format!("{type_name}::{name}"))),
        }
    }

    /// The resolved field `type_name::name`.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if the binding was not resolved.
    pub fn field(&self, type_name: &str, name: &str) -> Result<FieldHandle> {
        match self.get(BindingKind::Field, type_name, name)? {
            Member::Field(field) => Ok(field),
            _ => Err(Error::FieldNotFound(format!("{type_name}::{name}"))),
        }
    }

    /// The resolved type `full_name`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the binding was not resolved.
    pub fn ty(&self, full_name: &str) -> Result<TypeHandle> {
        match self.get(BindingKind::Type, full_name, "")? {
            Member::Type(ty) => Ok(ty),
            _ => Err(Error::TypeNotFound(full_name.to_string())),
        }
    }
}

fn not_found(key: &BindingKey) -> Error {
    match key.kind {
        BindingKind::Type => Error::TypeNotFound(key.describe()),
        BindingKind::Method => Error::MethodNotFound(key.describe()),
        BindingKind::Field => Error::FieldNotFound(key.describe()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::signatures::TypeSignature,
        runtime::{MethodBuilder, Runtime, RuntimeConfig},
    };

    #[test]
    fn resolves_all_kinds() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let ty = runtime.define_type("Game", "Player", None).unwrap();
        runtime
            .define_field(&ty, "health", TypeSignature::I4, false)
            .unwrap();
        runtime.define_method(MethodBuilder::new(&ty, "Jump")).unwrap();

        let mut bindings = BindingRegistry::new();
        bindings
            .declare(BindingKind::Type, "Game.Player", "ignored")
            .declare(BindingKind::Method, "Game.Player", "Jump")
            .declare(BindingKind::Field, "Game.Player", "health")
            .declare(BindingKind::Method, "Game.Player", "Jump");
        assert_eq!(bindings.len(), 3);

        bindings.resolve(runtime.module()).unwrap();
        assert_eq!(bindings.ty("Game.Player").unwrap().token, ty.token);
        assert_eq!(bindings.field("Game.Player", "health").unwrap().name, "health");
        assert!(matches!(
            bindings.method("Game.Player", "Run"),
            Err(Error::MethodNotFound(_))
        ));
    }

    #[test]
    fn missing_member_fails_resolution() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let mut bindings = BindingRegistry::new();
        bindings.declare(BindingKind::Field, "Game.World", "gravity");

        match bindings.resolve(runtime.module()) {
            Err(Error::FieldNotFound(name)) => assert_eq!(name, "Game.World::gravity"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn kind_names() {
        assert_eq!(BindingKind::Method.to_string(), "method");
        assert_eq!("field".parse::<BindingKind>().unwrap(), BindingKind::Field);
    }
}
