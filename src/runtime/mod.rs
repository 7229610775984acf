//! The host model patches are applied to.
//!
//! A [`Runtime`] bundles what a running process offers to a patching engine: a [`Module`]
//! holding type, field and method definitions, a [`CodeHeap`] in which every method body
//! lives at a concrete entry address, and an interpreter that runs those bodies. Every call
//! goes through the entry address, so a trampoline written there redirects callers just
//! like it would in native code.
//!
//! # Key Types
//! - [`Runtime`] - Module, code heap and interpreter
//! - [`Module`] - Definitions and token tables
//! - [`CodeHeap`] - Addressable code region
//! - [`DynamicMethod`] / [`Artifact`] - Generated bodies and their pins
//! - [`Value`] - Interpreter values
//! - [`BindingRegistry`] - Named host members resolved at startup
//!
//! # Example
//! ```rust
//! use dotpatch::assembly::InstructionAssembler;
//! use dotpatch::metadata::signatures::TypeSignature;
//! use dotpatch::runtime::{MethodBuilder, Runtime, RuntimeConfig, Value};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let ty = runtime.define_type("App", "Math", None)?;
//! let twice = runtime.define_method(
//!     MethodBuilder::new(&ty, "Twice")
//!         .param("x", TypeSignature::I4)
//!         .returns(TypeSignature::I4),
//! )?;
//!
//! let body = InstructionAssembler::new()
//!     .ldarg(0)
//!     .ldc_i4(2)
//!     .op(dotpatch::assembly::OpCode::Mul)
//!     .ret()
//!     .finish()?;
//! runtime.implement(&twice, Vec::new(), &body)?;
//!
//! assert_eq!(runtime.invoke(&twice, vec![Value::I4(21)])?, Some(Value::I4(42)));
//! # Ok::<(), dotpatch::Error>(())
//! ```

pub mod bindings;
mod codeheap;
mod config;
pub(crate) mod dynamic;
mod interpreter;
mod module;
mod value;

use std::sync::Arc;

use log::debug;

use crate::{
    assembly::{encode_method, EncodeOptions, Instruction, ModuleTokens},
    metadata::signatures::TypeSignature,
    Error, Result,
};

pub use bindings::{BindingKind, BindingRegistry};
pub use codeheap::{CodeHeap, MIN_PATCH_SITE};
pub use config::{RuntimeConfig, DEFAULT_CODE_BASE};
pub use dynamic::{Artifact, DynamicEntry, DynamicMethod, DynamicTokenTable};
pub use module::{
    FieldDef, FieldHandle, MethodBuilder, MethodDef, MethodHandle, Module, NativeFn, ParamDef,
    TypeDef, TypeHandle,
};
pub use value::{load, new_slot, store, Object, ObjectRef, Slot, Value};

use interpreter::Interpreter;

/// Types every runtime defines.
#[derive(Debug, Clone)]
pub(crate) struct CoreTypes {
    pub(crate) object: TypeHandle,
    pub(crate) exception: TypeHandle,
    pub(crate) message: FieldHandle,
    pub(crate) divide_by_zero: TypeHandle,
    pub(crate) null_reference: TypeHandle,
    pub(crate) invalid_cast: TypeHandle,
}

impl CoreTypes {
    fn define(module: &Module) -> Result<Self> {
        let object = module.define_type("System", "Object", None)?;
        let exception = module.define_type("System", "Exception", Some(&object))?;
        let message = module.define_field(&exception, "_message", TypeSignature::String, false)?;

        let field = message.token;
        module.define_method(
            MethodBuilder::new(&exception, ".ctor")
                .instance()
                .param("message", TypeSignature::String)
                .native(move |args: &[Value]| {
                    if let (Some(Value::Object(this)), Some(text)) = (args.first(), args.get(1)) {
                        if let Some(slot) = this.field(field) {
                            store(slot, text.clone())?;
                        }
                    }
                    Ok(None)
                }),
        )?;

        Ok(CoreTypes {
            divide_by_zero: module.define_type(
                "System",
                "DivideByZeroException",
                Some(&exception),
            )?,
            null_reference: module.define_type(
                "System",
                "NullReferenceException",
                Some(&exception),
            )?,
            invalid_cast: module.define_type("System", "InvalidCastException", Some(&exception))?,
            object,
            exception,
            message,
        })
    }
}

/// A module, its code heap and an interpreter.
///
/// `System.Object`, `System.Exception` (with a `.ctor(string)`) and the exceptions raised by
/// the interpreter itself are defined on creation.
pub struct Runtime {
    config: RuntimeConfig,
    module: Module,
    heap: Arc<CodeHeap>,
    core: CoreTypes,
    interpreter: Interpreter,
}

impl Runtime {
    /// Creates a runtime with the core types defined.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if defining the core types fails.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let module = Module::new();
        let core = CoreTypes::define(&module)?;
        Ok(Runtime {
            heap: Arc::new(CodeHeap::new(config.code_base)),
            interpreter: Interpreter::new(&config),
            config,
            module,
            core,
        })
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The definition tables.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The code region.
    #[must_use]
    pub fn code_heap(&self) -> &Arc<CodeHeap> {
        &self.heap
    }

    /// `System.Object`.
    #[must_use]
    pub fn object_type(&self) -> &TypeHandle {
        &self.core.object
    }

    /// `System.Exception`.
    #[must_use]
    pub fn exception_type(&self) -> &TypeHandle {
        &self.core.exception
    }

    /// Defines a class deriving from `extends`, or from `System.Object` when `None`.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn define_type(
        &self,
        namespace: &str,
        name: &str,
        extends: Option<&TypeHandle>,
    ) -> Result<TypeHandle> {
        self.module
            .define_type(namespace, name, Some(extends.unwrap_or(&self.core.object)))
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
        self.module
            .define_field(declaring_type, name, signature, is_static)
    }

    /// Defines a method.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the definition lock is poisoned.
    pub fn define_method(&self, builder: MethodBuilder) -> Result<MethodHandle> {
        self.module.define_method(builder)
    }

    /// Compiles `body` into the code heap and makes it the entry of `method`.
    ///
    /// Returns the entry address.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyImplemented`] for native methods and methods that already
    /// have a body, or the encoder's error for an invalid body.
    pub fn implement(
        &self,
        method: &MethodHandle,
        locals: Vec<TypeSignature>,
        body: &[Instruction],
    ) -> Result<u64> {
        if method.is_native() || method.entry() != 0 {
            return Err(Error::AlreadyImplemented(method.full_name()));
        }

        let options = EncodeOptions::for_method(method, locals);
        let encoded = encode_method(body, &options, &mut ModuleTokens::new(&self.module))?;
        let address = self.heap.allocate_method(method.token, &encoded.body)?;
        method.set_entry(address)?;

        debug!(
            "Implemented {} at 0x{address:x} (code {} bytes, max stack {})",
            method.full_name(),
            encoded.code_size,
            encoded.max_stack
        );
        Ok(address)
    }

    /// Calls `method` through its entry address.
    ///
    /// Instance methods take `this` as first argument.
    ///
    /// # Errors
    /// Returns [`Error::UnhandledException`] when a managed exception escapes,
    /// [`Error::InvalidProgram`] for a wrong argument count or a broken body, and the limit
    /// errors of [`RuntimeConfig`].
    pub fn invoke(&self, method: &MethodHandle, args: Vec<Value>) -> Result<Option<Value>> {
        self.interpreter
            .invoke(&self.module, &self.heap, &self.core, method, args)
    }

    /// Frees generated code that is no longer pinned. Returns the number of freed blobs.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the heap lock is poisoned.
    pub fn collect(&self) -> Result<usize> {
        let freed = self.heap.collect()?;
        self.interpreter.evict(&freed);
        Ok(freed.len())
    }
}
