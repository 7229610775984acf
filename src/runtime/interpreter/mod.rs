//! CIL interpreter of the runtime.
//!
//! Calls always enter through a method's entry address. Before decoding, the interpreter
//! looks at the first bytes there: if they hold a jump of any supported architecture it
//! follows it, the way a processor would run into an installed trampoline. Decoded bodies
//! are cached by address; code addresses are never reused, so a cached body stays valid
//! for as long as its address is reachable.
//!
//! Managed exceptions travel as [`Outcome::Threw`] between frames and become
//! [`Error::UnhandledException`] only when they leave the outermost call. Everything else
//! reported as an [`Error`] aborts the whole invocation.

mod ops;

use std::{collections::HashMap, ops::Range, sync::Arc};

use dashmap::DashMap;
use log::debug;

use crate::{
    assembly::{
        collect_regions, decode_method, ExceptionRegion, HandlerKind, Instruction, Label,
        OpCode, Operand,
    },
    metadata::{resolver::ModuleResolver, signatures::TypeSignature},
    patch::{decode_any, MAX_TRAMPOLINE_SIZE},
    runtime::{
        codeheap::BlobOwner,
        value::{load, new_slot, store, Object, ObjectRef, Slot},
        CodeHeap, CoreTypes, MethodDef, MethodHandle, Module, RuntimeConfig, TypeHandle, Value,
    },
    Error, Result,
};

use ops::{BinaryOp, CompareOp, ConversionType, UnaryOp};

/// Longest chain of jumps followed from one entry.
const MAX_JUMP_HOPS: usize = 8;

/// A decoded body ready for execution.
struct LoadedBody {
    method: MethodHandle,
    instructions: Vec<Instruction>,
    locals: Vec<TypeSignature>,
    regions: Vec<ExceptionRegion>,
    targets: HashMap<Label, usize>,
}

impl LoadedBody {
    fn target(&self, label: &Label) -> Result<usize> {
        self.targets.get(label).copied().ok_or_else(|| {
            Error::InvalidProgram(format!(
                "Label {label} in {} is not attached",
                self.method.full_name()
            ))
        })
    }
}

/// How a call ended.
pub(crate) enum Outcome {
    /// Normal return, with the value of non-void methods
    Returned(Option<Value>),
    /// A managed exception left the method
    Threw(ObjectRef),
}

enum StepResult {
    Continue,
    Branch(usize),
    Return(Option<Value>),
    Throw(ObjectRef),
    Leave(usize),
    EndFinally,
}

enum Exit {
    Return(Option<Value>),
    EndFinally,
    Throw(ObjectRef),
}

enum Dispatch {
    Handler(usize),
    Unhandled(ObjectRef),
}

struct Frame {
    args: Vec<Slot>,
    locals: Vec<Slot>,
    stack: Vec<Value>,
    exception: Option<ObjectRef>,
}

impl Frame {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| Error::InvalidProgram("Evaluation stack underflow".to_string()))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>> {
        let Some(split) = self.stack.len().checked_sub(count) else {
            return Err(Error::InvalidProgram(format!(
                "Call needs {count} arguments, stack holds {}",
                self.stack.len()
            )));
        };
        Ok(self.stack.split_off(split))
    }

    fn arg(&self, index: u16) -> Result<&Slot> {
        self.args
            .get(usize::from(index))
            .ok_or_else(|| Error::InvalidProgram(format!("Argument {index} does not exist")))
    }

    fn local(&self, index: u16) -> Result<&Slot> {
        self.locals
            .get(usize::from(index))
            .ok_or_else(|| Error::InvalidProgram(format!("Local {index} does not exist")))
    }
}

fn invalid_operand(instruction: &Instruction) -> Error {
    Error::InvalidProgram(format!(
        "'{}' has unexpected operand {}",
        instruction.opcode, instruction.operand
    ))
}

fn within(region: &ExceptionRegion, scope: &Range<usize>) -> bool {
    region.try_start >= scope.start && region.handler_end <= scope.end
}

/// Executes method bodies found in a [`CodeHeap`].
pub(crate) struct Interpreter {
    max_call_depth: usize,
    max_instructions: u64,
    cache: DashMap<u64, Arc<LoadedBody>>,
}

impl Interpreter {
    /// Creates an interpreter with the limits of `config`.
    pub(crate) fn new(config: &RuntimeConfig) -> Self {
        Interpreter {
            max_call_depth: config.max_call_depth,
            max_instructions: config.max_instructions,
            cache: DashMap::new(),
        }
    }

    /// Calls `method` with `args` (`this` first for instance methods).
    pub(crate) fn invoke(
        &self,
        module: &Module,
        heap: &CodeHeap,
        core: &CoreTypes,
        method: &MethodDef,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let mut machine = Machine {
            interpreter: self,
            module,
            heap,
            core,
            executed: 0,
        };

        match machine.call(method, args, 0)? {
            Outcome::Returned(value) => Ok(value),
            Outcome::Threw(exception) => Err(Error::UnhandledException {
                type_name: exception.ty().full_name(),
            }),
        }
    }

    /// Number of cached bodies.
    pub(crate) fn cached_bodies(&self) -> usize {
        self.cache.len()
    }

    /// Drops the cached bodies of freed code.
    pub(crate) fn evict(&self, addresses: &[u64]) {
        for address in addresses {
            self.cache.remove(address);
        }
    }
}

/// State of one top-level invocation.
struct Machine<'a> {
    interpreter: &'a Interpreter,
    module: &'a Module,
    heap: &'a CodeHeap,
    core: &'a CoreTypes,
    executed: u64,
}

impl Machine<'_> {
    fn call(&mut self, method: &MethodDef, args: Vec<Value>, depth: usize) -> Result<Outcome> {
        if depth > self.interpreter.max_call_depth {
            return Err(Error::CallDepthExceeded(self.interpreter.max_call_depth));
        }
        if args.len() != method.arg_count() {
            return Err(Error::InvalidProgram(format!(
                "{} takes {} arguments, got {}",
                method.full_name(),
                method.arg_count(),
                args.len()
            )));
        }

        if let Some(native) = &method.native {
            return native(&args).map(Outcome::Returned);
        }

        let entry = method.entry();
        if entry == 0 {
            return Err(Error::InvalidProgram(format!(
                "{} has no body",
                method.full_name()
            )));
        }

        let body = self.load(entry)?;
        self.execute(&body, args, depth)
    }

    fn resolve_entry(&self, entry: u64) -> Result<u64> {
        let mut address = entry;
        for _ in 0..MAX_JUMP_HOPS {
            let head = self.heap.read(address, MAX_TRAMPOLINE_SIZE)?;
            match decode_any(&head) {
                Some(target) => address = target,
                None => return Ok(address),
            }
        }
        Err(Error::InvalidProgram(format!(
            "Jump chain starting at 0x{entry:x} is too long"
        )))
    }

    fn load(&self, entry: u64) -> Result<Arc<LoadedBody>> {
        let address = self.resolve_entry(entry)?;
        if let Some(body) = self.interpreter.cache.get(&address) {
            return Ok(Arc::clone(body.value()));
        }

        let bytes = self.heap.read_blob(address)?;
        let (method, decoded) = match self.heap.owner(address) {
            Some(BlobOwner::Method(token)) => {
                let method = self
                    .module
                    .method_at(token)
                    .ok_or_else(|| Error::MethodNotFound(token.to_string()))?;
                let decoded = decode_method(&bytes, &ModuleResolver::new(self.module), &method)?;
                (method, decoded)
            }
            Some(BlobOwner::Dynamic(weak)) => {
                let artifact = weak.upgrade().ok_or_else(|| {
                    Error::InvalidProgram(format!("Code at 0x{address:x} was released"))
                })?;
                let generated = &artifact.method;
                let decoded = decode_method(&bytes, &generated.resolver(), generated.owner())?;
                (generated.owner().clone(), decoded)
            }
            None => {
                return Err(Error::InvalidProgram(format!(
                    "No method body at 0x{address:x}"
                )))
            }
        };

        let regions = collect_regions(&decoded.instructions)?;
        let mut targets = HashMap::new();
        for (index, instruction) in decoded.instructions.iter().enumerate() {
            for label in &instruction.labels {
                targets.insert(label.clone(), index);
            }
        }

        debug!(
            "Loaded {} at 0x{address:x} ({} instructions)",
            method.full_name(),
            decoded.instructions.len()
        );

        let body = Arc::new(LoadedBody {
            method,
            instructions: decoded.instructions,
            locals: decoded.locals,
            regions,
            targets,
        });
        self.interpreter.cache.insert(address, Arc::clone(&body));
        Ok(body)
    }

    fn execute(&mut self, body: &LoadedBody, args: Vec<Value>, depth: usize) -> Result<Outcome> {
        let mut frame = Frame {
            args: args.into_iter().map(new_slot).collect(),
            locals: body
                .locals
                .iter()
                .map(|ty| new_slot(Value::default_for(ty)))
                .collect(),
            stack: Vec::new(),
            exception: None,
        };

        let scope = 0..body.instructions.len();
        match self.run(body, &mut frame, 0, &scope, depth)? {
            Exit::Return(value) => Ok(Outcome::Returned(value)),
            Exit::Throw(exception) => Ok(Outcome::Threw(exception)),
            Exit::EndFinally => Err(Error::InvalidProgram(format!(
                "endfinally outside a handler in {}",
                body.method.full_name()
            ))),
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.executed += 1;
        let limit = self.interpreter.max_instructions;
        if limit > 0 && self.executed > limit {
            return Err(Error::InstructionLimitExceeded(limit));
        }
        Ok(())
    }

    /// Runs from `start` until the body returns, a handler ends, or an exception leaves
    /// `scope`.
    fn run(
        &mut self,
        body: &LoadedBody,
        frame: &mut Frame,
        start: usize,
        scope: &Range<usize>,
        depth: usize,
    ) -> Result<Exit> {
        let mut pc = start;
        loop {
            self.tick()?;
            let Some(instruction) = body.instructions.get(pc) else {
                return Err(Error::InvalidProgram(format!(
                    "{} runs past its last instruction",
                    body.method.full_name()
                )));
            };

            let dispatch = match self.step(body, frame, instruction, depth)? {
                StepResult::Continue => {
                    pc += 1;
                    continue;
                }
                StepResult::Branch(target) => {
                    pc = target;
                    continue;
                }
                StepResult::Return(value) => return Ok(Exit::Return(value)),
                StepResult::EndFinally => return Ok(Exit::EndFinally),
                StepResult::Leave(target) => self.leave(body, frame, pc, target, scope, depth)?,
                StepResult::Throw(exception) => {
                    self.dispatch(body, frame, pc, exception, scope, depth)?
                }
            };

            match dispatch {
                Dispatch::Handler(target) => pc = target,
                Dispatch::Unhandled(exception) => return Ok(Exit::Throw(exception)),
            }
        }
    }

    /// Finds the handler for `exception` thrown at `pc`, running finally and fault
    /// handlers on the way.
    fn dispatch(
        &mut self,
        body: &LoadedBody,
        frame: &mut Frame,
        pc: usize,
        mut exception: ObjectRef,
        scope: &Range<usize>,
        depth: usize,
    ) -> Result<Dispatch> {
        for region in &body.regions {
            if !region.try_contains(pc) || !within(region, scope) {
                continue;
            }

            match &region.kind {
                HandlerKind::Catch(ty) => {
                    if exception.ty().is_subclass_of(ty) {
                        frame.stack.clear();
                        frame.push(Value::Object(exception.clone()));
                        frame.exception = Some(exception);
                        return Ok(Dispatch::Handler(region.handler_start));
                    }
                }
                HandlerKind::Finally | HandlerKind::Fault => {
                    if let Some(replacement) = self.run_handler(body, frame, region, depth)? {
                        exception = replacement;
                    }
                }
            }
        }
        Ok(Dispatch::Unhandled(exception))
    }

    /// Runs the finally handlers between `pc` and the `leave` target.
    fn leave(
        &mut self,
        body: &LoadedBody,
        frame: &mut Frame,
        pc: usize,
        target: usize,
        scope: &Range<usize>,
        depth: usize,
    ) -> Result<Dispatch> {
        frame.stack.clear();

        let leaves_catch = body.regions.iter().any(|region| {
            matches!(region.kind, HandlerKind::Catch(_))
                && region.handler_contains(pc)
                && !region.handler_contains(target)
        });
        if leaves_catch {
            frame.exception = None;
        }

        for region in &body.regions {
            let exits = region.try_contains(pc) && !region.try_contains(target);
            if !exits || !matches!(region.kind, HandlerKind::Finally) || !within(region, scope) {
                continue;
            }

            if let Some(exception) = self.run_handler(body, frame, region, depth)? {
                return self.dispatch(body, frame, region.handler_start, exception, scope, depth);
            }
        }
        Ok(Dispatch::Handler(target))
    }

    /// Runs a finally or fault handler. Returns the exception that escaped it, if any.
    fn run_handler(
        &mut self,
        body: &LoadedBody,
        frame: &mut Frame,
        region: &ExceptionRegion,
        depth: usize,
    ) -> Result<Option<ObjectRef>> {
        frame.stack.clear();
        let scope = region.handler_start..region.handler_end;
        match self.run(body, frame, region.handler_start, &scope, depth)? {
            Exit::EndFinally => Ok(None),
            Exit::Throw(exception) => Ok(Some(exception)),
            Exit::Return(_) => Err(Error::InvalidProgram(format!(
                "ret inside a handler of {}",
                body.method.full_name()
            ))),
        }
    }

    fn raise(&self, ty: &TypeHandle, message: &str) -> Result<StepResult> {
        let object = Object::new(ty.clone(), &self.module.instance_fields(ty));
        if let Some(slot) = object.field(self.core.message.token) {
            store(slot, Value::string(message))?;
        }
        Ok(StepResult::Throw(Arc::new(object)))
    }

    fn null_reference(&self, opcode: OpCode) -> Result<StepResult> {
        self.raise(
            &self.core.null_reference,
            &format!("'{opcode}' on a null reference"),
        )
    }

    fn is_instance(&self, value: &Value, ty: &TypeHandle) -> bool {
        match value {
            Value::Object(object) => object.ty().is_subclass_of(ty),
            Value::Str(_) | Value::Handle(_) => ty.token == self.core.object.token,
            _ => false,
        }
    }

    fn invoke_from(
        &mut self,
        frame: &mut Frame,
        method: &MethodDef,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<StepResult> {
        match self.call(method, args, depth + 1)? {
            Outcome::Returned(value) => {
                if method.returns_value() {
                    let value = value.ok_or_else(|| {
                        Error::InvalidProgram(format!(
                            "{} returned without a value",
                            method.full_name()
                        ))
                    })?;
                    frame.push(value);
                }
                Ok(StepResult::Continue)
            }
            Outcome::Threw(exception) => Ok(StepResult::Throw(exception)),
        }
    }

    fn binary(&self, frame: &mut Frame, op: BinaryOp) -> Result<StepResult> {
        let right = frame.pop()?;
        let left = frame.pop()?;
        match ops::binary(op, &left, &right)? {
            Some(value) => {
                frame.push(value);
                Ok(StepResult::Continue)
            }
            None => self.raise(&self.core.divide_by_zero, "Attempted to divide by zero."),
        }
    }

    fn compare(frame: &mut Frame, op: CompareOp) -> Result<StepResult> {
        let right = frame.pop()?;
        let left = frame.pop()?;
        frame.push(Value::from_bool(ops::compare(op, &left, &right)?));
        Ok(StepResult::Continue)
    }

    fn branch_compare(frame: &mut Frame, op: CompareOp, target: usize) -> Result<StepResult> {
        let right = frame.pop()?;
        let left = frame.pop()?;
        if ops::compare(op, &left, &right)? {
            Ok(StepResult::Branch(target))
        } else {
            Ok(StepResult::Continue)
        }
    }

    fn convert(frame: &mut Frame, target: ConversionType) -> Result<StepResult> {
        let value = frame.pop()?;
        frame.push(ops::convert(target, &value)?);
        Ok(StepResult::Continue)
    }

    fn load_indirect(&self, frame: &mut Frame, opcode: OpCode) -> Result<StepResult> {
        match frame.pop()? {
            Value::Ref(slot) => {
                let value = load(&slot)?;
                frame.push(value);
                Ok(StepResult::Continue)
            }
            Value::Null => self.null_reference(opcode),
            other => Err(Error::InvalidProgram(format!(
                "'{opcode}' needs an address, found {other:?}"
            ))),
        }
    }

    fn store_indirect(&self, frame: &mut Frame, opcode: OpCode) -> Result<StepResult> {
        let value = frame.pop()?;
        match frame.pop()? {
            Value::Ref(slot) => {
                store(&slot, value)?;
                Ok(StepResult::Continue)
            }
            Value::Null => self.null_reference(opcode),
            other => Err(Error::InvalidProgram(format!(
                "'{opcode}' needs an address, found {other:?}"
            ))),
        }
    }

    fn instance_field(
        &self,
        receiver: Value,
        instruction: &Instruction,
    ) -> Result<std::result::Result<Slot, StepResult>> {
        let Operand::Field(field) = &instruction.operand else {
            return Err(invalid_operand(instruction));
        };

        match receiver {
            Value::Object(object) => object
                .field(field.token)
                .cloned()
                .map(Ok)
                .ok_or_else(|| {
                    Error::InvalidProgram(format!("{} has no field {field}", object.ty()))
                }),
            Value::Null => self.null_reference(instruction.opcode).map(Err),
            other => Err(Error::InvalidProgram(format!(
                "'{}' needs an object, found {other:?}",
                instruction.opcode
            ))),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        body: &LoadedBody,
        frame: &mut Frame,
        instruction: &Instruction,
        depth: usize,
    ) -> Result<StepResult> {
        let target = || match &instruction.operand {
            Operand::Target(label) => body.target(label),
            _ => Err(invalid_operand(instruction)),
        };

        match (instruction.opcode, &instruction.operand) {
            (OpCode::Nop, _) => {}
            (OpCode::Ldarg, Operand::Argument(arg)) => {
                let value = load(frame.arg(arg.index)?)?;
                frame.push(value);
            }
            (OpCode::Ldarga, Operand::Argument(arg)) => {
                let slot = frame.arg(arg.index)?.clone();
                frame.push(Value::Ref(slot));
            }
            (OpCode::Starg, Operand::Argument(arg)) => {
                let value = frame.pop()?;
                store(frame.arg(arg.index)?, value)?;
            }
            (OpCode::Ldloc, Operand::Local(local)) => {
                let value = load(frame.local(local.index)?)?;
                frame.push(value);
            }
            (OpCode::Ldloca, Operand::Local(local)) => {
                let slot = frame.local(local.index)?.clone();
                frame.push(Value::Ref(slot));
            }
            (OpCode::Stloc, Operand::Local(local)) => {
                let value = frame.pop()?;
                store(frame.local(local.index)?, value)?;
            }
            (OpCode::Ldnull, _) => frame.push(Value::Null),
            (OpCode::LdcI4, Operand::Int32(value)) => frame.push(Value::I4(*value)),
            (OpCode::LdcI8, Operand::Int64(value)) => frame.push(Value::I8(*value)),
            (OpCode::LdcR4, Operand::Float32(value)) => frame.push(Value::R8(f64::from(*value))),
            (OpCode::LdcR8, Operand::Float64(value)) => frame.push(Value::R8(*value)),
            (OpCode::Ldstr, Operand::String(value)) => frame.push(Value::Str(value.clone())),
            (OpCode::Ldtoken, Operand::Member(member)) => frame.push(Value::Handle(member.clone())),
            (OpCode::Dup, _) => {
                let value = frame.pop()?;
                frame.push(value.clone());
                frame.push(value);
            }
            (OpCode::Pop, _) => {
                frame.pop()?;
            }

            (OpCode::Call | OpCode::Callvirt, Operand::Method(method)) => {
                let args = frame.pop_n(method.arg_count())?;
                let null_receiver = !method.is_static && matches!(args.first(), Some(Value::Null));
                if instruction.opcode == OpCode::Callvirt && null_receiver {
                    return self.null_reference(instruction.opcode);
                }
                return self.invoke_from(frame, method, args, depth);
            }
            (OpCode::Newobj, Operand::Method(constructor)) => {
                let ty = &constructor.declaring_type;
                let object = Arc::new(Object::new(ty.clone(), &self.module.instance_fields(ty)));
                let mut args = frame.pop_n(constructor.params.len())?;
                args.insert(0, Value::Object(object.clone()));
                return match self.call(constructor, args, depth + 1)? {
                    Outcome::Returned(_) => {
                        frame.push(Value::Object(object));
                        Ok(StepResult::Continue)
                    }
                    Outcome::Threw(exception) => Ok(StepResult::Throw(exception)),
                };
            }
            (OpCode::Calli, _) => {
                return Err(Error::NotSupported(
                    "calli is not supported by the interpreter".to_string(),
                ))
            }
            (OpCode::Ret, _) => {
                let value = if body.method.returns_value() {
                    Some(frame.pop()?)
                } else {
                    None
                };
                return Ok(StepResult::Return(value));
            }

            (OpCode::Br, _) => return Ok(StepResult::Branch(target()?)),
            (OpCode::Brfalse, _) => {
                let target = target()?;
                if !frame.pop()?.is_truthy() {
                    return Ok(StepResult::Branch(target));
                }
            }
            (OpCode::Brtrue, _) => {
                let target = target()?;
                if frame.pop()?.is_truthy() {
                    return Ok(StepResult::Branch(target));
                }
            }
            (OpCode::Beq, _) => return Self::branch_compare(frame, CompareOp::Eq, target()?),
            (OpCode::Bge, _) => return Self::branch_compare(frame, CompareOp::Ge, target()?),
            (OpCode::Bgt, _) => return Self::branch_compare(frame, CompareOp::Gt, target()?),
            (OpCode::Ble, _) => return Self::branch_compare(frame, CompareOp::Le, target()?),
            (OpCode::Blt, _) => return Self::branch_compare(frame, CompareOp::Lt, target()?),
            (OpCode::BneUn, _) => return Self::branch_compare(frame, CompareOp::Ne, target()?),
            (OpCode::BgeUn, _) => return Self::branch_compare(frame, CompareOp::GeUn, target()?),
            (OpCode::BgtUn, _) => return Self::branch_compare(frame, CompareOp::GtUn, target()?),
            (OpCode::BleUn, _) => return Self::branch_compare(frame, CompareOp::LeUn, target()?),
            (OpCode::BltUn, _) => return Self::branch_compare(frame, CompareOp::LtUn, target()?),
            (OpCode::Switch, Operand::Switch(labels)) => {
                let selector = frame.pop()?;
                let index = selector
                    .as_i4()
                    .ok_or_else(|| Error::InvalidProgram(format!("switch on {selector:?}")))?;
                if let Some(label) = usize::try_from(index).ok().and_then(|i| labels.get(i)) {
                    return Ok(StepResult::Branch(body.target(label)?));
                }
            }
            (OpCode::Leave, _) => return Ok(StepResult::Leave(target()?)),
            (OpCode::Endfinally, _) => return Ok(StepResult::EndFinally),

            (
                OpCode::LdindI1
                | OpCode::LdindU1
                | OpCode::LdindI2
                | OpCode::LdindI4
                | OpCode::LdindI8
                | OpCode::LdindR8
                | OpCode::LdindRef,
                _,
            ) => return self.load_indirect(frame, instruction.opcode),
            (
                OpCode::StindRef
                | OpCode::StindI1
                | OpCode::StindI2
                | OpCode::StindI4
                | OpCode::StindI8
                | OpCode::StindR8,
                _,
            ) => return self.store_indirect(frame, instruction.opcode),

            (OpCode::Add, _) => return self.binary(frame, BinaryOp::Add),
            (OpCode::Sub, _) => return self.binary(frame, BinaryOp::Sub),
            (OpCode::Mul, _) => return self.binary(frame, BinaryOp::Mul),
            (OpCode::Div, _) => return self.binary(frame, BinaryOp::Div),
            (OpCode::DivUn, _) => return self.binary(frame, BinaryOp::DivUn),
            (OpCode::Rem, _) => return self.binary(frame, BinaryOp::Rem),
            (OpCode::RemUn, _) => return self.binary(frame, BinaryOp::RemUn),
            (OpCode::And, _) => return self.binary(frame, BinaryOp::And),
            (OpCode::Or, _) => return self.binary(frame, BinaryOp::Or),
            (OpCode::Xor, _) => return self.binary(frame, BinaryOp::Xor),
            (OpCode::Shl, _) => return self.binary(frame, BinaryOp::Shl),
            (OpCode::Shr, _) => return self.binary(frame, BinaryOp::Shr),
            (OpCode::ShrUn, _) => return self.binary(frame, BinaryOp::ShrUn),
            (OpCode::Neg | OpCode::Not, _) => {
                let op = if instruction.opcode == OpCode::Neg {
                    UnaryOp::Neg
                } else {
                    UnaryOp::Not
                };
                let value = frame.pop()?;
                frame.push(ops::unary(op, &value)?);
            }
            (OpCode::ConvI1, _) => return Self::convert(frame, ConversionType::I1),
            (OpCode::ConvI2, _) => return Self::convert(frame, ConversionType::I2),
            (OpCode::ConvI4, _) => return Self::convert(frame, ConversionType::I4),
            (OpCode::ConvI8, _) => return Self::convert(frame, ConversionType::I8),
            (OpCode::ConvR4, _) => return Self::convert(frame, ConversionType::R4),
            (OpCode::ConvR8, _) => return Self::convert(frame, ConversionType::R8),
            (OpCode::ConvU4, _) => return Self::convert(frame, ConversionType::U4),
            (OpCode::ConvU8, _) => return Self::convert(frame, ConversionType::U8),
            (OpCode::Ceq, _) => return Self::compare(frame, CompareOp::Eq),
            (OpCode::Cgt, _) => return Self::compare(frame, CompareOp::Gt),
            (OpCode::CgtUn, _) => return Self::compare(frame, CompareOp::GtUn),
            (OpCode::Clt, _) => return Self::compare(frame, CompareOp::Lt),
            (OpCode::CltUn, _) => return Self::compare(frame, CompareOp::LtUn),

            (OpCode::Castclass, Operand::Type(ty)) => {
                let value = frame.pop()?;
                if !matches!(value, Value::Null) && !self.is_instance(&value, ty) {
                    return self.raise(
                        &self.core.invalid_cast,
                        &format!("Unable to cast {value:?} to {ty}."),
                    );
                }
                frame.push(value);
            }
            (OpCode::Isinst, Operand::Type(ty)) => {
                let value = frame.pop()?;
                if self.is_instance(&value, ty) {
                    frame.push(value);
                } else {
                    frame.push(Value::Null);
                }
            }
            (OpCode::Box, _) => {}
            (OpCode::UnboxAny, _) => {
                if matches!(frame.stack.last(), Some(Value::Null)) {
                    return self.null_reference(instruction.opcode);
                }
            }
            (OpCode::Throw, _) => {
                return match frame.pop()? {
                    Value::Object(exception) => Ok(StepResult::Throw(exception)),
                    Value::Null => self.null_reference(instruction.opcode),
                    other => Err(Error::InvalidProgram(format!("throw of {other:?}"))),
                };
            }
            (OpCode::Rethrow, _) => {
                let exception = frame.exception.clone().ok_or_else(|| {
                    Error::InvalidProgram("rethrow outside a catch handler".to_string())
                })?;
                return Ok(StepResult::Throw(exception));
            }

            (OpCode::Ldfld | OpCode::Ldflda, _) => {
                let receiver = frame.pop()?;
                let slot = match self.instance_field(receiver, instruction)? {
                    Ok(slot) => slot,
                    Err(exception) => return Ok(exception),
                };
                if instruction.opcode == OpCode::Ldfld {
                    frame.push(load(&slot)?);
                } else {
                    frame.push(Value::Ref(slot));
                }
            }
            (OpCode::Stfld, _) => {
                let value = frame.pop()?;
                let receiver = frame.pop()?;
                match self.instance_field(receiver, instruction)? {
                    Ok(slot) => store(&slot, value)?,
                    Err(exception) => return Ok(exception),
                }
            }
            (OpCode::Ldsfld | OpCode::Ldsflda | OpCode::Stsfld, Operand::Field(field)) => {
                let slot = field.static_slot().cloned().ok_or_else(|| {
                    Error::InvalidProgram(format!("{field} is not a static field"))
                })?;
                match instruction.opcode {
                    OpCode::Ldsfld => frame.push(load(&slot)?),
                    OpCode::Ldsflda => frame.push(Value::Ref(slot)),
                    _ => {
                        let value = frame.pop()?;
                        store(&slot, value)?;
                    }
                }
            }

            _ => return Err(invalid_operand(instruction)),
        }

        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{InstructionAssembler, Label, OpCode},
        metadata::signatures::TypeSignature,
        runtime::{MethodBuilder, Runtime, RuntimeConfig, Value},
        Error,
    };

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn arithmetic_and_branches() {
        let runtime = runtime();
        let ty = runtime.define_type("App", "Math", None).unwrap();
        let abs = runtime
            .define_method(
                MethodBuilder::new(&ty, "Abs")
                    .param("x", TypeSignature::I4)
                    .returns(TypeSignature::I4),
            )
            .unwrap();

        let positive = Label::new();
        let body = InstructionAssembler::new()
            .ldarg(0)
            .ldc_i4(0)
            .branch(OpCode::Bge, &positive)
            .ldarg(0)
            .op(OpCode::Neg)
            .ret()
            .label(&positive)
            .ldarg(0)
            .ret()
            .finish()
            .unwrap();
        runtime.implement(&abs, Vec::new(), &body).unwrap();

        assert_eq!(
            runtime.invoke(&abs, vec![Value::I4(-7)]).unwrap(),
            Some(Value::I4(7))
        );
        assert_eq!(
            runtime.invoke(&abs, vec![Value::I4(3)]).unwrap(),
            Some(Value::I4(3))
        );
        assert_eq!(runtime.interpreter.cached_bodies(), 1);
    }

    #[test]
    fn divide_by_zero_is_a_managed_exception() {
        let runtime = runtime();
        let ty = runtime.define_type("App", "Math", None).unwrap();
        let div = runtime
            .define_method(
                MethodBuilder::new(&ty, "Div")
                    .param("a", TypeSignature::I4)
                    .param("b", TypeSignature::I4)
                    .returns(TypeSignature::I4),
            )
            .unwrap();
        let body = InstructionAssembler::new()
            .ldarg(0)
            .ldarg(1)
            .op(OpCode::Div)
            .ret()
            .finish()
            .unwrap();
        runtime.implement(&div, Vec::new(), &body).unwrap();

        match runtime.invoke(&div, vec![Value::I4(1), Value::I4(0)]) {
            Err(Error::UnhandledException { type_name }) => {
                assert_eq!(type_name, "System.DivideByZeroException");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn limits() {
        let runtime = Runtime::new(
            RuntimeConfig::default()
                .with_max_instructions(1_000)
                .with_max_call_depth(16),
        )
        .unwrap();
        let ty = runtime.define_type("App", "Loops", None).unwrap();

        let spin = runtime.define_method(MethodBuilder::new(&ty, "Spin")).unwrap();
        let top = Label::new();
        let body = InstructionAssembler::new()
            .label(&top)
            .branch(OpCode::Br, &top)
            .finish()
            .unwrap();
        runtime.implement(&spin, Vec::new(), &body).unwrap();
        assert!(matches!(
            runtime.invoke(&spin, Vec::new()),
            Err(Error::InstructionLimitExceeded(1_000))
        ));

        let recurse = runtime.define_method(MethodBuilder::new(&ty, "Recurse")).unwrap();
        let body = InstructionAssembler::new()
            .call(&recurse)
            .ret()
            .finish()
            .unwrap();
        runtime.implement(&recurse, Vec::new(), &body).unwrap();
        assert!(matches!(
            runtime.invoke(&recurse, Vec::new()),
            Err(Error::CallDepthExceeded(16))
        ));
    }

    #[test]
    fn arity_is_checked() {
        let runtime = runtime();
        let ty = runtime.define_type("App", "Host", None).unwrap();
        let run = runtime.define_method(MethodBuilder::new(&ty, "Run")).unwrap();
        let body = InstructionAssembler::new().ret().finish().unwrap();
        runtime.implement(&run, Vec::new(), &body).unwrap();

        assert!(matches!(
            runtime.invoke(&run, vec![Value::I4(1)]),
            Err(Error::InvalidProgram(_))
        ));
    }
}
