//! The interpreter proper: frames, protected-region dispatch and calls.

use super::error::VmError;
use super::intrinsics;
use super::value::{default_value, shared, Address, MoInstance, Object, Shared, TaskState, Value};
use super::Interceptor;
use crate::common::consts::{FIELD_CURRENT, METHOD_MOVE_NEXT, TYPE_EXCEPTION};
use crate::consts::{VM_MAX_DEPTH, VM_MAX_STEPS};
use crate::il::{FieldRef, HandlerKind, InstrId, Instruction, MethodHandle, MethodRef, Module, Op, Operand, TypeSig};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// What a host native returns: a value (or none) on success, an exception value on failure.
pub type NativeResult = std::result::Result<Option<Value>, Value>;

type Native = Rc<dyn Fn(&[Value]) -> NativeResult>;
type Factory = Rc<dyn Fn(&[Value]) -> Box<dyn Interceptor>>;

/// How a call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),
    Threw(Value),
}

impl Outcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Returned(value) => value.as_ref(),
            Outcome::Threw(_) => None,
        }
    }

    pub fn exception(&self) -> Option<&Value> {
        match self {
            Outcome::Threw(exception) => Some(exception),
            Outcome::Returned(_) => None,
        }
    }
}

/// Construction counters and executed instruction count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub contexts_created: usize,
    pub interceptors_created: usize,
    pub steps: u64,
}

/// Abrupt completion of interpreted code.
pub(super) enum Unwind {
    Throw(Value),
    Fault(VmError),
}

impl From<VmError> for Unwind {
    fn from(error: VmError) -> Self {
        Unwind::Fault(error)
    }
}

pub(super) type Exec<T> = std::result::Result<T, Unwind>;

/// A protected region resolved to instruction positions.
struct Region {
    try_start: usize,
    try_end: usize,
    handler_start: usize,
    handler_end: usize,
    catch_type: String,
}

impl Region {
    fn protects(&self, pc: usize) -> bool {
        (self.try_start..self.try_end).contains(&pc)
    }

    fn in_handler(&self, pc: usize) -> bool {
        (self.handler_start..self.handler_end).contains(&pc)
    }

    fn catches(&self, exception: &Value) -> bool {
        self.catch_type == TYPE_EXCEPTION || self.catch_type == "System.Object" || exception.type_name() == self.catch_type
    }
}

/// A method body flattened for execution.
struct Code {
    name: String,
    instrs: Vec<Instruction>,
    index: HashMap<InstrId, usize>,
    /// Innermost first.
    regions: Vec<Region>,
    variables: Vec<TypeSig>,
    returns_value: bool,
}

impl Code {
    fn compile(module: &Module, handle: MethodHandle) -> Result<Self, VmError> {
        let name = module.method_full_name(handle);
        let method = module.method(handle);
        let body = method
            .body
            .as_ref()
            .ok_or_else(|| VmError::malformed(&name, "method has no body"))?;

        let mut instrs = Vec::with_capacity(body.instructions.len());
        let mut index = HashMap::with_capacity(body.instructions.len());
        for (pos, (id, instr)) in body.instructions.iter().enumerate() {
            index.insert(id, pos);
            instrs.push(instr.clone());
        }
        let at = |id: InstrId| {
            index
                .get(&id)
                .copied()
                .ok_or_else(|| VmError::malformed(&name, format!("handler refers to unlinked {}", id)))
        };

        let mut regions = Vec::with_capacity(body.handlers.len());
        for handler in &body.handlers {
            let catch_type = match &handler.kind {
                HandlerKind::Catch(ty) => ty.full_name(),
                kind => return Err(VmError::unsupported(format!("{:?} region in {}", kind, name))),
            };
            regions.push(Region {
                try_start: at(handler.try_start)?,
                try_end: at(handler.try_end)?,
                handler_start: at(handler.handler_start)?,
                handler_end: match handler.handler_end {
                    Some(id) => at(id)?,
                    None => instrs.len(),
                },
                catch_type,
            });
        }
        regions.sort_by_key(|r| r.try_end - r.try_start);

        Ok(Self {
            name,
            instrs,
            index,
            regions,
            variables: body.variables.clone(),
            returns_value: !method.return_type.is_void() && !method.is_ctor(),
        })
    }

    fn target(&self, instr: &Instruction) -> Result<usize, VmError> {
        instr
            .branch_target()
            .and_then(|id| self.index.get(&id).copied())
            .ok_or_else(|| VmError::malformed(&self.name, format!("{} without a linked target", instr.op)))
    }
}

struct Frame {
    args: Vec<Shared<Value>>,
    locals: Vec<Shared<Value>>,
    stack: Vec<Value>,
    /// Exceptions being handled, with the region whose handler is running.
    caught: Vec<(usize, Value)>,
}

impl Frame {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < count {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn arg(&self, instr: &Instruction) -> Result<&Shared<Value>, VmError> {
        instr
            .arg_index()
            .and_then(|i| self.args.get(i as usize))
            .ok_or_else(|| VmError::unsupported(format!("argument slot of {:?}", instr)))
    }

    fn local(&self, instr: &Instruction) -> Result<&Shared<Value>, VmError> {
        instr
            .local_index()
            .and_then(|i| self.locals.get(i as usize))
            .ok_or_else(|| VmError::unsupported(format!("local slot of {:?}", instr)))
    }
}

enum Flow {
    Next,
    Jump(usize),
    Leave(usize),
    Return(Option<Value>),
    Throw(Value),
}

/// Executes methods of one module.
pub struct Vm {
    module: Module,
    code: HashMap<MethodHandle, Rc<Code>>,
    natives: HashMap<String, Native>,
    interceptors: HashMap<String, Factory>,
    statics: HashMap<String, Value>,
    scheduled: VecDeque<Value>,
    pub(super) stats: Stats,
    depth: usize,
    max_steps: u64,
}

impl Vm {
    pub fn new(module: Module) -> Self {
        Self {
            module,
            code: HashMap::new(),
            natives: HashMap::new(),
            interceptors: HashMap::new(),
            statics: HashMap::new(),
            scheduled: VecDeque::new(),
            stats: Stats::default(),
            depth: 0,
            max_steps: VM_MAX_STEPS,
        }
    }

    pub fn with_step_limit(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Implement `Type::Method` on the host side.
    pub fn register_native(&mut self, name: impl Into<String>, native: impl Fn(&[Value]) -> NativeResult + 'static) {
        self.natives.insert(name.into(), Rc::new(native));
    }

    /// `newobj` of `type_name` constructs the interceptor returned by `factory`.
    pub fn register_interceptor(
        &mut self,
        type_name: impl Into<String>,
        factory: impl Fn(&[Value]) -> Box<dyn Interceptor> + 'static,
    ) {
        self.interceptors.insert(type_name.into(), Rc::new(factory));
    }

    /// Call the method named `method` on `type_name`; `args` include `this` for instance methods.
    pub fn call(&mut self, type_name: &str, method: &str, args: Vec<Value>) -> Result<Outcome, VmError> {
        let handle = self
            .module
            .find_method(type_name, method)
            .ok_or_else(|| VmError::unknown_member(format!("{}::{}", type_name, method)))?;
        settle(self.execute_method(handle, args))
    }

    /// Virtual call on a module object.
    pub fn call_virtual(&mut self, receiver: &Value, method: &str, args: Vec<Value>) -> Result<Outcome, VmError> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(receiver.clone());
        all.extend(args);
        let handle = self
            .resolve_virtual(receiver, method, all.len() - 1)
            .ok_or_else(|| VmError::unknown_member(format!("{}::{}", receiver.type_name(), method)))?;
        settle(self.execute_method(handle, all))
    }

    /// Resume queued state machines until none are left.
    pub fn run_scheduled(&mut self) -> Result<usize, VmError> {
        let mut resumed = 0;
        while let Some(machine) = self.scheduled.pop_front() {
            match self.resume(&machine) {
                Ok(_) => resumed += 1,
                Err(Unwind::Throw(exception)) => return Err(VmError::unhandled(&exception)),
                Err(Unwind::Fault(error)) => return Err(error),
            }
        }
        Ok(resumed)
    }

    /// Drive all scheduled work and report how the task ended.
    pub fn await_task(&mut self, task: &Value) -> Result<Outcome, VmError> {
        self.run_scheduled()?;
        let Value::Task(state) = task else {
            return Err(VmError::type_mismatch("task", task));
        };
        let state = state.borrow();
        match &*state {
            TaskState::Pending => Err(VmError::Pending),
            TaskState::Completed(Value::Null) => Ok(Outcome::Returned(None)),
            TaskState::Completed(value) => Ok(Outcome::Returned(Some(value.clone()))),
            TaskState::Faulted(exception) => Ok(Outcome::Threw(exception.clone())),
        }
    }

    /// Step an enumerator to the end, collecting `current` after every successful step.
    /// The outcome is that of the final step.
    pub fn drain_enumerator(&mut self, enumerator: &Value) -> Result<(Vec<Value>, Outcome), VmError> {
        let mut items = Vec::new();
        loop {
            let outcome = self.call_virtual(enumerator, METHOD_MOVE_NEXT, vec![])?;
            match outcome.value() {
                Some(more) if more.is_truthy() => items.push(self.field(enumerator, FIELD_CURRENT).unwrap_or_default()),
                _ => return Ok((items, outcome)),
            }
        }
    }

    /// Step an async enumerator to the end through its value-or-end promise `promise`.
    pub fn drain_async_enumerator(
        &mut self,
        enumerator: &Value,
        promise: &str,
    ) -> Result<(Vec<Value>, Outcome), VmError> {
        let mut items = Vec::new();
        loop {
            if let Outcome::Threw(exception) = self.call_virtual(enumerator, METHOD_MOVE_NEXT, vec![])? {
                return Err(VmError::unhandled(&exception));
            }
            self.run_scheduled()?;
            let state = self
                .take_promise(enumerator, promise)
                .ok_or_else(|| VmError::unknown_member(promise.to_string()))?;
            match state {
                TaskState::Pending => return Err(VmError::Pending),
                TaskState::Completed(more) if more.is_truthy() => {
                    items.push(self.field(enumerator, FIELD_CURRENT).unwrap_or_default())
                }
                TaskState::Completed(end) => return Ok((items, Outcome::Returned(Some(end)))),
                TaskState::Faulted(exception) => return Ok((items, Outcome::Threw(exception))),
            }
        }
    }

    pub fn field(&self, object: &Value, name: &str) -> Option<Value> {
        match object.deref() {
            Value::Object(o) => o.borrow().fields.get(name).cloned(),
            _ => None,
        }
    }

    /// Read a promise field's state and reset it for the next step.
    pub fn take_promise(&self, object: &Value, name: &str) -> Option<TaskState> {
        match self.field(object, name)? {
            Value::Promise(state) => Some(std::mem::replace(&mut *state.borrow_mut(), TaskState::Pending)),
            _ => None,
        }
    }

    pub(super) fn schedule(&mut self, machine: Value) {
        self.scheduled.push_back(machine);
    }

    /// Run the step function of a state machine.
    pub(super) fn resume(&mut self, machine: &Value) -> Exec<Option<Value>> {
        let handle = self
            .resolve_virtual(machine, METHOD_MOVE_NEXT, 0)
            .ok_or_else(|| VmError::unknown_member(format!("{}::{}", machine.type_name(), METHOD_MOVE_NEXT)))?;
        self.execute_method(handle, vec![machine.clone()])
    }

    fn resolve_virtual(&self, receiver: &Value, name: &str, arity: usize) -> Option<MethodHandle> {
        let Value::Object(object) = receiver.deref() else {
            return None;
        };
        let class = object.borrow().class.clone();
        self.find_in_hierarchy(&class, name, arity, true)
    }

    fn find_in_hierarchy(&self, class: &str, name: &str, arity: usize, instance: bool) -> Option<MethodHandle> {
        for ty in self.module.hierarchy(class) {
            let found = ty
                .methods
                .iter()
                .position(|m| m.name == name && m.params.len() == arity && m.is_static != instance);
            if let Some(method_index) = found {
                let type_index = self.module.find_type(&ty.full_name)?;
                return Some(MethodHandle { type_index, method_index });
            }
        }
        None
    }

    fn compiled(&mut self, handle: MethodHandle) -> Result<Rc<Code>, VmError> {
        if let Some(code) = self.code.get(&handle) {
            return Ok(code.clone());
        }
        let code = Rc::new(Code::compile(&self.module, handle)?);
        self.code.insert(handle, code.clone());
        Ok(code)
    }

    fn execute_method(&mut self, handle: MethodHandle, args: Vec<Value>) -> Exec<Option<Value>> {
        let method = self.module.method(handle);
        if method.body.is_none() {
            if method.is_ctor() {
                return Ok(None);
            }
            return Err(VmError::unknown_member(self.module.method_full_name(handle)).into());
        }
        let code = self.compiled(handle)?;
        if self.depth >= VM_MAX_DEPTH {
            return Err(VmError::DepthLimit(VM_MAX_DEPTH).into());
        }
        self.depth += 1;
        let result = self.run(&code, args);
        self.depth -= 1;
        result
    }

    fn run(&mut self, code: &Code, args: Vec<Value>) -> Exec<Option<Value>> {
        let mut frame = Frame {
            args: args.into_iter().map(shared).collect(),
            locals: code.variables.iter().map(|ty| shared(default_value(ty))).collect(),
            stack: Vec::new(),
            caught: Vec::new(),
        };
        let mut pc = 0;
        loop {
            let instr = code
                .instrs
                .get(pc)
                .ok_or_else(|| VmError::malformed(&code.name, "execution ran past the last instruction"))?;
            self.stats.steps += 1;
            if self.stats.steps > self.max_steps {
                return Err(VmError::StepLimit(self.max_steps).into());
            }

            let flow = match self.step(code, &mut frame, instr) {
                Ok(flow) => flow,
                Err(Unwind::Throw(exception)) => Flow::Throw(exception),
                Err(fault) => return Err(fault),
            };
            pc = match flow {
                Flow::Next => pc + 1,
                Flow::Jump(target) => target,
                Flow::Leave(target) => {
                    frame.stack.clear();
                    frame
                        .caught
                        .retain(|(r, _)| !(code.regions[*r].in_handler(pc) && !code.regions[*r].in_handler(target)));
                    target
                }
                Flow::Return(value) => return Ok(value),
                Flow::Throw(exception) => {
                    let Some(region) = code.regions.iter().position(|r| r.protects(pc) && r.catches(&exception)) else {
                        log::trace!("{}: {} escapes", code.name, exception.type_name());
                        return Err(Unwind::Throw(exception));
                    };
                    let handler_start = code.regions[region].handler_start;
                    frame.caught.retain(|(r, _)| {
                        !(code.regions[*r].in_handler(pc) && !code.regions[*r].in_handler(handler_start))
                    });
                    frame.caught.push((region, exception.clone()));
                    frame.stack.clear();
                    frame.push(exception);
                    handler_start
                }
            };
        }
    }

    fn step(&mut self, code: &Code, frame: &mut Frame, instr: &Instruction) -> Exec<Flow> {
        let op = instr.op;
        match op.long_form() {
            Op::Nop => {}
            Op::Dup => {
                let top = frame.pop()?;
                frame.push(top.clone());
                frame.push(top);
            }
            Op::Pop => {
                frame.pop()?;
            }
            _ if op.is_ldarg() => {
                let value = frame.arg(instr)?.borrow().clone();
                frame.push(value);
            }
            _ if op.is_ldarga() => {
                let slot = frame.arg(instr)?.clone();
                frame.push(Value::Ref(Address::Slot(slot)));
            }
            _ if op.is_starg() => {
                let value = frame.pop()?;
                *frame.arg(instr)?.borrow_mut() = value;
            }
            _ if op.is_ldloc() => {
                let value = frame.local(instr)?.borrow().clone();
                frame.push(value);
            }
            _ if op.is_ldloca() => {
                let slot = frame.local(instr)?.clone();
                frame.push(Value::Ref(Address::Slot(slot)));
            }
            _ if op.is_stloc() => {
                let value = frame.pop()?;
                *frame.local(instr)?.borrow_mut() = value;
            }
            _ if op.is_ldc_i4() => {
                let value = instr
                    .i32_constant()
                    .ok_or_else(|| VmError::malformed(&code.name, "ldc.i4 without a constant"))?;
                frame.push(Value::I32(value));
            }
            Op::Ldnull => frame.push(Value::Null),
            Op::LdcI8 => match instr.operand {
                Operand::Int64(value) => frame.push(Value::I64(value)),
                _ => return Err(VmError::malformed(&code.name, "ldc.i8 without a constant").into()),
            },
            Op::Ldstr => match &instr.operand {
                Operand::String(s) => frame.push(Value::str(s)),
                _ => return Err(VmError::malformed(&code.name, "ldstr without a string").into()),
            },
            Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Shl | Op::ShrUn => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(arithmetic(op, &a, &b)?);
            }
            Op::Ceq => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(Value::bool(a.same(&b)));
            }
            Op::Cgt | Op::Clt => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(Value::bool(compare(op, &a, &b)?));
            }
            Op::ConvI4 => {
                let value = frame.pop()?.as_i64()?;
                frame.push(Value::I32(value as i32));
            }

            Op::Br => return Ok(Flow::Jump(code.target(instr)?)),
            Op::Brfalse | Op::Brtrue => {
                let value = frame.pop()?;
                if value.is_truthy() == (op.long_form() == Op::Brtrue) {
                    return Ok(Flow::Jump(code.target(instr)?));
                }
            }
            Op::Beq | Op::BneUn => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                if a.same(&b) == (op.long_form() == Op::Beq) {
                    return Ok(Flow::Jump(code.target(instr)?));
                }
            }
            Op::Bge | Op::Bgt | Op::Ble | Op::Blt => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                if compare(op.long_form(), &a, &b)? {
                    return Ok(Flow::Jump(code.target(instr)?));
                }
            }
            Op::Leave => return Ok(Flow::Leave(code.target(instr)?)),
            Op::Switch => {
                let index = frame.pop()?.as_i32()?;
                let Operand::Switch(targets) = &instr.operand else {
                    return Err(VmError::malformed(&code.name, "switch without targets").into());
                };
                if let Some(id) = usize::try_from(index).ok().and_then(|i| targets.get(i)) {
                    let target = code
                        .index
                        .get(id)
                        .copied()
                        .ok_or_else(|| VmError::malformed(&code.name, "switch to an unlinked instruction"))?;
                    return Ok(Flow::Jump(target));
                }
            }

            Op::Call | Op::Callvirt => {
                let method = method_operand(code, instr)?;
                let args = frame.pop_n(method.params.len() + method.has_this as usize)?;
                if let Some(result) = self.invoke(method, args, op == Op::Callvirt)? {
                    frame.push(result);
                }
            }
            Op::Newobj => {
                let method = method_operand(code, instr)?;
                let args = frame.pop_n(method.params.len())?;
                let object = self.construct(method, args)?;
                frame.push(object);
            }

            Op::Ldfld => {
                let field = field_operand(code, instr)?;
                let object = object_of(&frame.pop()?)?;
                let value = object.borrow().fields.get(&field.name).cloned();
                frame.push(value.unwrap_or_else(|| default_value(&field.field_type)));
            }
            Op::Ldflda => {
                let field = field_operand(code, instr)?;
                let object = object_of(&frame.pop()?)?;
                object
                    .borrow_mut()
                    .fields
                    .entry(field.name.clone())
                    .or_insert_with(|| default_value(&field.field_type));
                frame.push(Value::Ref(Address::Field(object, field.name.clone())));
            }
            Op::Stfld => {
                let field = field_operand(code, instr)?;
                let value = frame.pop()?;
                let object = object_of(&frame.pop()?)?;
                object.borrow_mut().fields.insert(field.name.clone(), value);
            }
            Op::Ldsfld => {
                let field = field_operand(code, instr)?;
                let value = self.statics.get(&static_key(field)).cloned();
                frame.push(value.unwrap_or_else(|| default_value(&field.field_type)));
            }
            Op::Stsfld => {
                let field = field_operand(code, instr)?;
                let value = frame.pop()?;
                self.statics.insert(static_key(field), value);
            }

            Op::Newarr => {
                let elem = type_operand(code, instr)?;
                let length = frame.pop()?.as_i32()?;
                let length = usize::try_from(length)
                    .map_err(|_| Unwind::Throw(Value::exception("System.OverflowException", "negative array size")))?;
                frame.push(Value::array(vec![default_value(elem); length]));
            }
            Op::Ldlen => {
                let items = array_of(&frame.pop()?)?;
                let length = items.borrow().len();
                frame.push(Value::I32(length as i32));
            }
            Op::LdelemRef => {
                let index = frame.pop()?.as_i32()?;
                let items = array_of(&frame.pop()?)?;
                let value = element(&items, index)?;
                frame.push(value);
            }
            Op::StelemRef => {
                let value = frame.pop()?;
                let index = frame.pop()?.as_i32()?;
                let items = array_of(&frame.pop()?)?;
                let slot = usize::try_from(index).ok().filter(|i| *i < items.borrow().len());
                match slot {
                    Some(i) => items.borrow_mut()[i] = value,
                    None => return Err(Unwind::Throw(index_out_of_range())),
                }
            }

            // boxes are the values themselves
            Op::Box | Op::Castclass | Op::Isinst => {}
            Op::UnboxAny => {
                let ty = type_operand(code, instr)?;
                let top = frame.stack.last().ok_or(VmError::StackUnderflow)?;
                if top.is_null() && !ty.accepts_null() {
                    return Err(Unwind::Throw(null_reference()));
                }
            }
            Op::Initobj => {
                let ty = type_operand(code, instr)?;
                let address = address_of(&frame.pop()?)?;
                address.store(default_value(ty));
            }
            Op::Ldobj | Op::LdindRef => {
                let address = address_of(&frame.pop()?)?;
                frame.push(address.load());
            }
            Op::Stobj | Op::StindRef => {
                let value = frame.pop()?;
                let address = address_of(&frame.pop()?)?;
                address.store(value);
            }
            Op::Ldtoken => match &instr.operand {
                Operand::Type(ty) => frame.push(Value::Type(ty.full_name())),
                Operand::Method(method) => frame.push(Value::Method(method.full_name())),
                _ => return Err(VmError::unsupported(format!("ldtoken {}", instr.operand)).into()),
            },

            Op::Throw => {
                let exception = frame.pop()?;
                if exception.is_null() {
                    return Err(Unwind::Throw(null_reference()));
                }
                return Err(Unwind::Throw(exception));
            }
            Op::Rethrow => {
                let (_, exception) = frame
                    .caught
                    .last()
                    .cloned()
                    .ok_or_else(|| VmError::malformed(&code.name, "rethrow outside a catch handler"))?;
                return Err(Unwind::Throw(exception));
            }
            Op::Ret => {
                let value = if code.returns_value { Some(frame.pop()?) } else { None };
                return Ok(Flow::Return(value));
            }
            other => return Err(VmError::unsupported(format!("opcode {}", other)).into()),
        }
        Ok(Flow::Next)
    }

    /// `call`/`callvirt`; `args` include the receiver for instance methods.
    fn invoke(&mut self, method: &MethodRef, args: Vec<Value>, virtual_call: bool) -> Exec<Option<Value>> {
        if method.has_this {
            let receiver = args.first().map(Value::deref).unwrap_or_default();
            if let Some(result) = intrinsics::instance_call(self, &receiver, method, &args[1..])? {
                return Ok(result);
            }
        }
        let name = method.full_name();
        if let Some(native) = self.natives.get(&name).cloned() {
            return native(&args).map_err(Unwind::Throw);
        }

        let mut handle = None;
        if virtual_call && method.has_this {
            handle = args.first().and_then(|this| self.resolve_virtual(this, &method.name, method.params.len()));
        }
        if handle.is_none() {
            let declaring = method.declaring.full_name();
            handle = self.find_in_hierarchy(&declaring, &method.name, method.params.len(), method.has_this);
        }
        if let Some(handle) = handle {
            return self.execute_method(handle, args);
        }

        match intrinsics::static_call(method, &args)? {
            Some(result) => Ok(result),
            None => Err(VmError::unknown_member(name).into()),
        }
    }

    /// `newobj`.
    fn construct(&mut self, ctor: &MethodRef, args: Vec<Value>) -> Exec<Value> {
        let type_name = ctor.declaring.full_name();
        if let Some(factory) = self.interceptors.get(&type_name).cloned() {
            self.stats.interceptors_created += 1;
            let interceptor = factory(&args);
            return Ok(Value::Mo(shared(MoInstance { type_name, interceptor })));
        }

        if self.module.find_type(&type_name).is_some() {
            let mut fields = HashMap::new();
            for ty in self.module.hierarchy(&type_name) {
                for field in ty.fields.iter().filter(|f| !f.is_static) {
                    fields.entry(field.name.clone()).or_insert_with(|| default_value(&field.ty));
                }
            }
            let object = Value::Object(shared(Object { class: type_name.clone(), fields }));
            if let Some(handle) = self.find_in_hierarchy(&type_name, &ctor.name, ctor.params.len(), true) {
                let mut all = Vec::with_capacity(args.len() + 1);
                all.push(object.clone());
                all.extend(args);
                self.execute_method(handle, all)?;
            }
            return Ok(object);
        }

        intrinsics::construct(self, &type_name, &args)?
            .ok_or_else(|| VmError::unknown_member(ctor.full_name()).into())
    }
}

fn settle(result: Exec<Option<Value>>) -> Result<Outcome, VmError> {
    match result {
        Ok(value) => Ok(Outcome::Returned(value)),
        Err(Unwind::Throw(exception)) => Ok(Outcome::Threw(exception)),
        Err(Unwind::Fault(error)) => Err(error),
    }
}

fn method_operand<'c>(code: &Code, instr: &'c Instruction) -> Result<&'c MethodRef, VmError> {
    instr
        .method()
        .ok_or_else(|| VmError::malformed(&code.name, format!("{} without a method operand", instr.op)))
}

fn field_operand<'c>(code: &Code, instr: &'c Instruction) -> Result<&'c FieldRef, VmError> {
    instr
        .field_ref()
        .ok_or_else(|| VmError::malformed(&code.name, format!("{} without a field operand", instr.op)))
}

fn type_operand<'c>(code: &Code, instr: &'c Instruction) -> Result<&'c TypeSig, VmError> {
    match &instr.operand {
        Operand::Type(ty) => Ok(ty),
        _ => Err(VmError::malformed(&code.name, format!("{} without a type operand", instr.op))),
    }
}

fn static_key(field: &FieldRef) -> String {
    format!("{}::{}", field.declaring.full_name(), field.name)
}

pub(super) fn null_reference() -> Value {
    Value::exception("System.NullReferenceException", "Object reference not set to an instance of an object.")
}

fn index_out_of_range() -> Value {
    Value::exception("System.IndexOutOfRangeException", "Index was outside the bounds of the array.")
}

fn object_of(value: &Value) -> Exec<Shared<Object>> {
    match value.deref() {
        Value::Object(object) => Ok(object),
        Value::Null => Err(Unwind::Throw(null_reference())),
        other => Err(VmError::type_mismatch("object", &other).into()),
    }
}

fn array_of(value: &Value) -> Exec<Shared<Vec<Value>>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Err(Unwind::Throw(null_reference())),
        other => Err(VmError::type_mismatch("array", other).into()),
    }
}

fn address_of(value: &Value) -> Exec<Address> {
    match value {
        Value::Ref(address) => Ok(address.clone()),
        Value::Null => Err(Unwind::Throw(null_reference())),
        other => Err(VmError::type_mismatch("address", other).into()),
    }
}

fn element(items: &Shared<Vec<Value>>, index: i32) -> Exec<Value> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.borrow().get(i).cloned())
        .ok_or_else(|| Unwind::Throw(index_out_of_range()))
}

fn arithmetic(op: Op, a: &Value, b: &Value) -> Result<Value, VmError> {
    if let (Value::I32(a), Value::I32(b)) = (a, b) {
        let (a, b) = (*a, *b);
        return Ok(Value::I32(match op {
            Op::Add => a.wrapping_add(b),
            Op::Sub => a.wrapping_sub(b),
            Op::Mul => a.wrapping_mul(b),
            Op::And => a & b,
            Op::Or => a | b,
            Op::Shl => a.wrapping_shl(b as u32),
            _ => ((a as u32).wrapping_shr(b as u32)) as i32,
        }));
    }
    let (a, b) = (a.as_i64()?, b.as_i64()?);
    Ok(Value::I64(match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::Mul => a.wrapping_mul(b),
        Op::And => a & b,
        Op::Or => a | b,
        Op::Shl => a.wrapping_shl(b as u32),
        _ => ((a as u64).wrapping_shr(b as u32)) as i64,
    }))
}

fn compare(op: Op, a: &Value, b: &Value) -> Result<bool, VmError> {
    let (a, b) = (a.as_i64()?, b.as_i64()?);
    Ok(match op {
        Op::Bge => a >= b,
        Op::Bgt | Op::Cgt => a > b,
        Op::Ble => a <= b,
        _ => a < b,
    })
}
