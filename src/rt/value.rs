//! Runtime values of the reference interpreter.

use super::context::MethodContext;
use super::error::VmError;
use super::Interceptor;
use crate::common::consts::TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE;
use crate::il::TypeSig;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub type Shared<T> = Rc<RefCell<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Rc::new(RefCell::new(value))
}

/// Instance of a module type.
#[derive(Debug, Clone)]
pub struct Object {
    pub class: String,
    pub fields: HashMap<String, Value>,
}

/// A thrown exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionData {
    pub type_name: String,
    pub message: String,
}

/// Completion state of a task or a value-or-end promise.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Completed(Value),
    Faulted(Value),
}

/// An interceptor instance together with the type it was constructed as.
pub struct MoInstance {
    pub type_name: String,
    pub interceptor: Box<dyn Interceptor>,
}

/// Location behind a by-ref value.
#[derive(Clone)]
pub enum Address {
    Slot(Shared<Value>),
    Field(Shared<Object>, String),
    Element(Shared<Vec<Value>>, usize),
}

impl Address {
    pub fn load(&self) -> Value {
        match self {
            Address::Slot(slot) => slot.borrow().clone(),
            Address::Field(object, name) => object.borrow().fields.get(name).cloned().unwrap_or(Value::Null),
            Address::Element(items, index) => items.borrow().get(*index).cloned().unwrap_or(Value::Null),
        }
    }

    pub fn store(&self, value: Value) {
        match self {
            Address::Slot(slot) => *slot.borrow_mut() = value,
            Address::Field(object, name) => {
                object.borrow_mut().fields.insert(name.clone(), value);
            }
            Address::Element(items, index) => {
                if let Some(item) = items.borrow_mut().get_mut(*index) {
                    *item = value;
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    I32(i32),
    I64(i64),
    Str(Rc<str>),
    Object(Shared<Object>),
    Array(Shared<Vec<Value>>),
    Ref(Address),
    /// A `System.Type`, by full name.
    Type(String),
    /// A `MethodBase`, by full name.
    Method(String),
    Exception(Rc<ExceptionData>),
    Context(Shared<MethodContext>),
    Mo(Shared<MoInstance>),
    Task(Shared<TaskState>),
    /// Async method builder; shares its task.
    Builder(Shared<TaskState>),
    /// `Task.Yield()` awaitable and its awaiter.
    Awaiter,
    Promise(Shared<TaskState>),
    List(Shared<Vec<Value>>),
}

impl Value {
    pub fn str(text: &str) -> Self {
        Value::Str(Rc::from(text))
    }

    pub fn bool(value: bool) -> Self {
        Value::I32(value as i32)
    }

    pub fn exception(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Value::Exception(Rc::new(ExceptionData { type_name: type_name.into(), message: message.into() }))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(shared(items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            _ => true,
        }
    }

    pub fn as_i32(&self) -> Result<i32, VmError> {
        match self {
            Value::I32(v) => Ok(*v),
            Value::I64(v) => Ok(*v as i32),
            other => Err(VmError::type_mismatch("int32", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, VmError> {
        match self {
            Value::I32(v) => Ok(*v as i64),
            Value::I64(v) => Ok(*v),
            other => Err(VmError::type_mismatch("int64", other)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Follow a by-ref value to what it points at.
    pub fn deref(&self) -> Value {
        match self {
            Value::Ref(address) => address.load(),
            other => other.clone(),
        }
    }

    /// Elements of an array or list.
    pub fn items(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) | Value::List(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    pub fn exception_data(&self) -> Option<&ExceptionData> {
        match self {
            Value::Exception(data) => Some(data),
            _ => None,
        }
    }

    /// Runtime type name, as used for catch-clause matching and diagnostics.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::I32(_) => "System.Int32".into(),
            Value::I64(_) => "System.Int64".into(),
            Value::Str(_) => "System.String".into(),
            Value::Object(o) => o.borrow().class.clone(),
            Value::Array(_) => "System.Object[]".into(),
            Value::Ref(_) => "byref".into(),
            Value::Type(_) => "System.Type".into(),
            Value::Method(_) => "System.Reflection.MethodBase".into(),
            Value::Exception(e) => e.type_name.clone(),
            Value::Context(_) => crate::common::consts::TYPE_METHOD_CONTEXT.into(),
            Value::Mo(m) => m.borrow().type_name.clone(),
            Value::Task(_) => crate::common::consts::TYPE_TASK.into(),
            Value::Builder(_) => "builder".into(),
            Value::Awaiter => "awaiter".into(),
            Value::Promise(_) => TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE.into(),
            Value::List(_) => crate::common::consts::TYPE_OBJECT_LIST.into(),
        }
    }

    /// Identity for reference values, equality for scalars.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::I32(a), Value::I64(b)) | (Value::I64(b), Value::I32(a)) => *a as i64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Type(a), Value::Type(b)) | (Value::Method(a), Value::Method(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) | (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Context(a), Value::Context(b)) => Rc::ptr_eq(a, b),
            (Value::Mo(a), Value::Mo(b)) => Rc::ptr_eq(a, b),
            (Value::Task(a), Value::Task(b))
            | (Value::Builder(a), Value::Builder(b))
            | (Value::Promise(a), Value::Promise(b)) => Rc::ptr_eq(a, b),
            (Value::Awaiter, Value::Awaiter) => true,
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) | (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Exception(a), Value::Exception(b)) => a == b,
            _ => self.same(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}L", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Array(items) => f.debug_list().entries(items.borrow().iter()).finish(),
            Value::List(items) => write!(f, "List{:?}", items.borrow()),
            Value::Exception(e) => write!(f, "{}({:?})", e.type_name, e.message),
            Value::Type(name) => write!(f, "typeof({})", name),
            Value::Method(name) => write!(f, "method {}", name),
            Value::Task(state) | Value::Promise(state) | Value::Builder(state) => {
                write!(f, "{}<{:?}>", self.type_name(), state.borrow())
            }
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

/// Zero value of a slot of type `ty`.
pub fn default_value(ty: &TypeSig) -> Value {
    match ty {
        TypeSig::Bool | TypeSig::Int32 => Value::I32(0),
        TypeSig::Int64 => Value::I64(0),
        other if other.name_starts_with(&[TYPE_MANUAL_RESET_VALUE_TASK_SOURCE_CORE]) => {
            Value::Promise(shared(TaskState::Pending))
        }
        _ => Value::Null,
    }
}
