use super::{Aspect, Arguments, Interception, MethodExecutionArgs};
use crate::il::{ClassId, MethodId, Type};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Value manipulated by the machine
///
/// Booleans are `I32` (`0` or `1`). Value types are not wrapped when boxed: `box` only checks
/// that the value has the expected type, and `unbox.any` checks it back. Everything else is a
/// reference, compared by identity.
#[derive(Clone)]
pub enum Value {
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    Str(Rc<str>),
    Object(Rc<RefCell<Object>>),
    Array(Rc<RefCell<Vec<Value>>>),
    Arguments(Rc<RefCell<Arguments>>),
    Context(Rc<RefCell<MethodExecutionArgs>>),
    Interception(Rc<RefCell<Interception>>),
    Aspect(Rc<RefCell<Box<dyn Aspect>>>),

    /// Method handle pushed by `ldftn`
    Method(MethodId),
    Exception(Rc<Exception>),

    /// Task, also serving as its own awaiter
    Task(Rc<RefCell<Task>>),

    /// Completion builder of an asynchronous method (owns the task it completes)
    Builder(Rc<RefCell<Task>>),
}

/// Instance of a class defined in the module
#[derive(Debug)]
pub struct Object {
    pub class: ClassId,
    pub fields: Vec<Value>,
}

/// Exception raised by the machine itself or built with `@exception.new`
#[derive(Debug)]
pub struct Exception {
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum TaskState {
    Pending,
    Completed(Value),
    Faulted(Value),
}

/// Eventual result of an asynchronous operation
#[derive(Debug)]
pub struct Task {
    pub state: TaskState,

    /// State machines to step once the task is done
    pub(crate) continuations: Vec<Value>,
}

impl Task {
    pub fn pending() -> Task {
        Task {
            state: TaskState::Pending,
            continuations: vec![],
        }
    }

    pub fn completed(value: Value) -> Task {
        Task {
            state: TaskState::Completed(value),
            continuations: vec![],
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.state, TaskState::Pending)
    }
}

impl Value {
    pub fn str(value: &str) -> Value {
        Value::Str(Rc::from(value))
    }

    pub fn exception(message: impl Into<String>) -> Value {
        Value::Exception(Rc::new(Exception {
            message: message.into(),
        }))
    }

    /// Zero value of a type (what fields, locals, and array elements start as)
    pub fn default_of(ty: &Type) -> Value {
        match ty {
            Type::Bool | Type::I32 => Value::I32(0),
            Type::I64 => Value::I64(0),
            Type::F64 => Value::F64(0.0),
            _ => Value::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truth value, as tested by `brtrue`/`brfalse`
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(value) => *value != 0,
            Value::I64(value) => *value != 0,
            Value::F64(value) => *value != 0.0,
            _ => true,
        }
    }

    /// Does this value inhabit `ty`? (`null` inhabits every reference type)
    pub fn has_type(&self, ty: &Type) -> bool {
        match (ty, self) {
            (Type::Void, _) => false,
            (Type::Bool | Type::I32, Value::I32(_)) => true,
            (Type::I64, Value::I64(_)) => true,
            (Type::F64, Value::F64(_)) => true,
            (Type::Bool | Type::I32 | Type::I64 | Type::F64, _) => false,
            (_, Value::Null) => true,
            (Type::Object, _) => true,
            (Type::Str, Value::Str(_)) => true,
            (Type::ObjectArray, Value::Array(_)) => true,
            (Type::Class(class), Value::Object(object)) => object.borrow().class == *class,
            _ => false,
        }
    }

    /// State of a task (or of the task a builder completes)
    pub fn task_state(&self) -> Option<TaskState> {
        match self {
            Value::Task(task) | Value::Builder(task) => Some(task.borrow().state.clone()),
            _ => None,
        }
    }

    /// Reference identity for references, equality for everything else
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Arguments(a), Value::Arguments(b)) => Rc::ptr_eq(a, b),
            (Value::Context(a), Value::Context(b)) => Rc::ptr_eq(a, b),
            (Value::Interception(a), Value::Interception(b)) => Rc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => a == b,
            (Value::Aspect(a), Value::Aspect(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Task(a) | Value::Builder(a), Value::Task(b) | Value::Builder(b)) => {
                Rc::ptr_eq(a, b)
            }
            _ => false,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::F64(_) => "float64",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "object[]",
            Value::Arguments(_) => "arguments",
            Value::Context(_) => "context",
            Value::Interception(_) => "interception",
            Value::Method(_) => "method",
            Value::Aspect(_) => "aspect",
            Value::Exception(_) => "exception",
            Value::Task(_) => "task",
            Value::Builder(_) => "builder",
        }
    }
}

/// Strings compare by contents, everything else as in [`Value::same`]
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => self.same(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(value) => write!(f, "I32({})", value),
            Value::I64(value) => write!(f, "I64({})", value),
            Value::F64(value) => write!(f, "F64({})", value),
            Value::Str(value) => write!(f, "Str({:?})", value),
            Value::Exception(exception) => write!(f, "Exception({:?})", exception.message),
            Value::Task(task) => write!(f, "Task({:?})", task.borrow().state),
            other => f.write_str(other.kind()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(value) => write!(f, "{}", value),
            Value::I64(value) => write!(f, "{}", value),
            Value::F64(value) => write!(f, "{}", value),
            Value::Str(value) => f.write_str(value),
            Value::Exception(exception) => f.write_str(&exception.message),
            other => f.write_str(other.kind()),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Value {
        Value::I32(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::I32(value as i32)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::str(value)
    }
}
