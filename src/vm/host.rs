use super::{HookResult, TaskState, Value};
use crate::il::MethodId;
use std::cell::RefCell;
use std::rc::Rc;

/// Arguments of one invocation, as seen (and rewritten) by hooks
///
/// Writes are tracked per argument so that woven code can copy back only what a hook changed.
#[derive(Debug)]
pub struct Arguments {
    values: Vec<Value>,
    modified: Vec<bool>,
    array_backed: bool,
}

impl Arguments {
    /// Fixed-arity container
    pub fn new(values: Vec<Value>) -> Arguments {
        let modified = vec![false; values.len()];
        Arguments {
            values,
            modified,
            array_backed: false,
        }
    }

    /// Container wrapping an object array
    pub fn from_array(values: Vec<Value>) -> Arguments {
        Arguments {
            array_backed: true,
            ..Arguments::new(values)
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the arguments were collected through an object array
    pub fn is_array_backed(&self) -> bool {
        self.array_backed
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Overwrite an argument, returning `false` if the index is out of range
    pub fn set(&mut self, idx: usize, value: Value) -> bool {
        match self.values.get_mut(idx) {
            Some(slot) => {
                *slot = value;
                self.modified[idx] = true;
                true
            }
            None => false,
        }
    }

    pub fn is_modified(&self, idx: usize) -> bool {
        self.modified.get(idx).copied().unwrap_or(false)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Execution context threaded through every hook of one invocation
#[derive(Debug)]
pub struct MethodExecutionArgs {
    /// Method identity (`Class::method`)
    pub method: String,

    /// Receiver, or `null` for static methods
    pub instance: Value,

    pub arguments: Rc<RefCell<Arguments>>,

    /// Value the method returns (hooks may replace it)
    pub return_value: Value,

    /// Value the iterator just produced (hooks may replace it)
    pub yield_value: Value,

    /// Exception the method failed with
    ///
    /// Replacing it has no effect: the original exception is the one that propagates.
    pub exception: Value,
}

impl MethodExecutionArgs {
    pub fn new(instance: Value, arguments: Rc<RefCell<Arguments>>) -> MethodExecutionArgs {
        MethodExecutionArgs {
            method: String::new(),
            instance,
            arguments,
            return_value: Value::Null,
            yield_value: Value::Null,
            exception: Value::Null,
        }
    }

    pub fn argument(&self, idx: usize) -> Option<Value> {
        self.arguments.borrow().get(idx).cloned()
    }

    pub fn argument_count(&self) -> usize {
        self.arguments.borrow().len()
    }

    pub fn set_argument(&mut self, idx: usize, value: Value) -> bool {
        self.arguments.borrow_mut().set(idx, value)
    }
}

/// Way back into the machine for the invoke hook
pub trait Invoker {
    /// Run `method` with `args`, passing `instance` as the receiver unless the method is static
    ///
    /// `Err` carries the exception the method threw.
    fn call(&mut self, method: MethodId, instance: &Value, args: Vec<Value>) -> Result<Value, Value>;
}

/// State of one intercepted invocation, shared by the woven code and the invoke hook
#[derive(Debug)]
pub struct Interception {
    /// Method identity (`Class::method`)
    pub method: String,

    /// Receiver, or `null` for static methods
    pub instance: Value,

    pub arguments: Rc<RefCell<Arguments>>,

    pub return_value: Value,

    /// Original logic of the intercepted method
    pub target: MethodId,

    /// Task of the original logic, once proceeding asynchronously
    pending: Option<Value>,
}

impl Interception {
    pub fn new(
        method: impl Into<String>,
        instance: Value,
        arguments: Rc<RefCell<Arguments>>,
        target: MethodId,
    ) -> Interception {
        Interception {
            method: method.into(),
            instance,
            arguments,
            return_value: Value::Null,
            target,
            pending: None,
        }
    }

    /// What the intercepted method returns
    ///
    /// After proceeding asynchronously (and not setting a return value since), that is the
    /// outcome of the original task.
    pub fn outcome(&self) -> Result<Value, Value> {
        match self.pending.as_ref().and_then(Value::task_state) {
            Some(TaskState::Completed(value)) => Ok(value),
            Some(TaskState::Faulted(exception)) => Err(exception),
            _ => Ok(self.return_value.clone()),
        }
    }
}

/// What the invoke hook sees of an intercepted invocation
pub struct MethodInterceptionArgs<'a> {
    state: &'a mut Interception,
    invoker: &'a mut dyn Invoker,
}

impl<'a> MethodInterceptionArgs<'a> {
    pub fn new(state: &'a mut Interception, invoker: &'a mut dyn Invoker) -> MethodInterceptionArgs<'a> {
        MethodInterceptionArgs { state, invoker }
    }

    pub fn method(&self) -> &str {
        &self.state.method
    }

    pub fn instance(&self) -> &Value {
        &self.state.instance
    }

    pub fn argument(&self, idx: usize) -> Option<Value> {
        self.state.arguments.borrow().get(idx).cloned()
    }

    pub fn argument_count(&self) -> usize {
        self.state.arguments.borrow().len()
    }

    pub fn arguments(&self) -> Vec<Value> {
        self.state.arguments.borrow().values().to_vec()
    }

    pub fn set_argument(&mut self, idx: usize, value: Value) -> bool {
        self.state.arguments.borrow_mut().set(idx, value)
    }

    pub fn return_value(&self) -> &Value {
        &self.state.return_value
    }

    pub fn set_return_value(&mut self, value: Value) {
        self.state.return_value = value;
        self.state.pending = None;
    }

    /// Run the original logic with the current arguments
    pub fn proceed(&mut self) -> HookResult {
        let args = self.arguments();
        self.invoke(args)
    }

    /// Run the original logic with `args`, keeping what it returns as the return value
    pub fn invoke(&mut self, args: Vec<Value>) -> HookResult {
        let value = self.invoker.call(self.state.target, &self.state.instance, args)?;
        self.set_return_value(value);
        Ok(())
    }

    /// Start the original asynchronous logic with the current arguments
    pub fn proceed_async(&mut self) -> Result<Value, Value> {
        let args = self.arguments();
        self.invoke_async(args)
    }

    /// Start the original asynchronous logic with `args`, returning its task
    ///
    /// Until a return value is set, the intercepted method returns whatever the task produces.
    pub fn invoke_async(&mut self, args: Vec<Value>) -> Result<Value, Value> {
        let task = self.invoker.call(self.state.target, &self.state.instance, args)?;
        self.state.return_value = Value::Null;
        self.state.pending = Some(task.clone());
        Ok(task)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writes_are_tracked() {
        let mut args = Arguments::new(vec![Value::I32(1), Value::str("a")]);
        assert!(!args.is_modified(0));
        assert!(args.set(1, Value::str("b")));
        assert!(!args.set(2, Value::Null));
        assert!(args.is_modified(1));
        assert!(!args.is_modified(0));
        assert!(!args.is_modified(7));
        assert_eq!(args.get(1), Some(&Value::str("b")));
    }

    /// Invoker recording the calls it gets and answering with the sum of the arguments
    #[derive(Default)]
    struct Summing {
        calls: Vec<(MethodId, Value, Vec<Value>)>,
    }

    impl Invoker for Summing {
        fn call(&mut self, method: MethodId, instance: &Value, args: Vec<Value>) -> Result<Value, Value> {
            let sum = args
                .iter()
                .map(|value| match value {
                    Value::I32(value) => Ok(*value),
                    _ => Err(Value::exception("not a number")),
                })
                .sum::<Result<i32, Value>>()?;
            self.calls.push((method, instance.clone(), args));
            Ok(Value::I32(sum))
        }
    }

    fn interception(values: Vec<Value>) -> Interception {
        let target = MethodId { class: crate::il::ClassId(0), index: 1 };
        Interception::new("Program::Add", Value::Null, Rc::new(RefCell::new(Arguments::new(values))), target)
    }

    #[test]
    fn proceeding_uses_current_arguments() {
        let mut state = interception(vec![Value::I32(1), Value::I32(2)]);
        let mut invoker = Summing::default();
        {
            let mut args = MethodInterceptionArgs::new(&mut state, &mut invoker);
            args.set_argument(1, Value::I32(5));
            args.proceed().unwrap();
            assert_eq!(args.return_value(), &Value::I32(6));
            args.invoke(vec![Value::I32(10), Value::I32(20)]).unwrap();
        }
        assert_eq!(state.outcome(), Ok(Value::I32(30)));
        assert_eq!(invoker.calls.len(), 2);
        assert_eq!(invoker.calls[0].2, vec![Value::I32(1), Value::I32(5)]);
        assert_eq!(invoker.calls[0].0, state.target);
    }

    #[test]
    fn failures_reach_the_hook() {
        let mut state = interception(vec![Value::str("x")]);
        let mut invoker = Summing::default();
        let mut args = MethodInterceptionArgs::new(&mut state, &mut invoker);
        let err = args.proceed().unwrap_err();
        assert_eq!(err.to_string(), "not a number");
        assert!(args.return_value().is_null());
    }
}
