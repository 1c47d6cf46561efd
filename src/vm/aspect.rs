use super::{MethodExecutionArgs, MethodInterceptionArgs, Value};
use crate::il::HookKind;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Outcome of a hook: `Err` carries an exception the hook throws
pub type HookResult = Result<(), Value>;

/// Lifecycle hooks of a hook descriptor
///
/// Every lifecycle hook defaults to doing nothing. Weaving only emits calls for the hooks a
/// descriptor declares, so overriding a hook here without declaring it in `.aspect` has no effect.
/// The invoke hooks are only called for `.intercept` descriptors, and default to running the
/// original logic unchanged.
#[allow(unused_variables)]
pub trait Aspect {
    fn on_entry(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        Ok(())
    }

    fn on_yield(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        Ok(())
    }

    fn on_resume(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        Ok(())
    }

    fn on_success(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        Ok(())
    }

    fn on_exception(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        Ok(())
    }

    fn on_exit(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        Ok(())
    }

    fn on_invoke(&mut self, args: &mut MethodInterceptionArgs) -> HookResult {
        args.proceed()
    }

    /// Invoke hook of asynchronous methods, returning the task the caller ends up awaiting
    fn on_invoke_async(&mut self, args: &mut MethodInterceptionArgs) -> Result<Value, Value> {
        args.proceed_async()
    }
}

/// Dispatch to the hook of the given kind
pub fn call_hook(aspect: &mut dyn Aspect, kind: HookKind, args: &mut MethodExecutionArgs) -> HookResult {
    match kind {
        HookKind::Entry => aspect.on_entry(args),
        HookKind::Yield => aspect.on_yield(args),
        HookKind::Resume => aspect.on_resume(args),
        HookKind::Success => aspect.on_success(args),
        HookKind::Exception => aspect.on_exception(args),
        HookKind::Exit => aspect.on_exit(args),
    }
}

/// Shared, append-only log of what ran (`@trace` writes to it, and so can hooks)
#[derive(Clone, Debug, Default)]
pub struct TraceLog(Rc<RefCell<Vec<String>>>);

impl TraceLog {
    pub fn new() -> TraceLog {
        TraceLog::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Entries separated by spaces
    pub fn joined(&self) -> String {
        self.0.borrow().join(" ")
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

type AspectFactory = Box<dyn Fn(&[Value], &TraceLog) -> Box<dyn Aspect>>;

/// Hook descriptor types the machine can instantiate, by name
#[derive(Default)]
pub struct AspectRegistry {
    factories: HashMap<String, AspectFactory>,
}

impl AspectRegistry {
    pub fn new() -> AspectRegistry {
        AspectRegistry::default()
    }

    /// Register a descriptor type, built from its constructor arguments
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&[Value], &TraceLog) -> Box<dyn Aspect> + 'static,
    {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    pub fn with<F>(mut self, type_name: impl Into<String>, factory: F) -> AspectRegistry
    where
        F: Fn(&[Value], &TraceLog) -> Box<dyn Aspect> + 'static,
    {
        self.register(type_name, factory);
        self
    }

    pub fn instantiate(&self, type_name: &str, args: &[Value], trace: &TraceLog) -> Option<Box<dyn Aspect>> {
        self.factories
            .get(type_name)
            .map(|factory| factory(args, trace))
    }
}
