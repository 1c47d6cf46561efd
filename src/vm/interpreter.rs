use super::{
    call_hook, Arguments, Aspect, AspectRegistry, Interception, Invoker, MethodExecutionArgs,
    MethodInterceptionArgs, Object, Task, TaskState, TraceLog, Value, VmError,
};
use crate::il::{
    ClassId, InsnId, Instruction, Intrinsic, MethodId, MethodRef, Module, Opcode, Operand,
    RegionKind, RegionSpan, Type,
};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Deepest call stack before an invocation is abandoned
pub const MAX_CALL_DEPTH: usize = 64;

/// Method body laid out for execution
struct CompiledBody<'m> {
    name: String,
    insns: Vec<&'m Instruction>,
    positions: HashMap<InsnId, usize>,

    /// Regions, innermost first, with their positions resolved
    regions: Vec<(RegionSpan, &'m RegionKind)>,

    locals: Vec<Value>,
    returns: bool,
}

/// Work left to do once the current finally handler completes
enum Continuation {
    /// Branch to `target` (a `leave`)
    Leave {
        target: usize,
        finallies: VecDeque<usize>,
        active: Option<usize>,
    },

    /// Enter the `catch` handler or, if there is none, propagate out of the method
    Unwind {
        exception: Value,
        finallies: VecDeque<usize>,
        catch: Option<usize>,
        active: Option<usize>,
    },
}

impl Continuation {
    /// Region whose finally handler is running
    fn active(&self) -> Option<usize> {
        match self {
            Continuation::Leave { active, .. } | Continuation::Unwind { active, .. } => *active,
        }
    }
}

struct Frame<'m> {
    code: Rc<CompiledBody<'m>>,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    pc: usize,
    continuations: Vec<Continuation>,

    /// Exception being handled, by catch region
    caught: HashMap<usize, Value>,
}

enum Step {
    Next,
    Return(Value),
}

enum Job {
    /// Complete a task that was only waiting for the next tick
    Complete(Rc<RefCell<Task>>),

    /// Step a state machine whose awaited task completed
    Resume(Value),
}

fn thrown(message: &str) -> VmError {
    VmError::Thrown(Value::exception(message))
}

/// Calls the invoke hook makes into the machine
///
/// Faults of the machine itself are set aside here, to be reported once the hook returns, so a
/// hook can't mistake them for exceptions and swallow them.
struct Reentry<'v, 'm> {
    vm: &'v mut Vm<'m>,
    fault: Option<VmError>,
}

impl Invoker for Reentry<'_, '_> {
    fn call(&mut self, method: MethodId, instance: &Value, args: Vec<Value>) -> Result<Value, Value> {
        let mut full_args = vec![];
        if !self.vm.module.method(method).is_static() {
            full_args.push(instance.clone());
        }
        full_args.extend(args);
        match self.vm.invoke(method, full_args) {
            Ok(value) => Ok(value),
            Err(VmError::Thrown(exception)) => Err(exception),
            Err(err) => {
                let exception = Value::exception(err.to_string());
                self.fault.get_or_insert(err);
                Err(exception)
            }
        }
    }
}

/// Reference interpreter for modules
///
/// Executes one method at a time on the calling thread. Continuations of asynchronous methods
/// are queued and only run from [`Vm::run_until_idle`].
pub struct Vm<'m> {
    module: &'m Module,
    registry: AspectRegistry,
    trace: TraceLog,
    bodies: HashMap<MethodId, Rc<CompiledBody<'m>>>,
    jobs: VecDeque<Job>,
    depth: usize,
}

impl<'m> Vm<'m> {
    pub fn new(module: &'m Module, registry: AspectRegistry) -> Vm<'m> {
        Vm {
            module,
            registry,
            trace: TraceLog::new(),
            bodies: HashMap::new(),
            jobs: VecDeque::new(),
            depth: 0,
        }
    }

    /// Log written by `@trace` (and handed to every aspect the machine instantiates)
    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    /// Invoke a method (`args` includes the receiver of instance methods)
    pub fn invoke(&mut self, method: MethodId, args: Vec<Value>) -> Result<Value, VmError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow(MAX_CALL_DEPTH));
        }
        let code = self.compiled(method)?;
        let expected = self.module.method(method).arg_count();
        if args.len() != expected {
            return Err(VmError::fault(
                &code.name,
                format!("expected {} arguments, got {}", expected, args.len()),
            ));
        }

        self.depth += 1;
        let result = self.execute(code, args);
        self.depth -= 1;
        result
    }

    /// Invoke a method by class and method name
    pub fn invoke_named(&mut self, class: &str, method: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let id = self
            .module
            .find_class(class)
            .and_then(|class| self.module.find_method(class, method))
            .ok_or_else(|| VmError::fault("<host>", format!("no method `{}::{}`", class, method)))?;
        self.invoke(id, args)
    }

    /// Invoke a method of the receiver's class by name
    pub fn invoke_virtual(&mut self, receiver: &Value, method: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let class = match receiver {
            Value::Object(object) => object.borrow().class,
            Value::Null => return Err(thrown("NullReferenceException")),
            other => {
                return Err(VmError::fault(
                    "<host>",
                    format!("cannot call `{}` on {:?}", method, other),
                ))
            }
        };
        let id = self.module.find_method(class, method).ok_or_else(|| {
            VmError::fault(
                "<host>",
                format!("no method `{}::{}`", self.module.class(class).name, method),
            )
        })?;
        let mut full_args = vec![receiver.clone()];
        full_args.extend(args);
        self.invoke(id, full_args)
    }

    /// Read a field of an object by name
    pub fn field(&self, object: &Value, name: &str) -> Option<Value> {
        match object {
            Value::Object(object) => {
                let object = object.borrow();
                let field = self.module.find_field(object.class, name)?;
                object.fields.get(field.index as usize).cloned()
            }
            _ => None,
        }
    }

    /// Step an iterator record until it reports completion, collecting what it yields
    pub fn iterate(&mut self, iterator: &Value) -> Result<Vec<Value>, VmError> {
        let mut items = vec![];
        while self.invoke_virtual(iterator, "MoveNext", vec![])?.is_truthy() {
            let current = self.field(iterator, "<>2__current").ok_or_else(|| {
                VmError::fault("<host>", "iterator has no `<>2__current` field")
            })?;
            items.push(current);
        }
        Ok(items)
    }

    /// Run queued continuations until there are none left
    pub fn run_until_idle(&mut self) -> Result<(), VmError> {
        while let Some(job) = self.jobs.pop_front() {
            match job {
                Job::Complete(task) => {
                    self.complete("<scheduler>", &task, TaskState::Completed(Value::Null))?
                }
                Job::Resume(machine) => {
                    log::trace!("Resuming state machine");
                    self.invoke_virtual(&machine, "MoveNext", vec![])?;
                }
            }
        }
        Ok(())
    }

    fn compiled(&mut self, method: MethodId) -> Result<Rc<CompiledBody<'m>>, VmError> {
        if let Some(code) = self.bodies.get(&method) {
            return Ok(code.clone());
        }
        let module = self.module;
        let name = module.qualified_name(method);
        let signature = module.method(method);
        let body = signature
            .body
            .as_ref()
            .ok_or_else(|| VmError::fault(&name, "method has no body"))?;
        let positions = body.positions();
        let spans = body
            .region_spans(&positions)
            .map_err(|err| VmError::fault(&name, err.to_string()))?;

        let code = Rc::new(CompiledBody {
            insns: body.iter().map(|(_, insn)| insn).collect(),
            regions: spans
                .into_iter()
                .zip(body.regions.iter().map(|region| &region.kind))
                .collect(),
            locals: body.locals.iter().map(|local| Value::default_of(&local.ty)).collect(),
            returns: !signature.return_type.is_void(),
            positions,
            name,
        });
        self.bodies.insert(method, code.clone());
        Ok(code)
    }

    fn new_object(&self, class: ClassId) -> Value {
        let fields = self
            .module
            .class(class)
            .fields
            .iter()
            .map(|field| Value::default_of(&field.ty))
            .collect();
        Value::Object(Rc::new(RefCell::new(Object { class, fields })))
    }

    fn execute(&mut self, code: Rc<CompiledBody<'m>>, args: Vec<Value>) -> Result<Value, VmError> {
        let mut frame = Frame {
            locals: code.locals.clone(),
            code,
            args,
            stack: vec![],
            pc: 0,
            continuations: vec![],
            caught: HashMap::new(),
        };
        loop {
            let at = frame.pc;
            let insn: &'m Instruction = *frame
                .code
                .insns
                .get(at)
                .ok_or_else(|| frame.fault("execution ran past the end of the body"))?;
            frame.pc += 1;
            match self.step(&mut frame, at, insn) {
                Ok(Step::Next) => (),
                Ok(Step::Return(value)) => return Ok(value),
                Err(VmError::Thrown(exception)) => frame.raise(at, exception)?,
                Err(err) => return Err(err),
            }
        }
    }

    fn step(&mut self, frame: &mut Frame<'m>, at: usize, insn: &'m Instruction) -> Result<Step, VmError> {
        match (insn.opcode, &insn.operand) {
            (Opcode::Nop, _) => (),
            (Opcode::LdNull, _) => frame.stack.push(Value::Null),
            (Opcode::LdcI4, Operand::I32(value)) => frame.stack.push(Value::I32(*value)),
            (Opcode::LdcI8, Operand::I64(value)) => frame.stack.push(Value::I64(*value)),
            (Opcode::LdcR8, Operand::F64(value)) => frame.stack.push(Value::F64(*value)),
            (Opcode::LdStr, Operand::Str(value)) => frame.stack.push(Value::str(value)),
            (Opcode::Dup, _) => {
                let top = frame.pop()?;
                frame.stack.push(top.clone());
                frame.stack.push(top);
            }
            (Opcode::Pop, _) => {
                frame.pop()?;
            }

            (Opcode::LdArg, Operand::Arg(slot)) => {
                let value = frame.args.get(*slot as usize).cloned();
                let value = value.ok_or_else(|| frame.fault(format!("no argument {}", slot)))?;
                frame.stack.push(value);
            }
            (Opcode::StArg, Operand::Arg(slot)) => {
                let value = frame.pop()?;
                match frame.args.get_mut(*slot as usize) {
                    Some(arg) => *arg = value,
                    None => return Err(frame.fault(format!("no argument {}", slot))),
                }
            }
            (Opcode::LdLoc, Operand::Local(slot)) => {
                let value = frame.locals.get(*slot as usize).cloned();
                let value = value.ok_or_else(|| frame.fault(format!("no local {}", slot)))?;
                frame.stack.push(value);
            }
            (Opcode::StLoc, Operand::Local(slot)) => {
                let value = frame.pop()?;
                match frame.locals.get_mut(*slot as usize) {
                    Some(local) => *local = value,
                    None => return Err(frame.fault(format!("no local {}", slot))),
                }
            }

            (Opcode::Br | Opcode::BrS, Operand::Target(target)) => frame.jump(*target)?,
            (Opcode::BrFalse | Opcode::BrFalseS, Operand::Target(target)) => {
                if !frame.pop()?.is_truthy() {
                    frame.jump(*target)?;
                }
            }
            (Opcode::BrTrue | Opcode::BrTrueS, Operand::Target(target)) => {
                if frame.pop()?.is_truthy() {
                    frame.jump(*target)?;
                }
            }
            (
                Opcode::Beq | Opcode::BeqS | Opcode::BneUn | Opcode::BneUnS,
                Operand::Target(target),
            ) => {
                let (a, b) = frame.pop2()?;
                let equal = equals(&a, &b);
                if equal == matches!(insn.opcode, Opcode::Beq | Opcode::BeqS) {
                    frame.jump(*target)?;
                }
            }
            (Opcode::Bge | Opcode::BgeS | Opcode::Blt | Opcode::BltS, Operand::Target(target)) => {
                let (a, b) = frame.pop2()?;
                let ordering = frame.compare(&a, &b)?;
                let taken = match insn.opcode {
                    Opcode::Bge | Opcode::BgeS => ordering != Ordering::Less,
                    _ => ordering == Ordering::Less,
                };
                if taken {
                    frame.jump(*target)?;
                }
            }
            (Opcode::Switch, Operand::Targets(targets)) => {
                let idx = frame.pop_i32()?;
                if let Some(target) = usize::try_from(idx).ok().and_then(|idx| targets.get(idx)) {
                    frame.jump(*target)?;
                }
            }
            (Opcode::Leave | Opcode::LeaveS, Operand::Target(target)) => {
                let target = frame.target(*target)?;
                frame.leave(at, target)?;
            }
            (Opcode::EndFinally, _) => frame.resume()?,

            (Opcode::Ceq, _) => {
                let (a, b) = frame.pop2()?;
                frame.stack.push(Value::from(equals(&a, &b)));
            }
            (Opcode::Cgt | Opcode::Clt, _) => {
                let (a, b) = frame.pop2()?;
                let ordering = frame.compare(&a, &b)?;
                let expected = if insn.opcode == Opcode::Cgt {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
                frame.stack.push(Value::from(ordering == expected));
            }
            (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem, _) => {
                let (a, b) = frame.pop2()?;
                let result = frame.arithmetic(insn.opcode, a, b)?;
                frame.stack.push(result);
            }
            (Opcode::Neg, _) => {
                let result = match frame.pop()? {
                    Value::I32(value) => Value::I32(value.wrapping_neg()),
                    Value::I64(value) => Value::I64(value.wrapping_neg()),
                    Value::F64(value) => Value::F64(-value),
                    other => return Err(frame.fault(format!("cannot negate {:?}", other))),
                };
                frame.stack.push(result);
            }

            (Opcode::Call | Opcode::CallVirt | Opcode::NewObj, Operand::Method(method)) => {
                self.call(frame, insn.opcode, method)?
            }
            (Opcode::LdFtn, Operand::Method(MethodRef::Defined(method))) => {
                frame.stack.push(Value::Method(*method))
            }
            (Opcode::Ret, _) => {
                let value = if frame.code.returns {
                    frame.pop()?
                } else {
                    Value::Null
                };
                return Ok(Step::Return(value));
            }

            (Opcode::Box, Operand::Type(ty)) => {
                let value = frame.pop()?;
                if !value.has_type(ty) {
                    return Err(frame.fault(format!("cannot box {:?} as {:?}", value, ty)));
                }
                frame.stack.push(value);
            }
            (Opcode::UnboxAny | Opcode::CastClass, Operand::Type(ty)) => {
                let value = frame.pop()?;
                if value.is_null() && ty.is_value_type() {
                    return Err(thrown("NullReferenceException"));
                }
                if !value.has_type(ty) {
                    return Err(thrown("InvalidCastException"));
                }
                frame.stack.push(value);
            }

            (Opcode::Throw, _) => {
                return Err(match frame.pop()? {
                    Value::Null => thrown("NullReferenceException"),
                    exception => VmError::Thrown(exception),
                });
            }
            (Opcode::Rethrow, _) => {
                let exception = frame
                    .handled_exception(at)
                    .ok_or_else(|| frame.fault("`rethrow` outside of a catch handler"))?;
                return Err(VmError::Thrown(exception));
            }

            (Opcode::LdFld, Operand::Field(field)) => {
                let value = match frame.pop()? {
                    Value::Object(object) => {
                        let object = object.borrow();
                        object.fields.get(field.index as usize).cloned()
                    }
                    Value::Null => return Err(thrown("NullReferenceException")),
                    other => return Err(frame.fault(format!("cannot load a field of {:?}", other))),
                };
                let value = value.ok_or_else(|| frame.fault("field index out of range"))?;
                frame.stack.push(value);
            }
            (Opcode::StFld, Operand::Field(field)) => {
                let (object, value) = frame.pop2()?;
                let object = match object {
                    Value::Object(object) => object,
                    Value::Null => return Err(thrown("NullReferenceException")),
                    other => return Err(frame.fault(format!("cannot store a field of {:?}", other))),
                };
                let mut object = object.borrow_mut();
                let slot = object.fields.get_mut(field.index as usize);
                let slot = slot.ok_or_else(|| frame.fault("field index out of range"))?;
                *slot = value;
            }

            (Opcode::NewArr, Operand::Type(ty)) => {
                let len = usize::try_from(frame.pop_i32()?).map_err(|_| thrown("OverflowException"))?;
                let elements = vec![Value::default_of(ty); len];
                frame.stack.push(Value::Array(Rc::new(RefCell::new(elements))));
            }
            (Opcode::LdLen, _) => {
                let array = frame.pop_array()?;
                let len = array.borrow().len();
                frame.stack.push(Value::I32(len as i32));
            }
            (Opcode::LdElemRef, _) => {
                let idx = frame.pop_i32()?;
                let array = frame.pop_array()?;
                let element = usize::try_from(idx)
                    .ok()
                    .and_then(|idx| array.borrow().get(idx).cloned())
                    .ok_or_else(|| thrown("IndexOutOfRangeException"))?;
                frame.stack.push(element);
            }
            (Opcode::StElemRef, _) => {
                let value = frame.pop()?;
                let idx = frame.pop_i32()?;
                let array = frame.pop_array()?;
                let mut array = array.borrow_mut();
                match usize::try_from(idx) {
                    Ok(idx) if idx < array.len() => array[idx] = value,
                    _ => return Err(thrown("IndexOutOfRangeException")),
                }
            }

            (opcode, operand) => {
                return Err(frame.fault(format!(
                    "`{}` cannot take {:?}",
                    opcode.mnemonic(),
                    operand
                )))
            }
        }
        Ok(Step::Next)
    }

    fn call(&mut self, frame: &mut Frame<'m>, opcode: Opcode, method: &'m MethodRef) -> Result<(), VmError> {
        let callee = match method {
            MethodRef::Intrinsic(intrinsic) => {
                let (pops, pushes) = intrinsic.stack_effect();
                let args = frame.pop_n(pops)?;
                let result = self.intrinsic(&frame.code.name, intrinsic, args)?;
                if pushes {
                    frame.stack.push(result);
                }
                return Ok(());
            }
            MethodRef::Defined(callee) => *callee,
        };

        let module = self.module;
        let signature = module.method(callee);
        if opcode == Opcode::NewObj {
            let object = self.new_object(callee.class);
            let mut args = vec![object.clone()];
            args.extend(frame.pop_n(signature.params.len())?);
            self.invoke(callee, args)?;
            frame.stack.push(object);
            return Ok(());
        }

        let args = frame.pop_n(signature.arg_count())?;
        if opcode == Opcode::CallVirt && !signature.is_static() && args[0].is_null() {
            return Err(thrown("NullReferenceException"));
        }
        let result = self.invoke(callee, args)?;
        if !signature.return_type.is_void() {
            frame.stack.push(result);
        }
        Ok(())
    }

    fn intrinsic(&mut self, method: &str, intrinsic: &Intrinsic, args: Vec<Value>) -> Result<Value, VmError> {
        let fault = |message: String| VmError::fault(method, message);
        let arg = |idx: usize| args.get(idx).cloned().unwrap_or(Value::Null);

        Ok(match intrinsic {
            Intrinsic::ArgsNew(_) => {
                Value::Arguments(Rc::new(RefCell::new(Arguments::new(args.to_vec()))))
            }
            Intrinsic::ArgsFromArray => {
                let values = match arg(0) {
                    Value::Array(array) => array.borrow().clone(),
                    other => return Err(fault(format!("expected an object[], found {:?}", other))),
                };
                Value::Arguments(Rc::new(RefCell::new(Arguments::from_array(values))))
            }
            Intrinsic::ArgsGet => {
                let container = arguments(method, &arg(0))?;
                let idx = index(method, &arg(1))?;
                let value = container.borrow().get(idx).cloned();
                value.ok_or_else(|| thrown("IndexOutOfRangeException"))?
            }
            Intrinsic::ArgsSet => {
                let container = arguments(method, &arg(0))?;
                let idx = index(method, &arg(1))?;
                if !container.borrow_mut().set(idx, arg(2)) {
                    return Err(thrown("IndexOutOfRangeException"));
                }
                Value::Null
            }
            Intrinsic::ArgsIsModified => {
                let container = arguments(method, &arg(0))?;
                let idx = index(method, &arg(1))?;
                let modified = container.borrow().is_modified(idx);
                Value::from(modified)
            }
            Intrinsic::ArgsCount => {
                let count = arguments(method, &arg(0))?.borrow().len();
                Value::I32(count as i32)
            }

            Intrinsic::CtxNew => {
                let container = arguments(method, &arg(1))?;
                let ctx = MethodExecutionArgs::new(arg(0), container);
                Value::Context(Rc::new(RefCell::new(ctx)))
            }
            Intrinsic::CtxSetMethod => {
                context(method, &arg(0))?.borrow_mut().method = arg(1).to_string();
                Value::Null
            }
            Intrinsic::CtxGetReturnValue => context(method, &arg(0))?.borrow().return_value.clone(),
            Intrinsic::CtxSetReturnValue => {
                context(method, &arg(0))?.borrow_mut().return_value = arg(1);
                Value::Null
            }
            Intrinsic::CtxGetYieldValue => context(method, &arg(0))?.borrow().yield_value.clone(),
            Intrinsic::CtxSetYieldValue => {
                context(method, &arg(0))?.borrow_mut().yield_value = arg(1);
                Value::Null
            }
            Intrinsic::CtxGetException => context(method, &arg(0))?.borrow().exception.clone(),
            Intrinsic::CtxSetException => {
                context(method, &arg(0))?.borrow_mut().exception = arg(1);
                Value::Null
            }
            Intrinsic::CtxGetArguments => {
                Value::Arguments(context(method, &arg(0))?.borrow().arguments.clone())
            }

            Intrinsic::Hook(kind) => {
                let aspect = aspect(method, &arg(0))?;
                let ctx = context(method, &arg(1))?;
                let mut aspect = aspect.borrow_mut();
                let mut ctx = ctx.borrow_mut();
                log::trace!("Calling {} hook of '{}'", kind.name(), ctx.method);
                match call_hook(aspect.as_mut(), *kind, &mut ctx) {
                    Ok(()) => Value::Null,
                    Err(Value::Null) => return Err(thrown("NullReferenceException")),
                    Err(exception) => return Err(VmError::Thrown(exception)),
                }
            }
            Intrinsic::AspectNew { type_name, .. } => {
                let aspect = self
                    .registry
                    .instantiate(type_name, &args, &self.trace)
                    .ok_or_else(|| VmError::UnknownAspect(type_name.clone()))?;
                Value::Aspect(Rc::new(RefCell::new(aspect)))
            }

            Intrinsic::InterceptNew => {
                let container = arguments(method, &arg(1))?;
                let target = match arg(2) {
                    Value::Method(target) => target,
                    other => return Err(fault(format!("expected a method, found {:?}", other))),
                };
                let state = Interception::new(arg(3).to_string(), arg(0), container, target);
                Value::Interception(Rc::new(RefCell::new(state)))
            }
            Intrinsic::InterceptInvoke | Intrinsic::InterceptInvokeAsync => {
                let aspect = aspect(method, &arg(0))?;
                let state = interception(method, &arg(1))?;
                let mut aspect = aspect.borrow_mut();
                let mut state = state.borrow_mut();
                log::trace!("Calling invoke hook of '{}'", state.method);

                let is_async = *intrinsic == Intrinsic::InterceptInvokeAsync;
                let mut reentry = Reentry { vm: self, fault: None };
                let outcome = {
                    let mut args = MethodInterceptionArgs::new(&mut state, &mut reentry);
                    if is_async {
                        aspect.on_invoke_async(&mut args)
                    } else {
                        aspect.on_invoke(&mut args).map(|()| Value::Null)
                    }
                };
                if let Some(err) = reentry.fault {
                    return Err(err);
                }
                match outcome {
                    Ok(Value::Null) if is_async => return Err(thrown("NullReferenceException")),
                    Ok(value) => value,
                    Err(Value::Null) => return Err(thrown("NullReferenceException")),
                    Err(exception) => return Err(VmError::Thrown(exception)),
                }
            }
            Intrinsic::InterceptGetReturnValue => {
                let outcome = interception(method, &arg(0))?.borrow().outcome();
                outcome.map_err(VmError::Thrown)?
            }

            Intrinsic::Trace => {
                self.trace.push(arg(0).to_string());
                Value::Null
            }
            Intrinsic::ExceptionNew => Value::exception(arg(0).to_string()),

            Intrinsic::TaskYield => {
                let task = Rc::new(RefCell::new(Task::pending()));
                self.jobs.push_back(Job::Complete(task.clone()));
                Value::Task(task)
            }
            Intrinsic::TaskFromResult => Value::Task(Rc::new(RefCell::new(Task::completed(arg(0))))),
            Intrinsic::TaskGetAwaiter => Value::Task(task(method, &arg(0))?),
            Intrinsic::AwaiterIsCompleted => Value::from(task(method, &arg(0))?.borrow().is_done()),
            Intrinsic::AwaiterGetResult => {
                let state = task(method, &arg(0))?.borrow().state.clone();
                match state {
                    TaskState::Completed(value) => value,
                    TaskState::Faulted(exception) => return Err(VmError::Thrown(exception)),
                    TaskState::Pending => return Err(fault("result of a pending task".to_owned())),
                }
            }

            Intrinsic::AsyncCreate => Value::Builder(Rc::new(RefCell::new(Task::pending()))),
            Intrinsic::AsyncStart => {
                self.invoke_virtual(&arg(1), "MoveNext", vec![])?;
                Value::Null
            }
            Intrinsic::AsyncTask => Value::Task(task(method, &arg(0))?),
            Intrinsic::AsyncAwaitOnCompleted => {
                let awaited = task(method, &arg(1))?;
                let machine = arg(2);
                let mut awaited = awaited.borrow_mut();
                if awaited.is_done() {
                    self.jobs.push_back(Job::Resume(machine));
                } else {
                    awaited.continuations.push(machine);
                }
                Value::Null
            }
            Intrinsic::AsyncSetResult => {
                self.complete(method, &task(method, &arg(0))?, TaskState::Completed(arg(1)))?;
                Value::Null
            }
            Intrinsic::AsyncSetException => {
                self.complete(method, &task(method, &arg(0))?, TaskState::Faulted(arg(1)))?;
                Value::Null
            }
        })
    }

    fn complete(&mut self, method: &str, task: &Rc<RefCell<Task>>, state: TaskState) -> Result<(), VmError> {
        let mut task = task.borrow_mut();
        if task.is_done() {
            return Err(VmError::fault(method, "task completed twice"));
        }
        task.state = state;
        for machine in task.continuations.drain(..) {
            self.jobs.push_back(Job::Resume(machine));
        }
        Ok(())
    }
}

fn arguments(method: &str, value: &Value) -> Result<Rc<RefCell<Arguments>>, VmError> {
    match value {
        Value::Arguments(container) => Ok(container.clone()),
        other => Err(VmError::fault(method, format!("expected arguments, found {:?}", other))),
    }
}

fn aspect(method: &str, value: &Value) -> Result<Rc<RefCell<Box<dyn Aspect>>>, VmError> {
    match value {
        Value::Aspect(aspect) => Ok(aspect.clone()),
        Value::Null => Err(thrown("NullReferenceException")),
        other => Err(VmError::fault(method, format!("expected an aspect, found {:?}", other))),
    }
}

fn interception(method: &str, value: &Value) -> Result<Rc<RefCell<Interception>>, VmError> {
    match value {
        Value::Interception(state) => Ok(state.clone()),
        other => Err(VmError::fault(method, format!("expected an interception, found {:?}", other))),
    }
}

fn context(method: &str, value: &Value) -> Result<Rc<RefCell<MethodExecutionArgs>>, VmError> {
    match value {
        Value::Context(ctx) => Ok(ctx.clone()),
        other => Err(VmError::fault(method, format!("expected a context, found {:?}", other))),
    }
}

/// Task behind a task, an awaiter, or a builder
fn task(method: &str, value: &Value) -> Result<Rc<RefCell<Task>>, VmError> {
    match value {
        Value::Task(task) | Value::Builder(task) => Ok(task.clone()),
        other => Err(VmError::fault(method, format!("expected a task, found {:?}", other))),
    }
}

fn index(method: &str, value: &Value) -> Result<usize, VmError> {
    match value {
        Value::I32(idx) if *idx >= 0 => Ok(*idx as usize),
        Value::I32(_) => Err(thrown("IndexOutOfRangeException")),
        other => Err(VmError::fault(method, format!("expected an index, found {:?}", other))),
    }
}

fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F64(a), Value::F64(b)) => a == b,
        _ => a.same(b),
    }
}

/// Does a catch handler filtering on `filter` accept `exception`?
fn catches(filter: &Option<Type>, exception: &Value) -> bool {
    match filter {
        None | Some(Type::Object) => true,
        Some(ty) => !exception.is_null() && exception.has_type(ty),
    }
}

impl<'m> Frame<'m> {
    fn fault(&self, message: impl Into<String>) -> VmError {
        VmError::fault(&self.code.name, message)
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.fault("stack underflow")),
        }
    }

    /// Pop two values, returning them in the order they were pushed
    fn pop2(&mut self) -> Result<(Value, Value), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    /// Pop `n` values, returning them in the order they were pushed
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        if n > self.stack.len() {
            return Err(self.fault("stack underflow"));
        }
        let split = self.stack.len() - n;
        Ok(self.stack.split_off(split))
    }

    fn pop_i32(&mut self) -> Result<i32, VmError> {
        match self.pop()? {
            Value::I32(value) => Ok(value),
            other => Err(self.fault(format!("expected an int32, found {:?}", other))),
        }
    }

    fn pop_array(&mut self) -> Result<Rc<RefCell<Vec<Value>>>, VmError> {
        match self.pop()? {
            Value::Array(array) => Ok(array),
            Value::Null => Err(thrown("NullReferenceException")),
            other => Err(self.fault(format!("expected an array, found {:?}", other))),
        }
    }

    fn target(&self, target: InsnId) -> Result<usize, VmError> {
        self.code
            .positions
            .get(&target)
            .copied()
            .ok_or_else(|| self.fault(format!("dangling branch target {:?}", target)))
    }

    fn jump(&mut self, target: InsnId) -> Result<(), VmError> {
        self.pc = self.target(target)?;
        Ok(())
    }

    fn compare(&self, a: &Value, b: &Value) -> Result<Ordering, VmError> {
        let ordering = match (a, b) {
            (Value::I32(a), Value::I32(b)) => Some(a.cmp(b)),
            (Value::I64(a), Value::I64(b)) => Some(a.cmp(b)),
            (Value::F64(a), Value::F64(b)) => a.partial_cmp(b),
            _ => None,
        };
        ordering.ok_or_else(|| self.fault(format!("cannot compare {:?} and {:?}", a, b)))
    }

    fn arithmetic(&self, opcode: Opcode, a: Value, b: Value) -> Result<Value, VmError> {
        macro_rules! integral {
            ($variant:ident, $a:expr, $b:expr) => {
                Value::$variant(match opcode {
                    Opcode::Add => $a.wrapping_add($b),
                    Opcode::Sub => $a.wrapping_sub($b),
                    Opcode::Mul => $a.wrapping_mul($b),
                    _ if $b == 0 => return Err(thrown("DivideByZeroException")),
                    Opcode::Div => $a.checked_div($b).ok_or_else(|| thrown("OverflowException"))?,
                    _ => $a.checked_rem($b).ok_or_else(|| thrown("OverflowException"))?,
                })
            };
        }
        Ok(match (a, b) {
            (Value::I32(a), Value::I32(b)) => integral!(I32, a, b),
            (Value::I64(a), Value::I64(b)) => integral!(I64, a, b),
            (Value::F64(a), Value::F64(b)) => Value::F64(match opcode {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                _ => a % b,
            }),
            (a, b) => {
                return Err(self.fault(format!(
                    "`{}` cannot combine {:?} and {:?}",
                    opcode.mnemonic(),
                    a,
                    b
                )))
            }
        })
    }

    /// Exception handled by the innermost catch handler around `at`
    fn handled_exception(&self, at: usize) -> Option<Value> {
        self.code
            .regions
            .iter()
            .enumerate()
            .find(|(_, (span, kind))| {
                matches!(kind, RegionKind::Catch(_)) && span.handler_range.contains(&at)
            })
            .and_then(|(region, _)| self.caught.get(&region).cloned())
    }

    /// Leave protected regions for `target`, running the finally handlers on the way out
    fn leave(&mut self, at: usize, target: usize) -> Result<(), VmError> {
        let regions = &self.code.regions;
        let finallies = regions
            .iter()
            .enumerate()
            .filter(|(_, (span, kind))| {
                matches!(kind, RegionKind::Finally)
                    && span.try_range.contains(&at)
                    && !span.try_range.contains(&target)
            })
            .map(|(region, _)| region)
            .collect();
        self.caught.retain(|region, _| {
            let handler = &regions[*region].0.handler_range;
            !handler.contains(&at) || handler.contains(&target)
        });
        self.stack.clear();
        self.continuations.push(Continuation::Leave {
            target,
            finallies,
            active: None,
        });
        self.resume()
    }

    /// Dispatch an exception raised at `at`
    ///
    /// Finally handlers between the raise point and the first catch handler that accepts the
    /// exception run first. Without such a catch handler, the exception leaves the method.
    fn raise(&mut self, at: usize, exception: Value) -> Result<(), VmError> {
        let mut finallies = VecDeque::new();
        let mut catch = None;
        for (region, (span, kind)) in self.code.regions.iter().enumerate() {
            if !span.try_range.contains(&at) {
                continue;
            }
            match kind {
                RegionKind::Finally => finallies.push_back(region),
                RegionKind::Catch(filter) => {
                    if catches(filter, &exception) {
                        catch = Some(region);
                        break;
                    }
                }
            }
        }

        // Pending work of finally handlers the exception escapes is abandoned
        let catch_start = catch.map(|region| self.code.regions[region].0.try_range.start);
        while let Some(active) = self.continuations.last().and_then(Continuation::active) {
            let handler = &self.code.regions[active].0.handler_range;
            let escapes =
                handler.contains(&at) && !catch_start.map_or(false, |start| handler.contains(&start));
            if !escapes {
                break;
            }
            self.continuations.pop();
        }

        self.stack.clear();
        self.continuations.push(Continuation::Unwind {
            exception,
            finallies,
            catch,
            active: None,
        });
        self.resume()
    }

    /// Carry on with the innermost continuation (at a `leave`, a raise, or an `endfinally`)
    fn resume(&mut self) -> Result<(), VmError> {
        let regions = &self.code.regions;
        match self.continuations.last_mut() {
            None => Err(VmError::fault(&self.code.name, "`endfinally` outside of a finally handler")),
            Some(Continuation::Leave {
                target,
                finallies,
                active,
            }) => {
                match finallies.pop_front() {
                    Some(region) => {
                        *active = Some(region);
                        self.pc = regions[region].0.handler_range.start;
                    }
                    None => {
                        self.pc = *target;
                        self.continuations.pop();
                    }
                }
                Ok(())
            }
            Some(Continuation::Unwind {
                exception,
                finallies,
                catch,
                active,
            }) => {
                if let Some(region) = finallies.pop_front() {
                    *active = Some(region);
                    self.pc = regions[region].0.handler_range.start;
                    return Ok(());
                }
                let exception = exception.clone();
                let catch = *catch;
                self.continuations.pop();
                match catch {
                    Some(region) => {
                        self.caught.insert(region, exception.clone());
                        self.stack.push(exception);
                        self.pc = regions[region].0.handler_range.start;
                        Ok(())
                    }
                    None => Err(VmError::Thrown(exception)),
                }
            }
        }
    }
}
