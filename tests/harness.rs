#![allow(dead_code)]

use aspect_weaver::il::{parse_module, Module};
use std::cell::RefCell;
use std::rc::Rc;
use aspect_weaver::vm::{
    Aspect, AspectRegistry, HookResult, MethodExecutionArgs, MethodInterceptionArgs, Task,
    TraceLog, Value,
};
use aspect_weaver::weave::{weave_module, Settings};

/// Hook descriptor writing every hook it runs to the trace
///
/// Built as `Recorder()`, or `Recorder("hook")` to make that hook throw (after recording it).
pub struct Recorder {
    trace: TraceLog,
    throw_from: Option<String>,
    exceptions: Option<Rc<RefCell<Vec<Value>>>>,
}

impl Recorder {
    fn record(&self, hook: &str, value: &Value) -> HookResult {
        if value.is_null() {
            self.trace.push(hook);
        } else {
            self.trace.push(format!("{} {}", hook, value));
        }
        match &self.throw_from {
            Some(name) if hook.eq_ignore_ascii_case(&format!("On{}", name)) => {
                Err(Value::exception(format!("{} failed", name)))
            }
            _ => Ok(()),
        }
    }
}

impl Aspect for Recorder {
    fn on_entry(&mut self, _args: &mut MethodExecutionArgs) -> HookResult {
        self.record("OnEntry", &Value::Null)
    }

    fn on_yield(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        self.record("OnYield", &args.yield_value)
    }

    fn on_resume(&mut self, _args: &mut MethodExecutionArgs) -> HookResult {
        self.record("OnResume", &Value::Null)
    }

    fn on_success(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        self.record("OnSuccess", &args.return_value)
    }

    fn on_exception(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        if let Some(exceptions) = &self.exceptions {
            exceptions.borrow_mut().push(args.exception.clone());
        }
        self.record("OnException", &args.exception)
    }

    fn on_exit(&mut self, _args: &mut MethodExecutionArgs) -> HookResult {
        self.record("OnExit", &Value::Null)
    }
}

/// Hook descriptor rewriting what it sees
///
/// The entry hook replaces the first argument with `10`, the yield hook adds `100` to produced
/// values, and the success hook multiplies the result by `10`.
pub struct Rewriter;

impl Aspect for Rewriter {
    fn on_entry(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        if args.argument_count() > 0 {
            args.set_argument(0, Value::I32(10));
        }
        Ok(())
    }

    fn on_yield(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        if let Value::I32(value) = args.yield_value {
            args.yield_value = Value::I32(value + 100);
        }
        Ok(())
    }

    fn on_success(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        if let Value::I32(value) = args.return_value {
            args.return_value = Value::I32(value * 10);
        }
        Ok(())
    }
}

/// Hook descriptor that remembers the arguments it was handed on entry
pub struct ArgumentLogger {
    trace: TraceLog,
}

impl Aspect for ArgumentLogger {
    fn on_entry(&mut self, args: &mut MethodExecutionArgs) -> HookResult {
        let values: Vec<String> = (0..args.argument_count())
            .filter_map(|idx| args.argument(idx))
            .map(|value| value.to_string())
            .collect();
        self.trace.push(format!("{}({})", args.method, values.join(",")));
        Ok(())
    }
}

/// Intercepting descriptor tracing what it sees and how it handles the call
///
/// The mode is its constructor argument:
///
/// * `proceed` runs the original logic with the arguments unchanged;
/// * `invoke` runs it with every `int32` argument doubled;
/// * `replace` returns `-1` without running it;
/// * `skip` neither runs it nor sets a return value;
/// * `catch` proceeds and, if the original logic throws, returns `0` instead.
///
/// It traces `OnInvoke` (or `OnInvokeAsync`) and the arguments, then the mode, and once the
/// original logic ran synchronously, the return value.
pub struct Interceptor {
    trace: TraceLog,
    mode: String,
}

impl Interceptor {
    fn begin(&self, hook: &str, args: &MethodInterceptionArgs) {
        self.trace.push(hook);
        for value in args.arguments() {
            self.trace.push(value.to_string());
        }
        let mut mode = self.mode.clone();
        if let Some(first) = mode.get_mut(..1) {
            first.make_ascii_uppercase();
        }
        self.trace.push(mode);
    }

    fn doubled(args: &MethodInterceptionArgs) -> Vec<Value> {
        args.arguments()
            .into_iter()
            .map(|value| match value {
                Value::I32(value) => Value::I32(value * 2),
                other => other,
            })
            .collect()
    }
}

impl Aspect for Interceptor {
    fn on_invoke(&mut self, args: &mut MethodInterceptionArgs) -> HookResult {
        self.begin("OnInvoke", args);
        match self.mode.as_str() {
            "proceed" => args.proceed()?,
            "invoke" => {
                let doubled = Interceptor::doubled(args);
                args.invoke(doubled)?
            }
            "replace" => args.set_return_value(Value::I32(-1)),
            "catch" => {
                if let Err(exception) = args.proceed() {
                    self.trace.push(format!("Caught {}", exception));
                    args.set_return_value(Value::I32(0));
                }
            }
            _ => return Ok(()),
        }
        self.trace.push(args.return_value().to_string());
        Ok(())
    }

    fn on_invoke_async(&mut self, args: &mut MethodInterceptionArgs) -> Result<Value, Value> {
        self.begin("OnInvokeAsync", args);
        match self.mode.as_str() {
            "invoke" => {
                let doubled = Interceptor::doubled(args);
                args.invoke_async(doubled)
            }
            "replace" => {
                args.set_return_value(Value::I32(-1));
                Ok(Value::Task(Rc::new(RefCell::new(Task::completed(Value::Null)))))
            }
            _ => args.proceed_async(),
        }
    }
}

pub fn registry() -> AspectRegistry {
    AspectRegistry::new()
        .with("Recorder", |args, trace| {
            Box::new(Recorder {
                trace: trace.clone(),
                throw_from: args.first().map(|hook| hook.to_string()),
                exceptions: None,
            })
        })
        .with("Rewriter", |_, _| Box::new(Rewriter))
        .with("ArgumentLogger", |_, trace| {
            Box::new(ArgumentLogger {
                trace: trace.clone(),
            })
        })
        .with("Interceptor", |args, trace| {
            Box::new(Interceptor {
                trace: trace.clone(),
                mode: args
                    .first()
                    .map(|mode| mode.to_string())
                    .unwrap_or_else(|| "proceed".to_owned()),
            })
        })
}

/// Same as [`registry`], except that `Recorder` also hands the exceptions it sees to `exceptions`
pub fn registry_keeping(exceptions: &Rc<RefCell<Vec<Value>>>) -> AspectRegistry {
    let exceptions = exceptions.clone();
    registry().with("Recorder", move |args, trace| {
        Box::new(Recorder {
            trace: trace.clone(),
            throw_from: args.first().map(|hook| hook.to_string()),
            exceptions: Some(exceptions.clone()),
        })
    })
}

/// Assemble a listing and weave every method carrying a hook descriptor
pub fn woven(source: &str) -> Module {
    woven_with(source, &Settings::new())
}

pub fn woven_with(source: &str, settings: &Settings) -> Module {
    let mut module = parse_module(source).expect("listing should assemble");
    weave_module(&mut module, settings).expect("weaving should succeed");
    module
}

/// Iterator record counting from `0` up to `limit` (exclusive)
///
/// `Count` is the owner. `Dispose` traces `Dispose`, and the body traces `step` every time it
/// runs, so hooks can be ordered against the original logic.
pub fn counter_source(aspect: &str) -> String {
    format!(
        r#"
        .class Counter
        .field int32 <>1__state
        .field int32 <>2__current
        .field int32 limit
        .field int32 i

        .method void .ctor()
                  ret
        .end

        .method bool MoveNext()
                  ldstr "step"
                  call @trace
                  ldarg this
                  ldfld Counter::<>1__state
                  switch (START, RESUME)
                  ldc.i4 0
                  ret
          START:  ldarg this
                  ldc.i4 0
                  stfld Counter::i
                  br CHECK
          RESUME: ldarg this
                  ldarg this
                  ldfld Counter::i
                  ldc.i4 1
                  add
                  stfld Counter::i
          CHECK:  ldarg this
                  ldfld Counter::i
                  ldarg this
                  ldfld Counter::limit
                  bge DONE
                  ldarg this
                  ldarg this
                  ldfld Counter::i
                  stfld Counter::<>2__current
                  ldarg this
                  ldc.i4 1
                  stfld Counter::<>1__state
                  ldc.i4 1
                  ret
          DONE:   ldarg this
                  ldc.i4 -1
                  stfld Counter::<>1__state
                  ldc.i4 0
                  ret
        .end

        .method void Dispose()
                  ldstr "Dispose"
                  call @trace
                  ret
        .end

        .class Program
        .method static Counter Count(int32 limit)
          .iterator Counter
          {aspect}
          .locals (Counter counter)
                  newobj Counter::.ctor
                  stloc counter
                  ldloc counter
                  ldarg limit
                  stfld Counter::limit
                  ldloc counter
                  ret
        .end
    "#,
        aspect = aspect
    )
}

/// Asynchronous record computing `x * 2`
///
/// The single await is on a task that is already complete unless `delay` is set, in which case
/// the record suspends until the next turn of the scheduler.
pub fn doubler_source(aspect: &str) -> String {
    format!(
        r#"
        .class Doubler
        .field int32 <>1__state
        .field object <>t__builder
        .field int32 x
        .field bool delay
        .field object awaiter

        .method void .ctor()
                  ret
        .end

        .method void MoveNext()
          .locals (int32 result, object awaiter, object error)
          TRY:    ldarg this
                  ldfld Doubler::<>1__state
                  brfalse RESUME0
                  ldarg this
                  ldfld Doubler::delay
                  brtrue DELAY
                  ldnull
                  call @task.from_result
                  br AWAIT
          DELAY:  call @task.yield
          AWAIT:  call @task.get_awaiter
                  stloc awaiter
                  ldloc awaiter
                  call @awaiter.is_completed
                  brtrue GOT
                  ldarg this
                  ldc.i4 0
                  stfld Doubler::<>1__state
                  ldarg this
                  ldloc awaiter
                  stfld Doubler::awaiter
                  ldarg this
                  ldfld Doubler::<>t__builder
                  ldloc awaiter
                  ldarg this
                  call @async.await_on_completed
                  leave RET
          RESUME0: ldarg this
                  ldfld Doubler::awaiter
                  stloc awaiter
                  ldarg this
                  ldc.i4 -1
                  stfld Doubler::<>1__state
          GOT:    ldloc awaiter
                  call @awaiter.get_result
                  pop
                  ldstr "work"
                  call @trace
                  ldarg this
                  ldfld Doubler::x
                  ldc.i4 2
                  mul
                  stloc result
                  leave SETRESULT
          CATCH:  stloc error
                  ldarg this
                  ldc.i4 -2
                  stfld Doubler::<>1__state
                  ldarg this
                  ldfld Doubler::<>t__builder
                  ldloc error
                  call @async.set_exception
                  leave RET
          SETRESULT: ldarg this
                  ldc.i4 -2
                  stfld Doubler::<>1__state
                  ldarg this
                  ldfld Doubler::<>t__builder
                  ldloc result
                  box int32
                  call @async.set_result
          RET:    ret
          .try TRY CATCH catch CATCH SETRESULT
        .end

        .class Program
        .method static object Double(int32 x, bool delay)
          .async Doubler
          {aspect}
          .locals (Doubler machine)
                  newobj Doubler::.ctor
                  stloc machine
                  ldloc machine
                  ldarg x
                  stfld Doubler::x
                  ldloc machine
                  ldarg delay
                  stfld Doubler::delay
                  ldloc machine
                  call @async.create
                  stfld Doubler::<>t__builder
                  ldloc machine
                  ldc.i4 -1
                  stfld Doubler::<>1__state
                  ldloc machine
                  ldfld Doubler::<>t__builder
                  ldloc machine
                  call @async.start
                  ldloc machine
                  ldfld Doubler::<>t__builder
                  call @async.task
                  ret
        .end
    "#,
        aspect = aspect
    )
}

/// [`counter_source`] whose second step finishes the record and throws `boom`
pub fn failing_counter_source(aspect: &str) -> String {
    counter_source(aspect).replace(
        "RESUME: ldarg this\n",
        r#"RESUME: ldarg this
                  ldc.i4 -1
                  stfld Counter::<>1__state
                  ldstr "boom"
                  newobj @exception.new
                  throw
                  ldarg this
"#,
    )
}

/// [`doubler_source`] whose body throws `boom` right after tracing `work`
pub fn failing_doubler_source(aspect: &str) -> String {
    doubler_source(aspect).replace(
        "ldstr \"work\"\n                  call @trace\n",
        r#"ldstr "work"
                  call @trace
                  ldstr "boom"
                  newobj @exception.new
                  throw
"#,
    )
}

/// Asynchronous record awaiting two tasks that both complete on a later turn, then producing `x`
///
/// The body traces `first` and `second` after the matching await.
pub fn pauser_source(aspect: &str) -> String {
    format!(
        r#"
        .class Pauser
        .field int32 <>1__state
        .field object <>t__builder
        .field int32 x
        .field object awaiter

        .method void .ctor()
                  ret
        .end

        .method void MoveNext()
          .locals (int32 result, object awaiter, object error)
          TRY:    ldarg this
                  ldfld Pauser::<>1__state
                  switch (RESUME0, RESUME1)
                  call @task.yield
                  call @task.get_awaiter
                  stloc awaiter
                  ldloc awaiter
                  call @awaiter.is_completed
                  brtrue GOT0
                  ldarg this
                  ldc.i4 0
                  stfld Pauser::<>1__state
                  ldarg this
                  ldloc awaiter
                  stfld Pauser::awaiter
                  ldarg this
                  ldfld Pauser::<>t__builder
                  ldloc awaiter
                  ldarg this
                  call @async.await_on_completed
                  leave RET
          RESUME0: ldarg this
                  ldfld Pauser::awaiter
                  stloc awaiter
                  ldarg this
                  ldc.i4 -1
                  stfld Pauser::<>1__state
          GOT0:   ldloc awaiter
                  call @awaiter.get_result
                  pop
                  ldstr "first"
                  call @trace
                  call @task.yield
                  call @task.get_awaiter
                  stloc awaiter
                  ldloc awaiter
                  call @awaiter.is_completed
                  brtrue GOT1
                  ldarg this
                  ldc.i4 1
                  stfld Pauser::<>1__state
                  ldarg this
                  ldloc awaiter
                  stfld Pauser::awaiter
                  ldarg this
                  ldfld Pauser::<>t__builder
                  ldloc awaiter
                  ldarg this
                  call @async.await_on_completed
                  leave RET
          RESUME1: ldarg this
                  ldfld Pauser::awaiter
                  stloc awaiter
                  ldarg this
                  ldc.i4 -1
                  stfld Pauser::<>1__state
          GOT1:   ldloc awaiter
                  call @awaiter.get_result
                  pop
                  ldstr "second"
                  call @trace
                  ldarg this
                  ldfld Pauser::x
                  stloc result
                  leave SETRESULT
          CATCH:  stloc error
                  ldarg this
                  ldc.i4 -2
                  stfld Pauser::<>1__state
                  ldarg this
                  ldfld Pauser::<>t__builder
                  ldloc error
                  call @async.set_exception
                  leave RET
          SETRESULT: ldarg this
                  ldc.i4 -2
                  stfld Pauser::<>1__state
                  ldarg this
                  ldfld Pauser::<>t__builder
                  ldloc result
                  box int32
                  call @async.set_result
          RET:    ret
          .try TRY CATCH catch CATCH SETRESULT
        .end

        .class Program
        .method static object Pause(int32 x)
          .async Pauser
          {aspect}
          .locals (Pauser machine)
                  newobj Pauser::.ctor
                  stloc machine
                  ldloc machine
                  ldarg x
                  stfld Pauser::x
                  ldloc machine
                  call @async.create
                  stfld Pauser::<>t__builder
                  ldloc machine
                  ldc.i4 -1
                  stfld Pauser::<>1__state
                  ldloc machine
                  ldfld Pauser::<>t__builder
                  ldloc machine
                  call @async.start
                  ldloc machine
                  ldfld Pauser::<>t__builder
                  call @async.task
                  ret
        .end
    "#,
        aspect = aspect
    )
}
