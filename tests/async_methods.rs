mod harness;

use aspect_weaver::vm::{TaskState, Value, Vm};
use harness::{
    doubler_source, failing_doubler_source, pauser_source, registry, registry_keeping, woven,
};
use std::cell::RefCell;
use std::rc::Rc;

fn completed(task: &Value) -> Value {
    match task.task_state() {
        Some(TaskState::Completed(value)) => value,
        other => panic!("expected a completed task, got {:?}", other),
    }
}

fn faulted(task: &Value) -> Value {
    match task.task_state() {
        Some(TaskState::Faulted(exception)) => exception,
        other => panic!("expected a faulted task, got {:?}", other),
    }
}

#[test]
fn all_synchronous() {
    let module = woven(&doubler_source(".aspect Recorder()"));
    let mut vm = Vm::new(&module, registry());

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(3), Value::from(false)])
        .unwrap();
    assert_eq!(completed(&task), Value::I32(6));
    assert_eq!(vm.trace().joined(), "OnEntry work OnSuccess 6 OnExit");

    vm.run_until_idle().unwrap();
    assert_eq!(vm.trace().joined(), "OnEntry work OnSuccess 6 OnExit");
}

#[test]
fn suspending_await() {
    let module = woven(&doubler_source(".aspect Recorder()"));
    let mut vm = Vm::new(&module, registry());

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(4), Value::from(true)])
        .unwrap();
    assert!(matches!(task.task_state(), Some(TaskState::Pending)));
    assert_eq!(vm.trace().joined(), "OnEntry OnYield");

    vm.run_until_idle().unwrap();
    assert_eq!(completed(&task), Value::I32(8));
    assert_eq!(
        vm.trace().joined(),
        "OnEntry OnYield OnResume work OnSuccess 8 OnExit"
    );
}

#[test]
fn success_hook_overwrites_the_result() {
    let module = woven(&doubler_source(".aspect Rewriter() : success"));
    let mut vm = Vm::new(&module, registry());

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(4), Value::from(true)])
        .unwrap();
    vm.run_until_idle().unwrap();
    assert_eq!(completed(&task), Value::I32(80));
}

#[test]
fn entry_hook_rewrites_arguments() {
    let module = woven(&doubler_source(".aspect Rewriter() : entry"));
    let mut vm = Vm::new(&module, registry());

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(4), Value::from(false)])
        .unwrap();
    assert_eq!(completed(&task), Value::I32(20));
}

#[test]
fn throwing_success_hook_faults_the_task() {
    let module = woven(&doubler_source(".aspect Recorder(\"success\")"));
    let mut vm = Vm::new(&module, registry());

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(4), Value::from(true)])
        .unwrap();
    vm.run_until_idle().unwrap();
    assert_eq!(faulted(&task).to_string(), "success failed");
    assert_eq!(
        vm.trace().joined(),
        "OnEntry OnYield OnResume work OnSuccess 8 OnException success failed OnExit"
    );
}

#[test]
fn record_gains_hook_fields() {
    let module = woven(&doubler_source(".aspect Recorder()"));
    let record = module.find_class("Doubler").unwrap();
    for field in ["*aspect*", "*aspectArgs*", "*args*", "*resumeFlag*"] {
        assert!(module.find_field(record, field).is_some(), "{}", field);
    }
    assert!(module.find_method(record, "MoveNext<Original>").is_some());
}

#[test]
fn throwing_body_before_suspending() {
    let module = woven(&failing_doubler_source(".aspect Recorder()"));
    let seen = Rc::new(RefCell::new(vec![]));
    let mut vm = Vm::new(&module, registry_keeping(&seen));

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(3), Value::from(false)])
        .unwrap();
    assert_eq!(vm.trace().joined(), "OnEntry work OnException boom OnExit");

    let exception = faulted(&task);
    assert_eq!(exception.to_string(), "boom");
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].same(&exception));
}

#[test]
fn throwing_body_after_suspending() {
    let module = woven(&failing_doubler_source(".aspect Recorder()"));
    let seen = Rc::new(RefCell::new(vec![]));
    let mut vm = Vm::new(&module, registry_keeping(&seen));

    let task = vm
        .invoke_named("Program", "Double", vec![Value::I32(3), Value::from(true)])
        .unwrap();
    assert!(matches!(task.task_state(), Some(TaskState::Pending)));
    vm.run_until_idle().unwrap();
    assert_eq!(
        vm.trace().joined(),
        "OnEntry OnYield OnResume work OnException boom OnExit"
    );

    let exception = faulted(&task);
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].same(&exception));
}

#[test]
fn several_suspensions_in_one_invocation() {
    let module = woven(&pauser_source(".aspect Recorder()"));
    let mut vm = Vm::new(&module, registry());

    let task = vm
        .invoke_named("Program", "Pause", vec![Value::I32(7)])
        .unwrap();
    assert_eq!(vm.trace().joined(), "OnEntry OnYield");

    vm.run_until_idle().unwrap();
    assert_eq!(completed(&task), Value::I32(7));
    assert_eq!(
        vm.trace().joined(),
        "OnEntry OnYield OnResume first OnYield OnResume second OnSuccess 7 OnExit"
    );
}
