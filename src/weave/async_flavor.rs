//! Asynchronous state machines
//!
//! `MoveNext` of an asynchronous record runs until the method completes or until it awaits
//! something that isn't complete yet, in which case it stores its phase, registers itself as the
//! continuation (`@async.await_on_completed`), and leaves. Completion is reported to the
//! builder (`@async.set_result`) after the compiler's catch-all region; a fault is reported by
//! its handler (`@async.set_exception`).
//!
//! The rebuilt `MoveNext` only runs the prologue before stepping `MoveNext<Original>`. The rest of
//! the instrumentation goes into `MoveNext<Original>` itself:
//!
//!   * the yield hook runs right before each `@async.await_on_completed`, which is only reached
//!     when an awaited value wasn't available synchronously;
//!   * every `leave` out of the compiler's protected range records which exit it took (`k`) and
//!     goes through a check block instead, which runs the success hook when the phase is still
//!     `-1` (the method ran to completion rather than suspending) and reloads the result from
//!     the context, so that a value rewritten by the hook is what gets reported;
//!   * the original range and the check block are wrapped in a new catch (exception hook) and
//!     finally (exit hook, once the method completed or faulted), nested inside the compiler's
//!     region so that its handler still reports the fault;
//!   * a dispatch block then takes exit `k`.

use super::state_machine::{StateMachineFlavor, StateMachineInjector};
use super::{protected_regions, EditorExts, Error, Settings, Storage};
use crate::il::{
    Cursor, Editor, HookKind, InsnId, Instruction, Intrinsic, MethodBody, MethodId, Module, Opcode,
    Operand, RegionKind, Type,
};

/// Field holding the builder that reports completion
pub const BUILDER_FIELD: &str = "<>t__builder";

/// Phase of a machine that is running (or has run to completion without suspending)
const RUNNING: i32 = -1;

pub struct AsyncFlavor;

impl StateMachineFlavor for AsyncFlavor {
    type Fields = ();

    fn add_fields(
        &self,
        module: &mut Module,
        injector: &StateMachineInjector,
        _settings: &Settings,
    ) -> Result<(), Error> {
        injector.contract_field(module, BUILDER_FIELD)?;
        Ok(())
    }

    fn rebuild_move_next(
        &self,
        module: &mut Module,
        injector: &StateMachineInjector,
        _fields: &(),
        original: MethodId,
        settings: &Settings,
    ) -> Result<MethodBody, Error> {
        let mut step = injector.body_of(module, original)?;
        instrument_step(injector, &mut step)?;
        injector.finish(&mut step, settings)?;
        module.method_mut(original).body = Some(step);

        let has_return_value = !module.method(injector.move_next).return_type.is_void();
        let mut body = MethodBody::new(has_return_value);
        let mut editor = Editor::new(&mut body);
        injector.emit_prologue(&mut editor, settings)?;
        editor.emit(Instruction::ldarg(0));
        editor.emit(Instruction::call(original));
        editor.emit(Instruction::simple(Opcode::Ret));
        Ok(body)
    }
}

/// Local holding the result reported by `@async.set_result` (`None` for methods without one)
fn result_local(name: &str, body: &MethodBody) -> Result<Option<u16>, Error> {
    let set_result = body
        .iter()
        .find(|(_, insn)| insn.calls_intrinsic(&Intrinsic::AsyncSetResult))
        .map(|(id, _)| id)
        .ok_or_else(|| Error::shape(name, "completion is never reported"))?;

    let mut operand = body.prev(set_result);
    if let Some(id) = operand {
        if body.get(id).opcode == Opcode::Box {
            operand = body.prev(id);
        }
    }
    match operand.map(|id| body.get(id)) {
        Some(Instruction {
            opcode: Opcode::LdLoc,
            operand: Operand::Local(slot),
        }) => Ok(Some(*slot)),
        Some(Instruction {
            opcode: Opcode::LdNull,
            ..
        }) => Ok(None),
        _ => Err(Error::shape(
            name,
            "the reported result is not loaded from a local",
        )),
    }
}

fn instrument_step(injector: &StateMachineInjector, body: &mut MethodBody) -> Result<(), Error> {
    let name = injector.name.as_str();
    let hooks = &injector.hooks;
    let state = Storage::Field(injector.state);

    let region_idx = body
        .regions
        .iter()
        .rposition(|region| matches!(region.kind, RegionKind::Catch(_)))
        .ok_or_else(|| Error::shape(name, "no protected region around the body"))?;
    let region = body.regions[region_idx].clone();
    let result = result_local(name, body)?;
    let result_ty = match result {
        Some(slot) => body.locals[slot as usize].ty.clone(),
        None => Type::Void,
    };

    // Exits from the protected range, with their targets
    let positions = body.positions();
    let range = positions[&region.try_start]..positions[&region.try_end];
    let exits: Vec<(InsnId, InsnId)> = body
        .iter()
        .filter(|(id, insn)| insn.opcode.is_leave() && range.contains(&positions[id]))
        .filter_map(|(id, insn)| match insn.operand {
            Operand::Target(target) if !range.contains(&positions[&target]) => Some((id, target)),
            _ => None,
        })
        .collect();
    if exits.is_empty() {
        return Err(Error::shape(name, "nothing leaves the protected region"));
    }

    let awaits: Vec<InsnId> = body
        .iter()
        .filter(|(_, insn)| insn.calls_intrinsic(&Intrinsic::AsyncAwaitOnCompleted))
        .map(|(id, _)| id)
        .collect();

    let mut editor = Editor::new(body);
    let exit_slot = editor.add_local(Type::I32, Some("exitIndex"));
    let exit_idx = Storage::Local(exit_slot);
    // The finally tells faults apart from suspension by the caught exception
    let exception = if hooks.overrides(HookKind::Exception) || hooks.overrides(HookKind::Exit) {
        Some(Storage::Local(editor.add_local(Type::Object, Some("exception"))))
    } else {
        None
    };

    for call in awaits {
        editor.set_cursor(Cursor::Before(call));
        injector.call_hook(&mut editor, HookKind::Yield);
    }

    let check = editor.create_label();
    for (k, (leave, _)) in exits.iter().enumerate() {
        editor.replace(*leave, Instruction::ldc_i4(k as i32));
        let store = editor.insert_after(*leave, Instruction::stloc(exit_slot));
        editor.insert_after(store, Instruction::branch(Opcode::Leave, check));
    }

    // Everything else goes at the end of the protected range
    editor.set_cursor(Cursor::Before(region.try_end));
    editor.place_label(check);
    let post = editor.create_label();
    if hooks.overrides(HookKind::Success) {
        let skip = editor.create_label();
        editor.load(&state);
        editor.emit(Instruction::ldc_i4(RUNNING));
        editor.branch(Opcode::BneUn, skip);
        if let Some(slot) = result {
            editor.load(&injector.context);
            editor.emit(Instruction::ldloc(slot));
            editor.box_value(&result_ty);
            editor.call_intrinsic(Intrinsic::CtxSetReturnValue);
        }
        injector.call_hook(&mut editor, HookKind::Success);
        if let Some(slot) = result {
            editor.store(&Storage::Local(slot), |editor| {
                editor.load(&injector.context);
                editor.call_intrinsic(Intrinsic::CtxGetReturnValue);
                editor.unbox_value(&result_ty);
            });
        }
        editor.place_label(skip);
    }
    editor.branch(Opcode::Leave, post);

    let catch_start = exception.as_ref().map(|exception| {
        let start = editor.mark();
        editor.store(exception, |_| ());
        if hooks.overrides(HookKind::Exception) {
            editor.load(&injector.context);
            editor.load(exception);
            editor.call_intrinsic(Intrinsic::CtxSetException);
            injector.call_hook(&mut editor, HookKind::Exception);
        }
        editor.emit(Instruction::simple(Opcode::Rethrow));
        start
    });

    let finally_start = match &exception {
        Some(exception) if hooks.overrides(HookKind::Exit) => {
            let start = editor.mark();
            let run = editor.create_label();
            let skip = editor.create_label();
            editor.load(exception);
            editor.branch(Opcode::BrTrue, run);
            editor.load(&state);
            editor.emit(Instruction::ldc_i4(RUNNING));
            editor.branch(Opcode::BneUn, skip);
            editor.place_label(run);
            injector.call_hook(&mut editor, HookKind::Exit);
            editor.place_label(skip);
            editor.emit(Instruction::simple(Opcode::EndFinally));
            Some(start)
        }
        _ => None,
    };

    editor.place_label(post);
    let targets: Vec<InsnId> = exits
        .iter()
        .map(|_| editor.create_label())
        .collect();
    if targets.len() > 1 {
        editor.load(&exit_idx);
        editor.emit(Instruction::new(Opcode::Switch, Operand::Targets(targets.clone())));
    }
    for (label, (_, target)) in targets.iter().zip(&exits) {
        editor.place_label(*label);
        editor.branch(Opcode::Leave, *target);
    }

    let wrapped = protected_regions(region.try_start, catch_start, finally_start, post);
    for (offset, region) in wrapped.into_iter().enumerate() {
        body.regions.insert(region_idx + offset, region);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::{parse_module, AspectSpec, HookSet};
    use crate::weave::state_machine::weave_state_machine;

    const SOURCE: &str = r#"
        .class Machine
        .field int32 <>1__state
        .field object <>t__builder
        .field object awaiter

        .method void .ctor()
                  ret
        .end
        .method void MoveNext()
          .locals (int32 result, object error)
          TRY:    ldarg this
                  ldfld Machine::awaiter
                  call @awaiter.is_completed
                  brtrue GOT
                  ldarg this
                  ldc.i4 0
                  stfld Machine::<>1__state
                  ldarg this
                  ldfld Machine::<>t__builder
                  ldarg this
                  ldfld Machine::awaiter
                  ldarg this
                  call @async.await_on_completed
                  leave RET
          GOT:    ldc.i4 5
                  stloc result
                  leave SETRESULT
          CATCH:  stloc error
                  ldarg this
                  ldfld Machine::<>t__builder
                  ldloc error
                  call @async.set_exception
                  leave RET
          SETRESULT: ldarg this
                  ldfld Machine::<>t__builder
                  ldloc result
                  box int32
                  call @async.set_result
          RET:    ret
          .try TRY CATCH catch CATCH SETRESULT
        .end

        .class Program
        .method static object Run()
          .async Machine
                  ldnull
                  ret
        .end
    "#;

    fn weave(source: &str, spec: AspectSpec) -> Result<(Module, MethodId), Error> {
        let mut module = parse_module(source).unwrap();
        let class = module.find_class("Program").unwrap();
        let owner = module.find_method(class, "Run").unwrap();
        let original = weave_state_machine(&mut module, owner, &spec, &Settings::new(), &AsyncFlavor)?;
        Ok((module, original))
    }

    fn step_of(module: &Module, original: MethodId) -> Vec<&Instruction> {
        let body = module.method(original).body.as_ref().unwrap();
        body.iter().map(|(_, insn)| insn).collect()
    }

    #[test]
    fn yield_hook_runs_right_before_suspending() {
        let (module, original) = weave(SOURCE, AspectSpec::new("Logger")).unwrap();
        let insns = step_of(&module, original);
        let suspend = insns
            .iter()
            .position(|insn| insn.calls_intrinsic(&Intrinsic::AsyncAwaitOnCompleted))
            .unwrap();
        assert!(insns[suspend - 1].calls_intrinsic(&Intrinsic::Hook(HookKind::Yield)));
    }

    #[test]
    fn exits_go_through_the_check_block() {
        let (module, original) = weave(SOURCE, AspectSpec::new("Logger")).unwrap();
        let body = module.method(original).body.as_ref().unwrap();
        assert!(body.validate().is_ok());

        // New catch and finally go inside the compiler's region
        assert_eq!(body.regions.len(), 3);
        assert!(matches!(body.regions[0].kind, RegionKind::Catch(None)));
        assert!(body.regions[1].is_finally());

        let insns = step_of(&module, original);
        let hooks = |kind: HookKind| {
            insns
                .iter()
                .filter(|insn| insn.calls_intrinsic(&Intrinsic::Hook(kind)))
                .count()
        };
        assert_eq!(hooks(HookKind::Success), 1);
        assert_eq!(hooks(HookKind::Exception), 1);
        assert_eq!(hooks(HookKind::Exit), 1);
        assert!(insns.iter().any(|insn| insn.opcode == Opcode::Switch));
    }

    #[test]
    fn success_only_descriptors_add_no_handlers() {
        let spec = AspectSpec::new("Logger").with_hooks(HookSet::SUCCESS);
        let (module, original) = weave(SOURCE, spec).unwrap();
        let body = module.method(original).body.as_ref().unwrap();
        assert_eq!(body.regions.len(), 1);
        assert!(body.locals.iter().all(|local| local.name.as_deref() != Some("exception")));
        assert!(body.validate().is_ok());
    }

    #[test]
    fn result_must_come_from_a_local() {
        let source = SOURCE.replace("ldloc result\n                  box int32", "ldc.i4 5\n                  box int32");
        let result = weave(&source, AspectSpec::new("Logger"));
        assert!(matches!(
            result,
            Err(Error::UnsupportedShape { ref method, .. }) if method == "Program::Run"
        ));
    }

    #[test]
    fn builder_is_part_of_the_contract() {
        let source = SOURCE.replace("<>t__builder", "builder");
        let result = weave(&source, AspectSpec::new("Logger"));
        assert!(matches!(
            result,
            Err(Error::MissingMember { ref member, .. }) if member == BUILDER_FIELD
        ));
    }
}
