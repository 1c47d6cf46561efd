//! Iterator state machines
//!
//! Each call to `MoveNext` steps the iterator once. The rebuilt `MoveNext` runs the step inside
//! the same try/catch/finally as a plain method, except that the finally only runs the exit hook
//! once the iterator is done (completed or faulted), which `*exitFlag*` records. A step that
//! produced a value runs the yield hook, which sees the value in the context and may replace it.
//!
//! `Dispose` is rebuilt as well: disposing an iterator that was started but not finished runs the
//! exit hook. `*isDisposing*` guards against reentry while disposal is under way (`1` while the
//! original `Dispose` runs, `2` while the exit hook runs), so neither a `Dispose` that steps the
//! iterator nor a hook that disposes it again recurses.

use super::state_machine::{StateMachineFlavor, StateMachineInjector};
use super::{protected_regions, EditorExts, Error, Settings, Storage};
use crate::il::{
    Editor, FieldId, HookKind, Instruction, Intrinsic, MethodBody, MethodId, Module, Opcode, Type,
};

/// Field holding the last produced value
pub const CURRENT_FIELD: &str = "<>2__current";

pub struct IteratorFlavor;

pub struct IteratorFields {
    current: FieldId,
    current_ty: Type,
    dispose: MethodId,
    exit_flag: Storage,
    disposing: Storage,
}

fn set_flag(editor: &mut Editor, flag: &Storage, value: i32) {
    editor.store(flag, |editor| {
        editor.emit(Instruction::ldc_i4(value));
    });
}

impl StateMachineFlavor for IteratorFlavor {
    type Fields = IteratorFields;

    fn add_fields(
        &self,
        module: &mut Module,
        injector: &StateMachineInjector,
        settings: &Settings,
    ) -> Result<IteratorFields, Error> {
        let current = injector.contract_field(module, CURRENT_FIELD)?;
        let dispose = injector.contract_method(module, "Dispose")?;
        Ok(IteratorFields {
            current,
            current_ty: module.field(current).ty.clone(),
            dispose,
            exit_flag: injector.add_field(module, &settings.exit_flag_field_name, Type::Bool),
            disposing: injector.add_field(module, &settings.disposing_field_name, Type::I32),
        })
    }

    fn rebuild_move_next(
        &self,
        _module: &mut Module,
        injector: &StateMachineInjector,
        fields: &IteratorFields,
        original: MethodId,
        settings: &Settings,
    ) -> Result<MethodBody, Error> {
        let hooks = &injector.hooks;
        let current = Storage::Field(fields.current);

        let mut body = MethodBody::new(true);
        let mut editor = Editor::new(&mut body);
        let result = Storage::Local(editor.add_local(Type::Bool, Some("result")));

        // Finished or being disposed: step without hooks
        let pass = editor.create_label();
        editor.load(&fields.exit_flag);
        editor.branch(Opcode::BrTrue, pass);
        editor.load(&fields.disposing);
        editor.branch(Opcode::BrTrue, pass);

        injector.emit_prologue(&mut editor, settings)?;

        // try
        let end = editor.create_label();
        let try_start = editor.mark();
        editor.emit(Instruction::ldarg(0));
        editor.emit(Instruction::call(original));
        editor.store(&result, |_| ());
        let completed = editor.create_label();
        editor.load(&result);
        editor.branch(Opcode::BrFalse, completed);

        if hooks.overrides(HookKind::Yield) {
            editor.load(&injector.context);
            editor.load(&current);
            editor.box_value(&fields.current_ty);
            editor.call_intrinsic(Intrinsic::CtxSetYieldValue);
            injector.call_hook(&mut editor, HookKind::Yield);
            editor.store(&current, |editor| {
                editor.load(&injector.context);
                editor.call_intrinsic(Intrinsic::CtxGetYieldValue);
                editor.unbox_value(&fields.current_ty);
            });
        }
        editor.branch(Opcode::Leave, end);

        editor.place_label(completed);
        set_flag(&mut editor, &fields.exit_flag, 1);
        injector.call_hook(&mut editor, HookKind::Success);
        editor.branch(Opcode::Leave, end);

        // catch: a fault always finishes the iterator, whichever hooks are overridden
        let catch_start = editor.mark();
        if hooks.overrides(HookKind::Exception) {
            let exception = Storage::Local(editor.add_local(Type::Object, Some("exception")));
            editor.store(&exception, |_| ());
            set_flag(&mut editor, &fields.exit_flag, 1);
            editor.load(&injector.context);
            editor.load(&exception);
            editor.call_intrinsic(Intrinsic::CtxSetException);
            injector.call_hook(&mut editor, HookKind::Exception);
        } else {
            editor.emit(Instruction::simple(Opcode::Pop));
            set_flag(&mut editor, &fields.exit_flag, 1);
        }
        editor.emit(Instruction::simple(Opcode::Rethrow));

        // finally
        let finally_start = if hooks.overrides(HookKind::Exit) {
            let start = editor.mark();
            let skip = editor.create_label();
            editor.load(&fields.exit_flag);
            editor.branch(Opcode::BrFalse, skip);
            injector.call_hook(&mut editor, HookKind::Exit);
            editor.place_label(skip);
            editor.emit(Instruction::simple(Opcode::EndFinally));
            Some(start)
        } else {
            None
        };

        editor.place_label(end);
        editor.load(&result);
        editor.emit(Instruction::simple(Opcode::Ret));

        editor.place_label(pass);
        editor.emit(Instruction::ldarg(0));
        editor.emit(Instruction::call(original));
        editor.emit(Instruction::simple(Opcode::Ret));

        body.regions
            .extend(protected_regions(try_start, Some(catch_start), finally_start, end));
        Ok(body)
    }

    fn rewrite_auxiliary(
        &self,
        module: &mut Module,
        injector: &StateMachineInjector,
        fields: &IteratorFields,
        settings: &Settings,
    ) -> Result<(), Error> {
        let original = injector.clone_method(module, fields.dispose, settings)?;

        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);

        // Not started, already finished, or reentered: just dispose
        let plain = editor.create_label();
        editor.load(&fields.exit_flag);
        editor.branch(Opcode::BrTrue, plain);
        editor.load(&injector.resume_flag);
        editor.branch(Opcode::BrFalse, plain);
        editor.load(&fields.disposing);
        editor.branch(Opcode::BrTrue, plain);

        set_flag(&mut editor, &fields.disposing, 1);
        let end = editor.create_label();
        let try_start = editor.mark();
        editor.emit(Instruction::ldarg(0));
        editor.emit(Instruction::call(original));
        editor.branch(Opcode::Leave, end);

        let finally_start = editor.mark();
        set_flag(&mut editor, &fields.disposing, 2);
        set_flag(&mut editor, &fields.exit_flag, 1);
        injector.call_hook(&mut editor, HookKind::Exit);
        set_flag(&mut editor, &fields.disposing, 0);
        editor.emit(Instruction::simple(Opcode::EndFinally));

        editor.place_label(end);
        editor.emit(Instruction::simple(Opcode::Ret));

        editor.place_label(plain);
        editor.emit(Instruction::ldarg(0));
        editor.emit(Instruction::call(original));
        editor.emit(Instruction::simple(Opcode::Ret));

        body.regions
            .extend(protected_regions(try_start, None, Some(finally_start), end));
        injector.finish(&mut body, settings)?;
        module.method_mut(fields.dispose).body = Some(body);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::parse_module;
    use crate::weave::state_machine::weave_state_machine;
    use crate::il::{AspectSpec, HookSet};

    const SOURCE: &str = r#"
        .class Counter
        .field int32 <>1__state
        .field object <>2__current
        .field int32 limit

        .method void .ctor()
                  ret
        .end
        .method bool MoveNext()
                  ldc.i4 0
                  ret
        .end
        .method void Dispose()
                  ret
        .end

        .class Program
        .method static object Count(int32 limit)
          .iterator Counter
                  ldnull
                  ret
        .end
    "#;

    fn weave(spec: AspectSpec) -> Module {
        let mut module = parse_module(SOURCE).unwrap();
        let class = module.find_class("Program").unwrap();
        let owner = module.find_method(class, "Count").unwrap();
        weave_state_machine(&mut module, owner, &spec, &Settings::new(), &IteratorFlavor).unwrap();
        module
    }

    #[test]
    fn adds_iterator_fields_and_siblings() {
        let module = weave(AspectSpec::new("Logger"));
        let record = module.find_class("Counter").unwrap();
        for field in ["*aspect*", "*aspectArgs*", "*args*", "*resumeFlag*", "*exitFlag*", "*isDisposing*"] {
            assert!(module.find_field(record, field).is_some(), "{}", field);
        }
        for method in ["MoveNext<Original>", "Dispose<Original>"] {
            assert!(module.find_method(record, method).is_some(), "{}", method);
        }

        let move_next = module.find_method(record, "MoveNext").unwrap();
        let body = module.method(move_next).body.as_ref().unwrap();
        assert_eq!(body.regions.len(), 2);
        assert!(body.validate().is_ok());

        let dispose = module.find_method(record, "Dispose").unwrap();
        let body = module.method(dispose).body.as_ref().unwrap();
        assert_eq!(body.regions.len(), 1);
        assert!(body.regions[0].is_finally());
    }

    #[test]
    fn catch_kept_for_exit_only_descriptors() {
        let module = weave(AspectSpec::new("Timer").with_hooks(HookSet::EXIT));
        let record = module.find_class("Counter").unwrap();
        let move_next = module.find_method(record, "MoveNext").unwrap();
        let body = module.method(move_next).body.as_ref().unwrap();
        assert_eq!(body.regions.len(), 2);
        assert!(!body
            .iter()
            .any(|(_, insn)| insn.calls_intrinsic(&Intrinsic::CtxSetException)));
    }

    #[test]
    fn faults_finish_the_iterator_without_fault_hooks() {
        let module = weave(AspectSpec::new("Recorder").with_hooks(HookSet::ENTRY | HookSet::SUCCESS));
        let record = module.find_class("Counter").unwrap();
        let move_next = module.find_method(record, "MoveNext").unwrap();
        let body = module.method(move_next).body.as_ref().unwrap();
        assert_eq!(body.regions.len(), 1);
        assert!(body.regions[0].is_catch_all());
        assert!(body.locals.iter().all(|local| local.name.as_deref() != Some("exception")));
        assert!(body.validate().is_ok());
    }

    #[test]
    fn missing_current_field_is_reported() {
        let mut module = parse_module(&SOURCE.replace(".field object <>2__current\n", "")).unwrap();
        let class = module.find_class("Program").unwrap();
        let owner = module.find_method(class, "Count").unwrap();
        let result = weave_state_machine(
            &mut module,
            owner,
            &AspectSpec::new("Logger"),
            &Settings::new(),
            &IteratorFlavor,
        );
        assert!(matches!(
            result,
            Err(Error::MissingMember { ref member, .. }) if member == CURRENT_FIELD
        ));
    }
}
