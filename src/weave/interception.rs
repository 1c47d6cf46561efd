//! Intercept calls
//!
//! An intercepting descriptor replaces the call itself: the original body moves to the
//! `Name<Original>` sibling, and the method becomes
//!
//! ```text,ignore,no_run
//! aspect = new Aspect(..)
//! ctx = new MethodInterceptionArgs(this, new Arguments(a, b, ..), &Name<Original>, "Class::Name")
//! aspect.OnInvoke(ctx)               // proceeds to the sibling, or not
//! return ctx.ReturnValue
//! ```
//!
//! Asynchronous methods get a dedicated state machine instead, so that the caller awaits the
//! task the invoke hook hands back before reading the return value:
//!
//! ```text,ignore,no_run
//! machine = new Class.Name<Interception>()
//! machine.*aspect* = aspect
//! machine.*aspectArgs* = ctx
//! machine.<>t__builder = AsyncTaskMethodBuilder.Create()
//! machine.<>1__state = -1
//! machine.<>t__builder.Start(machine)
//! return machine.<>t__builder.Task
//! ```
//!
//! Its `MoveNext` calls `OnInvokeAsync`, suspends until the returned task completes, then
//! completes the builder with the return value (or with the exception the task faulted with).

use super::arguments::{build_arguments_container, ArgumentSlot};
use super::async_flavor::BUILDER_FIELD;
use super::method::move_to_sibling;
use super::state_machine::STATE_FIELD;
use super::{construct_aspect, protected_regions, EditorExts, Error, Settings, Storage};
use crate::il::{
    widen_short_branches, AspectSpec, ClassId, Editor, FieldId, Instruction, Intrinsic, Method,
    MethodBody, MethodFlags, MethodId, MethodRef, Module, Opcode, Operand, StateMachine, Type,
};

/// Suffix of the state machine driving an intercepted asynchronous method
pub const INTERCEPTION_SUFFIX: &str = "<Interception>";

/// Weave an intercepting descriptor into a method, returning the sibling with the original logic
pub fn weave_interception(
    module: &mut Module,
    method: MethodId,
    spec: &AspectSpec,
    settings: &Settings,
) -> Result<MethodId, Error> {
    let name = module.qualified_name(method);
    let target = module.method(method).clone();
    let sibling = move_to_sibling(module, method, settings)?;

    let mut body = match target.state_machine {
        Some(StateMachine::Async(_)) => {
            let machine = add_machine(module, method, settings)?;
            build_async_wrapper(&name, &target, sibling, &machine, spec, settings)?
        }
        _ => build_wrapper(&name, &target, sibling, spec, settings)?,
    };
    if settings.widen_short_branches {
        widen_short_branches(&mut body);
    }
    body.validate().map_err(Error::malformed(&name))?;

    module.method_mut(method).body = Some(body);
    Ok(sibling)
}

/// Name of the state machine of an intercepted asynchronous method
pub fn machine_name(module: &Module, method: MethodId) -> String {
    format!(
        "{}.{}{}",
        module.class(method.class).name,
        module.method(method).name,
        INTERCEPTION_SUFFIX
    )
}

fn parameters(target: &Method) -> Vec<ArgumentSlot> {
    let first_param = target.first_param_slot();
    target
        .params
        .iter()
        .enumerate()
        .map(|(idx, param)| ArgumentSlot {
            storage: Storage::Arg(first_param + idx as u16),
            ty: param.ty.clone(),
        })
        .collect()
}

/// Instructions pushing a new interception context for a call to `target`, handled by `sibling`
fn new_context(
    name: &str,
    target: &Method,
    sibling: MethodId,
    settings: &Settings,
) -> Result<Vec<Instruction>, Error> {
    let mut insns = vec![if target.is_static() {
        Instruction::simple(Opcode::LdNull)
    } else {
        Instruction::ldarg(0)
    }];
    insns.extend(build_arguments_container(
        name,
        &parameters(target),
        settings.array_fallback,
    )?);
    insns.push(Instruction::new(
        Opcode::LdFtn,
        Operand::Method(MethodRef::Defined(sibling)),
    ));
    insns.push(Instruction::ldstr(name));
    insns.push(Instruction::new(
        Opcode::NewObj,
        Operand::Method(MethodRef::Intrinsic(Intrinsic::InterceptNew)),
    ));
    Ok(insns)
}

fn build_wrapper(
    name: &str,
    target: &Method,
    sibling: MethodId,
    spec: &AspectSpec,
    settings: &Settings,
) -> Result<MethodBody, Error> {
    let has_result = !target.return_type.is_void();
    let mut body = MethodBody::new(has_result);
    let mut editor = Editor::new(&mut body);
    let aspect = Storage::Local(editor.add_local(Type::Object, Some("aspect")));
    let ctx = Storage::Local(editor.add_local(Type::Object, Some("ctx")));

    editor.store(&aspect, |editor| {
        editor.emit_all(construct_aspect(spec));
    });
    let context = new_context(name, target, sibling, settings)?;
    editor.store(&ctx, |editor| {
        editor.emit_all(context);
    });

    editor.load(&aspect);
    editor.load(&ctx);
    editor.call_intrinsic(Intrinsic::InterceptInvoke);
    if has_result {
        editor.load(&ctx);
        editor.call_intrinsic(Intrinsic::InterceptGetReturnValue);
        editor.unbox_value(&target.return_type);
    }
    editor.emit(Instruction::simple(Opcode::Ret));
    Ok(body)
}

/// Members of the generated state machine
struct Machine {
    class: ClassId,
    constructor: MethodId,
    state: FieldId,
    builder: FieldId,
    awaiter: FieldId,
    aspect: FieldId,
    context: FieldId,
}

/// Add the state machine class driving an intercepted asynchronous method
fn add_machine(module: &mut Module, method: MethodId, settings: &Settings) -> Result<Machine, Error> {
    let class_name = machine_name(module, method);
    if module.find_class(&class_name).is_some() {
        return Err(Error::AlreadyWoven {
            method: module.qualified_name(method),
        });
    }

    let class = module.add_class(class_name);
    let machine = Machine {
        class,
        constructor: module.add_method(
            class,
            Method::new(".ctor", MethodFlags::SPECIAL_NAME, vec![], Type::Void),
        ),
        state: module.add_field(class, STATE_FIELD, Type::I32),
        builder: module.add_field(class, BUILDER_FIELD, Type::Object),
        awaiter: module.add_field(class, "*awaiter*", Type::Object),
        aspect: module.add_field(class, settings.aspect_field_name.as_str(), Type::Object),
        context: module.add_field(class, settings.context_field_name.as_str(), Type::Object),
    };

    let mut constructor = MethodBody::new(false);
    Editor::new(&mut constructor).emit(Instruction::simple(Opcode::Ret));
    module.method_mut(machine.constructor).body = Some(constructor);

    let move_next = build_move_next(&machine);
    module.add_method(
        class,
        Method {
            body: Some(move_next),
            ..Method::new("MoveNext", MethodFlags::empty(), vec![], Type::Void)
        },
    );
    Ok(machine)
}

fn build_move_next(machine: &Machine) -> MethodBody {
    let state = Storage::Field(machine.state);
    let builder = Storage::Field(machine.builder);
    let saved_awaiter = Storage::Field(machine.awaiter);

    let mut body = MethodBody::new(false);
    let mut editor = Editor::new(&mut body);
    let awaiter = Storage::Local(editor.add_local(Type::Object, Some("awaiter")));
    let result = Storage::Local(editor.add_local(Type::Object, Some("result")));
    let error = Storage::Local(editor.add_local(Type::Object, Some("error")));

    let ret = editor.create_label();
    let set_result = editor.create_label();
    let resume = editor.create_label();
    let got = editor.create_label();

    // try
    let try_start = editor.mark();
    editor.load(&state);
    editor.branch(Opcode::BrFalse, resume);
    editor.store(&awaiter, |editor| {
        editor.load(&Storage::Field(machine.aspect));
        editor.load(&Storage::Field(machine.context));
        editor.call_intrinsic(Intrinsic::InterceptInvokeAsync);
        editor.call_intrinsic(Intrinsic::TaskGetAwaiter);
    });
    editor.load(&awaiter);
    editor.call_intrinsic(Intrinsic::AwaiterIsCompleted);
    editor.branch(Opcode::BrTrue, got);
    editor.store(&state, |editor| {
        editor.emit(Instruction::ldc_i4(0));
    });
    editor.store(&saved_awaiter, |editor| editor.load(&awaiter));
    editor.load(&builder);
    editor.load(&awaiter);
    editor.emit(Instruction::ldarg(0));
    editor.call_intrinsic(Intrinsic::AsyncAwaitOnCompleted);
    editor.branch(Opcode::Leave, ret);

    editor.place_label(resume);
    editor.store(&awaiter, |editor| editor.load(&saved_awaiter));
    editor.store(&saved_awaiter, |editor| {
        editor.emit(Instruction::simple(Opcode::LdNull));
    });
    editor.store(&state, |editor| {
        editor.emit(Instruction::ldc_i4(-1));
    });

    editor.place_label(got);
    editor.load(&awaiter);
    editor.call_intrinsic(Intrinsic::AwaiterGetResult);
    editor.emit(Instruction::simple(Opcode::Pop));
    editor.store(&result, |editor| {
        editor.load(&Storage::Field(machine.context));
        editor.call_intrinsic(Intrinsic::InterceptGetReturnValue);
    });
    editor.branch(Opcode::Leave, set_result);

    // catch
    let catch_start = editor.mark();
    editor.store(&error, |_| ());
    editor.store(&state, |editor| {
        editor.emit(Instruction::ldc_i4(-2));
    });
    editor.load(&builder);
    editor.load(&error);
    editor.call_intrinsic(Intrinsic::AsyncSetException);
    editor.branch(Opcode::Leave, ret);

    editor.place_label(set_result);
    editor.store(&state, |editor| {
        editor.emit(Instruction::ldc_i4(-2));
    });
    editor.load(&builder);
    editor.load(&result);
    editor.call_intrinsic(Intrinsic::AsyncSetResult);

    editor.place_label(ret);
    editor.emit(Instruction::simple(Opcode::Ret));

    body.regions
        .extend(protected_regions(try_start, Some(catch_start), None, set_result));
    body
}

fn build_async_wrapper(
    name: &str,
    target: &Method,
    sibling: MethodId,
    machine: &Machine,
    spec: &AspectSpec,
    settings: &Settings,
) -> Result<MethodBody, Error> {
    let context = new_context(name, target, sibling, settings)?;

    let mut body = MethodBody::new(true);
    let mut editor = Editor::new(&mut body);
    let instance = Storage::Local(editor.add_local(Type::Class(machine.class), Some("machine")));

    editor.store(&instance, |editor| {
        editor.emit(Instruction::new(
            Opcode::NewObj,
            Operand::Method(MethodRef::Defined(machine.constructor)),
        ));
    });
    store_field(&mut editor, &instance, machine.aspect, |editor| {
        editor.emit_all(construct_aspect(spec));
    });
    store_field(&mut editor, &instance, machine.context, |editor| {
        editor.emit_all(context);
    });
    store_field(&mut editor, &instance, machine.builder, |editor| {
        editor.call_intrinsic(Intrinsic::AsyncCreate);
    });
    store_field(&mut editor, &instance, machine.state, |editor| {
        editor.emit(Instruction::ldc_i4(-1));
    });

    editor.load(&instance);
    editor.emit(Instruction::ldfld(machine.builder));
    editor.load(&instance);
    editor.call_intrinsic(Intrinsic::AsyncStart);
    editor.load(&instance);
    editor.emit(Instruction::ldfld(machine.builder));
    editor.call_intrinsic(Intrinsic::AsyncTask);
    editor.emit(Instruction::simple(Opcode::Ret));
    Ok(body)
}

/// Store into a field of the object held in `object`
fn store_field<'b>(
    editor: &mut Editor<'b>,
    object: &Storage,
    field: FieldId,
    value: impl FnOnce(&mut Editor<'b>),
) {
    editor.load(object);
    value(editor);
    editor.emit(Instruction::stfld(field));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::parse_module;

    const SOURCE: &str = r#"
        .class Program
        .method static int32 Add(int32 a, int32 b)
                  ldarg a
                  ldarg b
                  add
                  ret
        .end
        .method static object Later(int32 x)
          .async Program
                  ldarg x
                  box int32
                  call @task.from_result
                  ret
        .end
    "#;

    fn weave(name: &str) -> (Module, MethodId, MethodId) {
        let mut module = parse_module(SOURCE).unwrap();
        let class = module.find_class("Program").unwrap();
        let method = module.find_method(class, name).unwrap();
        let spec = AspectSpec::interception("Interceptor");
        let sibling = weave_interception(&mut module, method, &spec, &Settings::new()).unwrap();
        (module, method, sibling)
    }

    fn intrinsics(body: &MethodBody) -> Vec<Intrinsic> {
        body.iter()
            .filter_map(|(_, insn)| match &insn.operand {
                Operand::Method(MethodRef::Intrinsic(intrinsic)) => Some(intrinsic.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn wrapper_hands_the_sibling_to_the_hook() {
        let before = parse_module(SOURCE).unwrap();
        let (module, method, sibling) = weave("Add");
        assert_eq!(module.method(sibling).name, "Add<Original>");
        assert_eq!(module.method(sibling).body, before.method(method).body);

        let body = module.method(method).body.as_ref().unwrap();
        assert!(body.regions.is_empty());
        assert!(body.validate().is_ok());
        assert!(body.iter().any(|(_, insn)| {
            insn.opcode == Opcode::LdFtn
                && insn.operand == Operand::Method(MethodRef::Defined(sibling))
        }));
        let calls = intrinsics(body);
        assert!(calls.contains(&Intrinsic::InterceptNew));
        assert!(calls.contains(&Intrinsic::InterceptInvoke));
        assert!(calls.contains(&Intrinsic::InterceptGetReturnValue));
        assert!(!calls.iter().any(|call| matches!(call, Intrinsic::Hook(_))));
    }

    #[test]
    fn asynchronous_methods_get_their_own_machine() {
        let (module, method, _) = weave("Later");
        let machine = module.find_class("Program.Later<Interception>").unwrap();
        for field in [STATE_FIELD, BUILDER_FIELD, "*aspect*", "*aspectArgs*"] {
            assert!(module.find_field(machine, field).is_some(), "{}", field);
        }

        let move_next = module.find_method(machine, "MoveNext").unwrap();
        let body = module.method(move_next).body.as_ref().unwrap();
        assert!(body.validate().is_ok());
        assert_eq!(body.regions.len(), 1);
        assert!(body.regions[0].is_catch_all());
        assert!(intrinsics(body).contains(&Intrinsic::InterceptInvokeAsync));

        let owner = intrinsics(module.method(method).body.as_ref().unwrap());
        assert!(owner.contains(&Intrinsic::AsyncStart));
        assert!(!owner.contains(&Intrinsic::InterceptInvoke));
    }
}
