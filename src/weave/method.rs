//! Wrap plain methods
//!
//! The original body moves to a private sibling (`Name<Original>`) and the method itself is
//! rebuilt into a wrapper calling it:
//!
//! ```text,ignore,no_run
//! aspect = new Aspect(..)
//! args = new Arguments(a, b, ..)
//! ctx = new MethodExecutionArgs(this, args)
//! aspect.OnEntry(ctx)
//! a, b, .. = args                    // copy-back
//! try {
//!     result = Name<Original>(a, b, ..)
//!     ctx.ReturnValue = result
//!     aspect.OnSuccess(ctx)
//! } catch (e) {
//!     ctx.Exception = e
//!     aspect.OnException(ctx)
//!     rethrow
//! } finally {
//!     aspect.OnExit(ctx)
//! }
//! return ctx.ReturnValue
//! ```
//!
//! Hooks the descriptor doesn't override are left out, along with any handler that ends up
//! empty.

use super::arguments::{build_arguments_container, emit_copy_back, ArgumentSlot};
use super::{
    construct_aspect, protected_regions, CopyBack, EditorExts, Error, HookTable, Settings, Storage,
};
use crate::il::{
    widen_short_branches, AspectSpec, Editor, HookKind, Instruction, Intrinsic, Method,
    MethodBody, MethodFlags, MethodId, Module, Opcode, Type,
};

/// Weave a method whose logic is all in its own body
pub fn weave_plain(
    module: &mut Module,
    method: MethodId,
    spec: &AspectSpec,
    settings: &Settings,
) -> Result<MethodId, Error> {
    let name = module.qualified_name(method);
    let target = module.method(method).clone();
    let sibling = move_to_sibling(module, method, settings)?;

    let mut body = build_wrapper(&name, &target, sibling, spec, settings)?;
    if settings.widen_short_branches {
        widen_short_branches(&mut body);
    }
    body.validate().map_err(Error::malformed(&name))?;

    module.method_mut(method).body = Some(body);
    Ok(sibling)
}

/// Copy the body of `method` into a new private `Name<Original>` sibling with the same signature
pub(crate) fn move_to_sibling(
    module: &mut Module,
    method: MethodId,
    settings: &Settings,
) -> Result<MethodId, Error> {
    let name = module.qualified_name(method);
    let target = module.method(method);
    let mut original = target
        .body
        .clone()
        .ok_or_else(|| Error::NoBody { method: name.clone() })?;
    original.validate().map_err(Error::malformed(&name))?;
    ensure_trailing_return(&mut original);

    let sibling = Method {
        body: Some(original),
        ..Method::new(
            settings.original_name(&target.name),
            target.flags | MethodFlags::PRIVATE,
            target.params.clone(),
            target.return_type.clone(),
        )
    };
    Ok(module.add_method(method.class, sibling))
}

/// Give a body that ends by throwing an unreachable trailing `ret`
///
/// Region ends at the end of the body are pinned to the new instruction so that they keep
/// covering the same range.
pub(crate) fn ensure_trailing_return(body: &mut MethodBody) {
    let ends_in_throw = match body.last() {
        Some(last) => matches!(body.get(last).opcode, Opcode::Throw | Opcode::Rethrow),
        None => false,
    };
    if !ends_in_throw {
        return;
    }
    let ret = Editor::new(body).append(Instruction::simple(Opcode::Ret));
    for region in &mut body.regions {
        region.handler_end.get_or_insert(ret);
    }
}

fn build_wrapper(
    name: &str,
    target: &Method,
    sibling: MethodId,
    spec: &AspectSpec,
    settings: &Settings,
) -> Result<MethodBody, Error> {
    let hooks = HookTable::new(spec);
    let result_type = target.return_type.clone();
    let has_result = !result_type.is_void();

    let mut body = MethodBody::new(has_result);
    let mut editor = Editor::new(&mut body);
    let aspect = Storage::Local(editor.add_local(Type::Object, Some("aspect")));
    let args = Storage::Local(editor.add_local(Type::Object, Some("args")));
    let ctx = Storage::Local(editor.add_local(Type::Object, Some("ctx")));
    let result = if has_result {
        Some(Storage::Local(editor.add_local(result_type.clone(), Some("result"))))
    } else {
        None
    };

    let first_param = target.first_param_slot();
    let params: Vec<ArgumentSlot> = target
        .params
        .iter()
        .enumerate()
        .map(|(idx, param)| ArgumentSlot {
            storage: Storage::Arg(first_param + idx as u16),
            ty: param.ty.clone(),
        })
        .collect();

    editor.store(&aspect, |editor| {
        editor.emit_all(construct_aspect(spec));
    });
    let container = build_arguments_container(name, &params, settings.array_fallback)?;
    editor.store(&args, |editor| {
        editor.emit_all(container);
    });
    editor.store(&ctx, |editor| {
        if target.is_static() {
            editor.emit(Instruction::simple(Opcode::LdNull));
        } else {
            editor.emit(Instruction::ldarg(0));
        }
        editor.load(&args);
        editor.new_intrinsic(Intrinsic::CtxNew);
    });
    editor.load(&ctx);
    editor.emit(Instruction::ldstr(name));
    editor.call_intrinsic(Intrinsic::CtxSetMethod);

    editor.call_hook(&hooks, HookKind::Entry, &aspect, &ctx);
    if hooks.overrides(HookKind::Entry) {
        emit_copy_back(
            &mut editor,
            &args,
            &params,
            settings.copy_back == CopyBack::ModifiedOnly,
        );
    }

    // try
    let end = editor.create_label();
    let try_start = editor.mark();
    for slot in 0..target.arg_count() {
        editor.emit(Instruction::ldarg(slot as u16));
    }
    editor.emit(Instruction::call(sibling));
    if let Some(result) = &result {
        editor.store(result, |_| ());
        editor.load(&ctx);
        editor.load(result);
        editor.box_value(&result_type);
        editor.call_intrinsic(Intrinsic::CtxSetReturnValue);
    }
    editor.call_hook(&hooks, HookKind::Success, &aspect, &ctx);
    editor.branch(Opcode::Leave, end);

    // catch
    let catch_start = if hooks.overrides(HookKind::Exception) {
        let start = editor.mark();
        let exception = Storage::Local(editor.add_local(Type::Object, Some("exception")));
        editor.store(&exception, |_| ());
        editor.load(&ctx);
        editor.load(&exception);
        editor.call_intrinsic(Intrinsic::CtxSetException);
        editor.call_hook(&hooks, HookKind::Exception, &aspect, &ctx);
        editor.emit(Instruction::simple(Opcode::Rethrow));
        Some(start)
    } else {
        None
    };

    // finally
    let finally_start = if hooks.overrides(HookKind::Exit) {
        let start = editor.mark();
        editor.call_hook(&hooks, HookKind::Exit, &aspect, &ctx);
        editor.emit(Instruction::simple(Opcode::EndFinally));
        Some(start)
    } else {
        None
    };

    editor.place_label(end);
    if has_result {
        editor.load(&ctx);
        editor.call_intrinsic(Intrinsic::CtxGetReturnValue);
        editor.unbox_value(&result_type);
    }
    editor.emit(Instruction::simple(Opcode::Ret));

    body.regions
        .extend(protected_regions(try_start, catch_start, finally_start, end));
    Ok(body)
}
