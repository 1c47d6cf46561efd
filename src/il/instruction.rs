use super::{FieldId, HookKind, MethodId, Opcode, Type};
use crate::util::Width;
use std::fmt;

/// Stable handle to an instruction inside a [`MethodBody`](super::MethodBody)
///
/// Handles stay valid across insertions and removals, so branch operands and exception region
/// boundaries can refer to instructions directly.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InsnId(pub(crate) u32);

impl InsnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InsnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("i{}", self.0))
    }
}

/// One stack-machine operation
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Arg(u16),
    Local(u16),
    Field(FieldId),
    Method(MethodRef),
    Type(Type),
    Target(InsnId),
    Targets(Vec<InsnId>),

    /// Branch whose target has not been decided yet
    Pending,
}

/// Call target: either a method defined in the module or a runtime intrinsic
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MethodRef {
    Defined(MethodId),
    Intrinsic(Intrinsic),
}

/// Operations provided by the runtime rather than by the module
///
/// These cover the containers passed to hooks (arguments, execution context), the hooks
/// themselves, the invoke hook of intercepting descriptors, and the task machinery that asynchronous state machines are written against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// `(v1 .. vN) -> args`, fixed-arity container (`N <= 8`)
    ArgsNew(u8),
    /// `(object[]) -> args`
    ArgsFromArray,
    /// `(args, int32) -> object`
    ArgsGet,
    /// `(args, int32, object) -> ()`
    ArgsSet,
    /// `(args, int32) -> bool`
    ArgsIsModified,
    /// `(args) -> int32`
    ArgsCount,

    /// `(instance, args) -> ctx`
    CtxNew,
    /// `(ctx, string) -> ()`
    CtxSetMethod,
    CtxGetReturnValue,
    CtxSetReturnValue,
    CtxGetYieldValue,
    CtxSetYieldValue,
    CtxGetException,
    CtxSetException,
    CtxGetArguments,

    /// `(aspect, ctx) -> ()`
    Hook(HookKind),
    /// `(c1 .. cN) -> aspect`
    AspectNew { type_name: String, arity: u8 },

    /// `(instance, args, method, string) -> ctx`, context of an intercepted call
    InterceptNew,
    /// `(aspect, ctx) -> ()`
    InterceptInvoke,
    /// `(aspect, ctx) -> task`
    InterceptInvokeAsync,
    /// `(ctx) -> object`
    InterceptGetReturnValue,

    /// `(object) -> ()`, appends to the trace log
    Trace,
    /// `(string) -> exception`
    ExceptionNew,

    /// `() -> task`, completes on the next scheduler tick
    TaskYield,
    /// `(object) -> task`, already completed
    TaskFromResult,
    /// `(task) -> awaiter`
    TaskGetAwaiter,
    /// `(awaiter) -> bool`
    AwaiterIsCompleted,
    /// `(awaiter) -> object`
    AwaiterGetResult,

    /// `() -> builder`
    AsyncCreate,
    /// `(builder, machine) -> ()`, runs the first `MoveNext`
    AsyncStart,
    /// `(builder) -> task`
    AsyncTask,
    /// `(builder, awaiter, machine) -> ()`, schedules `MoveNext` once the awaiter completes
    AsyncAwaitOnCompleted,
    /// `(builder, object) -> ()`
    AsyncSetResult,
    /// `(builder, exception) -> ()`
    AsyncSetException,
}

impl Intrinsic {
    /// Number of values popped off the stack and whether a value is pushed back
    pub fn stack_effect(&self) -> (usize, bool) {
        match self {
            Intrinsic::ArgsNew(arity) => (*arity as usize, true),
            Intrinsic::ArgsFromArray => (1, true),
            Intrinsic::ArgsGet => (2, true),
            Intrinsic::ArgsSet => (3, false),
            Intrinsic::ArgsIsModified => (2, true),
            Intrinsic::ArgsCount => (1, true),
            Intrinsic::CtxNew => (2, true),
            Intrinsic::CtxSetMethod
            | Intrinsic::CtxSetReturnValue
            | Intrinsic::CtxSetYieldValue
            | Intrinsic::CtxSetException => (2, false),
            Intrinsic::CtxGetReturnValue
            | Intrinsic::CtxGetYieldValue
            | Intrinsic::CtxGetException
            | Intrinsic::CtxGetArguments => (1, true),
            Intrinsic::Hook(_) => (2, false),
            Intrinsic::AspectNew { arity, .. } => (*arity as usize, true),
            Intrinsic::InterceptNew => (4, true),
            Intrinsic::InterceptInvoke => (2, false),
            Intrinsic::InterceptInvokeAsync => (2, true),
            Intrinsic::InterceptGetReturnValue => (1, true),
            Intrinsic::Trace => (1, false),
            Intrinsic::ExceptionNew => (1, true),
            Intrinsic::TaskYield => (0, true),
            Intrinsic::TaskFromResult
            | Intrinsic::TaskGetAwaiter
            | Intrinsic::AwaiterIsCompleted
            | Intrinsic::AwaiterGetResult => (1, true),
            Intrinsic::AsyncCreate => (0, true),
            Intrinsic::AsyncStart => (2, false),
            Intrinsic::AsyncTask => (1, true),
            Intrinsic::AsyncAwaitOnCompleted => (3, false),
            Intrinsic::AsyncSetResult | Intrinsic::AsyncSetException => (2, false),
        }
    }

    /// Name used in the assembly syntax (without the leading `@`)
    pub fn name(&self) -> String {
        let fixed = match self {
            Intrinsic::ArgsNew(arity) => return format!("args.new/{}", arity),
            Intrinsic::AspectNew { type_name, arity } => {
                return format!("aspect.new/{}/{}", type_name, arity)
            }
            Intrinsic::Hook(kind) => return format!("hook.{}", kind.name()),
            Intrinsic::ArgsFromArray => "args.from_array",
            Intrinsic::ArgsGet => "args.get",
            Intrinsic::ArgsSet => "args.set",
            Intrinsic::ArgsIsModified => "args.is_modified",
            Intrinsic::ArgsCount => "args.count",
            Intrinsic::CtxNew => "ctx.new",
            Intrinsic::CtxSetMethod => "ctx.set_method",
            Intrinsic::CtxGetReturnValue => "ctx.get_return_value",
            Intrinsic::CtxSetReturnValue => "ctx.set_return_value",
            Intrinsic::CtxGetYieldValue => "ctx.get_yield_value",
            Intrinsic::CtxSetYieldValue => "ctx.set_yield_value",
            Intrinsic::CtxGetException => "ctx.get_exception",
            Intrinsic::CtxSetException => "ctx.set_exception",
            Intrinsic::CtxGetArguments => "ctx.get_arguments",
            Intrinsic::InterceptNew => "intercept.new",
            Intrinsic::InterceptInvoke => "intercept.invoke",
            Intrinsic::InterceptInvokeAsync => "intercept.invoke_async",
            Intrinsic::InterceptGetReturnValue => "intercept.get_return_value",
            Intrinsic::Trace => "trace",
            Intrinsic::ExceptionNew => "exception.new",
            Intrinsic::TaskYield => "task.yield",
            Intrinsic::TaskFromResult => "task.from_result",
            Intrinsic::TaskGetAwaiter => "task.get_awaiter",
            Intrinsic::AwaiterIsCompleted => "awaiter.is_completed",
            Intrinsic::AwaiterGetResult => "awaiter.get_result",
            Intrinsic::AsyncCreate => "async.create",
            Intrinsic::AsyncStart => "async.start",
            Intrinsic::AsyncTask => "async.task",
            Intrinsic::AsyncAwaitOnCompleted => "async.await_on_completed",
            Intrinsic::AsyncSetResult => "async.set_result",
            Intrinsic::AsyncSetException => "async.set_exception",
        };
        fixed.to_owned()
    }

    pub fn from_name(name: &str) -> Option<Intrinsic> {
        if let Some(arity) = name.strip_prefix("args.new/") {
            return arity.parse().ok().map(Intrinsic::ArgsNew);
        }
        if let Some(rest) = name.strip_prefix("aspect.new/") {
            let (type_name, arity) = rest.rsplit_once('/')?;
            return Some(Intrinsic::AspectNew {
                type_name: type_name.to_owned(),
                arity: arity.parse().ok()?,
            });
        }
        if let Some(kind) = name.strip_prefix("hook.") {
            return HookKind::from_name(kind).map(Intrinsic::Hook);
        }
        Some(match name {
            "args.from_array" => Intrinsic::ArgsFromArray,
            "args.get" => Intrinsic::ArgsGet,
            "args.set" => Intrinsic::ArgsSet,
            "args.is_modified" => Intrinsic::ArgsIsModified,
            "args.count" => Intrinsic::ArgsCount,
            "ctx.new" => Intrinsic::CtxNew,
            "ctx.set_method" => Intrinsic::CtxSetMethod,
            "ctx.get_return_value" => Intrinsic::CtxGetReturnValue,
            "ctx.set_return_value" => Intrinsic::CtxSetReturnValue,
            "ctx.get_yield_value" => Intrinsic::CtxGetYieldValue,
            "ctx.set_yield_value" => Intrinsic::CtxSetYieldValue,
            "ctx.get_exception" => Intrinsic::CtxGetException,
            "ctx.set_exception" => Intrinsic::CtxSetException,
            "ctx.get_arguments" => Intrinsic::CtxGetArguments,
            "intercept.new" => Intrinsic::InterceptNew,
            "intercept.invoke" => Intrinsic::InterceptInvoke,
            "intercept.invoke_async" => Intrinsic::InterceptInvokeAsync,
            "intercept.get_return_value" => Intrinsic::InterceptGetReturnValue,
            "trace" => Intrinsic::Trace,
            "exception.new" => Intrinsic::ExceptionNew,
            "task.yield" => Intrinsic::TaskYield,
            "task.from_result" => Intrinsic::TaskFromResult,
            "task.get_awaiter" => Intrinsic::TaskGetAwaiter,
            "awaiter.is_completed" => Intrinsic::AwaiterIsCompleted,
            "awaiter.get_result" => Intrinsic::AwaiterGetResult,
            "async.create" => Intrinsic::AsyncCreate,
            "async.start" => Intrinsic::AsyncStart,
            "async.task" => Intrinsic::AsyncTask,
            "async.await_on_completed" => Intrinsic::AsyncAwaitOnCompleted,
            "async.set_result" => Intrinsic::AsyncSetResult,
            "async.set_exception" => Intrinsic::AsyncSetException,
            _ => return None,
        })
    }
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: Operand) -> Instruction {
        Instruction { opcode, operand }
    }

    /// Instruction without an operand
    pub fn simple(opcode: Opcode) -> Instruction {
        Instruction::new(opcode, Operand::None)
    }

    pub fn nop() -> Instruction {
        Instruction::simple(Opcode::Nop)
    }

    pub fn ldc_i4(value: i32) -> Instruction {
        Instruction::new(Opcode::LdcI4, Operand::I32(value))
    }

    pub fn ldstr(value: impl Into<String>) -> Instruction {
        Instruction::new(Opcode::LdStr, Operand::Str(value.into()))
    }

    pub fn ldarg(slot: u16) -> Instruction {
        Instruction::new(Opcode::LdArg, Operand::Arg(slot))
    }

    pub fn starg(slot: u16) -> Instruction {
        Instruction::new(Opcode::StArg, Operand::Arg(slot))
    }

    pub fn ldloc(slot: u16) -> Instruction {
        Instruction::new(Opcode::LdLoc, Operand::Local(slot))
    }

    pub fn stloc(slot: u16) -> Instruction {
        Instruction::new(Opcode::StLoc, Operand::Local(slot))
    }

    pub fn ldfld(field: FieldId) -> Instruction {
        Instruction::new(Opcode::LdFld, Operand::Field(field))
    }

    pub fn stfld(field: FieldId) -> Instruction {
        Instruction::new(Opcode::StFld, Operand::Field(field))
    }

    pub fn call(method: MethodId) -> Instruction {
        Instruction::new(Opcode::Call, Operand::Method(MethodRef::Defined(method)))
    }

    pub fn intrinsic(intrinsic: Intrinsic) -> Instruction {
        Instruction::new(Opcode::Call, Operand::Method(MethodRef::Intrinsic(intrinsic)))
    }

    pub fn typed(opcode: Opcode, ty: Type) -> Instruction {
        Instruction::new(opcode, Operand::Type(ty))
    }

    pub fn branch(opcode: Opcode, target: InsnId) -> Instruction {
        debug_assert!(opcode.is_branch() && opcode != Opcode::Switch);
        Instruction::new(opcode, Operand::Target(target))
    }

    /// Is this a `call`/`callvirt`/`newobj` of the given intrinsic?
    pub fn calls_intrinsic(&self, intrinsic: &Intrinsic) -> bool {
        matches!(&self.operand, Operand::Method(MethodRef::Intrinsic(called)) if called == intrinsic)
    }

    /// Branch targets (empty for non-branches and pending branches)
    pub fn targets(&self) -> Vec<InsnId> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::Targets(targets) => targets.clone(),
            _ => vec![],
        }
    }

    /// Apply a function to every branch target in place
    pub fn map_targets(&mut self, mut f: impl FnMut(InsnId) -> InsnId) {
        match &mut self.operand {
            Operand::Target(target) => *target = f(*target),
            Operand::Targets(targets) => {
                for target in targets {
                    *target = f(*target);
                }
            }
            _ => (),
        }
    }

    /// Does control flow fall through to the next instruction?
    pub fn falls_through(&self) -> bool {
        !self.opcode.ends_flow()
    }
}

impl Width for Instruction {
    fn width(&self) -> usize {
        let targets = match &self.operand {
            Operand::Targets(targets) => targets.len(),
            _ => 0,
        };
        self.opcode.encoded_len() + self.opcode.operand_kind().width(targets)
    }
}
