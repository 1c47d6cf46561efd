use super::ClassId;
use bitflags::bitflags;
use std::fmt;

/// The six lifecycle hooks a hook descriptor exposes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    Entry,
    Yield,
    Resume,
    Success,
    Exception,
    Exit,
}

impl HookKind {
    pub const ALL: [HookKind; 6] = [
        HookKind::Entry,
        HookKind::Yield,
        HookKind::Resume,
        HookKind::Success,
        HookKind::Exception,
        HookKind::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HookKind::Entry => "entry",
            HookKind::Yield => "yield",
            HookKind::Resume => "resume",
            HookKind::Success => "success",
            HookKind::Exception => "exception",
            HookKind::Exit => "exit",
        }
    }

    pub fn from_name(name: &str) -> Option<HookKind> {
        HookKind::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    pub fn flag(self) -> HookSet {
        match self {
            HookKind::Entry => HookSet::ENTRY,
            HookKind::Yield => HookSet::YIELD,
            HookKind::Resume => HookSet::RESUME,
            HookKind::Success => HookSet::SUCCESS,
            HookKind::Exception => HookSet::EXCEPTION,
            HookKind::Exit => HookSet::EXIT,
        }
    }
}

bitflags! {
    /// Hooks overridden by a hook descriptor type
    pub struct HookSet: u8 {
        const ENTRY = 0x01;
        const YIELD = 0x02;
        const RESUME = 0x04;
        const SUCCESS = 0x08;
        const EXCEPTION = 0x10;
        const EXIT = 0x20;
    }
}

impl HookSet {
    pub fn kinds(self) -> impl Iterator<Item = HookKind> {
        HookKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.flag()))
    }
}

/// Constant argument to a hook descriptor constructor
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => f.write_str("null"),
            Constant::I32(value) => write!(f, "{}", value),
            Constant::I64(value) => write!(f, "{}L", value),
            Constant::F64(value) => write!(f, "{:?}", value),
            Constant::Str(value) => write!(f, "{:?}", value),
        }
    }
}

/// How a hook descriptor attaches to the method it decorates
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AspectKind {
    /// Lifecycle hooks run around the original logic
    Boundary,

    /// The descriptor's invoke hook replaces the call and decides whether (and with which
    /// arguments) the original logic runs
    Interception,
}

/// Request to weave a hook descriptor around a method
///
/// This is the constructor expression of the descriptor (its type name and constant arguments)
/// along with the set of hooks the descriptor type overrides. Hooks that are not overridden have
/// no-op defaults, so no calls to them get emitted. Interception descriptors have a single hook,
/// so their `hooks` are left empty.
#[derive(Clone, Debug, PartialEq)]
pub struct AspectSpec {
    pub type_name: String,
    pub ctor_args: Vec<Constant>,
    pub hooks: HookSet,
    pub kind: AspectKind,
}

impl AspectSpec {
    /// Descriptor overriding every hook, constructed without arguments
    pub fn new(type_name: impl Into<String>) -> AspectSpec {
        AspectSpec {
            type_name: type_name.into(),
            ctor_args: vec![],
            hooks: HookSet::all(),
            kind: AspectKind::Boundary,
        }
    }

    /// Intercepting descriptor, constructed without arguments
    pub fn interception(type_name: impl Into<String>) -> AspectSpec {
        AspectSpec {
            type_name: type_name.into(),
            ctor_args: vec![],
            hooks: HookSet::empty(),
            kind: AspectKind::Interception,
        }
    }

    pub fn with_args(mut self, ctor_args: Vec<Constant>) -> AspectSpec {
        self.ctor_args = ctor_args;
        self
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> AspectSpec {
        self.hooks = hooks;
        self
    }

    pub fn overrides(&self, kind: HookKind) -> bool {
        self.hooks.contains(kind.flag())
    }
}

/// Marks a method whose logic the compiler moved into a state-machine record class
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateMachine {
    /// Deferred iteration: driven by `MoveNext`, abandoned through `Dispose`
    Iterator(ClassId),

    /// Asynchronous suspension: driven by `MoveNext`, reported through a completion builder
    Async(ClassId),
}

impl StateMachine {
    pub fn class(self) -> ClassId {
        match self {
            StateMachine::Iterator(class) | StateMachine::Async(class) => class,
        }
    }
}
