//! Weave lifecycle hooks into methods
//!
//! A hook descriptor ([`AspectSpec`]) names six hooks (entry, yield, resume, success, exception,
//! and exit) which run around every invocation of the method it is attached to. Weaving rewrites
//! the method in place: its original logic is kept in a private `<Original>` sibling and the
//! method itself becomes a wrapper that builds an execution context, runs the hooks, and calls
//! the sibling.
//!
//! Methods the compiler lowered to state machines keep their owner untouched. It is the
//! record's `MoveNext` (and, for iterators, `Dispose`) that is rewritten, so that hooks fire at
//! the phase boundaries of the whole logical invocation rather than around each step.
//!
//! Intercepting descriptors (`.intercept`) have a single invoke hook that stands in for the call
//! and decides whether to proceed to the original logic. See [`weave_interception`].
//!
//! ### Simple example
//!
//! ```
//! use aspect_weaver::il::parse_module;
//! use aspect_weaver::weave::{weave_module, Settings};
//!
//! let mut module = parse_module(r#"
//!     .class Program
//!     .method static int32 Answer()
//!       .aspect Logger() : entry exit
//!             ldc.i4 7
//!             ret
//!     .end
//! "#).unwrap();
//!
//! assert_eq!(weave_module(&mut module, &Settings::new()).unwrap(), 1);
//!
//! let class = module.find_class("Program").unwrap();
//! assert!(module.find_method(class, "Answer<Original>").is_some());
//! ```

mod arguments;
mod aspect;
mod async_flavor;
mod emit;
mod errors;
mod interception;
mod iterator;
mod method;
mod settings;
mod state_machine;

pub use arguments::*;
pub use aspect::*;
pub use async_flavor::*;
pub use emit::*;
pub use errors::*;
pub use interception::*;
pub use iterator::*;
pub use method::*;
pub use settings::*;
pub use state_machine::*;

pub use crate::il::AspectSpec;
use crate::il::{AspectKind, Class, ClassId, MethodId, MethodListing, Module, StateMachine};

/// Weave a hook descriptor into a method
///
/// Returns the sibling holding the original logic: `Name<Original>` for plain methods and
/// interceptions, `MoveNext<Original>` on the record for state machines. Weaving is all or
/// nothing: if it fails, every class it touched is restored and any class it added is removed.
pub fn weave_method(
    module: &mut Module,
    method: MethodId,
    spec: &AspectSpec,
    settings: &Settings,
) -> Result<MethodId, Error> {
    let name = module.qualified_name(method);
    let target = module.method(method);
    let state_machine = match spec.kind {
        AspectKind::Boundary => target.state_machine,
        AspectKind::Interception => None,
    };
    let (rewritten, woven_name) = match state_machine {
        None => (method.class, settings.original_name(&target.name)),
        Some(state_machine) => (state_machine.class(), settings.original_name("MoveNext")),
    };
    if module.find_method(rewritten, &woven_name).is_some() {
        return Err(Error::AlreadyWoven { method: name });
    }

    log::debug!("Weaving '{}' with '{}'", name, spec.type_name);
    let touched = [method.class, rewritten];
    let result = transaction(module, &touched, |module| match state_machine {
        None if spec.kind == AspectKind::Interception => {
            weave_interception(module, method, spec, settings)
        }
        None => weave_plain(module, method, spec, settings),
        Some(StateMachine::Iterator(_)) => {
            weave_state_machine(module, method, spec, settings, &IteratorFlavor)
        }
        Some(StateMachine::Async(_)) => {
            weave_state_machine(module, method, spec, settings, &AsyncFlavor)
        }
    });

    match &result {
        Ok(original) => {
            let wrapper = match state_machine {
                None => method,
                Some(_) => module
                    .find_method(rewritten, "MoveNext")
                    .unwrap_or(method),
            };
            log::trace!("Wrapper:\n{}", MethodListing::new(module, wrapper));
            log::trace!("Original:\n{}", MethodListing::new(module, *original));
        }
        Err(err) => log::debug!("Failed to weave '{}': {}", name, err),
    }
    result
}

/// Weave every method carrying a hook descriptor, returning how many were woven
///
/// This fails on the first method that cannot be woven, in which case the module is left as it
/// was.
pub fn weave_module(module: &mut Module, settings: &Settings) -> Result<usize, Error> {
    let snapshot = module.clone();
    let mut woven = 0;
    for method in module.method_ids() {
        let result = match module.method(method).aspects.as_slice() {
            [] => continue,
            [spec] => {
                let spec = spec.clone();
                weave_method(module, method, &spec, settings)
            }
            _ => Err(Error::shape(
                &module.qualified_name(method),
                "more than one hook descriptor",
            )),
        };
        if let Err(err) = result {
            *module = snapshot;
            return Err(err);
        }
        woven += 1;
    }
    Ok(woven)
}

/// Run `weave`, restoring `classes` (and dropping added classes) if it fails
fn transaction<T>(
    module: &mut Module,
    classes: &[ClassId],
    weave: impl FnOnce(&mut Module) -> Result<T, Error>,
) -> Result<T, Error> {
    let snapshot: Vec<(ClassId, Class)> = classes
        .iter()
        .map(|class| (*class, module.class(*class).clone()))
        .collect();
    let class_count = module.classes.len();
    let result = weave(module);
    if result.is_err() {
        module.classes.truncate(class_count);
        for (class, saved) in snapshot {
            *module.class_mut(class) = saved;
        }
    }
    result
}
