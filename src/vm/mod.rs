//! Reference interpreter and host runtime
//!
//! The [`Vm`] executes module methods directly from their bodies. It provides the host objects
//! that woven code talks to through intrinsics: argument containers ([`Arguments`]), execution
//! contexts ([`MethodExecutionArgs`]), hook descriptors ([`Aspect`], instantiated through an
//! [`AspectRegistry`]), interception contexts ([`MethodInterceptionArgs`]), and tasks for
//! asynchronous methods.
//!
//! ### Simple example
//!
//! ```
//! use aspect_weaver::il::parse_module;
//! use aspect_weaver::vm::{AspectRegistry, Value, Vm};
//!
//! let module = parse_module(r#"
//!     .class Program
//!     .method static int32 Twice(int32 x)
//!             ldarg x
//!             ldstr "twice"
//!             call @trace
//!             ldarg x
//!             add
//!             ret
//!     .end
//! "#).unwrap();
//!
//! let mut vm = Vm::new(&module, AspectRegistry::new());
//! let result = vm.invoke_named("Program", "Twice", vec![Value::I32(21)]).unwrap();
//! assert_eq!(result, Value::I32(42));
//! assert_eq!(vm.trace().joined(), "twice");
//! ```

mod aspect;
mod errors;
mod host;
mod interpreter;
mod value;

pub use aspect::*;
pub use errors::*;
pub use host::*;
pub use interpreter::*;
pub use value::*;
