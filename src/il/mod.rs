//! Stack-machine instruction set and the modules built out of it
//!
//! A [`Module`] is a set of classes, each with fields and methods. A method body
//! ([`MethodBody`]) is a list of [`Instruction`]s stored in an arena and addressed by stable
//! [`InsnId`] handles, plus typed locals and [`ExceptionRegion`]s whose boundaries are also
//! handles. Bodies are edited in place through an [`Editor`].
//!
//! ### Simple example
//!
//! ```
//! use aspect_weaver::il::*;
//!
//! # fn build() -> Result<(), Error> {
//! let mut module = Module::new();
//! let class = module.add_class("Program");
//! let answer = module.add_method(
//!     class,
//!     Method::new("Answer", MethodFlags::STATIC, vec![], Type::I32),
//! );
//!
//! let mut body = MethodBody::new(true);
//! let mut editor = Editor::new(&mut body);
//! editor.emit(Instruction::ldc_i4(7));
//! editor.emit(Instruction::simple(Opcode::Ret));
//! body.validate()?;
//! module.method_mut(answer).body = Some(body);
//!
//! assert_eq!(
//!     module.to_string(),
//!     ".class Program\n\n.method static int32 Answer()\n  IL_0000: ldc.i4 7\n  IL_0005: ret\n.end\n",
//! );
//! # Ok(())
//! # }
//! # build().unwrap();
//! ```

mod asm;
mod attributes;
mod binary_format;
mod body;
mod editor;
mod errors;
mod instruction;
mod jump_encoding;
mod module;
mod opcode;
mod region;
mod types;

pub use asm::*;
pub use attributes::*;
pub use binary_format::*;
pub use body::*;
pub use editor::*;
pub use errors::*;
pub use instruction::*;
pub use jump_encoding::*;
pub use module::*;
pub use opcode::*;
pub use region::*;
pub use types::*;
