//! Marshal arguments into the container hooks see, and back out again
//!
//! Up to [`MAX_FIXED_ARITY`] arguments are collected into a fixed-arity generic container (one
//! load per argument, then the constructor). Beyond that, arguments are boxed into an object
//! array which is then wrapped in a container. Either way, the code built here only leaves the
//! container on the stack: the caller decides where it is stored.
//!
//! Hooks may overwrite arguments, so after the entry hook the container is copied back into the
//! argument slots (or, for state machines, the fields holding the captured parameters) that the
//! original logic reads from.

use super::{EditorExts, Error, Storage};
use crate::il::{Editor, Instruction, Intrinsic, MethodRef, Opcode, Operand, Type};

/// Largest number of arguments held by a fixed-arity container
pub const MAX_FIXED_ARITY: usize = 8;

/// Parameter as seen by the marshaling code
#[derive(Clone, Debug, PartialEq)]
pub struct ArgumentSlot {
    pub storage: Storage,
    pub ty: Type,
}

/// Instructions pushing a new container holding the current value of every parameter
pub fn build_arguments_container(
    method: &str,
    params: &[ArgumentSlot],
    array_fallback: bool,
) -> Result<Vec<Instruction>, Error> {
    let mut insns = vec![];
    if params.len() <= MAX_FIXED_ARITY {
        for param in params {
            insns.extend(param.storage.load());
        }
        insns.push(Instruction::new(
            Opcode::NewObj,
            Operand::Method(MethodRef::Intrinsic(Intrinsic::ArgsNew(params.len() as u8))),
        ));
    } else if array_fallback {
        insns.push(Instruction::ldc_i4(params.len() as i32));
        insns.push(Instruction::typed(Opcode::NewArr, Type::Object));
        for (idx, param) in params.iter().enumerate() {
            insns.push(Instruction::simple(Opcode::Dup));
            insns.push(Instruction::ldc_i4(idx as i32));
            insns.extend(param.storage.load());
            if param.ty.is_value_type() {
                insns.push(Instruction::typed(Opcode::Box, param.ty.clone()));
            }
            insns.push(Instruction::simple(Opcode::StElemRef));
        }
        insns.push(Instruction::new(
            Opcode::NewObj,
            Operand::Method(MethodRef::Intrinsic(Intrinsic::ArgsFromArray)),
        ));
    } else {
        return Err(Error::UnsupportedArity {
            method: method.to_owned(),
            arity: params.len(),
        });
    }
    Ok(insns)
}

/// Emit code copying every container slot back into its parameter
///
/// With `modified_only`, each copy is guarded so that only arguments a hook overwrote are
/// written back.
pub fn emit_copy_back(
    editor: &mut Editor,
    container: &Storage,
    targets: &[ArgumentSlot],
    modified_only: bool,
) {
    for (idx, target) in targets.iter().enumerate() {
        let skip = if modified_only {
            let skip = editor.create_label();
            editor.load(container);
            editor.emit(Instruction::ldc_i4(idx as i32));
            editor.call_intrinsic(Intrinsic::ArgsIsModified);
            editor.branch(Opcode::BrFalse, skip);
            Some(skip)
        } else {
            None
        };
        editor.store(&target.storage, |editor| {
            editor.load(container);
            editor.emit(Instruction::ldc_i4(idx as i32));
            editor.call_intrinsic(Intrinsic::ArgsGet);
            editor.unbox_value(&target.ty);
        });
        if let Some(skip) = skip {
            editor.place_label(skip);
        }
    }
}
