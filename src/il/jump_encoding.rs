//! Promote short branches whose targets are out of reach
//!
//! Short branch forms (`br.s`, `brtrue.s`, `leave.s`, ...) encode their target as a signed 8-bit
//! offset relative to the end of the branch instruction. Splicing code into a body can push a
//! target out of that range, at which point the branch must use its long form (4-byte offset).
//!
//! ### Termination
//!
//! Promoting a branch makes it three bytes longer, which can push _other_ short branches out of
//! range, so the pass is repeated until no oversized branch remains. This always finishes since
//! the number of short branches strictly decreases on every round that rewrites anything:
//!
//!   - a promoted branch is long for good (branches are never demoted)
//!
//!   - promotion never introduces new short branches
//!
//! The result is correct but not necessarily minimal: a branch promoted in an early round stays
//! long even if later rounds would have left enough room for the short form.

use super::{InsnId, MethodBody, Operand};
use crate::util::{Offset, Width};
use std::collections::HashMap;
use std::ops::{RangeBounds, RangeInclusive};

/// Range of relative offsets supported by short branch instructions
pub const SIGNED_8BIT_JUMP_RANGE: RangeInclusive<isize> =
    RangeInclusive::new(i8::MIN as isize, i8::MAX as isize);

/// Byte offset of every live instruction, along with the total length of the body
pub fn layout(body: &MethodBody) -> (HashMap<InsnId, Offset>, Offset) {
    let mut offsets = HashMap::with_capacity(body.len());
    let mut current = 0;
    for (id, insn) in body.iter() {
        offsets.insert(id, Offset(current));
        current += insn.width();
    }
    (offsets, Offset(current))
}

/// Distance from the end of the branch to its target, or `None` if it has no resolved target
pub fn branch_distance(
    body: &MethodBody,
    offsets: &HashMap<InsnId, Offset>,
    branch: InsnId,
) -> Option<isize> {
    let insn = body.get(branch);
    let target = match insn.operand {
        Operand::Target(target) => target,
        _ => return None,
    };
    let from = Offset(offsets.get(&branch)?.0 + insn.width());
    Some(*offsets.get(&target)? - from)
}

/// Promote every short branch that can't reach its target, returning how many were promoted
pub fn widen_short_branches(body: &mut MethodBody) -> usize {
    widen_oversized_branches(body, &SIGNED_8BIT_JUMP_RANGE)
}

/// Same as [`widen_short_branches`], but with a configurable reach (only for unit tests)
pub(crate) fn widen_oversized_branches(
    body: &mut MethodBody,
    short_jump_range: &impl RangeBounds<isize>,
) -> usize {
    let mut promoted = 0;
    loop {
        let (offsets, _) = layout(body);
        let oversized: Vec<InsnId> = body
            .iter()
            .filter(|(_, insn)| insn.opcode.is_short_branch())
            .filter_map(|(id, _)| {
                let distance = branch_distance(body, &offsets, id)?;
                if short_jump_range.contains(&distance) {
                    None
                } else {
                    Some(id)
                }
            })
            .collect();

        if oversized.is_empty() {
            return promoted;
        }

        for id in oversized {
            let insn = body.get_mut(id);
            log::trace!("Promoting {:?} `{}` to long form", id, insn.opcode.mnemonic());
            insn.opcode = insn.opcode.long_form();
            promoted += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::{Editor, Instruction, Opcode};

    #[test]
    fn in_range_branches_stay_short() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let end = editor.create_label();
        let branch = editor.emit(Instruction::branch(Opcode::BrS, end));
        for _ in 0..127 {
            editor.emit(Instruction::nop());
        }
        editor.place_label(end);
        editor.emit(Instruction::simple(Opcode::Ret));

        assert_eq!(widen_short_branches(&mut body), 0);
        assert_eq!(body.get(branch).opcode, Opcode::BrS);
    }

    #[test]
    fn out_of_range_branches_are_promoted() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let end = editor.create_label();
        let start = editor.emit(Instruction::nop());
        let forward = editor.emit(Instruction::branch(Opcode::BrFalseS, end));
        for _ in 0..128 {
            editor.emit(Instruction::nop());
        }
        editor.place_label(end);
        let backward = editor.emit(Instruction::branch(Opcode::LeaveS, start));
        editor.emit(Instruction::simple(Opcode::Ret));

        assert_eq!(widen_short_branches(&mut body), 2);
        assert_eq!(body.get(forward).opcode, Opcode::BrFalse);
        assert_eq!(body.get(backward).opcode, Opcode::Leave);
    }

    #[test]
    fn promotions_cascade() {
        // Promoting `second` pushes the target of `first` out of range
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let near = editor.create_label();
        let far = editor.create_label();
        let first = editor.emit(Instruction::branch(Opcode::BrS, near));
        let second = editor.emit(Instruction::branch(Opcode::BrTrueS, far));
        for _ in 0..7 {
            editor.emit(Instruction::nop());
        }
        editor.place_label(near);
        for _ in 0..10 {
            editor.emit(Instruction::nop());
        }
        editor.place_label(far);
        editor.emit(Instruction::simple(Opcode::Ret));

        let (offsets, _) = layout(&body);
        assert_eq!(branch_distance(&body, &offsets, first), Some(9));
        assert_eq!(branch_distance(&body, &offsets, second), Some(18));

        assert_eq!(widen_oversized_branches(&mut body, &(-10..=10)), 2);
        assert_eq!(body.get(first).opcode, Opcode::Br);
        assert_eq!(body.get(second).opcode, Opcode::BrTrue);
    }

    #[test]
    fn long_branches_are_never_demoted() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let end = editor.create_label();
        let branch = editor.emit(Instruction::branch(Opcode::Br, end));
        editor.place_label(end);
        editor.emit(Instruction::simple(Opcode::Ret));

        assert_eq!(widen_short_branches(&mut body), 0);
        assert_eq!(body.get(branch).opcode, Opcode::Br);
    }
}
