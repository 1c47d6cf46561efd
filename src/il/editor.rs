//! Edit method bodies in place
//!
//! Every operation here works on [`InsnId`] handles, which stay valid across edits. Inserting
//! instructions is O(1); only operations that have to find every referent of an instruction
//! (branch operands, region boundaries, sequence points) scan the body.
//!
//! ### Forward branches
//!
//! Jumping forward to code that hasn't been emitted yet is done with labels: a label is a `nop`
//! that is allocated up front (so branches can already target it) and placed later.
//!
//! ```
//! use aspect_weaver::il::{Editor, Instruction, MethodBody, Opcode};
//!
//! let mut body = MethodBody::new(false);
//! let mut editor = Editor::new(&mut body);
//! let done = editor.create_label();
//! editor.emit(Instruction::ldc_i4(0));
//! editor.emit(Instruction::branch(Opcode::BrFalse, done));
//! editor.emit(Instruction::ldstr("skipped"));
//! editor.emit(Instruction::simple(Opcode::Pop));
//! editor.place_label(done);
//! editor.emit(Instruction::simple(Opcode::Ret));
//! assert!(body.validate().is_ok());
//! ```

use super::{Error, InsnId, Instruction, MethodBody, Opcode, Operand, Type};

/// Where [`Editor::emit`] puts instructions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cursor {
    /// Append at the end of the body
    End,

    /// Insert right before an instruction (successive emits stay in order)
    Before(InsnId),
}

pub struct Editor<'b> {
    body: &'b mut MethodBody,
    cursor: Cursor,
}

impl<'b> Editor<'b> {
    /// Editor which appends to the body
    pub fn new(body: &'b mut MethodBody) -> Editor<'b> {
        Editor {
            body,
            cursor: Cursor::End,
        }
    }

    /// Editor which inserts before `anchor`
    pub fn before(body: &'b mut MethodBody, anchor: InsnId) -> Editor<'b> {
        let mut editor = Editor::new(body);
        editor.set_cursor(Cursor::Before(anchor));
        editor
    }

    pub fn body(&self) -> &MethodBody {
        self.body
    }

    pub fn body_mut(&mut self) -> &mut MethodBody {
        self.body
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        if let Cursor::Before(anchor) = cursor {
            self.assert_live(anchor);
        }
        self.cursor = cursor;
    }

    pub fn add_local(&mut self, ty: Type, name: Option<&str>) -> u16 {
        self.body.add_local(ty, name)
    }

    fn assert_live(&self, anchor: InsnId) {
        assert!(
            self.body.is_live(anchor),
            "anchor {:?} is not part of the instruction list",
            anchor
        );
    }

    /// Emit an instruction at the cursor
    pub fn emit(&mut self, insn: Instruction) -> InsnId {
        let id = self.body.allocate(insn);
        self.link_at_cursor(id);
        id
    }

    /// Emit several instructions at the cursor, returning the first
    pub fn emit_all(&mut self, insns: impl IntoIterator<Item = Instruction>) -> Option<InsnId> {
        let mut first = None;
        for insn in insns {
            let id = self.emit(insn);
            first.get_or_insert(id);
        }
        first
    }

    fn link_at_cursor(&mut self, id: InsnId) {
        match self.cursor {
            Cursor::End => self.body.link_back(id),
            Cursor::Before(anchor) => {
                self.assert_live(anchor);
                self.body.link_before(id, anchor);
            }
        }
    }

    /// Insert an instruction right before `anchor`
    ///
    /// Referents of `anchor` are left alone: branches to `anchor` skip the new instruction. See
    /// [`Editor::splice_before`] for an insertion that takes the anchor's place.
    pub fn insert_before(&mut self, anchor: InsnId, insn: Instruction) -> InsnId {
        self.assert_live(anchor);
        let id = self.body.allocate(insn);
        self.body.link_before(id, anchor);
        id
    }

    /// Insert an instruction right after `anchor`
    pub fn insert_after(&mut self, anchor: InsnId, insn: Instruction) -> InsnId {
        self.assert_live(anchor);
        let id = self.body.allocate(insn);
        self.body.link_after(id, anchor);
        id
    }

    /// Append an instruction to the end of the body (regardless of the cursor)
    pub fn append(&mut self, insn: Instruction) -> InsnId {
        let id = self.body.allocate(insn);
        self.body.link_back(id);
        id
    }

    /// Allocate a `nop` that branches can target before it is placed
    pub fn create_label(&mut self) -> InsnId {
        self.body.allocate(Instruction::nop())
    }

    /// Place a label created with [`Editor::create_label`] at the cursor
    pub fn place_label(&mut self, label: InsnId) {
        assert!(
            self.body.is_detached(label),
            "label {:?} has already been placed",
            label
        );
        self.link_at_cursor(label);
    }

    /// Emit a branch whose target is decided later with [`Editor::retarget`]
    pub fn emit_branch_placeholder(&mut self, opcode: Opcode) -> InsnId {
        assert!(opcode.is_branch() && opcode != Opcode::Switch);
        self.emit(Instruction::new(opcode, Operand::Pending))
    }

    /// Point a branch at a new target
    pub fn retarget(&mut self, branch: InsnId, target: InsnId) {
        let insn = self.body.get_mut(branch);
        assert!(
            insn.opcode.is_branch() && insn.opcode != Opcode::Switch,
            "{:?} is not a single-target branch",
            branch
        );
        insn.operand = Operand::Target(target);
    }

    /// Overwrite an instruction, keeping its identity (and so all of its referents)
    pub fn replace(&mut self, id: InsnId, insn: Instruction) {
        self.assert_live(id);
        *self.body.get_mut(id) = insn;
    }

    /// Insert instructions before `anchor` so that they take its place
    ///
    /// Branches to `anchor` and region boundaries at `anchor` are moved to the first inserted
    /// instruction.
    pub fn splice_before(
        &mut self,
        anchor: InsnId,
        insns: impl IntoIterator<Item = Instruction>,
    ) -> Option<InsnId> {
        self.assert_live(anchor);
        let saved = self.cursor;
        self.cursor = Cursor::Before(anchor);
        let first = self.emit_all(insns);
        self.cursor = saved;
        if let Some(first) = first {
            self.redirect_referents(anchor, first);
        }
        first
    }

    /// Move every branch, region boundary, and sequence point from `from` onto `to`
    pub fn redirect_referents(&mut self, from: InsnId, to: InsnId) {
        let redirect = |id: InsnId| if id == from { to } else { id };
        for id in self.body.ids() {
            self.body.get_mut(id).map_targets(redirect);
        }
        for region in &mut self.body.regions {
            region.map_boundaries(|id| if id == from { Some(to) } else { None });
        }
        if let Some(line) = self.body.sequence_points.remove(&from) {
            self.body.sequence_points.entry(to).or_insert(line);
        }
    }

    /// Unlink an instruction, moving its referents onto the following instruction
    pub fn remove(&mut self, id: InsnId) -> Result<(), Error> {
        self.assert_live(id);
        match self.body.next(id) {
            Some(next) => self.redirect_referents(id, next),
            None => {
                for (branch, insn) in self.body.iter() {
                    if insn.targets().contains(&id) {
                        return Err(Error::DanglingTarget { branch, target: id });
                    }
                }
                for region in &mut self.body.regions {
                    if region.try_start == id || region.try_end == id || region.handler_start == id
                    {
                        return Err(Error::AnchorsRegion(id));
                    }
                    if region.handler_end == Some(id) {
                        region.handler_end = None;
                    }
                }
            }
        }
        if let Cursor::Before(anchor) = self.cursor {
            if anchor == id {
                self.cursor = match self.body.next(id) {
                    Some(next) => Cursor::Before(next),
                    None => Cursor::End,
                };
            }
        }
        self.body.unlink(id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::ExceptionRegion;

    fn opcodes(body: &MethodBody) -> Vec<Opcode> {
        body.iter().map(|(_, insn)| insn.opcode).collect()
    }

    #[test]
    fn insertions_keep_handles() {
        let mut body = MethodBody::new(true);
        let mut editor = Editor::new(&mut body);
        let first = editor.emit(Instruction::ldc_i4(1));
        let ret = editor.emit(Instruction::simple(Opcode::Ret));
        let after = editor.insert_after(first, Instruction::ldc_i4(2));
        let before = editor.insert_before(first, Instruction::nop());
        editor.insert_before(ret, Instruction::simple(Opcode::Add));

        assert_eq!(
            opcodes(&body),
            vec![Opcode::Nop, Opcode::LdcI4, Opcode::LdcI4, Opcode::Add, Opcode::Ret]
        );
        assert_eq!(body.get(first), &Instruction::ldc_i4(1));
        assert_eq!(body.get(after), &Instruction::ldc_i4(2));
        assert_eq!(body.first(), Some(before));
        assert_eq!(body.last(), Some(ret));
        assert_eq!(body.len(), 5);
    }

    #[test]
    fn cursor_emits_in_order() {
        let mut body = MethodBody::new(false);
        let ret = Editor::new(&mut body).emit(Instruction::simple(Opcode::Ret));
        let mut editor = Editor::before(&mut body, ret);
        editor.emit(Instruction::ldstr("a"));
        editor.emit(Instruction::simple(Opcode::Pop));
        assert_eq!(opcodes(&body), vec![Opcode::LdStr, Opcode::Pop, Opcode::Ret]);
    }

    #[test]
    fn splice_takes_the_anchor_place() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let start = editor.emit(Instruction::nop());
        let leave = editor.emit_branch_placeholder(Opcode::Leave);
        let handler = editor.emit(Instruction::simple(Opcode::EndFinally));
        let ret = editor.emit(Instruction::simple(Opcode::Ret));
        editor.retarget(leave, ret);
        editor
            .body_mut()
            .regions
            .push(ExceptionRegion::finally(start, handler, handler, Some(ret)));
        editor.body_mut().sequence_points.insert(ret, 7);

        let first = editor
            .splice_before(ret, vec![Instruction::ldstr("x"), Instruction::simple(Opcode::Pop)])
            .unwrap();

        assert_eq!(body.get(leave).targets(), vec![first]);
        assert_eq!(body.regions[0].handler_end, Some(first));
        assert_eq!(body.sequence_points.get(&first), Some(&7));
        assert!(body.validate().is_ok());
    }

    #[test]
    fn remove_moves_referents_forward() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let target = editor.create_label();
        let branch = editor.emit(Instruction::branch(Opcode::Br, target));
        editor.place_label(target);
        let ret = editor.emit(Instruction::simple(Opcode::Ret));
        editor.remove(target).unwrap();

        assert_eq!(body.get(branch).targets(), vec![ret]);
        assert!(!body.is_live(target));
        assert_eq!(body.len(), 2);
        assert!(body.validate().is_ok());
    }

    #[test]
    fn remove_refuses_to_dangle() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let last = editor.create_label();
        editor.emit(Instruction::branch(Opcode::Br, last));
        editor.place_label(last);
        assert!(matches!(
            editor.remove(last),
            Err(Error::DanglingTarget { target, .. }) if target == last
        ));
    }

    #[test]
    fn pending_placeholders_fail_validation() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let branch = editor.emit_branch_placeholder(Opcode::BrS);
        editor.emit(Instruction::simple(Opcode::Ret));
        assert!(matches!(body.validate(), Err(Error::PendingBranch(id)) if id == branch));
    }

    #[test]
    fn unplaced_labels_dangle() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let label = editor.create_label();
        editor.emit(Instruction::branch(Opcode::Br, label));
        assert!(matches!(
            body.validate(),
            Err(Error::DanglingTarget { target, .. }) if target == label
        ));
    }

    #[test]
    #[should_panic(expected = "is not part of the instruction list")]
    fn inserting_at_a_removed_anchor_panics() {
        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        let nop = editor.emit(Instruction::nop());
        editor.emit(Instruction::simple(Opcode::Ret));
        editor.remove(nop).unwrap();
        editor.insert_before(nop, Instruction::nop());
    }

    #[test]
    fn clones_share_handles() {
        let mut body = MethodBody::new(true);
        let mut editor = Editor::new(&mut body);
        let load = editor.emit(Instruction::ldc_i4(3));
        editor.emit(Instruction::simple(Opcode::Ret));

        let mut copy = body.clone();
        Editor::new(&mut copy).replace(load, Instruction::ldc_i4(4));
        assert_eq!(body.get(load), &Instruction::ldc_i4(3));
        assert_eq!(copy.get(load), &Instruction::ldc_i4(4));
    }
}
