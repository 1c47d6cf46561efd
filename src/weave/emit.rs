use super::HookTable;
use crate::il::{
    Editor, ExceptionRegion, FieldId, HookKind, InsnId, Instruction, Intrinsic, MethodRef, Opcode,
    Operand, Type,
};

/// Location of a value, from the point of view of the code being emitted
#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    Arg(u16),
    Local(u16),

    /// Field of the receiver (argument 0)
    Field(FieldId),
}

impl Storage {
    /// Instructions pushing the value
    pub fn load(&self) -> Vec<Instruction> {
        match self {
            Storage::Arg(slot) => vec![Instruction::ldarg(*slot)],
            Storage::Local(slot) => vec![Instruction::ldloc(*slot)],
            Storage::Field(field) => vec![Instruction::ldarg(0), Instruction::ldfld(*field)],
        }
    }
}

/// Emission helpers layered over [`Editor`]
pub trait EditorExts {
    /// Push the value held in a storage location
    fn load(&mut self, storage: &Storage);

    /// Store into a storage location the value pushed by `value`
    fn store(&mut self, storage: &Storage, value: impl FnOnce(&mut Self));

    /// Call a runtime intrinsic
    fn call_intrinsic(&mut self, intrinsic: Intrinsic) -> InsnId;

    /// Construct a runtime object through an intrinsic constructor
    fn new_intrinsic(&mut self, intrinsic: Intrinsic) -> InsnId;

    /// Box the value on top of the stack if it has a value type
    fn box_value(&mut self, ty: &Type);

    /// Convert the object on top of the stack back to `ty`
    fn unbox_value(&mut self, ty: &Type);

    /// Call a hook with the descriptor and the execution context, unless the hook is a no-op
    fn call_hook(&mut self, hooks: &HookTable, kind: HookKind, aspect: &Storage, context: &Storage);

    /// Emit a branch to a target (possibly a label that is placed later)
    fn branch(&mut self, opcode: Opcode, target: InsnId) -> InsnId;

    /// Allocate a label and place it at the cursor right away
    fn mark(&mut self) -> InsnId;
}

impl<'b> EditorExts for Editor<'b> {
    fn load(&mut self, storage: &Storage) {
        self.emit_all(storage.load());
    }

    fn store(&mut self, storage: &Storage, value: impl FnOnce(&mut Self)) {
        match storage {
            Storage::Arg(slot) => {
                value(self);
                self.emit(Instruction::starg(*slot));
            }
            Storage::Local(slot) => {
                value(self);
                self.emit(Instruction::stloc(*slot));
            }
            Storage::Field(field) => {
                self.emit(Instruction::ldarg(0));
                value(self);
                self.emit(Instruction::stfld(*field));
            }
        }
    }

    fn call_intrinsic(&mut self, intrinsic: Intrinsic) -> InsnId {
        self.emit(Instruction::intrinsic(intrinsic))
    }

    fn new_intrinsic(&mut self, intrinsic: Intrinsic) -> InsnId {
        self.emit(Instruction::new(
            Opcode::NewObj,
            Operand::Method(MethodRef::Intrinsic(intrinsic)),
        ))
    }

    fn box_value(&mut self, ty: &Type) {
        if ty.is_value_type() {
            self.emit(Instruction::typed(Opcode::Box, ty.clone()));
        }
    }

    fn unbox_value(&mut self, ty: &Type) {
        match ty {
            Type::Object | Type::Void => (),
            ty if ty.is_value_type() => {
                self.emit(Instruction::typed(Opcode::UnboxAny, ty.clone()));
            }
            ty => {
                self.emit(Instruction::typed(Opcode::CastClass, ty.clone()));
            }
        }
    }

    fn call_hook(&mut self, hooks: &HookTable, kind: HookKind, aspect: &Storage, context: &Storage) {
        if let Some(target) = hooks.target(kind) {
            self.load(aspect);
            self.load(context);
            self.emit(Instruction::new(
                Opcode::CallVirt,
                Operand::Method(target.clone()),
            ));
        }
    }

    fn branch(&mut self, opcode: Opcode, target: InsnId) -> InsnId {
        self.emit(Instruction::branch(opcode, target))
    }

    fn mark(&mut self) -> InsnId {
        let label = self.create_label();
        self.place_label(label);
        label
    }
}

/// Regions protecting `[try_start, handlers)` with a catch-all and a finally
///
/// Either handler may be missing. Handlers are laid out back to back (catch first) and the last
/// one ends at `end`.
pub fn protected_regions(
    try_start: InsnId,
    catch_start: Option<InsnId>,
    finally_start: Option<InsnId>,
    end: InsnId,
) -> Vec<ExceptionRegion> {
    let mut regions = vec![];
    if let Some(catch_start) = catch_start {
        regions.push(ExceptionRegion::catch_all(
            try_start,
            catch_start,
            catch_start,
            Some(finally_start.unwrap_or(end)),
        ));
    }
    if let Some(finally_start) = finally_start {
        regions.push(ExceptionRegion::finally(
            try_start,
            finally_start,
            finally_start,
            Some(end),
        ));
    }
    regions
}
