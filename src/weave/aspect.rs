use crate::il::{AspectSpec, Constant, HookKind, Instruction, Intrinsic, MethodRef, Opcode, Operand};

/// Call targets of the hooks of one hook-descriptor type
///
/// Built once per descriptor: a hook the descriptor type does not override keeps its no-op
/// default, so it has no entry here and no call to it is ever emitted.
#[derive(Clone, Debug)]
pub struct HookTable {
    targets: [Option<MethodRef>; 6],
}

impl HookTable {
    pub fn new(spec: &AspectSpec) -> HookTable {
        let mut targets: [Option<MethodRef>; 6] = Default::default();
        for kind in spec.hooks.kinds() {
            targets[kind as usize] = Some(MethodRef::Intrinsic(Intrinsic::Hook(kind)));
        }
        HookTable { targets }
    }

    /// Resolved call target of a hook, if the descriptor overrides it
    pub fn target(&self, kind: HookKind) -> Option<&MethodRef> {
        self.targets[kind as usize].as_ref()
    }

    pub fn overrides(&self, kind: HookKind) -> bool {
        self.target(kind).is_some()
    }
}

/// Instructions constructing the hook descriptor
pub fn construct_aspect(spec: &AspectSpec) -> Vec<Instruction> {
    let mut insns: Vec<Instruction> = spec.ctor_args.iter().map(load_constant).collect();
    insns.push(Instruction::new(
        Opcode::NewObj,
        Operand::Method(MethodRef::Intrinsic(Intrinsic::AspectNew {
            type_name: spec.type_name.clone(),
            arity: spec.ctor_args.len() as u8,
        })),
    ));
    insns
}

pub fn load_constant(constant: &Constant) -> Instruction {
    match constant {
        Constant::Null => Instruction::simple(Opcode::LdNull),
        Constant::I32(value) => Instruction::ldc_i4(*value),
        Constant::I64(value) => Instruction::new(Opcode::LdcI8, Operand::I64(*value)),
        Constant::F64(value) => Instruction::new(Opcode::LdcR8, Operand::F64(*value)),
        Constant::Str(value) => Instruction::ldstr(value.as_str()),
    }
}
