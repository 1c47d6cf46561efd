use bitflags::bitflags;

bitflags! {
    /// Control-flow properties of an opcode
    pub struct OpcodeFlags: u8 {
        /// Has one or more branch targets
        const BRANCH = 0x01;
        /// May fall through to the next instruction even though it branches
        const CONDITIONAL = 0x02;
        /// Target is encoded as a signed 8-bit relative offset
        const SHORT_FORM = 0x04;
        /// Never falls through
        const ENDS_FLOW = 0x08;
        /// Exits protected regions (runs the `finally` handlers it crosses)
        const LEAVE = 0x10;
    }
}

/// Shape of the operand an opcode carries
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperandKind {
    None,
    I32,
    I64,
    F64,
    Str,
    Arg,
    Local,
    Field,
    Method,
    Type,
    ShortTarget,
    LongTarget,
    Switch,
}

impl OperandKind {
    /// Encoded width of the operand (`targets` only matters for `switch`)
    pub fn width(self, targets: usize) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::ShortTarget => 1,
            OperandKind::Arg | OperandKind::Local => 2,
            OperandKind::I32
            | OperandKind::Str
            | OperandKind::Field
            | OperandKind::Method
            | OperandKind::Type
            | OperandKind::LongTarget => 4,
            OperandKind::I64 | OperandKind::F64 => 8,
            OperandKind::Switch => 4 + 4 * targets,
        }
    }
}

macro_rules! opcodes {
    ($($variant:ident => $mnemonic:literal, $code:literal, $kind:ident, $flags:expr;)*) => {
        /// Opcodes of the stack machine
        ///
        /// Encodings follow the ECMA-335 numbering, two-byte opcodes being prefixed with `0xFE`.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $mnemonic,)*
                }
            }

            pub fn code(self) -> u16 {
                match self {
                    $(Opcode::$variant => $code,)*
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $(Opcode::$variant => OperandKind::$kind,)*
                }
            }

            pub fn flags(self) -> OpcodeFlags {
                match self {
                    $(Opcode::$variant => $flags,)*
                }
            }
        }
    };
}

const NONE: OpcodeFlags = OpcodeFlags::empty();
const JUMP: OpcodeFlags = OpcodeFlags::BRANCH.union(OpcodeFlags::ENDS_FLOW);
const JUMP_S: OpcodeFlags = JUMP.union(OpcodeFlags::SHORT_FORM);
const COND: OpcodeFlags = OpcodeFlags::BRANCH.union(OpcodeFlags::CONDITIONAL);
const COND_S: OpcodeFlags = COND.union(OpcodeFlags::SHORT_FORM);
const LEAVE: OpcodeFlags = JUMP.union(OpcodeFlags::LEAVE);
const LEAVE_S: OpcodeFlags = LEAVE.union(OpcodeFlags::SHORT_FORM);
const END: OpcodeFlags = OpcodeFlags::ENDS_FLOW;

opcodes! {
    Nop => "nop", 0x00, None, NONE;
    LdNull => "ldnull", 0x14, None, NONE;
    LdcI4 => "ldc.i4", 0x20, I32, NONE;
    LdcI8 => "ldc.i8", 0x21, I64, NONE;
    LdcR8 => "ldc.r8", 0x23, F64, NONE;
    Dup => "dup", 0x25, None, NONE;
    Pop => "pop", 0x26, None, NONE;
    Call => "call", 0x28, Method, NONE;
    Ret => "ret", 0x2A, None, END;
    BrS => "br.s", 0x2B, ShortTarget, JUMP_S;
    BrFalseS => "brfalse.s", 0x2C, ShortTarget, COND_S;
    BrTrueS => "brtrue.s", 0x2D, ShortTarget, COND_S;
    BeqS => "beq.s", 0x2E, ShortTarget, COND_S;
    BgeS => "bge.s", 0x2F, ShortTarget, COND_S;
    BltS => "blt.s", 0x32, ShortTarget, COND_S;
    BneUnS => "bne.un.s", 0x33, ShortTarget, COND_S;
    Br => "br", 0x38, LongTarget, JUMP;
    BrFalse => "brfalse", 0x39, LongTarget, COND;
    BrTrue => "brtrue", 0x3A, LongTarget, COND;
    Beq => "beq", 0x3B, LongTarget, COND;
    Bge => "bge", 0x3C, LongTarget, COND;
    Blt => "blt", 0x3F, LongTarget, COND;
    BneUn => "bne.un", 0x40, LongTarget, COND;
    Switch => "switch", 0x45, Switch, COND;
    Add => "add", 0x58, None, NONE;
    Sub => "sub", 0x59, None, NONE;
    Mul => "mul", 0x5A, None, NONE;
    Div => "div", 0x5B, None, NONE;
    Rem => "rem", 0x5D, None, NONE;
    Neg => "neg", 0x65, None, NONE;
    CallVirt => "callvirt", 0x6F, Method, NONE;
    LdStr => "ldstr", 0x72, Str, NONE;
    NewObj => "newobj", 0x73, Method, NONE;
    CastClass => "castclass", 0x74, Type, NONE;
    Throw => "throw", 0x7A, None, END;
    LdFld => "ldfld", 0x7B, Field, NONE;
    StFld => "stfld", 0x7D, Field, NONE;
    Box => "box", 0x8C, Type, NONE;
    NewArr => "newarr", 0x8D, Type, NONE;
    LdLen => "ldlen", 0x8E, None, NONE;
    LdElemRef => "ldelem.ref", 0x9A, None, NONE;
    StElemRef => "stelem.ref", 0xA2, None, NONE;
    UnboxAny => "unbox.any", 0xA5, Type, NONE;
    EndFinally => "endfinally", 0xDC, None, END;
    Leave => "leave", 0xDD, LongTarget, LEAVE;
    LeaveS => "leave.s", 0xDE, ShortTarget, LEAVE_S;
    Ceq => "ceq", 0xFE01, None, NONE;
    Cgt => "cgt", 0xFE02, None, NONE;
    Clt => "clt", 0xFE04, None, NONE;
    LdFtn => "ldftn", 0xFE06, Method, NONE;
    LdArg => "ldarg", 0xFE09, Arg, NONE;
    StArg => "starg", 0xFE0B, Arg, NONE;
    LdLoc => "ldloc", 0xFE0C, Local, NONE;
    StLoc => "stloc", 0xFE0E, Local, NONE;
    Rethrow => "rethrow", 0xFE1A, None, END;
}

impl Opcode {
    pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic() == mnemonic)
    }

    /// Number of bytes taken by the opcode itself
    pub fn encoded_len(self) -> usize {
        if self.code() > 0xFF {
            2
        } else {
            1
        }
    }

    pub fn is_branch(self) -> bool {
        self.flags().contains(OpcodeFlags::BRANCH)
    }

    pub fn is_short_branch(self) -> bool {
        self.flags().contains(OpcodeFlags::SHORT_FORM)
    }

    pub fn is_leave(self) -> bool {
        self.flags().contains(OpcodeFlags::LEAVE)
    }

    /// Does control never reach the following instruction?
    pub fn ends_flow(self) -> bool {
        self.flags().contains(OpcodeFlags::ENDS_FLOW)
    }

    /// Long form of a short branch
    pub fn long_form(self) -> Opcode {
        match self {
            Opcode::BrS => Opcode::Br,
            Opcode::BrFalseS => Opcode::BrFalse,
            Opcode::BrTrueS => Opcode::BrTrue,
            Opcode::BeqS => Opcode::Beq,
            Opcode::BgeS => Opcode::Bge,
            Opcode::BltS => Opcode::Blt,
            Opcode::BneUnS => Opcode::BneUn,
            Opcode::LeaveS => Opcode::Leave,
            other => other,
        }
    }

    /// Short form of a long branch, if there is one
    pub fn short_form(self) -> Option<Opcode> {
        Some(match self {
            Opcode::Br => Opcode::BrS,
            Opcode::BrFalse => Opcode::BrFalseS,
            Opcode::BrTrue => Opcode::BrTrueS,
            Opcode::Beq => Opcode::BeqS,
            Opcode::Bge => Opcode::BgeS,
            Opcode::Blt => Opcode::BltS,
            Opcode::BneUn => Opcode::BneUnS,
            Opcode::Leave => Opcode::LeaveS,
            _ => return None,
        })
    }
}
