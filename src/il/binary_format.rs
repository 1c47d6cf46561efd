//! Binary encoding of method bodies
//!
//! Bodies are encoded in the ECMA-335 style: opcodes (two-byte opcodes prefixed with `0xFE`),
//! little-endian operands, metadata operands as 4-byte tokens, and branch targets as offsets
//! relative to the end of the branch instruction. Exception regions are written as fat
//! exception-handling clauses.

use super::jump_encoding::{branch_distance, layout, SIGNED_8BIT_JUMP_RANGE};
use super::{
    Error, FieldId, InsnId, MethodBody, MethodRef, Module, OperandKind, Operand, RegionKind, Type,
};
use crate::util::{Offset, Width};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::io::Write;

/// Serialize into a binary output stream
pub trait Serialize: Sized {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()>;
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u16::<LittleEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(*self)
    }
}

/// Length in `u16` followed by UTF-8 bytes
impl Serialize for String {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.len() as u16).serialize(writer)?;
        writer.write_all(self.as_bytes())
    }
}

/// Metadata an instruction stream refers to by token
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TokenKey {
    Str(String),
    Field(FieldId),
    Method(MethodRef),
    Type(Type),
}

impl TokenKey {
    /// Metadata table, stored in the top byte of the token
    fn table(&self) -> u8 {
        match self {
            TokenKey::Type(_) => 0x01,
            TokenKey::Field(_) => 0x04,
            TokenKey::Method(MethodRef::Defined(_)) => 0x06,
            TokenKey::Method(MethodRef::Intrinsic(_)) => 0x0A,
            TokenKey::Str(_) => 0x70,
        }
    }
}

/// Assigns tokens to metadata, shared across the bodies of a module
#[derive(Default, Debug)]
pub struct TokenTable {
    tokens: HashMap<TokenKey, u32>,
    rows: HashMap<u8, u32>,
    entries: Vec<(u32, TokenKey)>,
}

impl TokenTable {
    pub fn new() -> TokenTable {
        TokenTable::default()
    }

    pub fn token(&mut self, key: TokenKey) -> u32 {
        if let Some(token) = self.tokens.get(&key) {
            return *token;
        }
        let table = key.table();
        let row = self.rows.entry(table).or_insert(0);
        *row += 1;
        let token = (table as u32) << 24 | *row;
        self.tokens.insert(key.clone(), token);
        self.entries.push((token, key));
        token
    }

    /// Tokens in the order they were assigned
    pub fn entries(&self) -> &[(u32, TokenKey)] {
        &self.entries
    }
}

/// Encoded method body
#[derive(Debug)]
pub struct EncodedBody {
    pub code: Vec<u8>,
    pub offsets: HashMap<InsnId, Offset>,
    pub clauses: Vec<ExceptionClause>,
}

/// Fat exception-handling clause
#[derive(Debug, PartialEq, Eq)]
pub struct ExceptionClause {
    pub flags: u32,
    pub try_offset: u32,
    pub try_length: u32,
    pub handler_offset: u32,
    pub handler_length: u32,
    pub class_token: u32,
}

impl ExceptionClause {
    pub const CATCH: u32 = 0x0000;
    pub const FINALLY: u32 = 0x0002;
}

impl Serialize for ExceptionClause {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.flags.serialize(writer)?;
        self.try_offset.serialize(writer)?;
        self.try_length.serialize(writer)?;
        self.handler_offset.serialize(writer)?;
        self.handler_length.serialize(writer)?;
        self.class_token.serialize(writer)
    }
}

impl Serialize for EncodedBody {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.code.len() as u32).serialize(writer)?;
        writer.write_all(&self.code)?;
        (self.clauses.len() as u16).serialize(writer)?;
        for clause in &self.clauses {
            clause.serialize(writer)?;
        }
        Ok(())
    }
}

/// Encode a method body
///
/// Short branches that can't reach their targets are an error: run
/// [`widen_short_branches`](super::widen_short_branches) first.
pub fn encode_body(body: &MethodBody, tokens: &mut TokenTable) -> Result<EncodedBody, Error> {
    let (offsets, end) = layout(body);
    let mut code: Vec<u8> = Vec::with_capacity(end.0);

    for (id, insn) in body.iter() {
        let opcode = insn.opcode;
        let bad_operand = || Error::BadOperand {
            at: id,
            mnemonic: opcode.mnemonic(),
        };
        if insn.operand == Operand::Pending {
            return Err(Error::PendingBranch(id));
        }

        let code_point = opcode.code();
        if code_point > 0xFF {
            code.write_u8((code_point >> 8) as u8)?;
        }
        code.write_u8(code_point as u8)?;

        match (opcode.operand_kind(), &insn.operand) {
            (OperandKind::None, Operand::None) => (),
            (OperandKind::I32, Operand::I32(value)) => code.write_i32::<LittleEndian>(*value)?,
            (OperandKind::I64, Operand::I64(value)) => code.write_i64::<LittleEndian>(*value)?,
            (OperandKind::F64, Operand::F64(value)) => code.write_f64::<LittleEndian>(*value)?,
            (OperandKind::Arg, Operand::Arg(slot)) | (OperandKind::Local, Operand::Local(slot)) => {
                code.write_u16::<LittleEndian>(*slot)?
            }
            (OperandKind::Str, Operand::Str(string)) => {
                let token = tokens.token(TokenKey::Str(string.clone()));
                code.write_u32::<LittleEndian>(token)?
            }
            (OperandKind::Field, Operand::Field(field)) => {
                let token = tokens.token(TokenKey::Field(*field));
                code.write_u32::<LittleEndian>(token)?
            }
            (OperandKind::Method, Operand::Method(method)) => {
                let token = tokens.token(TokenKey::Method(method.clone()));
                code.write_u32::<LittleEndian>(token)?
            }
            (OperandKind::Type, Operand::Type(ty)) => {
                let token = tokens.token(TokenKey::Type(ty.clone()));
                code.write_u32::<LittleEndian>(token)?
            }
            (OperandKind::ShortTarget, Operand::Target(target)) => {
                let distance = resolve_distance(body, &offsets, id, *target)?;
                if !SIGNED_8BIT_JUMP_RANGE.contains(&distance) {
                    return Err(Error::ShortBranchOutOfRange {
                        branch: id,
                        distance,
                    });
                }
                code.write_i8(distance as i8)?
            }
            (OperandKind::LongTarget, Operand::Target(target)) => {
                let distance = resolve_distance(body, &offsets, id, *target)?;
                code.write_i32::<LittleEndian>(distance as i32)?
            }
            (OperandKind::Switch, Operand::Targets(targets)) => {
                let from = offsets[&id].0 + insn.width();
                code.write_u32::<LittleEndian>(targets.len() as u32)?;
                for target in targets {
                    let to = offsets.get(target).ok_or(Error::DanglingTarget {
                        branch: id,
                        target: *target,
                    })?;
                    code.write_i32::<LittleEndian>((to.0 as isize - from as isize) as i32)?;
                }
            }
            _ => return Err(bad_operand()),
        }
    }

    let positions = body.positions();
    let spans = body.region_spans(&positions)?;
    let ids = body.ids();
    let offset_at = |pos: usize| -> u32 {
        ids.get(pos)
            .map_or(end, |id| offsets[id])
            .0 as u32
    };
    let clauses = body
        .regions
        .iter()
        .zip(spans)
        .map(|(region, span)| {
            let (flags, class_token) = match &region.kind {
                RegionKind::Finally => (ExceptionClause::FINALLY, 0),
                RegionKind::Catch(None) => (ExceptionClause::CATCH, 0),
                RegionKind::Catch(Some(ty)) => {
                    (ExceptionClause::CATCH, tokens.token(TokenKey::Type(ty.clone())))
                }
            };
            let try_offset = offset_at(span.try_range.start);
            let handler_offset = offset_at(span.handler_range.start);
            ExceptionClause {
                flags,
                try_offset,
                try_length: offset_at(span.try_range.end) - try_offset,
                handler_offset,
                handler_length: offset_at(span.handler_range.end) - handler_offset,
                class_token,
            }
        })
        .collect();

    Ok(EncodedBody {
        code,
        offsets,
        clauses,
    })
}

fn resolve_distance(
    body: &MethodBody,
    offsets: &HashMap<InsnId, Offset>,
    branch: InsnId,
    target: InsnId,
) -> Result<isize, Error> {
    branch_distance(body, offsets, branch).ok_or(Error::DanglingTarget { branch, target })
}

/// Encode every method body of a module
///
/// The output is a sequence of `(qualified method name, encoded body)` records followed by the
/// token table, each token paired with a printable description of what it refers to.
pub fn encode_module(module: &Module) -> Result<Vec<u8>, Error> {
    let mut tokens = TokenTable::new();
    let mut output: Vec<u8> = vec![];
    output.write_all(b"AWIL")?;

    let methods: Vec<_> = module
        .method_ids()
        .into_iter()
        .filter(|method| module.method(*method).body.is_some())
        .collect();
    (methods.len() as u32).serialize(&mut output)?;
    for method in methods {
        if let Some(body) = &module.method(method).body {
            module.qualified_name(method).serialize(&mut output)?;
            encode_body(body, &mut tokens)?.serialize(&mut output)?;
        }
    }

    (tokens.entries().len() as u32).serialize(&mut output)?;
    for (token, key) in tokens.entries() {
        token.serialize(&mut output)?;
        let description = match key {
            TokenKey::Str(string) => string.clone(),
            TokenKey::Field(field) => module.qualified_field_name(*field),
            TokenKey::Method(MethodRef::Defined(method)) => module.qualified_name(*method),
            TokenKey::Method(MethodRef::Intrinsic(intrinsic)) => format!("@{}", intrinsic.name()),
            TokenKey::Type(ty) => module.type_name(ty),
        };
        description.serialize(&mut output)?;
    }

    Ok(output)
}
