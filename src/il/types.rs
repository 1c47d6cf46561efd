use super::ClassId;

/// Types of locals, fields, parameters and operands
///
/// Only the distinctions the weaver needs are kept: value types must be boxed before they are
/// stored in an object slot, and unboxed when they are read back out of one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    I32,
    I64,
    F64,
    Str,
    Object,
    ObjectArray,
    Class(ClassId),
}

impl Type {
    /// Value types live unboxed on the stack and in typed slots
    pub fn is_value_type(&self) -> bool {
        matches!(self, Type::Bool | Type::I32 | Type::I64 | Type::F64)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Keyword used in the assembly syntax (classes are written by name instead)
    pub fn keyword(&self) -> Option<&'static str> {
        Some(match self {
            Type::Void => "void",
            Type::Bool => "bool",
            Type::I32 => "int32",
            Type::I64 => "int64",
            Type::F64 => "float64",
            Type::Str => "string",
            Type::Object => "object",
            Type::ObjectArray => "object[]",
            Type::Class(_) => return None,
        })
    }

    pub fn from_keyword(keyword: &str) -> Option<Type> {
        Some(match keyword {
            "void" => Type::Void,
            "bool" => Type::Bool,
            "int32" => Type::I32,
            "int64" => Type::I64,
            "float64" => Type::F64,
            "string" => Type::Str,
            "object" => Type::Object,
            "object[]" => Type::ObjectArray,
            _ => return None,
        })
    }
}
