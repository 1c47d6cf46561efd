//! Textual form of modules
//!
//! The assembly syntax is line-oriented. Comments start with `//`.
//!
//! ```text,ignore,no_run
//! .class Program
//! .field int32 counter
//!
//! .method static int32 Answer()
//!   .aspect Logger("tag") : entry success exit
//!   .locals (int32 result)
//!   .line 3
//!         ldstr "A"
//!         call @trace
//!         ldc.i4 7
//!         ret
//! .end
//! ```
//!
//! Inside a method, `NAME:` labels the next instruction, `.try START END catch|finally HSTART
//! HEND [TYPE]` declares an exception region in terms of labels (ends are exclusive and `-` stands
//! for the end of the body), and `.iterator CLASS`/`.async CLASS` marks a method whose logic lives
//! in a state-machine class. `.intercept Type(args)` requests an intercepting descriptor instead of
//! an `.aspect`. Member references are written `Class::member`, runtime intrinsics
//! `@name`.
//!
//! [`MethodListing`] and the [`Display`](fmt::Display) implementation on [`Module`] print bodies
//! back in the same syntax, labelling every instruction with its byte offset (`IL_001a`).

use super::jump_encoding::layout;
use super::{
    AspectKind, AspectSpec, ClassId, Constant, Editor, Error, ExceptionRegion, HookKind, HookSet, InsnId,
    Instruction, Intrinsic, Method, MethodBody, MethodFlags, MethodId, MethodRef, Module, Opcode,
    Operand, OperandKind, Param, RegionKind, StateMachine, Type,
};
use crate::util::Offset;
use std::collections::HashMap;
use std::fmt;

fn syntax(line: usize, message: impl Into<String>) -> Error {
    Error::Syntax {
        line,
        message: message.into(),
    }
}

/// Parse a module from its assembly listing
pub fn parse_module(source: &str) -> Result<Module, Error> {
    let lines: Vec<(usize, &str)> = source
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, strip_comment(line).trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect();

    // Declare classes up front so that members can refer to classes declared later
    let mut module = Module::new();
    for (number, line) in &lines {
        if let Some(name) = line.strip_prefix(".class") {
            let name = name.trim();
            if name.is_empty() || module.find_class(name).is_some() {
                return Err(syntax(*number, format!("bad class name `{}`", name)));
            }
            module.add_class(name);
        }
    }

    // Declare members, holding on to method bodies until every member is known
    let mut pending: Vec<(MethodId, Vec<(usize, &str)>)> = vec![];
    let mut current_class: Option<ClassId> = None;
    let mut current_method: Option<(MethodId, Vec<(usize, &str)>)> = None;
    for (number, line) in lines.iter().copied() {
        if current_method.is_some() {
            if line == ".end" {
                pending.extend(current_method.take());
            } else if let Some((_, body)) = &mut current_method {
                body.push((number, line));
            }
            continue;
        }

        let (directive, rest) = split_word(line);
        match directive {
            ".class" => current_class = module.find_class(rest.trim()),
            ".field" => {
                let class = current_class.ok_or_else(|| syntax(number, "field outside class"))?;
                let (ty, name) = split_word(rest);
                let ty = parse_type(&module, ty).ok_or_else(|| syntax(number, "bad field type"))?;
                module.add_field(class, name.trim(), ty);
            }
            ".method" => {
                let class = current_class.ok_or_else(|| syntax(number, "method outside class"))?;
                let method = parse_method_header(&module, rest).map_err(|msg| syntax(number, msg))?;
                current_method = Some((module.add_method(class, method), vec![]));
            }
            other => return Err(syntax(number, format!("unexpected `{}`", other))),
        }
    }
    if let Some((method, _)) = current_method {
        return Err(syntax(
            lines.last().map_or(0, |(number, _)| *number),
            format!("`{}` is missing `.end`", module.qualified_name(method)),
        ));
    }

    for (method, body_lines) in pending {
        assemble_method(&mut module, method, &body_lines)?;
    }
    Ok(module)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    let bytes = line.as_bytes();
    for (idx, byte) in bytes.iter().copied().enumerate() {
        match byte {
            _ if escaped => escaped = false,
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(idx + 1) == Some(&b'/') => return &line[..idx],
            _ => (),
        }
    }
    line
}

/// Split off the first whitespace-delimited word
fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim_start()),
        None => (text, ""),
    }
}

/// Split a parenthesized, comma-separated list (commas inside strings don't count)
fn split_list(text: &str) -> Vec<&str> {
    let mut items = vec![];
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ',' if !in_string => {
                items.push(text[start..idx].trim());
                start = idx + 1;
            }
            _ => (),
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() || !items.is_empty() {
        items.push(last);
    }
    items
}

/// Strip surrounding parentheses
fn parenthesized(text: &str) -> Option<&str> {
    text.trim().strip_prefix('(')?.strip_suffix(')')
}

fn parse_type(module: &Module, text: &str) -> Option<Type> {
    let text = text.trim();
    Type::from_keyword(text).or_else(|| module.find_class(text).map(Type::Class))
}

fn parse_method_header(module: &Module, text: &str) -> Result<Method, String> {
    let open = text.find('(').ok_or("missing parameter list")?;
    let params_text = parenthesized(&text[open..]).ok_or("unbalanced parameter list")?;
    let mut words: Vec<&str> = text[..open].split_whitespace().collect();
    let name = words.pop().ok_or("missing method name")?;
    let return_type = words.pop().ok_or("missing return type")?;
    let mut flags = MethodFlags::empty();
    for word in words {
        flags |= match word {
            "static" => MethodFlags::STATIC,
            "private" => MethodFlags::PRIVATE,
            "specialname" => MethodFlags::SPECIAL_NAME,
            other => return Err(format!("unknown method flag `{}`", other)),
        };
    }
    if name == ".ctor" {
        flags |= MethodFlags::SPECIAL_NAME;
    }
    let return_type = parse_type(module, return_type)
        .ok_or_else(|| format!("unknown return type `{}`", return_type))?;

    let mut params = vec![];
    for param in split_list(params_text) {
        let (ty, name) = split_word(param);
        let ty = parse_type(module, ty).ok_or_else(|| format!("unknown type `{}`", ty))?;
        if name.is_empty() {
            return Err(format!("parameter {} has no name", params.len()));
        }
        params.push(Param {
            name: name.to_owned(),
            ty,
        });
    }

    Ok(Method::new(name, flags, params, return_type))
}

fn parse_string(text: &str) -> Option<String> {
    let inner = text.trim().strip_prefix('"')?.strip_suffix('"')?;
    let mut output = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            output.push(c);
            continue;
        }
        output.push(match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            '\'' => '\'',
            'u' => {
                let rest: String = chars.by_ref().take_while(|c| *c != '}').collect();
                let hex = rest.strip_prefix('{')?;
                char::from_u32(u32::from_str_radix(hex, 16).ok()?)?
            }
            _ => return None,
        });
    }
    Some(output)
}

fn parse_constant(text: &str) -> Option<Constant> {
    let text = text.trim();
    if text == "null" {
        Some(Constant::Null)
    } else if text.starts_with('"') {
        parse_string(text).map(Constant::Str)
    } else if let Some(long) = text.strip_suffix('L') {
        long.parse().ok().map(Constant::I64)
    } else if let Ok(int) = text.parse() {
        Some(Constant::I32(int))
    } else {
        text.parse().ok().map(Constant::F64)
    }
}

/// `Type(args)` followed by whatever trails the closing parenthesis
fn parse_constructor(text: &str) -> Option<(&str, Vec<Constant>, &str)> {
    let (ctor, rest) = match text.rfind(')') {
        Some(close) => (&text[..=close], text[close + 1..].trim()),
        None => (text, ""),
    };
    let (type_name, args) = match ctor.find('(') {
        Some(open) => (ctor[..open].trim(), parenthesized(&ctor[open..])?),
        None => (ctor.trim(), ""),
    };
    if type_name.is_empty() {
        return None;
    }
    let ctor_args = split_list(args)
        .into_iter()
        .map(parse_constant)
        .collect::<Option<Vec<_>>>()?;
    Some((type_name, ctor_args, rest))
}

/// `.intercept Type(args)`
fn parse_interception(text: &str) -> Option<AspectSpec> {
    match parse_constructor(text)? {
        (type_name, ctor_args, "") => Some(AspectSpec::interception(type_name).with_args(ctor_args)),
        _ => None,
    }
}

/// `.aspect Type(args) [: hooks]`
fn parse_aspect(text: &str) -> Option<AspectSpec> {
    let (type_name, ctor_args, hooks) = parse_constructor(text)?;
    let hooks = match hooks.strip_prefix(':') {
        Some(names) => {
            let mut set = HookSet::empty();
            for name in names.split_whitespace() {
                set |= HookKind::from_name(name)?.flag();
            }
            set
        }
        None if hooks.is_empty() => HookSet::all(),
        None => return None,
    };
    Some(AspectSpec::new(type_name).with_args(ctor_args).with_hooks(hooks))
}

/// Split off a leading `label:`
fn split_label(text: &str) -> Option<(&str, &str)> {
    let (word, rest) = split_word(text);
    let label = word.strip_suffix(':')?;
    let is_ident = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '.');
    if is_ident {
        Some((label, rest))
    } else {
        None
    }
}

struct PendingInstruction<'a> {
    id: InsnId,
    line: usize,
    opcode: Opcode,
    operand: &'a str,
}

fn assemble_method(module: &mut Module, method: MethodId, lines: &[(usize, &str)]) -> Result<(), Error> {
    let has_return_value = !module.method(method).return_type.is_void();
    let mut body = MethodBody::new(has_return_value);
    let mut aspects = vec![];
    let mut state_machine = None;
    let mut labels: HashMap<&str, InsnId> = HashMap::new();
    let mut instructions: Vec<PendingInstruction> = vec![];
    let mut tries: Vec<(usize, &str)> = vec![];

    {
        let mut editor = Editor::new(&mut body);
        let mut unbound: Vec<(usize, &str)> = vec![];
        let mut pending_line: Option<u32> = None;

        for (number, line) in lines.iter().copied() {
            let mut rest = line;
            while let Some((label, after)) = split_label(rest) {
                unbound.push((number, label));
                rest = after;
            }
            if rest.is_empty() {
                continue;
            }

            let (word, operand) = split_word(rest);
            match word {
                ".aspect" => {
                    aspects.push(parse_aspect(operand).ok_or_else(|| syntax(number, "bad aspect"))?)
                }
                ".intercept" => aspects.push(
                    parse_interception(operand).ok_or_else(|| syntax(number, "bad interception"))?,
                ),
                ".iterator" | ".async" => {
                    let class = module
                        .find_class(operand)
                        .ok_or_else(|| syntax(number, format!("unknown class `{}`", operand)))?;
                    state_machine = Some(if word == ".iterator" {
                        StateMachine::Iterator(class)
                    } else {
                        StateMachine::Async(class)
                    });
                }
                ".locals" => {
                    let list = parenthesized(operand).unwrap_or(operand);
                    for local in split_list(list) {
                        let (ty, name) = split_word(local);
                        let ty = parse_type(module, ty)
                            .ok_or_else(|| syntax(number, format!("unknown type `{}`", ty)))?;
                        let name = Some(name.trim()).filter(|name| !name.is_empty());
                        editor.add_local(ty, name);
                    }
                }
                ".line" => {
                    pending_line =
                        Some(operand.parse().map_err(|_| syntax(number, "bad line number"))?)
                }
                ".try" => tries.push((number, operand)),
                mnemonic => {
                    let opcode = Opcode::from_mnemonic(mnemonic)
                        .ok_or_else(|| syntax(number, format!("unknown opcode `{}`", mnemonic)))?;
                    let id = editor.emit(Instruction::new(opcode, Operand::Pending));
                    for (label_line, label) in unbound.drain(..) {
                        if labels.insert(label, id).is_some() {
                            return Err(syntax(label_line, format!("duplicate label `{}`", label)));
                        }
                    }
                    if let Some(source_line) = pending_line.take() {
                        editor.body_mut().sequence_points.insert(id, source_line);
                    }
                    instructions.push(PendingInstruction {
                        id,
                        line: number,
                        opcode,
                        operand,
                    });
                }
            }
        }

        if let Some((number, label)) = unbound.first() {
            return Err(syntax(
                *number,
                format!("label `{}` is not followed by an instruction", label),
            ));
        }
    }

    let resolve_label = |line: usize, label: &str| {
        labels
            .get(label)
            .copied()
            .ok_or_else(|| syntax(line, format!("unknown label `{}`", label)))
    };

    for pending in &instructions {
        let operand = parse_operand(module, method, &body, pending, &resolve_label)?;
        body.get_mut(pending.id).operand = operand;
    }

    for (number, text) in tries {
        let words: Vec<&str> = text.split_whitespace().collect();
        let (kind, handler_end) = match words.as_slice() {
            [_, _, "finally", _, end] => (RegionKind::Finally, *end),
            [_, _, "catch", _, end] => (RegionKind::Catch(None), *end),
            [_, _, "catch", _, end, ty] => {
                let ty = parse_type(module, ty)
                    .ok_or_else(|| syntax(number, format!("unknown type `{}`", ty)))?;
                (RegionKind::Catch(Some(ty)), *end)
            }
            _ => return Err(syntax(number, "expected `.try START END catch|finally START END`")),
        };
        body.regions.push(ExceptionRegion {
            try_start: resolve_label(number, words[0])?,
            try_end: resolve_label(number, words[1])?,
            handler_start: resolve_label(number, words[3])?,
            handler_end: match handler_end {
                "-" => None,
                label => Some(resolve_label(number, label)?),
            },
            kind,
        });
    }

    let target = module.method_mut(method);
    target.body = if body.is_empty() { None } else { Some(body) };
    target.aspects = aspects;
    target.state_machine = state_machine;
    Ok(())
}

fn parse_operand(
    module: &Module,
    method: MethodId,
    body: &MethodBody,
    pending: &PendingInstruction,
    resolve_label: &impl Fn(usize, &str) -> Result<InsnId, Error>,
) -> Result<Operand, Error> {
    let line = pending.line;
    let text = pending.operand.trim();
    let expected = |what: &str| syntax(line, format!("`{}` expects {}", pending.opcode.mnemonic(), what));

    Ok(match pending.opcode.operand_kind() {
        OperandKind::None if text.is_empty() => Operand::None,
        OperandKind::None => return Err(expected("no operand")),
        OperandKind::I32 => Operand::I32(text.parse().map_err(|_| expected("an int32"))?),
        OperandKind::I64 => Operand::I64(text.parse().map_err(|_| expected("an int64"))?),
        OperandKind::F64 => Operand::F64(text.parse().map_err(|_| expected("a float64"))?),
        OperandKind::Str => Operand::Str(parse_string(text).ok_or_else(|| expected("a string"))?),
        OperandKind::Arg => {
            let signature = module.method(method);
            let slot = if let Ok(slot) = text.parse() {
                slot
            } else if text == "this" && !signature.is_static() {
                0
            } else {
                let idx = signature
                    .params
                    .iter()
                    .position(|param| param.name == text)
                    .ok_or_else(|| expected("a parameter"))?;
                idx as u16 + signature.first_param_slot()
            };
            Operand::Arg(slot)
        }
        OperandKind::Local => Operand::Local(match text.parse() {
            Ok(slot) => slot,
            Err(_) => body.local_named(text).ok_or_else(|| expected("a local"))?,
        }),
        OperandKind::Field => {
            let (class, field) = text.split_once("::").ok_or_else(|| expected("`Class::field`"))?;
            let field = module
                .find_class(class)
                .and_then(|class| module.find_field(class, field))
                .ok_or_else(|| syntax(line, format!("unknown field `{}`", text)))?;
            Operand::Field(field)
        }
        OperandKind::Method => {
            if let Some(name) = text.strip_prefix('@') {
                let intrinsic = Intrinsic::from_name(name)
                    .ok_or_else(|| syntax(line, format!("unknown intrinsic `{}`", text)))?;
                Operand::Method(MethodRef::Intrinsic(intrinsic))
            } else {
                let (class, name) = text.split_once("::").ok_or_else(|| expected("`Class::method`"))?;
                let callee = module
                    .find_class(class)
                    .and_then(|class| module.find_method(class, name))
                    .ok_or_else(|| syntax(line, format!("unknown method `{}`", text)))?;
                Operand::Method(MethodRef::Defined(callee))
            }
        }
        OperandKind::Type => Operand::Type(
            parse_type(module, text).ok_or_else(|| syntax(line, format!("unknown type `{}`", text)))?,
        ),
        OperandKind::ShortTarget | OperandKind::LongTarget => Operand::Target(resolve_label(line, text)?),
        OperandKind::Switch => {
            let list = parenthesized(text).ok_or_else(|| expected("`(L1, L2, ...)`"))?;
            let targets = split_list(list)
                .into_iter()
                .map(|label| resolve_label(line, label))
                .collect::<Result<Vec<_>, _>>()?;
            Operand::Targets(targets)
        }
    })
}

/// Printable listing of one method
pub struct MethodListing<'a> {
    pub module: &'a Module,
    pub method: MethodId,
}

impl<'a> MethodListing<'a> {
    pub fn new(module: &'a Module, method: MethodId) -> MethodListing<'a> {
        MethodListing { module, method }
    }
}

fn write_label(f: &mut fmt::Formatter<'_>, offsets: &HashMap<InsnId, Offset>, id: InsnId) -> fmt::Result {
    match offsets.get(&id) {
        Some(offset) => write!(f, "IL_{:04x}", offset.0),
        None => write!(f, "?{:?}", id),
    }
}

impl<'a> fmt::Display for MethodListing<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.module;
        let method = module.method(self.method);

        write!(f, ".method ")?;
        for (flag, word) in [
            (MethodFlags::STATIC, "static "),
            (MethodFlags::PRIVATE, "private "),
        ] {
            if method.flags.contains(flag) {
                f.write_str(word)?;
            }
        }
        if method.flags.contains(MethodFlags::SPECIAL_NAME) && method.name != ".ctor" {
            f.write_str("specialname ")?;
        }
        write!(f, "{} {}(", module.type_name(&method.return_type), method.name)?;
        for (idx, param) in method.params.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", module.type_name(&param.ty), param.name)?;
        }
        writeln!(f, ")")?;

        for aspect in &method.aspects {
            let directive = match aspect.kind {
                AspectKind::Boundary => ".aspect",
                AspectKind::Interception => ".intercept",
            };
            write!(f, "  {} {}(", directive, aspect.type_name)?;
            for (idx, arg) in aspect.ctor_args.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", arg)?;
            }
            f.write_str(")")?;
            if aspect.kind == AspectKind::Boundary && aspect.hooks != HookSet::all() {
                f.write_str(" :")?;
                for kind in aspect.hooks.kinds() {
                    write!(f, " {}", kind.name())?;
                }
            }
            writeln!(f)?;
        }
        match method.state_machine {
            Some(StateMachine::Iterator(class)) => writeln!(f, "  .iterator {}", module.class(class).name)?,
            Some(StateMachine::Async(class)) => writeln!(f, "  .async {}", module.class(class).name)?,
            None => (),
        }

        let body = match &method.body {
            Some(body) => body,
            None => return writeln!(f, ".end"),
        };
        if !body.locals.is_empty() {
            f.write_str("  .locals (")?;
            for (idx, local) in body.locals.iter().enumerate() {
                if idx > 0 {
                    f.write_str(", ")?;
                }
                f.write_str(&module.type_name(&local.ty))?;
                if let Some(name) = &local.name {
                    write!(f, " {}", name)?;
                }
            }
            writeln!(f, ")")?;
        }

        let (offsets, _) = layout(body);
        for (id, insn) in body.iter() {
            if let Some(line) = body.sequence_points.get(&id) {
                writeln!(f, "  .line {}", line)?;
            }
            f.write_str("  ")?;
            write_label(f, &offsets, id)?;
            write!(f, ": {}", insn.opcode.mnemonic())?;
            match &insn.operand {
                Operand::None => (),
                Operand::I32(value) => write!(f, " {}", value)?,
                Operand::I64(value) => write!(f, " {}", value)?,
                Operand::F64(value) => write!(f, " {:?}", value)?,
                Operand::Str(value) => write!(f, " {:?}", value)?,
                Operand::Arg(slot) | Operand::Local(slot) => write!(f, " {}", slot)?,
                Operand::Field(field) => write!(f, " {}", module.qualified_field_name(*field))?,
                Operand::Method(MethodRef::Defined(callee)) => {
                    write!(f, " {}", module.qualified_name(*callee))?
                }
                Operand::Method(MethodRef::Intrinsic(intrinsic)) => write!(f, " @{}", intrinsic.name())?,
                Operand::Type(ty) => write!(f, " {}", module.type_name(ty))?,
                Operand::Target(target) => {
                    f.write_str(" ")?;
                    write_label(f, &offsets, *target)?;
                }
                Operand::Targets(targets) => {
                    f.write_str(" (")?;
                    for (idx, target) in targets.iter().enumerate() {
                        if idx > 0 {
                            f.write_str(", ")?;
                        }
                        write_label(f, &offsets, *target)?;
                    }
                    f.write_str(")")?;
                }
                Operand::Pending => f.write_str(" ?")?,
            }
            writeln!(f)?;
        }

        for region in &body.regions {
            f.write_str("  .try ")?;
            write_label(f, &offsets, region.try_start)?;
            f.write_str(" ")?;
            write_label(f, &offsets, region.try_end)?;
            f.write_str(match region.kind {
                RegionKind::Finally => " finally ",
                RegionKind::Catch(_) => " catch ",
            })?;
            write_label(f, &offsets, region.handler_start)?;
            f.write_str(" ")?;
            match region.handler_end {
                Some(end) => write_label(f, &offsets, end)?,
                None => f.write_str("-")?,
            }
            if let RegionKind::Catch(Some(ty)) = &region.kind {
                write!(f, " {}", module.type_name(ty))?;
            }
            writeln!(f)?;
        }
        writeln!(f, ".end")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (class_idx, class) in self.classes.iter().enumerate() {
            if class_idx > 0 {
                writeln!(f)?;
            }
            writeln!(f, ".class {}", class.name)?;
            for field in &class.fields {
                writeln!(f, ".field {} {}", self.type_name(&field.ty), field.name)?;
            }
            for method_idx in 0..class.methods.len() {
                writeln!(f)?;
                let method = MethodId {
                    class: ClassId(class_idx as u32),
                    index: method_idx as u32,
                };
                write!(f, "{}", MethodListing::new(self, method))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SOURCE: &str = r#"
        .class Program
        .field int32 counter

        .method static int32 Pick(int32 a, string b)
          .aspect Logger("x, y", 3, null) : entry exit
          .locals (int32 result, object)
          .line 12
                  ldarg a
                  brtrue.s NONZERO   // comment
                  ldc.i4 -1
                  stloc result
                  leave.s DONE
          NONZERO: ldarg b
                  call @trace
                  ldarg 0
                  stloc 0
                  leave.s DONE
          HANDLER: pop
                  leave.s DONE
          DONE:   ldloc result
                  ret
          .try IL_START NONZERO catch HANDLER DONE
          IL_START:
        .end
    "#;

    #[test]
    fn unbound_trailing_labels_are_rejected() {
        assert!(matches!(
            parse_module(SOURCE),
            Err(Error::Syntax { message, .. }) if message.contains("IL_START")
        ));
    }

    fn fixed_source() -> String {
        SOURCE
            .replace("          IL_START:\n", "")
            .replace(".line 12\n                  ldarg a", ".line 12\n          IL_START: ldarg a")
    }

    #[test]
    fn parses_methods() {
        let module = parse_module(&fixed_source()).unwrap();
        let class = module.find_class("Program").unwrap();
        let method = module.find_method(class, "Pick").unwrap();
        let method = module.method(method);

        assert!(method.is_static());
        assert_eq!(method.params.len(), 2);
        assert_eq!(
            method.aspects,
            vec![AspectSpec::new("Logger")
                .with_args(vec![
                    Constant::Str("x, y".to_owned()),
                    Constant::I32(3),
                    Constant::Null
                ])
                .with_hooks(HookSet::ENTRY | HookSet::EXIT)]
        );

        let body = method.body.as_ref().unwrap();
        assert!(body.has_return_value);
        assert_eq!(body.locals.len(), 2);
        assert_eq!(body.len(), 14);
        assert_eq!(body.regions.len(), 1);
        assert_eq!(body.sequence_points.values().copied().collect::<Vec<_>>(), vec![12]);
        let first = body.first().unwrap();
        assert_eq!(body.get(first), &Instruction::ldarg(0));
        assert!(body.validate().is_ok());
    }

    #[test]
    fn listing_round_trips() {
        let module = parse_module(&fixed_source()).unwrap();
        let listing = module.to_string();
        let reparsed = parse_module(&listing).unwrap();
        assert_eq!(reparsed.to_string(), listing);
        assert!(listing.contains("call @trace"));
        assert!(listing.contains(".try IL_0000 IL_0011 catch IL_0024 IL_0027"));
    }

    #[test]
    fn parses_interceptions() {
        let source = r#"
            .class Program
            .method static int32 Answer(int32 a)
              .intercept Interceptor("proceed")
                      ldftn Program::Answer
                      pop
                      ldarg a
                      ret
            .end
        "#;
        let module = parse_module(source).unwrap();
        let class = module.find_class("Program").unwrap();
        let answer = module.find_method(class, "Answer").unwrap();
        assert_eq!(
            module.method(answer).aspects,
            vec![AspectSpec::interception("Interceptor")
                .with_args(vec![Constant::Str("proceed".to_owned())])]
        );

        let listing = module.to_string();
        assert!(listing.contains(".intercept Interceptor(\"proceed\")\n"));
        assert!(listing.contains("ldftn Program::Answer"));
        assert_eq!(parse_module(&listing).unwrap().to_string(), listing);

        assert!(parse_module(&source.replace("(\"proceed\")", "(\"proceed\") : entry")).is_err());
    }

    #[test]
    fn reports_unknown_members() {
        let source = ".class A\n.method static void M()\n  call A::Missing\n  ret\n.end\n";
        assert!(matches!(
            parse_module(source),
            Err(Error::Syntax { line: 3, .. })
        ));
    }
}
