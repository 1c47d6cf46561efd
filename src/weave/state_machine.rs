//! Shared machinery for methods lowered to state machines
//!
//! An iterator or asynchronous method keeps almost none of its logic: its body allocates a
//! compiler-synthesized record and the logic lives in the record's `MoveNext`, already split at
//! every suspension point and dispatching on the phase field `<>1__state`. Weaving such a method
//! means leaving the owner alone and instrumenting the record instead:
//!
//!   * the hook descriptor, execution context, arguments container, and a "resumed before" flag
//!     become fields of the record (the descriptor is created by the record's constructor);
//!   * `MoveNext` moves to `MoveNext<Original>`, and the new `MoveNext` decides on every call
//!     whether this is the first step (build the context, run the entry hook) or a resumption
//!     (run the resume hook) before stepping the original.
//!
//! What happens around the call to the original step differs between the two flavors, so it is
//! supplied by a [`StateMachineFlavor`].

use super::arguments::{build_arguments_container, emit_copy_back, ArgumentSlot};
use super::{construct_aspect, CopyBack, EditorExts, Error, HookTable, Settings, Storage};
use crate::il::{
    widen_short_branches, AspectSpec, ClassId, Editor, FieldId, HookKind, Instruction, Intrinsic, Method,
    MethodBody, MethodFlags, MethodId, Module, Opcode, Type,
};

/// Phase field of every state-machine record
pub const STATE_FIELD: &str = "<>1__state";

/// Field capturing the receiver of an instance owner
pub const THIS_FIELD: &str = "<>4__this";

/// Members of a state-machine record that weaving relies on
pub struct StateMachineInjector {
    /// Identity of the owner method (`Class::method`)
    pub name: String,
    pub owner: MethodId,
    pub record: ClassId,
    pub hooks: HookTable,
    pub spec: AspectSpec,

    pub state: FieldId,
    pub this: Option<FieldId>,

    /// Fields capturing the owner's parameters, in declaration order
    pub params: Vec<ArgumentSlot>,

    pub constructor: MethodId,
    pub move_next: MethodId,

    pub aspect: Storage,
    pub context: Storage,
    pub arguments: Storage,
    pub resume_flag: Storage,
}

impl StateMachineInjector {
    /// Resolve the record of `owner` and add the fields every flavor needs
    pub fn new(
        module: &mut Module,
        owner: MethodId,
        spec: &AspectSpec,
        settings: &Settings,
    ) -> Result<StateMachineInjector, Error> {
        let name = module.qualified_name(owner);
        let method = module.method(owner);
        let record = match method.state_machine {
            Some(state_machine) => state_machine.class(),
            None => return Err(Error::shape(&name, "not a state-machine method")),
        };

        let missing = |member: &str| Error::MissingMember {
            method: name.clone(),
            owner: module.class(record).name.clone(),
            member: member.to_owned(),
        };
        let field = |member: &str| module.find_field(record, member).ok_or_else(|| missing(member));
        let method_named =
            |member: &str| module.find_method(record, member).ok_or_else(|| missing(member));

        let state = field(STATE_FIELD)?;
        let this = if method.is_static() {
            None
        } else {
            Some(field(THIS_FIELD)?)
        };
        let params = method
            .params
            .iter()
            .map(|param| {
                Ok(ArgumentSlot {
                    storage: Storage::Field(field(&param.name)?),
                    ty: param.ty.clone(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let constructor = method_named(".ctor")?;
        let move_next = method_named("MoveNext")?;

        let aspect = module.add_field(record, &settings.aspect_field_name, Type::Object);
        let context = module.add_field(record, &settings.context_field_name, Type::Object);
        let arguments = module.add_field(record, &settings.arguments_field_name, Type::Object);
        let resume_flag = module.add_field(record, &settings.resume_flag_field_name, Type::Bool);

        Ok(StateMachineInjector {
            name,
            owner,
            record,
            hooks: HookTable::new(spec),
            spec: spec.clone(),
            state,
            this,
            params,
            constructor,
            move_next,
            aspect: Storage::Field(aspect),
            context: Storage::Field(context),
            arguments: Storage::Field(arguments),
            resume_flag: Storage::Field(resume_flag),
        })
    }

    fn missing(&self, module: &Module, member: &str) -> Error {
        Error::MissingMember {
            method: self.name.clone(),
            owner: module.class(self.record).name.clone(),
            member: member.to_owned(),
        }
    }

    /// Look up a field the compiler is expected to have put on the record
    pub fn contract_field(&self, module: &Module, member: &str) -> Result<FieldId, Error> {
        module
            .find_field(self.record, member)
            .ok_or_else(|| self.missing(module, member))
    }

    /// Look up a method the compiler is expected to have put on the record
    pub fn contract_method(&self, module: &Module, member: &str) -> Result<MethodId, Error> {
        module
            .find_method(self.record, member)
            .ok_or_else(|| self.missing(module, member))
    }

    /// Add a field to the record
    pub fn add_field(&self, module: &mut Module, name: &str, ty: Type) -> Storage {
        Storage::Field(module.add_field(self.record, name, ty))
    }

    /// Body of a record method, checked for well-formedness
    pub fn body_of(&self, module: &Module, method: MethodId) -> Result<MethodBody, Error> {
        let body = module.method(method).body.clone().ok_or_else(|| Error::NoBody {
            method: module.qualified_name(method),
        })?;
        body.validate().map_err(Error::malformed(&self.name))?;
        Ok(body)
    }

    /// Create the hook descriptor at the start of the record's constructor
    pub fn create_aspect_instance(&self, module: &mut Module) -> Result<(), Error> {
        let mut body = self.body_of(module, self.constructor)?;
        let first = body
            .first()
            .ok_or_else(|| Error::shape(&self.name, "record constructor is empty"))?;

        let mut insns = vec![Instruction::ldarg(0)];
        insns.extend(construct_aspect(&self.spec));
        if let Storage::Field(field) = self.aspect {
            insns.push(Instruction::stfld(field));
        }
        Editor::new(&mut body).splice_before(first, insns);

        body.validate().map_err(Error::malformed(&self.name))?;
        module.method_mut(self.constructor).body = Some(body);
        Ok(())
    }

    /// Move a record method to a private `<Original>` sibling, returning the sibling
    pub fn clone_method(
        &self,
        module: &mut Module,
        method: MethodId,
        settings: &Settings,
    ) -> Result<MethodId, Error> {
        let body = self.body_of(module, method)?;
        let source = module.method(method);
        let clone = Method {
            body: Some(body),
            ..Method::new(
                settings.original_name(&source.name),
                source.flags | MethodFlags::PRIVATE,
                source.params.clone(),
                source.return_type.clone(),
            )
        };
        Ok(module.add_method(self.record, clone))
    }

    /// Call a hook with the record's descriptor and context
    pub fn call_hook(&self, editor: &mut Editor, kind: HookKind) {
        editor.call_hook(&self.hooks, kind, &self.aspect, &self.context);
    }

    /// Emit the first-step-or-resumption dispatch
    ///
    /// On the first step, the arguments container and the execution context are built from the
    /// captured fields, the entry hook runs, and the (possibly rewritten) arguments are copied
    /// back into the captured fields. Every later step runs the resume hook instead.
    pub fn emit_prologue(&self, editor: &mut Editor, settings: &Settings) -> Result<(), Error> {
        let resume = editor.create_label();
        let done = editor.create_label();
        editor.load(&self.resume_flag);
        editor.branch(Opcode::BrTrue, resume);

        let container = build_arguments_container(&self.name, &self.params, settings.array_fallback)?;
        editor.store(&self.arguments, |editor| {
            editor.emit_all(container);
        });
        editor.store(&self.context, |editor| {
            match self.this {
                Some(this) => editor.load(&Storage::Field(this)),
                None => {
                    editor.emit(Instruction::simple(Opcode::LdNull));
                }
            }
            editor.load(&self.arguments);
            editor.new_intrinsic(Intrinsic::CtxNew);
        });
        editor.load(&self.context);
        editor.emit(Instruction::ldstr(self.name.as_str()));
        editor.call_intrinsic(Intrinsic::CtxSetMethod);

        self.call_hook(editor, HookKind::Entry);
        if self.hooks.overrides(HookKind::Entry) {
            emit_copy_back(
                editor,
                &self.arguments,
                &self.params,
                settings.copy_back == CopyBack::ModifiedOnly,
            );
        }
        editor.store(&self.resume_flag, |editor| {
            editor.emit(Instruction::ldc_i4(1));
        });
        editor.branch(Opcode::Br, done);

        editor.place_label(resume);
        self.call_hook(editor, HookKind::Resume);
        editor.place_label(done);
        Ok(())
    }

    /// Widen and check a rebuilt body
    pub fn finish(&self, body: &mut MethodBody, settings: &Settings) -> Result<(), Error> {
        if settings.widen_short_branches {
            widen_short_branches(body);
        }
        body.validate().map_err(Error::malformed(&self.name))
    }
}

/// The parts of weaving that differ between iterators and asynchronous methods
pub trait StateMachineFlavor {
    /// Flavor-specific members of the record
    type Fields;

    /// Resolve (and add) the members the flavor needs beyond the shared ones
    fn add_fields(
        &self,
        module: &mut Module,
        injector: &StateMachineInjector,
        settings: &Settings,
    ) -> Result<Self::Fields, Error>;

    /// Build the new `MoveNext` around a call to `original`
    ///
    /// The flavor may also instrument the body of `original` itself.
    fn rebuild_move_next(
        &self,
        module: &mut Module,
        injector: &StateMachineInjector,
        fields: &Self::Fields,
        original: MethodId,
        settings: &Settings,
    ) -> Result<MethodBody, Error>;

    /// Rewrite record methods other than `MoveNext`
    fn rewrite_auxiliary(
        &self,
        _module: &mut Module,
        _injector: &StateMachineInjector,
        _fields: &Self::Fields,
        _settings: &Settings,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Weave a state-machine method, returning `MoveNext<Original>`
pub fn weave_state_machine<F: StateMachineFlavor>(
    module: &mut Module,
    owner: MethodId,
    spec: &AspectSpec,
    settings: &Settings,
    flavor: &F,
) -> Result<MethodId, Error> {
    let injector = StateMachineInjector::new(module, owner, spec, settings)?;
    let fields = flavor.add_fields(module, &injector, settings)?;
    injector.create_aspect_instance(module)?;

    let original = injector.clone_method(module, injector.move_next, settings)?;
    let mut body = flavor.rebuild_move_next(module, &injector, &fields, original, settings)?;
    injector.finish(&mut body, settings)?;
    module.method_mut(injector.move_next).body = Some(body);

    flavor.rewrite_auxiliary(module, &injector, &fields, settings)?;
    Ok(original)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::il::{parse_module, Constant};

    const SOURCE: &str = r#"
        .class Record
        .field int32 <>1__state
        .field Program <>4__this
        .field int32 count

        .method void .ctor()
                  ret
        .end
        .method bool MoveNext()
                  ldc.i4 0
                  ret
        .end

        .class Program
        .method object Count(int32 count)
          .iterator Record
                  ldnull
                  ret
        .end
        .method static object Missing(int32 other)
          .iterator Record
                  ldnull
                  ret
        .end
    "#;

    fn module_and_owner(name: &str) -> (Module, MethodId) {
        let module = parse_module(SOURCE).unwrap();
        let class = module.find_class("Program").unwrap();
        let owner = module.find_method(class, name).unwrap();
        (module, owner)
    }

    #[test]
    fn resolves_contract_members() {
        let (mut module, owner) = module_and_owner("Count");
        let settings = Settings::new();
        let injector =
            StateMachineInjector::new(&mut module, owner, &AspectSpec::new("Logger"), &settings).unwrap();
        let record = module.find_class("Record").unwrap();

        assert_eq!(injector.record, record);
        assert_eq!(injector.this, module.find_field(record, "<>4__this"));
        assert_eq!(
            injector.params,
            vec![ArgumentSlot {
                storage: Storage::Field(module.find_field(record, "count").unwrap()),
                ty: Type::I32,
            }]
        );
        assert_eq!(
            injector.resume_flag,
            Storage::Field(module.find_field(record, "*resumeFlag*").unwrap())
        );
        assert!(module.find_field(record, "*aspectArgs*").is_some());
    }

    #[test]
    fn missing_parameter_field_is_reported() {
        let (mut module, owner) = module_and_owner("Missing");
        let result = StateMachineInjector::new(&mut module, owner, &AspectSpec::new("Logger"), &Settings::new());
        assert!(matches!(
            result,
            Err(Error::MissingMember { ref member, ref owner, .. }) if member == "other" && owner == "Record"
        ));
    }

    #[test]
    fn constructor_creates_the_descriptor_first() {
        let (mut module, owner) = module_and_owner("Count");
        let spec = AspectSpec::new("Logger").with_args(vec![Constant::I32(5)]);
        let injector = StateMachineInjector::new(&mut module, owner, &spec, &Settings::new()).unwrap();
        injector.create_aspect_instance(&mut module).unwrap();

        let body = module.method(injector.constructor).body.as_ref().unwrap();
        let insns: Vec<&Instruction> = body.iter().map(|(_, insn)| insn).collect();
        assert_eq!(insns.len(), 5);
        assert_eq!(insns[0], &Instruction::ldarg(0));
        assert_eq!(insns[1], &Instruction::ldc_i4(5));
        assert_eq!(insns[3].opcode, Opcode::StFld);
        assert_eq!(insns[4].opcode, Opcode::Ret);
    }

    #[test]
    fn prologue_branches_on_resume_flag() {
        let (mut module, owner) = module_and_owner("Count");
        let settings = Settings::new();
        let injector =
            StateMachineInjector::new(&mut module, owner, &AspectSpec::new("Logger"), &settings).unwrap();

        let mut body = MethodBody::new(false);
        let mut editor = Editor::new(&mut body);
        injector.emit_prologue(&mut editor, &settings).unwrap();
        editor.emit(Instruction::simple(Opcode::Ret));
        injector.finish(&mut body, &settings).unwrap();

        let calls: Vec<Intrinsic> = body
            .iter()
            .filter_map(|(_, insn)| match &insn.operand {
                crate::il::Operand::Method(crate::il::MethodRef::Intrinsic(intrinsic)) => {
                    Some(intrinsic.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                Intrinsic::ArgsNew(1),
                Intrinsic::CtxNew,
                Intrinsic::CtxSetMethod,
                Intrinsic::Hook(HookKind::Entry),
                Intrinsic::ArgsIsModified,
                Intrinsic::ArgsGet,
                Intrinsic::Hook(HookKind::Resume),
            ]
        );
    }
}
