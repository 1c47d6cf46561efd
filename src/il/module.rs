use super::{AspectSpec, MethodBody, StateMachine, Type};
use bitflags::bitflags;

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ClassId(pub u32);

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct FieldId {
    pub class: ClassId,
    pub index: u32,
}

#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u32,
}

bitflags! {
    /// Flags on methods
    pub struct MethodFlags: u16 {
        const PRIVATE = 0x0001;
        const STATIC = 0x0010;
        const SPECIAL_NAME = 0x0800;
    }
}

/// Collection of classes, addressed by [`ClassId`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub classes: Vec<Class>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Class {
    pub name: String,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub name: String,
    pub flags: MethodFlags,
    pub params: Vec<Param>,
    pub return_type: Type,
    pub body: Option<MethodBody>,

    /// Set when the compiler moved the logic of this method into a state-machine record
    pub state_machine: Option<StateMachine>,

    /// Hook descriptors requested for this method
    pub aspects: Vec<AspectSpec>,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        flags: MethodFlags,
        params: Vec<Param>,
        return_type: Type,
    ) -> Method {
        Method {
            name: name.into(),
            flags,
            params,
            return_type,
            body: None,
            state_machine: None,
            aspects: vec![],
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Argument slot of the first declared parameter (slot 0 is `this` on instance methods)
    pub fn first_param_slot(&self) -> u16 {
        if self.is_static() {
            0
        } else {
            1
        }
    }

    /// Number of argument slots, including `this`
    pub fn arg_count(&self) -> usize {
        self.params.len() + self.first_param_slot() as usize
    }
}

impl Module {
    pub fn new() -> Module {
        Module { classes: vec![] }
    }

    pub fn add_class(&mut self, name: impl Into<String>) -> ClassId {
        self.classes.push(Class {
            name: name.into(),
            fields: vec![],
            methods: vec![],
        });
        ClassId((self.classes.len() - 1) as u32)
    }

    pub fn class(&self, class: ClassId) -> &Class {
        &self.classes[class.0 as usize]
    }

    pub fn class_mut(&mut self, class: ClassId) -> &mut Class {
        &mut self.classes[class.0 as usize]
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|class| class.name == name)
            .map(|idx| ClassId(idx as u32))
    }

    pub fn add_field(&mut self, class: ClassId, name: impl Into<String>, ty: Type) -> FieldId {
        let fields = &mut self.class_mut(class).fields;
        fields.push(Field {
            name: name.into(),
            ty,
        });
        FieldId {
            class,
            index: (fields.len() - 1) as u32,
        }
    }

    pub fn field(&self, field: FieldId) -> &Field {
        &self.class(field.class).fields[field.index as usize]
    }

    pub fn find_field(&self, class: ClassId, name: &str) -> Option<FieldId> {
        self.class(class)
            .fields
            .iter()
            .position(|field| field.name == name)
            .map(|idx| FieldId {
                class,
                index: idx as u32,
            })
    }

    pub fn add_method(&mut self, class: ClassId, method: Method) -> MethodId {
        let methods = &mut self.class_mut(class).methods;
        methods.push(method);
        MethodId {
            class,
            index: (methods.len() - 1) as u32,
        }
    }

    pub fn method(&self, method: MethodId) -> &Method {
        &self.class(method.class).methods[method.index as usize]
    }

    pub fn method_mut(&mut self, method: MethodId) -> &mut Method {
        &mut self.class_mut(method.class).methods[method.index as usize]
    }

    pub fn find_method(&self, class: ClassId, name: &str) -> Option<MethodId> {
        self.class(class)
            .methods
            .iter()
            .position(|method| method.name == name)
            .map(|idx| MethodId {
                class,
                index: idx as u32,
            })
    }

    /// Every method of every class
    pub fn method_ids(&self) -> Vec<MethodId> {
        self.classes
            .iter()
            .enumerate()
            .flat_map(|(class_idx, class)| {
                (0..class.methods.len()).map(move |method_idx| MethodId {
                    class: ClassId(class_idx as u32),
                    index: method_idx as u32,
                })
            })
            .collect()
    }

    /// Method identity, as `Class::method`
    pub fn qualified_name(&self, method: MethodId) -> String {
        format!(
            "{}::{}",
            self.class(method.class).name,
            self.method(method).name
        )
    }

    /// Field identity, as `Class::field`
    pub fn qualified_field_name(&self, field: FieldId) -> String {
        format!("{}::{}", self.class(field.class).name, self.field(field).name)
    }

    pub fn type_name(&self, ty: &Type) -> String {
        match ty {
            Type::Class(class) => self.class(*class).name.clone(),
            other => other.keyword().unwrap_or_default().to_owned(),
        }
    }
}
