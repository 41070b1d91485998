//! Test-only class file writer used to build bytecode fixtures.

use std::collections::HashMap;

use super::MAGIC;

const RESTRICTED: &str = "Lorg/kohsuke/accmod/Restricted;";
const EXTENSION: &str = "Lhudson/Extension;";

#[derive(Debug, Clone)]
pub(crate) enum AnnotationSpec {
    /// `@Restricted({...})` with restriction simple names; class retention.
    Restricted(Vec<String>),
    /// `@Extension(ordinal = 100, dynamicLoadable = ...)`; runtime retention.
    Extension(Option<String>),
}

impl AnnotationSpec {
    pub(crate) fn restricted(kinds: &[&str]) -> Self {
        AnnotationSpec::Restricted(kinds.iter().map(|k| k.to_string()).collect())
    }

    pub(crate) fn extension(dynamic_loadable: Option<&str>) -> Self {
        AnnotationSpec::Extension(dynamic_loadable.map(str::to_string))
    }

    fn visible(&self) -> bool {
        matches!(self, AnnotationSpec::Extension(_))
    }
}

#[derive(Debug, Clone)]
enum Op {
    Line(u16),
    Member {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
        interface: bool,
    },
    Type { opcode: u8, class: String },
    LdcClass(String),
    TableSwitch { low: i32, high: i32 },
}

#[derive(Debug, Clone)]
pub(crate) struct MethodSpec {
    name: String,
    descriptor: String,
    annotations: Vec<AnnotationSpec>,
    ops: Vec<Op>,
}

impl MethodSpec {
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            annotations: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub(crate) fn annotate(mut self, annotation: AnnotationSpec) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Attributes the following instructions to `line`.
    pub(crate) fn line(mut self, line: u16) -> Self {
        self.ops.push(Op::Line(line));
        self
    }

    fn member(mut self, opcode: u8, owner: &str, name: &str, descriptor: &str, interface: bool) -> Self {
        self.ops.push(Op::Member {
            opcode,
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
            interface,
        });
        self
    }

    pub(crate) fn invoke_virtual(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb6, owner, name, descriptor, false)
    }

    pub(crate) fn invoke_static(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb8, owner, name, descriptor, false)
    }

    pub(crate) fn invoke_interface(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb9, owner, name, descriptor, true)
    }

    pub(crate) fn get_static(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb2, owner, name, descriptor, false)
    }

    pub(crate) fn get_field(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.member(0xb4, owner, name, descriptor, false)
    }

    pub(crate) fn new_object(mut self, class: &str) -> Self {
        self.ops.push(Op::Type {
            opcode: 0xbb,
            class: class.into(),
        });
        self
    }

    pub(crate) fn check_cast(mut self, class: &str) -> Self {
        self.ops.push(Op::Type {
            opcode: 0xc0,
            class: class.into(),
        });
        self
    }

    pub(crate) fn ldc_class(mut self, class: &str) -> Self {
        self.ops.push(Op::LdcClass(class.into()));
        self
    }

    pub(crate) fn table_switch(mut self, low: i32, high: i32) -> Self {
        self.ops.push(Op::TableSwitch { low, high });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolKey {
    Utf8(String),
    Class(String),
    NameAndType(String, String),
    Member(u8, String, String, String),
    Double(u64),
}

pub(crate) struct ClassWriter {
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    annotations: Vec<AnnotationSpec>,
    fields: Vec<(String, String, Vec<AnnotationSpec>)>,
    methods: Vec<MethodSpec>,
    pool: Vec<u8>,
    next_index: u16,
    cache: HashMap<PoolKey, u16>,
}

impl ClassWriter {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            super_name: None,
            interfaces: Vec::new(),
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: Vec::new(),
            next_index: 1,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn extends(mut self, super_name: &str) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    pub(crate) fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub(crate) fn annotate(mut self, annotation: AnnotationSpec) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub(crate) fn field(mut self, name: &str, descriptor: &str, annotations: Vec<AnnotationSpec>) -> Self {
        self.fields.push((name.into(), descriptor.into(), annotations));
        self
    }

    pub(crate) fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        let mut body = Vec::new();
        put_u2(&mut body, 0x0021);
        let this_index = self.class(&self.name.clone());
        put_u2(&mut body, this_index);
        let super_index = match self.super_name.clone() {
            Some(name) => self.class(&name),
            None => 0,
        };
        put_u2(&mut body, super_index);

        let interfaces = std::mem::take(&mut self.interfaces);
        put_u2(&mut body, interfaces.len() as u16);
        for interface in &interfaces {
            let index = self.class(interface);
            put_u2(&mut body, index);
        }

        let fields = std::mem::take(&mut self.fields);
        put_u2(&mut body, fields.len() as u16);
        for (name, descriptor, annotations) in &fields {
            put_u2(&mut body, 0x0001);
            let name = self.utf8(name);
            put_u2(&mut body, name);
            let descriptor = self.utf8(descriptor);
            put_u2(&mut body, descriptor);
            let attributes = self.annotation_attributes(annotations);
            put_u2(&mut body, attributes.len() as u16);
            for attribute in attributes {
                body.extend(attribute);
            }
        }

        let methods = std::mem::take(&mut self.methods);
        put_u2(&mut body, methods.len() as u16);
        for method in &methods {
            put_u2(&mut body, 0x0001);
            let name = self.utf8(&method.name);
            put_u2(&mut body, name);
            let descriptor = self.utf8(&method.descriptor);
            put_u2(&mut body, descriptor);
            let mut attributes = self.annotation_attributes(&method.annotations);
            attributes.push(self.code_attribute(&method.ops));
            put_u2(&mut body, attributes.len() as u16);
            for attribute in attributes {
                body.extend(attribute);
            }
        }

        let annotations = std::mem::take(&mut self.annotations);
        let attributes = self.annotation_attributes(&annotations);
        put_u2(&mut body, attributes.len() as u16);
        for attribute in attributes {
            body.extend(attribute);
        }

        let mut out = Vec::new();
        put_u4(&mut out, MAGIC);
        put_u2(&mut out, 0);
        put_u2(&mut out, 52);
        put_u2(&mut out, self.next_index);
        out.extend(&self.pool);
        out.extend(body);
        out
    }

    fn code_attribute(&mut self, ops: &[Op]) -> Vec<u8> {
        let mut code = Vec::new();
        let mut lines: Vec<(u16, u16)> = Vec::new();
        let mut pending_line = None;
        for op in ops {
            if let Op::Line(line) = op {
                pending_line = Some(*line);
                continue;
            }
            if let Some(line) = pending_line.take() {
                lines.push((code.len() as u16, line));
            }
            match op {
                Op::Line(_) => unreachable!(),
                Op::Member {
                    opcode,
                    owner,
                    name,
                    descriptor,
                    interface,
                } => {
                    let index = self.member(*opcode, owner, name, descriptor, *interface);
                    code.push(*opcode);
                    put_u2(&mut code, index);
                    if *opcode == 0xb9 {
                        code.extend([1, 0]);
                    }
                }
                Op::Type { opcode, class } => {
                    let index = self.class(class);
                    code.push(*opcode);
                    put_u2(&mut code, index);
                }
                Op::LdcClass(class) => {
                    let index = self.class(class);
                    code.push(0x13);
                    put_u2(&mut code, index);
                }
                Op::TableSwitch { low, high } => {
                    let pc = code.len();
                    code.push(0xaa);
                    code.extend(std::iter::repeat(0).take((4 - (pc + 1) % 4) % 4));
                    code.extend(0i32.to_be_bytes());
                    code.extend(low.to_be_bytes());
                    code.extend(high.to_be_bytes());
                    for _ in *low..=*high {
                        code.extend(0i32.to_be_bytes());
                    }
                }
            }
        }
        code.push(0xb1);

        let mut info = Vec::new();
        put_u2(&mut info, 8);
        put_u2(&mut info, 8);
        put_u4(&mut info, code.len() as u32);
        info.extend(&code);
        put_u2(&mut info, 0);
        if lines.is_empty() {
            put_u2(&mut info, 0);
        } else {
            put_u2(&mut info, 1);
            let mut table = Vec::new();
            put_u2(&mut table, lines.len() as u16);
            for (pc, line) in lines {
                put_u2(&mut table, pc);
                put_u2(&mut table, line);
            }
            info.extend(self.attribute("LineNumberTable", &table));
        }
        self.attribute("Code", &info)
    }

    fn annotation_attributes(&mut self, annotations: &[AnnotationSpec]) -> Vec<Vec<u8>> {
        let mut attributes = Vec::new();
        for (visible, attribute) in [
            (true, "RuntimeVisibleAnnotations"),
            (false, "RuntimeInvisibleAnnotations"),
        ] {
            let selected: Vec<_> = annotations.iter().filter(|a| a.visible() == visible).collect();
            if selected.is_empty() {
                continue;
            }
            let mut info = Vec::new();
            put_u2(&mut info, selected.len() as u16);
            for annotation in selected {
                self.encode_annotation(annotation, &mut info);
            }
            attributes.push(self.attribute(attribute, &info));
        }
        attributes
    }

    fn encode_annotation(&mut self, annotation: &AnnotationSpec, out: &mut Vec<u8>) {
        match annotation {
            AnnotationSpec::Restricted(kinds) => {
                let type_index = self.utf8(RESTRICTED);
                put_u2(out, type_index);
                put_u2(out, 1);
                let value = self.utf8("value");
                put_u2(out, value);
                out.push(b'[');
                put_u2(out, kinds.len() as u16);
                for kind in kinds {
                    let class = self.utf8(&format!("Lorg/kohsuke/accmod/restrictions/{kind};"));
                    out.push(b'c');
                    put_u2(out, class);
                }
            }
            AnnotationSpec::Extension(dynamic_loadable) => {
                let type_index = self.utf8(EXTENSION);
                put_u2(out, type_index);
                put_u2(out, if dynamic_loadable.is_some() { 2 } else { 1 });
                let ordinal = self.utf8("ordinal");
                put_u2(out, ordinal);
                out.push(b'D');
                let constant = self.double(100.0);
                put_u2(out, constant);
                if let Some(value) = dynamic_loadable {
                    let name = self.utf8("dynamicLoadable");
                    put_u2(out, name);
                    out.push(b'e');
                    let type_name = self.utf8("Ljenkins/YesNoMaybe;");
                    put_u2(out, type_name);
                    let constant = self.utf8(value);
                    put_u2(out, constant);
                }
            }
        }
    }

    fn attribute(&mut self, name: &str, info: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let name = self.utf8(name);
        put_u2(&mut out, name);
        put_u4(&mut out, info.len() as u32);
        out.extend(info);
        out
    }

    fn intern(&mut self, key: PoolKey, encoded: Vec<u8>, slots: u16) -> u16 {
        if let Some(index) = self.cache.get(&key) {
            return *index;
        }
        let index = self.next_index;
        self.pool.extend(encoded);
        self.next_index += slots;
        self.cache.insert(key, index);
        index
    }

    fn utf8(&mut self, value: &str) -> u16 {
        let mut encoded = vec![1];
        put_u2(&mut encoded, value.len() as u16);
        encoded.extend(value.as_bytes());
        self.intern(PoolKey::Utf8(value.into()), encoded, 1)
    }

    fn double(&mut self, value: f64) -> u16 {
        let mut encoded = vec![6];
        encoded.extend(value.to_be_bytes());
        self.intern(PoolKey::Double(value.to_bits()), encoded, 2)
    }

    fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut encoded = vec![7];
        put_u2(&mut encoded, name_index);
        self.intern(PoolKey::Class(name.into()), encoded, 1)
    }

    fn member(&mut self, opcode: u8, owner: &str, name: &str, descriptor: &str, interface: bool) -> u16 {
        let tag = match (opcode, interface) {
            (_, true) => 11,
            (0xb2..=0xb5, false) => 9,
            _ => 10,
        };
        let class = self.class(owner);
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut nat = vec![12];
        put_u2(&mut nat, name_index);
        put_u2(&mut nat, descriptor_index);
        let nat = self.intern(PoolKey::NameAndType(name.into(), descriptor.into()), nat, 1);
        let mut encoded = vec![tag];
        put_u2(&mut encoded, class);
        put_u2(&mut encoded, nat);
        self.intern(
            PoolKey::Member(tag, owner.into(), name.into(), descriptor.into()),
            encoded,
            1,
        )
    }
}

fn put_u2(out: &mut Vec<u8>, value: u16) {
    out.extend(value.to_be_bytes());
}

fn put_u4(out: &mut Vec<u8>, value: u32) {
    out.extend(value.to_be_bytes());
}
