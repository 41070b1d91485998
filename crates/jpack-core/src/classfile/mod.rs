//! Reader for the parts of a JVM class file the policy checker needs: the
//! constant pool, member signatures, annotations, and enough of each `Code`
//! attribute to walk instructions and map them to source lines.

mod opcodes;
#[cfg(test)]
pub(crate) mod writer;

use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

const CODE: &str = "Code";
const LINE_NUMBER_TABLE: &str = "LineNumberTable";
const VISIBLE_ANNOTATIONS: &str = "RuntimeVisibleAnnotations";
const INVISIBLE_ANNOTATIONS: &str = "RuntimeInvisibleAnnotations";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("not a class file (magic {0:#010x})")]
    BadMagic(u32),
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("unknown constant pool tag {tag} at index {index}")]
    UnknownConstant { tag: u8, index: u16 },
    #[error("constant pool index {index} is not a {expected}")]
    BadConstant { index: u16, expected: &'static str },
    #[error("unknown opcode {opcode:#04x} at bytecode offset {pc}")]
    UnknownOpcode { opcode: u8, pc: usize },
    #[error("malformed switch at bytecode offset {pc}")]
    BadSwitch { pc: usize },
    #[error("unknown annotation element tag `{0}`")]
    UnknownElementTag(char),
}

type Result<T> = std::result::Result<T, ClassFileError>;

#[derive(Debug, Clone)]
pub struct ClassFile {
    /// Internal name, e.g. `hudson/model/Job`.
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub annotations: Vec<Annotation>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pool: ConstantPool,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub descriptor: String,
    pub annotations: Vec<Annotation>,
    pub code: Option<Code>,
}

#[derive(Debug, Clone, Default)]
pub struct Code {
    pub bytecode: Vec<u8>,
    pub line_numbers: Vec<LineNumber>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Field descriptor of the annotation type, e.g. `Lhudson/Extension;`.
    pub type_descriptor: String,
    pub elements: Vec<(String, ElementValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    /// Primitive or string constant; only the tag is retained.
    Const(char),
    Enum {
        type_descriptor: String,
        constant: String,
    },
    /// Return descriptor of a class literal, e.g. `Lfoo/Bar;`.
    Class(String),
    Annotation(Annotation),
    Array(Vec<ElementValue>),
}

/// Something a bytecode instruction points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Class(String),
    Field {
        owner: String,
        name: String,
        descriptor: String,
    },
    Method {
        owner: String,
        name: String,
        descriptor: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeReference {
    pub pc: usize,
    pub line: Option<u32>,
    pub target: Reference,
}

impl Annotation {
    pub fn element(&self, name: &str) -> Option<&ElementValue> {
        self.elements
            .iter()
            .find(|(element, _)| element == name)
            .map(|(_, value)| value)
    }
}

impl Code {
    /// Source line of the instruction at `pc`, if the compiler recorded one.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_numbers
            .iter()
            .filter(|entry| usize::from(entry.start_pc) <= pc)
            .max_by_key(|entry| entry.start_pc)
            .map(|entry| u32::from(entry.line))
    }
}

impl ClassFile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let magic = reader.u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        reader.skip(4)?; // minor + major version
        let pool = ConstantPool::parse(&mut reader)?;
        reader.skip(2)?; // access flags
        let name = pool.class_name(reader.u2()?)?.to_string();
        let super_index = reader.u2()?;
        let super_name = if super_index == 0 {
            None
        } else {
            Some(pool.class_name(super_index)?.to_string())
        };
        let interface_count = reader.u2()?;
        let mut interfaces = Vec::with_capacity(usize::from(interface_count));
        for _ in 0..interface_count {
            interfaces.push(pool.class_name(reader.u2()?)?.to_string());
        }
        let fields = parse_members(&mut reader, &pool)?;
        let methods = parse_members(&mut reader, &pool)?;

        let mut annotations = Vec::new();
        let attribute_count = reader.u2()?;
        for _ in 0..attribute_count {
            let (attribute, body) = read_attribute(&mut reader, &pool)?;
            if attribute == VISIBLE_ANNOTATIONS || attribute == INVISIBLE_ANNOTATIONS {
                annotations.extend(parse_annotations(body, &pool)?);
            }
        }

        Ok(Self {
            name,
            super_name,
            interfaces,
            annotations,
            fields,
            methods,
            pool,
        })
    }

    /// Every class, field and method reference made by `code`, in bytecode order.
    pub fn references(&self, code: &Code) -> Result<Vec<CodeReference>> {
        let bytes = code.bytecode.as_slice();
        let mut found = Vec::new();
        let mut pc = 0;
        while pc < bytes.len() {
            let opcode = bytes[pc];
            let len = opcodes::instruction_length(bytes, pc)?;
            if pc + len > bytes.len() {
                return Err(ClassFileError::Truncated(pc));
            }
            let target = match opcode {
                opcodes::GETSTATIC..=opcodes::PUTFIELD => {
                    Some(self.pool.field_ref(read_u16(bytes, pc + 1))?)
                }
                opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
                    Some(self.pool.method_ref(read_u16(bytes, pc + 1))?)
                }
                opcodes::NEW
                | opcodes::ANEWARRAY
                | opcodes::CHECKCAST
                | opcodes::INSTANCEOF
                | opcodes::MULTIANEWARRAY => {
                    let class = self.pool.class_name(read_u16(bytes, pc + 1))?;
                    element_class(class).map(|name| Reference::Class(name.to_string()))
                }
                opcodes::LDC => self.pool.class_constant(u16::from(bytes[pc + 1])),
                opcodes::LDC_W => self.pool.class_constant(read_u16(bytes, pc + 1)),
                _ => None,
            };
            if let Some(target) = target {
                found.push(CodeReference {
                    pc,
                    line: code.line_at(pc),
                    target,
                });
            }
            pc += len;
        }
        Ok(found)
    }
}

/// `a/b/C` -> `a.b.C`.
pub fn dotted(internal: &str) -> String {
    internal.replace('/', ".")
}

/// Strips array dimensions from a class constant. Primitive arrays yield `None`.
pub fn element_class(name: &str) -> Option<&str> {
    let element = name.trim_start_matches('[');
    if element.len() == name.len() {
        return Some(name);
    }
    element.strip_prefix('L')?.strip_suffix(';')
}

/// `Lfoo/Bar;` -> `foo/Bar`.
pub fn descriptor_class(descriptor: &str) -> Option<&str> {
    descriptor.strip_prefix('L')?.strip_suffix(';')
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn parse_members(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<Vec<Member>> {
    let count = reader.u2()?;
    let mut members = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        reader.skip(2)?; // access flags
        let name = pool.utf8(reader.u2()?)?.to_string();
        let descriptor = pool.utf8(reader.u2()?)?.to_string();
        let mut annotations = Vec::new();
        let mut code = None;
        let attribute_count = reader.u2()?;
        for _ in 0..attribute_count {
            let (attribute, body) = read_attribute(reader, pool)?;
            match attribute {
                CODE => code = Some(parse_code(body, pool)?),
                VISIBLE_ANNOTATIONS | INVISIBLE_ANNOTATIONS => {
                    annotations.extend(parse_annotations(body, pool)?)
                }
                _ => {}
            }
        }
        members.push(Member {
            name,
            descriptor,
            annotations,
            code,
        });
    }
    Ok(members)
}

fn read_attribute<'a, 'p>(
    reader: &mut Reader<'a>,
    pool: &'p ConstantPool,
) -> Result<(&'p str, &'a [u8])> {
    let name = pool.utf8(reader.u2()?)?;
    let len = reader.u4()? as usize;
    Ok((name, reader.bytes(len)?))
}

fn parse_code(body: &[u8], pool: &ConstantPool) -> Result<Code> {
    let mut reader = Reader::new(body);
    reader.skip(4)?; // max_stack + max_locals
    let code_len = reader.u4()? as usize;
    let bytecode = reader.bytes(code_len)?.to_vec();
    let exception_count = usize::from(reader.u2()?);
    reader.skip(exception_count * 8)?;

    let mut line_numbers = Vec::new();
    let attribute_count = reader.u2()?;
    for _ in 0..attribute_count {
        let (attribute, table) = read_attribute(&mut reader, pool)?;
        if attribute == LINE_NUMBER_TABLE {
            let mut table = Reader::new(table);
            let entries = table.u2()?;
            for _ in 0..entries {
                line_numbers.push(LineNumber {
                    start_pc: table.u2()?,
                    line: table.u2()?,
                });
            }
        }
    }
    Ok(Code {
        bytecode,
        line_numbers,
    })
}

fn parse_annotations(body: &[u8], pool: &ConstantPool) -> Result<Vec<Annotation>> {
    let mut reader = Reader::new(body);
    let count = reader.u2()?;
    let mut annotations = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        annotations.push(parse_annotation(&mut reader, pool)?);
    }
    Ok(annotations)
}

fn parse_annotation(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<Annotation> {
    let type_descriptor = pool.utf8(reader.u2()?)?.to_string();
    let pairs = reader.u2()?;
    let mut elements = Vec::with_capacity(usize::from(pairs));
    for _ in 0..pairs {
        let name = pool.utf8(reader.u2()?)?.to_string();
        elements.push((name, parse_element(reader, pool)?));
    }
    Ok(Annotation {
        type_descriptor,
        elements,
    })
}

fn parse_element(reader: &mut Reader<'_>, pool: &ConstantPool) -> Result<ElementValue> {
    let tag = char::from(reader.u1()?);
    let value = match tag {
        'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z' | 's' => {
            reader.skip(2)?;
            ElementValue::Const(tag)
        }
        'e' => ElementValue::Enum {
            type_descriptor: pool.utf8(reader.u2()?)?.to_string(),
            constant: pool.utf8(reader.u2()?)?.to_string(),
        },
        'c' => ElementValue::Class(pool.utf8(reader.u2()?)?.to_string()),
        '@' => ElementValue::Annotation(parse_annotation(reader, pool)?),
        '[' => {
            let count = reader.u2()?;
            let mut values = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                values.push(parse_element(reader, pool)?);
            }
            ElementValue::Array(values)
        }
        other => return Err(ClassFileError::UnknownElementTag(other)),
    };
    Ok(value)
}

#[derive(Debug, Clone)]
enum Constant {
    /// Index 0 and the slot after a long or double.
    Unusable,
    Utf8(String),
    Class(u16),
    MemberRef { class: u16, name_and_type: u16 },
    InterfaceMemberRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    Other,
}

#[derive(Debug, Clone, Default)]
struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    fn parse(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.u2()?;
        let mut entries = Vec::with_capacity(usize::from(count));
        entries.push(Constant::Unusable);
        let mut index = 1;
        while index < count {
            let tag = reader.u1()?;
            let mut wide = false;
            let constant = match tag {
                1 => {
                    let len = usize::from(reader.u2()?);
                    Constant::Utf8(String::from_utf8_lossy(reader.bytes(len)?).into_owned())
                }
                3 | 4 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                5 | 6 => {
                    reader.skip(8)?;
                    wide = true;
                    Constant::Other
                }
                7 => Constant::Class(reader.u2()?),
                9 | 10 => Constant::MemberRef {
                    class: reader.u2()?,
                    name_and_type: reader.u2()?,
                },
                11 => Constant::InterfaceMemberRef {
                    class: reader.u2()?,
                    name_and_type: reader.u2()?,
                },
                12 => Constant::NameAndType {
                    name: reader.u2()?,
                    descriptor: reader.u2()?,
                },
                8 | 16 | 19 | 20 => {
                    reader.skip(2)?;
                    Constant::Other
                }
                15 => {
                    reader.skip(3)?;
                    Constant::Other
                }
                17 | 18 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                tag => return Err(ClassFileError::UnknownConstant { tag, index }),
            };
            entries.push(constant);
            index += 1;
            if wide {
                entries.push(Constant::Unusable);
                index += 1;
            }
        }
        Ok(Self { entries })
    }

    fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(usize::from(index))
    }

    fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index) {
            Some(Constant::Utf8(value)) => Ok(value),
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index) {
            Some(Constant::Class(name)) => self.utf8(*name),
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "Class",
            }),
        }
    }

    fn class_constant(&self, index: u16) -> Option<Reference> {
        let name = self.class_name(index).ok()?;
        element_class(name).map(|name| Reference::Class(name.to_string()))
    }

    fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index) {
            Some(Constant::NameAndType { name, descriptor }) => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(ClassFileError::BadConstant {
                index,
                expected: "NameAndType",
            }),
        }
    }

    fn member(&self, index: u16, expected: &'static str) -> Result<(String, String, String)> {
        let (class, name_and_type) = match self.get(index) {
            Some(Constant::MemberRef {
                class,
                name_and_type,
            })
            | Some(Constant::InterfaceMemberRef {
                class,
                name_and_type,
            }) => (*class, *name_and_type),
            _ => return Err(ClassFileError::BadConstant { index, expected }),
        };
        let owner = self.class_name(class)?;
        let owner = element_class(owner).unwrap_or(owner).to_string();
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok((owner, name.to_string(), descriptor.to_string()))
    }

    fn field_ref(&self, index: u16) -> Result<Reference> {
        let (owner, name, descriptor) = self.member(index, "Fieldref")?;
        Ok(Reference::Field {
            owner,
            name,
            descriptor,
        })
    }

    fn method_ref(&self, index: u16) -> Result<Reference> {
        let (owner, name, descriptor) = self.member(index, "Methodref")?;
        Ok(Reference::Method {
            owner,
            name,
            descriptor,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ClassFileError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    fn u1(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u2(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
