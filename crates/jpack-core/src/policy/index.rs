use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
};

use crate::{
    classfile::{descriptor_class, dotted, Annotation, ClassFile, ElementValue, Reference},
    classpath,
    errors::Result,
};

use super::{PolicyLog, RestrictedPattern, Restriction, RESTRICTED_ANNOTATION};

/// Restricted APIs keyed by internal class name and member signature.
#[derive(Debug, Default)]
pub struct RestrictionIndex {
    classes: HashMap<String, Vec<Restriction>>,
    fields: HashMap<(String, String), Vec<Restriction>>,
    methods: HashMap<(String, String, String), Vec<Restriction>>,
    /// Configured `Class#member` patterns without a descriptor.
    members: HashMap<(String, String), Vec<Restriction>>,
    /// Every indexed class, restricted or not, for member resolution.
    shapes: HashMap<String, ClassShape>,
}

/// Supertypes and declared members of one class.
#[derive(Debug, Clone, Default)]
pub struct ClassShape {
    superclass: Option<String>,
    interfaces: Vec<String>,
    fields: HashSet<String>,
    methods: HashSet<(String, String)>,
}

impl ClassShape {
    pub fn of(class: &ClassFile) -> Self {
        Self {
            superclass: class.super_name.clone(),
            interfaces: class.interfaces.clone(),
            fields: class.fields.iter().map(|f| f.name.clone()).collect(),
            methods: class
                .methods
                .iter()
                .map(|m| (m.name.clone(), m.descriptor.clone()))
                .collect(),
        }
    }

    fn declares(&self, reference: &Reference) -> bool {
        match reference {
            Reference::Class(_) => false,
            Reference::Field { name, .. } => self.fields.contains(name),
            Reference::Method {
                name, descriptor, ..
            } => self.methods.contains(&(name.clone(), descriptor.clone())),
        }
    }
}

/// A restricted API hit by one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub target: String,
    pub restriction: Restriction,
}

impl RestrictionIndex {
    /// Indexes every class reachable from `classpath` and then `patterns`.
    ///
    /// Unreadable classes inside classpath entries are skipped with a warning;
    /// unreadable entries themselves fail the build of the index.
    pub fn build(classpath: &[PathBuf], patterns: &[String], log: &dyn PolicyLog) -> Result<Self> {
        let mut index = Self::default();
        for entry in classpath {
            let count = classpath::for_each_class(entry, |origin, bytes| {
                match ClassFile::parse(bytes) {
                    Ok(class) => index.add_class(&class, log),
                    Err(err) => log.warn(&format!(
                        "skipping unreadable class {}: {err}",
                        origin.display()
                    )),
                }
                Ok(())
            })?;
            log.debug(&format!("indexed {count} classes from {}", entry.display()));
        }
        for pattern in patterns {
            match RestrictedPattern::parse(pattern) {
                Some(parsed) => index.add_pattern(parsed),
                None => log.warn(&format!("ignoring malformed restricted API pattern `{pattern}`")),
            }
        }
        log.debug(&format!("{} restricted APIs indexed", index.len()));
        Ok(index)
    }

    pub fn add_class(&mut self, class: &ClassFile, log: &dyn PolicyLog) {
        let owner = &class.name;
        self.shapes.insert(owner.clone(), ClassShape::of(class));
        let found = declared(&class.annotations, &dotted(owner), log);
        if !found.is_empty() {
            self.classes.entry(owner.clone()).or_default().extend(found);
        }
        for field in &class.fields {
            let target = format!("{}.{}", dotted(owner), field.name);
            let found = declared(&field.annotations, &target, log);
            if !found.is_empty() {
                self.fields
                    .entry((owner.clone(), field.name.clone()))
                    .or_default()
                    .extend(found);
            }
        }
        for method in &class.methods {
            let target = format!("{}.{}{}", dotted(owner), method.name, method.descriptor);
            let found = declared(&method.annotations, &target, log);
            if !found.is_empty() {
                self.methods
                    .entry((owner.clone(), method.name.clone(), method.descriptor.clone()))
                    .or_default()
                    .extend(found);
            }
        }
    }

    pub fn add_pattern(&mut self, pattern: RestrictedPattern) {
        let restriction = Restriction::DoNotUse;
        match pattern {
            RestrictedPattern::Class(owner) => {
                self.classes.entry(owner).or_default().push(restriction)
            }
            RestrictedPattern::Member { owner, name } => {
                self.members.entry((owner, name)).or_default().push(restriction)
            }
            RestrictedPattern::Method {
                owner,
                name,
                descriptor,
            } => self
                .methods
                .entry((owner, name, descriptor))
                .or_default()
                .push(restriction),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len() + self.fields.len() + self.methods.len() + self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class declaring the field or method `reference` names.
    ///
    /// Walks the owner, its superclasses and then their superinterfaces, the
    /// order the JVM resolves members in. `local` shapes shadow indexed ones.
    /// `None` when no known class in the hierarchy declares the member.
    pub fn declaring_class(
        &self,
        reference: &Reference,
        local: &HashMap<String, ClassShape>,
    ) -> Option<String> {
        let owner = match reference {
            Reference::Class(_) => return None,
            Reference::Field { owner, .. } | Reference::Method { owner, .. } => owner,
        };
        let mut seen = HashSet::new();
        let mut interfaces = VecDeque::new();

        let mut current = Some(owner.clone());
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            let Some(found) = self.shape(local, &name) else {
                break;
            };
            if found.declares(reference) {
                return Some(name);
            }
            interfaces.extend(found.interfaces.iter().cloned());
            current = found.superclass.clone();
        }

        while let Some(name) = interfaces.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(found) = self.shape(local, &name) {
                if found.declares(reference) {
                    return Some(name);
                }
                interfaces.extend(found.interfaces.iter().cloned());
            }
        }
        None
    }

    fn shape<'s>(
        &'s self,
        local: &'s HashMap<String, ClassShape>,
        name: &str,
    ) -> Option<&'s ClassShape> {
        local.get(name).or_else(|| self.shapes.get(name))
    }

    /// Restrictions on a class used as a supertype or instruction operand.
    pub fn class_hits(&self, class: &str) -> Vec<Hit> {
        hits(self.classes.get(class), || dotted(class))
    }

    /// Restrictions hit by an instruction operand. Member references also
    /// count as a use of their owner class.
    pub fn reference_hits(&self, reference: &Reference) -> Vec<Hit> {
        match reference {
            Reference::Class(name) => self.class_hits(name),
            Reference::Field { owner, name, .. } => {
                let mut found = self.class_hits(owner);
                let key = (owner.clone(), name.clone());
                let target = || format!("{}.{name}", dotted(owner));
                found.extend(hits(self.fields.get(&key), target));
                found.extend(hits(self.members.get(&key), target));
                found
            }
            Reference::Method {
                owner,
                name,
                descriptor,
            } => {
                let mut found = self.class_hits(owner);
                let target = || format!("{}.{name}{descriptor}", dotted(owner));
                let key = (owner.clone(), name.clone(), descriptor.clone());
                found.extend(hits(self.methods.get(&key), target));
                found.extend(hits(self.members.get(&(owner.clone(), name.clone())), target));
                found
            }
        }
    }
}

fn hits(restrictions: Option<&Vec<Restriction>>, target: impl Fn() -> String) -> Vec<Hit> {
    restrictions
        .map(|all| {
            all.iter()
                .map(|&restriction| Hit {
                    target: target(),
                    restriction,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Restrictions declared by `@Restricted` among `annotations`.
fn declared(annotations: &[Annotation], target: &str, log: &dyn PolicyLog) -> Vec<Restriction> {
    let mut found = Vec::new();
    for annotation in annotations
        .iter()
        .filter(|a| a.type_descriptor == RESTRICTED_ANNOTATION)
    {
        let kinds: Vec<&ElementValue> = match annotation.element("value") {
            Some(ElementValue::Array(values)) => values.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        };
        for kind in kinds {
            let ElementValue::Class(descriptor) = kind else {
                continue;
            };
            let name = descriptor_class(descriptor).unwrap_or(descriptor);
            match Restriction::from_internal_name(name) {
                Some(restriction) => found.push(restriction),
                None => log.warn(&format!(
                    "{target} uses unsupported restriction {}",
                    dotted(name)
                )),
            }
        }
    }
    found
}
