use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    classfile::{dotted, ClassFile, Reference},
    classpath,
    errors::{PackError, Result},
    report::{CallSite, Violation},
};

use super::{
    index::Hit, ClassShape, PolicyConfig, PolicyLog, RestrictionIndex, ViolationListener,
};

/// Finds uses of restricted APIs in compiled classes.
pub struct Checker<'a> {
    index: RestrictionIndex,
    policy: PolicyConfig,
    log: &'a dyn PolicyLog,
}

impl<'a> Checker<'a> {
    /// Indexes restrictions from `classpath` and the configured patterns.
    pub fn new(classpath: &[PathBuf], policy: PolicyConfig, log: &'a dyn PolicyLog) -> Result<Self> {
        let index = RestrictionIndex::build(classpath, &policy.restricted, log)?;
        Ok(Self::with_index(index, policy, log))
    }

    pub fn with_index(index: RestrictionIndex, policy: PolicyConfig, log: &'a dyn PolicyLog) -> Self {
        Self { index, policy, log }
    }

    /// Checks every class file below `dir` and returns how many were inspected.
    ///
    /// References to classes defined in `dir` itself are never violations.
    /// Field and method references are charged to the class that declares the
    /// member, so inherited restricted members are caught through local and
    /// library subclasses alike.
    pub fn check(&self, dir: &Path, listener: &mut dyn ViolationListener) -> Result<usize> {
        let mut classes = Vec::new();
        for path in classpath::class_files(dir)? {
            let bytes = fs::read(&path).map_err(|err| PackError::io(&path, err))?;
            let class = ClassFile::parse(&bytes)
                .map_err(|source| PackError::ClassFile { path, source })?;
            classes.push(class);
        }
        let local: HashMap<String, ClassShape> = classes
            .iter()
            .map(|class| (class.name.clone(), ClassShape::of(class)))
            .collect();

        for class in &classes {
            let caller = dotted(&class.name);
            let supertypes = class.super_name.iter().chain(&class.interfaces);
            for supertype in supertypes.filter(|name| !local.contains_key(name.as_str())) {
                self.report(self.index.class_hits(supertype), &caller, None, listener);
            }
            for method in &class.methods {
                let Some(code) = &method.code else {
                    continue;
                };
                let references = class.references(code).map_err(|source| PackError::ClassFile {
                    path: dir.join(format!("{}.class", class.name)),
                    source,
                })?;
                for reference in references {
                    let hits = self.hits(&reference.target, &local);
                    self.report(hits, &caller, reference.line, listener);
                }
            }
        }

        self.log.info(&format!(
            "checked {} classes in {}",
            classes.len(),
            dir.display()
        ));
        metrics::counter!("jpack_classes_scanned_total").increment(classes.len() as u64);
        Ok(classes.len())
    }

    fn hits(&self, target: &Reference, local: &HashMap<String, ClassShape>) -> Vec<Hit> {
        let owner = owner_of(target);
        let Some(declaring) = self.index.declaring_class(target, local) else {
            if local.contains_key(owner) {
                return Vec::new();
            }
            return self.index.reference_hits(target);
        };

        let mut found = Vec::new();
        if !local.contains_key(&declaring) {
            found.extend(self.index.reference_hits(&with_owner(target, &declaring)));
        }
        if declaring != owner && !local.contains_key(owner) {
            found.extend(self.index.class_hits(owner));
        }
        found
    }

    fn report(
        &self,
        hits: Vec<Hit>,
        caller: &str,
        line: Option<u32>,
        listener: &mut dyn ViolationListener,
    ) {
        for hit in hits {
            if !hit.restriction.applies(&self.policy) {
                self.log
                    .debug(&format!("{} allowed by policy at {caller}", hit.target));
                continue;
            }
            listener.on_violation(Violation {
                restricted: hit.restriction.message(&hit.target),
                call_site: CallSite::new(caller, line),
            });
        }
    }
}

fn owner_of(reference: &Reference) -> &str {
    match reference {
        Reference::Class(name) => name,
        Reference::Field { owner, .. } | Reference::Method { owner, .. } => owner,
    }
}

fn with_owner(reference: &Reference, declaring: &str) -> Reference {
    match reference {
        Reference::Class(name) => Reference::Class(name.clone()),
        Reference::Field {
            name, descriptor, ..
        } => Reference::Field {
            owner: declaring.to_string(),
            name: name.clone(),
            descriptor: descriptor.clone(),
        },
        Reference::Method {
            name, descriptor, ..
        } => Reference::Method {
            owner: declaring.to_string(),
            name: name.clone(),
            descriptor: descriptor.clone(),
        },
    }
}
