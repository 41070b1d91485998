//! Restricted-API policy: which APIs are off limits and how their use is found.
//!
//! Restrictions come from `@org.kohsuke.accmod.Restricted` annotations on
//! classes, methods and fields of the scan classpath, plus patterns listed in
//! the policy configuration. [`Checker`] walks compiled classes and reports
//! every use of a restricted API to a [`ViolationListener`].

mod checker;
mod index;
mod log;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use checker::Checker;
pub use index::{ClassShape, RestrictionIndex};
pub use log::{PolicyLog, TracingLog};

#[cfg(test)]
pub(crate) use log::recording::RecordingLog;

use crate::report::Violation;

/// Prefix of project properties that are forwarded to the checker.
pub const PROPERTY_PREFIX: &str = "checkAccessModifier.";

pub const USE_BETA: &str = "useBeta";

pub const RESTRICTED_ANNOTATION: &str = "Lorg/kohsuke/accmod/Restricted;";

const RESTRICTION_PACKAGE: &str = "org/kohsuke/accmod/restrictions/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Additional APIs to forbid: `pkg.Class`, `pkg.Class#member` or
    /// `pkg.Class#method(descriptor)`.
    pub restricted: Vec<String>,
    /// Checker properties such as `useBeta`.
    pub properties: BTreeMap<String, String>,
}

impl PolicyConfig {
    /// Whether APIs marked `@Restricted(Beta.class)` may be used.
    pub fn use_beta(&self) -> bool {
        self.properties
            .get(USE_BETA)
            .map_or(false, |value| value.trim().eq_ignore_ascii_case("true"))
    }
}

/// Keeps the properties starting with `prefix`, with the prefix removed.
pub fn prefixed_properties<'a, I>(properties: I, prefix: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    properties
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Restriction {
    NoExternalUse,
    DoNotUse,
    Beta,
}

impl Restriction {
    /// Maps `org/kohsuke/accmod/restrictions/<Kind>` to a known restriction.
    pub fn from_internal_name(name: &str) -> Option<Self> {
        match name.strip_prefix(RESTRICTION_PACKAGE)? {
            "NoExternalUse" => Some(Restriction::NoExternalUse),
            "DoNotUse" => Some(Restriction::DoNotUse),
            "Beta" => Some(Restriction::Beta),
            _ => None,
        }
    }

    pub fn applies(self, policy: &PolicyConfig) -> bool {
        !(self == Restriction::Beta && policy.use_beta())
    }

    pub fn message(self, target: &str) -> String {
        match self {
            Restriction::NoExternalUse | Restriction::DoNotUse => {
                format!("{target} must not be used")
            }
            Restriction::Beta => format!("{target} is still in beta"),
        }
    }
}

/// An API forbidden by configuration rather than by annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrictedPattern {
    Class(String),
    /// Any field or method of `owner` called `name`.
    Member { owner: String, name: String },
    Method {
        owner: String,
        name: String,
        descriptor: String,
    },
}

impl RestrictedPattern {
    /// Parses `pkg.Class`, `pkg.Class#member` or `pkg.Class#method(desc)ret`.
    /// Class names are converted to their internal `pkg/Class` form.
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        let (class, member) = match pattern.split_once('#') {
            Some((class, member)) => (class, Some(member)),
            None => (pattern, None),
        };
        let valid_class = !class.is_empty()
            && !class.starts_with('.')
            && !class.ends_with('.')
            && class
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '.' | '$' | '_'));
        if !valid_class {
            return None;
        }
        let owner = class.replace('.', "/");
        let Some(member) = member else {
            return Some(RestrictedPattern::Class(owner));
        };
        match member.find('(') {
            Some(open) => {
                let (name, descriptor) = member.split_at(open);
                if name.is_empty() || !descriptor.contains(')') {
                    return None;
                }
                Some(RestrictedPattern::Method {
                    owner,
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
            }
            None if !member.is_empty() && !member.contains(char::is_whitespace) => {
                Some(RestrictedPattern::Member {
                    owner,
                    name: member.to_string(),
                })
            }
            None => None,
        }
    }
}

/// Receives every restricted-API use the checker finds.
pub trait ViolationListener {
    fn on_violation(&mut self, violation: Violation);
}

impl ViolationListener for Vec<Violation> {
    fn on_violation(&mut self, violation: Violation) {
        self.push(violation);
    }
}
