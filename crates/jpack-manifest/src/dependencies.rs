use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Suffix marking a dependency the host may run without.
pub const OPTIONAL_RESOLUTION: &str = ";resolution:=optional";

/// A resolved edge from the packaged plugin to another plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub optional: bool,
}

impl DependencyEdge {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_token(&self.name, &[':']) {
            return Err(ManifestError::InvalidDependency(format!(
                "plugin name `{}` must be non-empty without whitespace, `:`, `,` or `;`",
                self.name
            )));
        }
        if !is_token(&self.version, &[]) {
            return Err(ManifestError::InvalidDependency(format!(
                "version `{}` of `{}` must be non-empty without whitespace, `,` or `;`",
                self.version, self.name
            )));
        }
        Ok(())
    }

    fn entry(&self) -> String {
        if self.optional {
            format!("{}:{}{OPTIONAL_RESOLUTION}", self.name, self.version)
        } else {
            format!("{}:{}", self.name, self.version)
        }
    }
}

fn is_token(value: &str, extra: &[char]) -> bool {
    !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == ',' || c == ';' || extra.contains(&c))
}

/// Encodes edges as the `Plugin-Dependencies` attribute value.
///
/// Entries are sorted by plugin name. Repeating an identical edge is
/// tolerated; two edges with the same name that differ in version or
/// optionality are rejected. Returns an empty string for an empty set.
pub fn encode<'a, I>(edges: I) -> Result<String, ManifestError>
where
    I: IntoIterator<Item = &'a DependencyEdge>,
{
    let mut by_name: BTreeMap<&str, &DependencyEdge> = BTreeMap::new();
    for edge in edges {
        edge.validate()?;
        if let Some(existing) = by_name.get(edge.name.as_str()) {
            if *existing != edge {
                return Err(ManifestError::DuplicateDependency {
                    name: edge.name.clone(),
                    first: existing.entry(),
                    second: edge.entry(),
                });
            }
            continue;
        }
        by_name.insert(edge.name.as_str(), edge);
    }
    Ok(by_name
        .values()
        .map(|edge| edge.entry())
        .collect::<Vec<_>>()
        .join(","))
}
