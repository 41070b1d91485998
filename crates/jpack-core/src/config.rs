use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use jpack_manifest::{encode_dependencies, DependencyEdge, PluginDeveloper};
use serde::{Deserialize, Serialize};

use crate::{
    policy::{PolicyConfig, RestrictedPattern},
    version::GitVersion,
};

/// Root configuration structure deserialized from `jpack.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub plugin: PluginMetadata,
    pub dependencies: Vec<DependencyEdge>,
    pub check: CheckConfig,
    /// Used by `jpack version --git`.
    pub git_version: GitVersion,
}

/// Project metadata written into the final manifest.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PluginMetadata {
    /// Short name, e.g. `git-client`.
    pub id: String,
    /// Display name; falls back to the id.
    pub name: Option<String>,
    pub version: String,
    pub group_id: Option<String>,
    /// Lowest host version the plugin runs on.
    pub jenkins_version: String,
    pub minimum_java_version: Option<String>,
    pub url: Option<String>,
    pub compatible_since_version: Option<String>,
    pub sandboxed: bool,
    pub plugin_first_class_loader: bool,
    pub masked_classes: Vec<String>,
    pub developers: Vec<PluginDeveloper>,
    /// Adds `Implementation-Title` (`group#id;version`) and `Implementation-Version`.
    pub implementation_attributes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CheckConfig {
    /// Log violations instead of failing.
    pub ignore_failures: bool,
    pub restricted: Vec<String>,
    pub properties: BTreeMap<String, String>,
    /// Where per-directory reports go; none are written when unset.
    pub output_dir: Option<PathBuf>,
}

impl CheckConfig {
    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            restricted: self.restricted.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        self.plugin.validate()?;
        encode_dependencies(&self.dependencies).context("invalid [[dependencies]]")?;
        for pattern in &self.check.restricted {
            if RestrictedPattern::parse(pattern).is_none() {
                bail!(
                    "check.restricted entry `{pattern}` must look like `pkg.Class`, \
                     `pkg.Class#member` or `pkg.Class#method(descriptor)`"
                );
            }
        }
        Ok(())
    }
}

impl PluginMetadata {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("plugin.id must not be empty");
        }
        if self.id.contains(|c: char| c.is_whitespace() || matches!(c, ':' | ',' | ';')) {
            bail!("plugin.id `{}` must not contain whitespace, `:`, `,` or `;`", self.id);
        }
        if self.version.trim().is_empty() {
            bail!("plugin.version must not be empty");
        }
        if self.jenkins_version.trim().is_empty() {
            bail!("plugin.jenkins_version must not be empty");
        }

        let mut ids = HashSet::new();
        for developer in &self.developers {
            let fields = [&developer.id, &developer.name, &developer.email];
            if fields.iter().all(|field| field.is_empty()) {
                bail!("plugin.developers entries need at least one of id, name or email");
            }
            if fields.iter().any(|field| field.contains([':', ','])) {
                bail!(
                    "developer `{}` must not contain `:` or `,` in id, name or email",
                    developer.entry()
                );
            }
            if !developer.id.is_empty() && !ids.insert(developer.id.as_str()) {
                bail!("duplicate developer id `{}`", developer.id);
            }
        }

        for class in &self.masked_classes {
            if class.trim().is_empty() || class.contains(char::is_whitespace) {
                bail!("plugin.masked_classes entry `{class}` must be a single package or class name");
            }
        }
        Ok(())
    }
}
