//! Final manifest assembly.

use jpack_manifest::{
    encode_dependencies, encode_developers,
    keys::{
        COMPATIBLE_SINCE_VERSION, EXTENSION_NAME, GROUP_ID, IMPLEMENTATION_TITLE,
        IMPLEMENTATION_VERSION, JENKINS_VERSION, LONG_NAME, MASK_CLASSES, MINIMUM_JAVA_VERSION, PLUGIN_DEPENDENCIES, PLUGIN_DEVELOPERS,
        PLUGIN_FIRST_CLASS_LOADER, PLUGIN_VERSION, SANDBOX_STATUS, SHORT_NAME, URL,
    },
    DependencyEdge, ManifestAttributeSet,
};

use crate::{config::PluginMetadata, errors::Result, version::VersionNormalizer};

pub struct ManifestAssembler;

impl ManifestAssembler {
    /// Merges `partials` in order onto an empty manifest, then `overrides`.
    /// Later sources win on key collisions.
    pub fn assemble(
        partials: &[ManifestAttributeSet],
        overrides: &ManifestAttributeSet,
    ) -> ManifestAttributeSet {
        let mut manifest = ManifestAttributeSet::new();
        for partial in partials {
            manifest.merge_from(partial);
        }
        manifest.merge_from(overrides);
        manifest
    }

    /// Project-derived attributes that take precedence over every partial.
    pub fn overrides(
        plugin: &PluginMetadata,
        dependencies: &[DependencyEdge],
        versions: &VersionNormalizer,
    ) -> Result<ManifestAttributeSet> {
        let mut set = ManifestAttributeSet::new();
        let version = versions.normalize(&plugin.version);
        if plugin.implementation_attributes {
            let group = non_empty(&plugin.group_id).unwrap_or_default();
            set.set(
                IMPLEMENTATION_TITLE,
                format!("{group}#{};{version}", plugin.id),
            )?;
            set.set(IMPLEMENTATION_VERSION, version.as_str())?;
        }
        if let Some(group) = non_empty(&plugin.group_id) {
            set.set(GROUP_ID, group)?;
        }
        if let Some(java) = non_empty(&plugin.minimum_java_version) {
            set.set(MINIMUM_JAVA_VERSION, java)?;
        }
        set.set(SHORT_NAME, plugin.id.as_str())?;
        set.set(EXTENSION_NAME, plugin.id.as_str())?;
        set.set(LONG_NAME, non_empty(&plugin.name).unwrap_or(&plugin.id))?;
        set.set(JENKINS_VERSION, plugin.jenkins_version.as_str())?;
        if let Some(url) = non_empty(&plugin.url) {
            set.set(URL, url)?;
        }
        if let Some(since) = non_empty(&plugin.compatible_since_version) {
            set.set(COMPATIBLE_SINCE_VERSION, since)?;
        }
        if plugin.sandboxed {
            set.set(SANDBOX_STATUS, "true")?;
        }
        if plugin.plugin_first_class_loader {
            set.set(PLUGIN_FIRST_CLASS_LOADER, "true")?;
        }
        set.set(PLUGIN_VERSION, version)?;

        let mut masked: Vec<&str> = Vec::new();
        for class in plugin.masked_classes.iter().map(|c| c.trim()) {
            if !class.is_empty() && !masked.contains(&class) {
                masked.push(class);
            }
        }
        if !masked.is_empty() {
            set.set(MASK_CLASSES, masked.join(" "))?;
        }

        let encoded = encode_dependencies(dependencies)?;
        if !encoded.is_empty() {
            set.set(PLUGIN_DEPENDENCIES, encoded)?;
        }
        if !plugin.developers.is_empty() {
            set.set(PLUGIN_DEVELOPERS, encode_developers(&plugin.developers))?;
        }
        Ok(set)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
