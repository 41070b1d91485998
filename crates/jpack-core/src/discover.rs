//! Partial manifests derived from compiled output and resolved dependencies.

use std::{
    fs,
    path::{Path, PathBuf},
};

use jpack_manifest::{
    encode_dependencies,
    keys::{PLUGIN_CLASS, PLUGIN_DEPENDENCIES, SUPPORT_DYNAMIC_LOADING},
    DependencyEdge, ManifestAttributeSet,
};
use tracing::{debug, error};

use crate::{
    classfile::{Annotation, ClassFile, ElementValue},
    classpath,
    errors::{PackError, Result},
};

/// Service file naming the legacy `hudson.Plugin` subclass.
pub const PLUGIN_SERVICE: &str = "META-INF/services/hudson.Plugin";

const EXTENSION_ANNOTATION: &str = "Lhudson/Extension;";
const DYNAMIC_LOADABLE: &str = "dynamicLoadable";

/// `Plugin-Class` from the service files of `dirs`.
///
/// No entry leaves the attribute out. More than one entry across all
/// directories is an error.
pub fn plugin_class(dirs: &[PathBuf]) -> Result<ManifestAttributeSet> {
    let mut implementations = Vec::new();
    for dir in dirs {
        let path = dir.join(PLUGIN_SERVICE);
        if !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path).map_err(|err| PackError::io(&path, err))?;
        implementations.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    let mut manifest = ManifestAttributeSet::new();
    match implementations.as_slice() {
        [] => {}
        [single] => {
            manifest.set(PLUGIN_CLASS, single.as_str())?;
        }
        several => {
            error!("Must not have more than 1 legacy hudson.Plugin subclass");
            error!("Found {} subclasses:", several.len());
            for implementation in several {
                error!("\t- {implementation}");
            }
            error!("Prefer using @Extension: https://www.jenkins.io/doc/developer/extensions");
            return Err(PackError::MultiplePluginClasses(several.to_vec()));
        }
    }
    Ok(manifest)
}

/// `jenkins.YesNoMaybe`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicLoading {
    Yes,
    No,
    Maybe,
}

impl DynamicLoading {
    fn from_constant(constant: &str) -> Option<Self> {
        match constant {
            "YES" => Some(DynamicLoading::Yes),
            "NO" => Some(DynamicLoading::No),
            "MAYBE" => Some(DynamicLoading::Maybe),
            _ => None,
        }
    }

    /// Any `NO` forbids dynamic loading, otherwise any `MAYBE` leaves it
    /// undecided (`None`), otherwise it is supported.
    pub fn combine<I>(values: I) -> Option<bool>
    where
        I: IntoIterator<Item = DynamicLoading>,
    {
        let values: Vec<_> = values.into_iter().collect();
        if values.contains(&DynamicLoading::No) {
            Some(false)
        } else if values.contains(&DynamicLoading::Maybe) {
            None
        } else {
            Some(true)
        }
    }
}

/// `dynamicLoadable` of every `@Extension` declared in `class`. An extension
/// without the element defaults to `MAYBE`.
fn extension_loading(class: &ClassFile) -> Vec<DynamicLoading> {
    let annotations = class
        .annotations
        .iter()
        .chain(class.fields.iter().flat_map(|f| &f.annotations))
        .chain(class.methods.iter().flat_map(|m| &m.annotations));
    annotations
        .filter(|a| a.type_descriptor == EXTENSION_ANNOTATION)
        .map(|a| dynamic_loadable(a).unwrap_or(DynamicLoading::Maybe))
        .collect()
}

fn dynamic_loadable(annotation: &Annotation) -> Option<DynamicLoading> {
    match annotation.element(DYNAMIC_LOADABLE)? {
        ElementValue::Enum { constant, .. } => DynamicLoading::from_constant(constant),
        _ => None,
    }
}

/// `Support-Dynamic-Loading` from the extensions compiled into `dirs`.
pub fn dynamic_loading(dirs: &[PathBuf]) -> Result<ManifestAttributeSet> {
    let mut found = Vec::new();
    for dir in dirs {
        for path in classpath::class_files(dir)? {
            let bytes = fs::read(&path).map_err(|err| PackError::io(&path, err))?;
            let class = ClassFile::parse(&bytes)
                .map_err(|source| PackError::ClassFile { path, source })?;
            found.extend(extension_loading(&class));
        }
    }
    debug!(extensions = found.len(), "collected extension dynamic loading flags");

    let mut manifest = ManifestAttributeSet::new();
    if let Some(supported) = DynamicLoading::combine(found) {
        manifest.set(SUPPORT_DYNAMIC_LOADING, supported.to_string())?;
    }
    Ok(manifest)
}

/// `Plugin-Dependencies` for the resolved edges; omitted when there are none.
pub fn dependencies(edges: &[DependencyEdge]) -> Result<ManifestAttributeSet> {
    let mut manifest = ManifestAttributeSet::new();
    let encoded = encode_dependencies(edges)?;
    if !encoded.is_empty() {
        manifest.set(PLUGIN_DEPENDENCIES, encoded)?;
    }
    Ok(manifest)
}

pub fn read_manifest(path: &Path) -> Result<ManifestAttributeSet> {
    let bytes = fs::read(path).map_err(|err| PackError::io(path, err))?;
    Ok(ManifestAttributeSet::load(&bytes)?)
}

/// Writes `manifest` to `path`, creating parent directories.
pub fn write_manifest(path: &Path, manifest: &ManifestAttributeSet) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| PackError::io(parent, err))?;
    }
    fs::write(path, manifest.to_bytes()).map_err(|err| PackError::io(path, err))
}
