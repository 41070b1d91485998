pub mod dependencies;
pub mod developer;
pub mod error;
pub mod keys;
pub mod manifest;

pub use dependencies::{encode as encode_dependencies, DependencyEdge};
pub use developer::{encode_developers, PluginDeveloper};
pub use error::ManifestError;
pub use manifest::ManifestAttributeSet;
