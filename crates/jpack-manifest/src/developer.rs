use serde::{Deserialize, Serialize};

/// A maintainer listed in `Plugin-Developers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginDeveloper {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl PluginDeveloper {
    /// Renders `name:id:email`; unset fields stay as empty strings.
    pub fn entry(&self) -> String {
        format!("{}:{}:{}", self.name, self.id, self.email)
    }
}

pub fn encode_developers(developers: &[PluginDeveloper]) -> String {
    developers
        .iter()
        .map(PluginDeveloper::entry)
        .collect::<Vec<_>>()
        .join(",")
}
