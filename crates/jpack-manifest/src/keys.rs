//! Attribute names understood by the host application's plugin loader.

pub const MANIFEST_VERSION: &str = "Manifest-Version";
pub const PLUGIN_CLASS: &str = "Plugin-Class";
pub const SUPPORT_DYNAMIC_LOADING: &str = "Support-Dynamic-Loading";
pub const PLUGIN_DEPENDENCIES: &str = "Plugin-Dependencies";
pub const GROUP_ID: &str = "Group-Id";
pub const MINIMUM_JAVA_VERSION: &str = "Minimum-Java-Version";
pub const SHORT_NAME: &str = "Short-Name";
pub const EXTENSION_NAME: &str = "Extension-Name";
pub const LONG_NAME: &str = "Long-Name";
pub const JENKINS_VERSION: &str = "Jenkins-Version";
pub const URL: &str = "Url";
pub const COMPATIBLE_SINCE_VERSION: &str = "Compatible-Since-Version";
pub const SANDBOX_STATUS: &str = "Sandbox-Status";
pub const PLUGIN_FIRST_CLASS_LOADER: &str = "PluginFirstClassLoader";
pub const PLUGIN_VERSION: &str = "Plugin-Version";
pub const MASK_CLASSES: &str = "Mask-Classes";
pub const PLUGIN_DEVELOPERS: &str = "Plugin-Developers";
pub const IMPLEMENTATION_TITLE: &str = "Implementation-Title";
pub const IMPLEMENTATION_VERSION: &str = "Implementation-Version";
