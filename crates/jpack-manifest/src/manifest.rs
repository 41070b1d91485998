use std::{fmt, str::FromStr};

use indexmap::IndexMap;

use crate::{error::ManifestError, keys::MANIFEST_VERSION};

pub const DEFAULT_MANIFEST_VERSION: &str = "1.0";

/// Longest attribute name the JVM manifest reader accepts.
const MAX_NAME_LEN: usize = 70;

/// Main section of a JVM-style manifest: ordered, single-valued attributes.
///
/// `Manifest-Version` is tracked separately from the other attributes. It is
/// always serialized first and, once assigned, never changes.
#[derive(Debug, Clone, Default)]
pub struct ManifestAttributeSet {
    version: Option<String>,
    attributes: IndexMap<String, String>,
}

impl ManifestAttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the main section of a manifest document.
    ///
    /// Reading stops at the first empty line. Continuation lines (a leading
    /// single space) are folded into the previous value.
    pub fn load(bytes: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| ManifestError::malformed(0, format!("not valid UTF-8: {err}")))?;

        let mut set = Self::new();
        let mut pending: Option<(String, String)> = None;
        for (index, raw) in text.split('\n').enumerate() {
            let line_no = index + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix(' ') {
                match pending.as_mut() {
                    Some((_, value)) => value.push_str(rest),
                    None => {
                        return Err(ManifestError::malformed(
                            line_no,
                            "continuation line without a preceding attribute",
                        ))
                    }
                }
                continue;
            }
            if let Some((name, value)) = pending.take() {
                set.set(name, value)?;
            }

            let (name, rest) = line.split_once(':').ok_or_else(|| {
                ManifestError::malformed(line_no, format!("missing `:` separator in `{line}`"))
            })?;
            if validate_name(name).is_err() {
                return Err(ManifestError::malformed(
                    line_no,
                    format!("invalid attribute name `{name}`"),
                ));
            }
            let value = match rest.strip_prefix(' ') {
                Some(value) => value,
                None if rest.is_empty() => rest,
                None => {
                    return Err(ManifestError::malformed(
                        line_no,
                        format!("expected a space after `{name}:`"),
                    ))
                }
            };
            pending = Some((name.to_string(), value.to_string()));
        }
        if let Some((name, value)) = pending {
            set.set(name, value)?;
        }
        Ok(set)
    }

    /// Value of `Manifest-Version`, falling back to `1.0` when never assigned.
    pub fn format_version(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_MANIFEST_VERSION)
    }

    /// Inserts or overwrites an attribute.
    ///
    /// Assigning `Manifest-Version` a second time is a no-op. Overwriting keeps
    /// the attribute at the position where it was first set.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, ManifestError> {
        let name = name.into();
        let value = value.into();
        validate_name(&name)?;
        if value.contains(['\r', '\n', '\0']) {
            return Err(ManifestError::InvalidValue { name });
        }
        if name == MANIFEST_VERSION {
            if self.version.is_none() {
                self.version = Some(value);
            }
        } else {
            self.attributes.insert(name, value);
        }
        Ok(self)
    }

    /// Copies every attribute of `other` except `Manifest-Version`, in `other`'s order.
    pub fn merge_from(&mut self, other: &ManifestAttributeSet) -> &mut Self {
        for (name, value) in &other.attributes {
            self.attributes.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        if name == MANIFEST_VERSION {
            return Some(self.format_version());
        }
        self.attributes.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        name == MANIFEST_VERSION || self.attributes.contains_key(name)
    }

    /// Number of attributes, not counting `Manifest-Version`.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attributes in insertion order, without `Manifest-Version`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl PartialEq for ManifestAttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.format_version() == other.format_version() && self.attributes == other.attributes
    }
}

impl Eq for ManifestAttributeSet {}

impl fmt::Display for ManifestAttributeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MANIFEST_VERSION}: {}\r\n", self.format_version())?;
        for (name, value) in &self.attributes {
            write!(f, "{name}: {value}\r\n")?;
        }
        f.write_str("\r\n")
    }
}

impl FromStr for ManifestAttributeSet {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::load(s.as_bytes())
    }
}

fn validate_name(name: &str) -> Result<(), ManifestError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn set_of(pairs: &[(&str, &str)]) -> ManifestAttributeSet {
        let mut set = ManifestAttributeSet::new();
        for (name, value) in pairs {
            set.set(*name, *value).unwrap();
        }
        set
    }

    fn names(set: &ManifestAttributeSet) -> Vec<&str> {
        set.iter().map(|(name, _)| name).collect()
    }

    #[test]
    fn serializes_format_version_first_then_insertion_order() {
        let set = set_of(&[("Short-Name", "example"), ("Long-Name", "Example Plugin")]);
        assert_eq!(
            set.to_string(),
            "Manifest-Version: 1.0\r\nShort-Name: example\r\nLong-Name: Example Plugin\r\n\r\n"
        );
    }

    #[test]
    fn format_version_is_only_assigned_once() {
        let mut set = ManifestAttributeSet::new();
        set.set("Manifest-Version", "2.0").unwrap();
        set.set("Manifest-Version", "3.0").unwrap();
        assert_eq!(set.format_version(), "2.0");
        assert!(set.is_empty());
    }

    #[test]
    fn merge_prefers_right_hand_values_but_keeps_left_format_version() {
        let mut left = set_of(&[("Manifest-Version", "1.0"), ("A", "left"), ("B", "keep")]);
        let right = set_of(&[("Manifest-Version", "9.9"), ("A", "right"), ("C", "new")]);
        left.merge_from(&right);

        assert_eq!(left.format_version(), "1.0");
        assert_eq!(left.get("A"), Some("right"));
        assert_eq!(left.get("B"), Some("keep"));
        assert_eq!(left.get("C"), Some("new"));
        assert_eq!(names(&left), vec!["A", "B", "C"]);
    }

    #[test]
    fn load_reads_main_section_only() {
        let doc = "Manifest-Version: 1.0\nPlugin-Class: com.example.Foo\n\nName: foo/Bar.class\nX: y\n";
        let set = ManifestAttributeSet::load(doc.as_bytes()).unwrap();
        assert_eq!(set.get("Plugin-Class"), Some("com.example.Foo"));
        assert!(!set.contains("Name"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn load_folds_continuation_lines() {
        let doc = "Manifest-Version: 1.0\r\nPlugin-Dependencies: credentials:2.6.1,scm-a\r\n pi:1.0\r\n\r\n";
        let set: ManifestAttributeSet = doc.parse().unwrap();
        assert_eq!(
            set.get("Plugin-Dependencies"),
            Some("credentials:2.6.1,scm-api:1.0")
        );
    }

    #[test]
    fn load_accepts_empty_values() {
        let set = ManifestAttributeSet::load(b"Url:\n").unwrap();
        assert_eq!(set.get("Url"), Some(""));
    }

    #[test]
    fn load_rejects_lines_without_separator() {
        let err = ManifestAttributeSet::load(b"Manifest-Version: 1.0\nbogus line\n").unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { line: 2, .. }), "{err}");
    }

    #[test]
    fn load_rejects_leading_continuation() {
        let err = ManifestAttributeSet::load(b" dangling\n").unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { line: 1, .. }));
    }

    #[test]
    fn set_rejects_bad_names_and_values() {
        let mut set = ManifestAttributeSet::new();
        assert!(matches!(
            set.set("Bad:Name", "x"),
            Err(ManifestError::InvalidName(_))
        ));
        assert!(matches!(
            set.set("Good-Name", "line\nbreak"),
            Err(ManifestError::InvalidValue { .. })
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn overwrite_keeps_original_position() {
        let mut set = set_of(&[("A", "1"), ("B", "2")]);
        set.set("A", "3").unwrap();
        assert_eq!(names(&set), vec!["A", "B"]);
        assert_eq!(set.get("A"), Some("3"));
    }

    fn attributes() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(("[A-Z][A-Za-z0-9_-]{0,12}", "[ -~]{0,24}"), 0..8)
    }

    fn build(pairs: &[(String, String)]) -> ManifestAttributeSet {
        let mut set = ManifestAttributeSet::new();
        for (name, value) in pairs {
            set.set(name.as_str(), value.as_str()).unwrap();
        }
        set
    }

    proptest! {
        #[test]
        fn merged_documents_keep_every_key_with_right_hand_precedence(
            a in attributes(),
            b in attributes(),
        ) {
            let left = build(&a);
            let right = build(&b);
            let mut merged = left.clone();
            merged.merge_from(&right);
            let reparsed = ManifestAttributeSet::load(&merged.to_bytes()).unwrap();

            for (name, value) in left.iter() {
                let expected = right.get(name).unwrap_or(value);
                prop_assert_eq!(reparsed.get(name), Some(expected));
            }
            for (name, value) in right.iter() {
                prop_assert_eq!(reparsed.get(name), Some(value));
            }
            prop_assert_eq!(reparsed.format_version(), left.format_version());
        }

        #[test]
        fn serialization_is_a_fixed_point(a in attributes()) {
            let bytes = build(&a).to_bytes();
            let reparsed = ManifestAttributeSet::load(&bytes).unwrap();
            prop_assert_eq!(reparsed.to_bytes(), bytes);
        }
    }
}
