//! Deduplication and rendering of restricted-API violations.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    errors::{PackError, Result},
    policy::ViolationListener,
};

/// Where a restricted API was used. Sites without a line sort after every
/// line-bearing site of the same class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    /// Binary name of the calling class, e.g. `com.example.Foo$1`.
    pub class_name: String,
    pub line: Option<u32>,
}

impl CallSite {
    pub fn new(class_name: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            class_name: class_name.into(),
            line,
        }
    }
}

impl Ord for CallSite {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class_name
            .cmp(&other.class_name)
            .then_with(|| match (self.line, other.line) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    }
}

impl PartialOrd for CallSite {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{line}", self.class_name),
            None => f.write_str(&self.class_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Message naming the restricted API, e.g. `hudson.Util.foo() must not be used`.
    pub restricted: String,
    pub call_site: CallSite,
}

/// Collects violations for one scan, keyed by restricted API.
#[derive(Debug, Default)]
pub struct ViolationAggregator {
    errors: BTreeMap<String, BTreeSet<CallSite>>,
}

impl ViolationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, violation: Violation) {
        self.errors
            .entry(violation.restricted)
            .or_default()
            .insert(violation.call_site);
    }

    pub fn report(self) -> ViolationReport {
        let mut groups: Vec<ViolationGroup> = self
            .errors
            .into_iter()
            .map(|(restricted, sites)| ViolationGroup {
                restricted,
                call_sites: sites.into_iter().collect(),
            })
            .collect();
        // Map iteration already orders by signature; the stable sort keeps it for ties.
        groups.sort_by(|a, b| b.call_sites.len().cmp(&a.call_sites.len()));
        ViolationReport { groups }
    }
}

impl ViolationListener for ViolationAggregator {
    fn on_violation(&mut self, violation: Violation) {
        self.record(violation);
    }
}

/// Folds a stream of violations into a report.
pub fn aggregate<I>(violations: I) -> ViolationReport
where
    I: IntoIterator<Item = Violation>,
{
    let mut aggregator = ViolationAggregator::new();
    for violation in violations {
        aggregator.record(violation);
    }
    aggregator.report()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationGroup {
    pub restricted: String,
    pub call_sites: Vec<CallSite>,
}

/// Groups ordered by call-site count descending, then by signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViolationReport {
    groups: Vec<ViolationGroup>,
}

impl ViolationReport {
    pub fn has_violations(&self) -> bool {
        !self.groups.is_empty()
    }

    pub fn groups(&self) -> &[ViolationGroup] {
        &self.groups
    }

    pub fn call_site_count(&self) -> usize {
        self.groups.iter().map(|g| g.call_sites.len()).sum()
    }

    pub fn rendered_text(&self) -> String {
        let mut lines = Vec::new();
        for (index, group) in self.groups.iter().enumerate() {
            if index > 0 {
                lines.push(String::new());
            }
            lines.push(group.restricted.clone());
            let count = group.call_sites.len();
            let noun = if count == 1 { "line" } else { "lines" };
            lines.push(format!("\tbut was used on {count} {noun}:"));
            for site in &group.call_sites {
                lines.push(format!("\t\t- {site}"));
            }
        }
        lines.join("\n")
    }

    /// Writes the rendered report to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| PackError::io(parent, err))?;
        }
        fs::write(path, self.rendered_text()).map_err(|err| PackError::io(path, err))
    }

    pub fn outcome(self, ignore_failures: bool) -> ScanOutcome {
        if !self.has_violations() {
            return ScanOutcome::Clean;
        }
        let severity = if ignore_failures {
            Severity::Warn
        } else {
            Severity::Error
        };
        ScanOutcome::Violations {
            report: self,
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Violations {
        report: ViolationReport,
        severity: Severity,
    },
}

impl ScanOutcome {
    /// Logs tolerated violations; turns the rest into an error.
    pub fn enforce(self) -> Result<()> {
        match self {
            ScanOutcome::Clean => Ok(()),
            ScanOutcome::Violations {
                report,
                severity: Severity::Warn,
            } => {
                tracing::warn!(
                    "Restricted APIs were detected - see https://tiny.cc/jenkins-restricted\n{}",
                    report.rendered_text()
                );
                Ok(())
            }
            ScanOutcome::Violations {
                report,
                severity: Severity::Error,
            } => Err(PackError::RestrictedApiViolation {
                report: report.rendered_text(),
            }),
        }
    }
}

/// File name for the report of `dir` inside an output directory.
pub fn report_file_name(dir: &Path) -> PathBuf {
    let flattened: String = dir
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let stem = flattened.trim_matches('_');
    PathBuf::from(format!("{}.txt", if stem.is_empty() { "classes" } else { stem }))
}
