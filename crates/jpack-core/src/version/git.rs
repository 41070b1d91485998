//! Versions derived from git history: commit depth plus an abbreviated hash.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    process::Command,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PackError, Result};

pub const DEFAULT_ABBREV_LENGTH: usize = 12;
pub const DEFAULT_FORMAT: &str = "%d.%s";

/// `[git_version]` settings and the generator they drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitVersion {
    /// Work tree to read; the current directory when unset.
    pub root: PathBuf,
    pub abbrev_length: usize,
    pub prefix: String,
    /// `%d` takes the commit depth and `%s` the abbreviated hash, in order.
    pub format: String,
    pub allow_dirty: bool,
    /// Suffixes every `a` and `b` in the hash with `_`.
    pub sanitize: bool,
    /// Receives the version and the full hash, one per line.
    pub output: Option<PathBuf>,
}

impl Default for GitVersion {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            abbrev_length: DEFAULT_ABBREV_LENGTH,
            prefix: String::new(),
            format: DEFAULT_FORMAT.to_string(),
            allow_dirty: false,
            sanitize: false,
            output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedVersion {
    pub version: String,
    pub full_hash: String,
}

impl fmt::Display for GeneratedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.version, self.full_hash)
    }
}

impl GitVersion {
    pub fn generate(&self) -> Result<GeneratedVersion> {
        if self.abbrev_length < 4 {
            return Err(self.error(format!(
                "abbrev_length must be at least 4, got {}",
                self.abbrev_length
            )));
        }
        self.check_clean()?;

        let full_hash = self
            .git(&["rev-parse", "--verify", "HEAD^{commit}"])
            .map_err(|_| self.error("cannot resolve HEAD".to_string()))?;
        let short = format!("--short={}", self.abbrev_length);
        let mut hash = self.git(&["rev-parse", &short, "HEAD"])?;
        let depth: u64 = self
            .git(&["rev-list", "--count", "HEAD"])?
            .parse()
            .map_err(|err| self.error(format!("unexpected commit count: {err}")))?;
        if self.sanitize {
            hash = sanitize(&hash);
        }
        debug!(root = %self.root.display(), depth, hash = %hash, "derived git version");

        let formatted = render(&self.format, depth, &hash).map_err(|message| self.error(message))?;
        Ok(GeneratedVersion {
            version: format!("{}{formatted}", self.prefix),
            full_hash,
        })
    }

    /// Generates the version and writes it to `output` when one is set.
    pub fn generate_to_output(&self) -> Result<GeneratedVersion> {
        let generated = self.generate()?;
        if let Some(path) = &self.output {
            write_version(path, &generated)?;
        }
        Ok(generated)
    }

    fn check_clean(&self) -> Result<()> {
        let status = self.git(&["status", "--porcelain"])?;
        if status.is_empty() || self.allow_dirty {
            return Ok(());
        }
        let (untracked, changed): (Vec<&str>, Vec<&str>) = status
            .lines()
            .partition(|line| line.starts_with("??"));
        let paths = |lines: Vec<&str>| {
            lines
                .into_iter()
                .map(|line| line.get(3..).unwrap_or(line).to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut message = String::from("repository has pending changes:");
        if !untracked.is_empty() {
            message.push_str(&format!("\n- untracked files: [{}]", paths(untracked)));
        }
        if !changed.is_empty() {
            message.push_str(&format!("\n- uncommitted changes: [{}]", paths(changed)));
        }
        Err(self.error(message))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .map_err(|err| self.error(format!("failed to run git: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.error(format!("git {} failed: {}", args.join(" "), stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn error(&self, message: String) -> PackError {
        PackError::GitVersion {
            root: self.root.clone(),
            message,
        }
    }
}

/// `a` -> `a_`, `b` -> `b_`; keeps hex hashes from reading as numbers.
pub fn sanitize(hash: &str) -> String {
    let mut out = String::with_capacity(hash.len() * 2);
    for c in hash.chars() {
        out.push(c);
        if matches!(c, 'a' | 'b') {
            out.push('_');
        }
    }
    out
}

/// Fills `%d` and `%s` with the depth and then the hash, in order of appearance.
fn render(format: &str, depth: u64, hash: &str) -> std::result::Result<String, String> {
    let mut out = String::new();
    let mut used = 0;
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(spec @ ('d' | 's')) => {
                match (used, spec) {
                    (0, _) => out.push_str(&depth.to_string()),
                    (1, 's') => out.push_str(hash),
                    (1, _) => return Err(format!("`%d` cannot format the hash in `{format}`")),
                    _ => return Err(format!("`{format}` uses more than two arguments")),
                }
                used += 1;
            }
            Some(other) => return Err(format!("unsupported conversion `%{other}` in `{format}`")),
            None => return Err(format!("`{format}` ends with a lone `%`")),
        }
    }
    Ok(out)
}

fn write_version(path: &Path, generated: &GeneratedVersion) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| PackError::io(parent, err))?;
    }
    fs::write(path, generated.to_string()).map_err(|err| PackError::io(path, err))
}
