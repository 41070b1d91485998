use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::errors::{PackError, Result};

const CLASS_SUFFIX: &str = ".class";

/// Class files below `dir`, sorted by path. A missing directory yields nothing.
pub fn class_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(dir).to_path_buf();
            PackError::io(path, io::Error::new(io::ErrorKind::Other, err))
        })?;
        if entry.file_type().is_file() && is_class_name(&entry.file_name().to_string_lossy()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Feeds every class file of a classpath entry to `visit`.
///
/// Directories are walked recursively; any other existing file is opened as a
/// jar. Entries that do not exist are skipped. Returns the number of classes
/// visited.
pub fn for_each_class<F>(entry: &Path, mut visit: F) -> Result<usize>
where
    F: FnMut(&Path, &[u8]) -> Result<()>,
{
    if entry.is_dir() {
        let files = class_files(entry)?;
        for file in &files {
            let bytes = fs::read(file).map_err(|err| PackError::io(file, err))?;
            visit(file, &bytes)?;
        }
        return Ok(files.len());
    }
    if !entry.is_file() {
        tracing::debug!(entry = %entry.display(), "skipping missing classpath entry");
        return Ok(0);
    }

    let invalid = |err: zip::result::ZipError| {
        PackError::io(entry, io::Error::new(io::ErrorKind::InvalidData, err))
    };
    let file = File::open(entry).map_err(|err| PackError::io(entry, err))?;
    let mut archive = zip::ZipArchive::new(file).map_err(invalid)?;
    let mut visited = 0;
    for index in 0..archive.len() {
        let mut member = archive.by_index(index).map_err(invalid)?;
        if member.is_dir() || !is_class_name(member.name()) {
            continue;
        }
        let origin = PathBuf::from(format!("{}!/{}", entry.display(), member.name()));
        let mut bytes = Vec::with_capacity(member.size() as usize);
        member
            .read_to_end(&mut bytes)
            .map_err(|err| PackError::io(&origin, err))?;
        drop(member);
        visit(&origin, &bytes)?;
        visited += 1;
    }
    Ok(visited)
}

fn is_class_name(name: &str) -> bool {
    name.ends_with(CLASS_SUFFIX)
}
