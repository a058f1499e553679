//! Filesystem helpers shared by the pipeline commands.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Extensions that hide a second dot from naive stem splitting.
const COMPOUND_EXTENSIONS: &[&str] = &[".nii.gz", ".tar.gz", ".mnc.gz"];

/// Restores the original working directory when dropped.
pub struct WorkingDirGuard {
    original: PathBuf,
}

impl WorkingDirGuard {
    pub fn change_to(dir: impl AsRef<Path>) -> io::Result<Self> {
        let original = std::env::current_dir()?;
        std::env::set_current_dir(dir.as_ref())?;
        debug!(dir = %dir.as_ref().display(), "Changed working directory");
        Ok(Self { original })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(err) = std::env::set_current_dir(&self.original) {
            error!(dir = %self.original.display(), %err, "Failed to restore working directory");
        }
    }
}

/// Create a directory (and parents) if it does not exist, returning it.
pub fn define_folder(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// Subject directories under `dir`: entries whose names parse as session
/// identifiers, excluding phantoms. Sorted.
pub fn get_subjects(dir: &Path) -> io::Result<Vec<String>> {
    list_session_dirs(dir, false)
}

/// Phantom directories under `dir`. Sorted.
pub fn get_phantoms(dir: &Path) -> io::Result<Vec<String>> {
    list_session_dirs(dir, true)
}

fn list_session_dirs(dir: &Path, phantoms: bool) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match scantrack_ids::parse(&name) {
            Ok(ident) if ident.is_phantom() == phantoms => names.push(name),
            _ => {}
        }
    }
    names.sort();
    Ok(names)
}

/// Files in `dir` matching a series tag. Strict matching requires the tag
/// as a whole `_{tag}_` field; fuzzy matching accepts any substring hit.
pub fn get_files_with_tag(dir: &Path, tag: &str, fuzzy: bool) -> io::Result<Vec<PathBuf>> {
    let needle = if fuzzy {
        tag.to_string()
    } else {
        format!("_{tag}_")
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.contains(&needle) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Split a file name into stem and extension, keeping compound imaging
/// extensions (`.nii.gz` and friends) in one piece.
pub fn splitext(name: &str) -> (&str, &str) {
    for ext in COMPOUND_EXTENSIONS {
        if let Some(stem) = name.strip_suffix(ext) {
            return (stem, ext);
        }
    }
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// The bare stem of a NIfTI path: directory and extension stripped.
pub fn nifti_basename(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    splitext(&name).0.to_string()
}
