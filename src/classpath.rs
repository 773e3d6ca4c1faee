//! Library locator: builds the classpath handed to the language server.
//!
//! Directories are visited in the profile's fixed order and, inside each
//! directory, archives are taken in file-name order. The first entry of a
//! clashing class wins on the JVM side, so this order is part of the contract.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::platform::PlatformProfile;

const ARCHIVE_EXTENSION: &str = "jar";

#[derive(thiserror::Error, Debug)]
pub enum LocatorError {
    #[error("host installation path invalid: cannot read {}: {source}", path.display())]
    InvalidInstallation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bundled Java runtime not found under {}: {reason}", dir.display())]
    RuntimeNotFound { dir: PathBuf, reason: String },
}

/// Ordered, de-duplicated list of archive paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classpath {
    entries: Vec<PathBuf>,
    separator: char,
}

impl Classpath {
    pub fn new(separator: char) -> Self {
        Self {
            entries: Vec::new(),
            separator,
        }
    }

    /// Append `path` unless already present. Returns whether it was added.
    pub fn push(&mut self, path: PathBuf) -> bool {
        if self.entries.contains(&path) {
            return false;
        }
        self.entries.push(path);
        true
    }

    /// Append `path` as the final entry, dropping any earlier copy of it.
    pub fn push_last(&mut self, path: PathBuf) {
        self.entries.retain(|entry| *entry != path);
        self.entries.push(path);
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value for the `-classpath` argument.
    pub fn to_arg(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Classpath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", self.separator)?;
            }
            write!(f, "{}", entry.display())?;
        }
        Ok(())
    }
}

/// Collect every archive of the installation at `host_root`. A missing
/// directory is an error, never skipped: a partial classpath only fails later
/// inside the server with far less useful messages.
pub async fn build_classpath(
    host_root: &Path,
    profile: &PlatformProfile,
) -> Result<Classpath, LocatorError> {
    let mut classpath = Classpath::new(profile.separator);
    for dir in profile.library_paths(host_root) {
        let archives = archives_in(&dir).await?;
        tracing::debug!("{} archives in {}", archives.len(), dir.display());
        for archive in archives {
            classpath.push(archive);
        }
    }
    Ok(classpath)
}

async fn archives_in(dir: &Path) -> Result<Vec<PathBuf>, LocatorError> {
    let invalid = |source: std::io::Error| LocatorError::InvalidInstallation {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(invalid)?;
    let mut archives = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(invalid)? {
        let path = entry.path();
        let is_archive = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
            .unwrap_or(false);
        if !is_archive {
            continue;
        }
        // 심볼릭 링크는 따라가서 판단
        let is_dir = tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn installed_layout(root: &Path) {
        touch(&root.join("lib").join("pde.jar"));
        touch(&root.join("lib").join("antlr.jar"));
        touch(&root.join("lib").join("version.txt"));
        touch(&root.join("core").join("library").join("core.jar"));
        touch(&root.join("core").join("library").join("jogl-all.jar"));
        touch(&root.join("modes").join("java").join("mode").join("JavaMode.jar"));
        std::fs::create_dir_all(root.join("modes").join("java").join("mode").join("legacy.jar")).unwrap();
    }

    #[tokio::test]
    async fn directory_order_then_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        installed_layout(root);

        let profile = PlatformProfile::for_platform(Platform::Linux);
        let cp = build_classpath(root, &profile).await.unwrap();

        assert_eq!(
            cp.entries(),
            &[
                root.join("lib").join("antlr.jar"),
                root.join("lib").join("pde.jar"),
                root.join("core").join("library").join("core.jar"),
                root.join("core").join("library").join("jogl-all.jar"),
                root.join("modes").join("java").join("mode").join("JavaMode.jar"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_directory_is_invalid_installation() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("lib").join("pde.jar"));

        let profile = PlatformProfile::for_platform(Platform::Linux);
        let err = build_classpath(tmp.path(), &profile).await.unwrap_err();
        assert!(err.to_string().starts_with("host installation path invalid"));
        match err {
            LocatorError::InvalidInstallation { path, .. } => {
                assert_eq!(path, tmp.path().join("core").join("library"));
            }
            other => panic!("expected InvalidInstallation, got {other:?}"),
        }
    }

    #[test]
    fn join_uses_separator_and_dedupes() {
        let mut cp = Classpath::new(';');
        assert!(cp.push(PathBuf::from("a.jar")));
        assert!(cp.push(PathBuf::from("b.jar")));
        assert!(!cp.push(PathBuf::from("a.jar")));
        assert!(cp.push(PathBuf::from("server.jar")));
        assert_eq!(cp.to_arg(), "a.jar;b.jar;server.jar");
        assert_eq!(cp.len(), 3);
    }

    #[test]
    fn push_last_moves_existing_entry_to_the_end() {
        let mut cp = Classpath::new(':');
        cp.push(PathBuf::from("lib/pde.jar"));
        cp.push(PathBuf::from("core/core.jar"));
        cp.push_last(PathBuf::from("lib/pde.jar"));
        assert_eq!(cp.to_arg(), "core/core.jar:lib/pde.jar");

        cp.push_last(PathBuf::from("server.jar"));
        assert_eq!(cp.entries().last(), Some(&PathBuf::from("server.jar")));
        assert_eq!(cp.len(), 3);
    }

    #[test]
    fn empty_classpath_renders_empty() {
        let cp = Classpath::new(':');
        assert!(cp.is_empty());
        assert_eq!(cp.to_arg(), "");
    }
}
