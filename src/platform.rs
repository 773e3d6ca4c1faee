//! Platform profiles. Every layout difference of a Processing installation
//! lives here, selected once per launch.

use std::path::{Path, PathBuf};

use crate::classpath::LocatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutableRule {
    /// Fixed path relative to the installation root
    Relative(&'static [&'static str]),
    /// The runtime directory name varies between releases: list `plugin_dir`,
    /// take its sole entry, then descend into `nested`
    BundledRuntime {
        plugin_dir: &'static [&'static str],
        nested: &'static [&'static str],
    },
}

/// Layout of a host installation on one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    /// Archive directories in classpath precedence order
    pub library_dirs: &'static [&'static [&'static str]],
    pub separator: char,
    pub version_file: &'static [&'static str],
    executable: ExecutableRule,
}

const INSTALLED_LIBRARY_DIRS: &[&[&str]] = &[
    &["lib"],
    &["core", "library"],
    &["modes", "java", "mode"],
];

const BUNDLE_LIBRARY_DIRS: &[&[&str]] = &[
    &["Contents", "Java"],
    &["Contents", "Java", "core", "library"],
    &["Contents", "Java", "modes", "java", "mode"],
];

impl PlatformProfile {
    pub fn current() -> Self {
        Self::for_platform(Platform::current())
    }

    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Linux => Self {
                platform,
                library_dirs: INSTALLED_LIBRARY_DIRS,
                separator: ':',
                version_file: &["lib", "version.txt"],
                executable: ExecutableRule::Relative(&["java", "bin", "java"]),
            },
            Platform::Windows => Self {
                platform,
                library_dirs: INSTALLED_LIBRARY_DIRS,
                separator: ';',
                version_file: &["lib", "version.txt"],
                executable: ExecutableRule::Relative(&["java", "bin", "java.exe"]),
            },
            Platform::MacOs => Self {
                platform,
                library_dirs: BUNDLE_LIBRARY_DIRS,
                separator: ':',
                version_file: &["Contents", "Java", "lib", "version.txt"],
                executable: ExecutableRule::BundledRuntime {
                    plugin_dir: &["Contents", "PlugIns"],
                    nested: &["Contents", "Home", "bin", "java"],
                },
            },
        }
    }

    pub fn library_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.library_dirs.iter().map(|parts| join_all(root, parts)).collect()
    }

    pub fn version_file_path(&self, root: &Path) -> PathBuf {
        join_all(root, self.version_file)
    }

    /// Path of the bundled `java` executable. Existence of a fixed relative
    /// path is left to spawn; the bundle lookup fails here when the runtime
    /// directory cannot be determined.
    pub async fn find_executable(&self, root: &Path) -> Result<PathBuf, LocatorError> {
        match self.executable {
            ExecutableRule::Relative(parts) => Ok(join_all(root, parts)),
            ExecutableRule::BundledRuntime { plugin_dir, nested } => {
                let dir = join_all(root, plugin_dir);
                let runtime = sole_visible_entry(&dir).await?;
                Ok(join_all(&runtime, nested))
            }
        }
    }
}

fn join_all(root: &Path, parts: &[&str]) -> PathBuf {
    parts.iter().fold(root.to_path_buf(), |acc, p| acc.join(p))
}

async fn sole_visible_entry(dir: &Path) -> Result<PathBuf, LocatorError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| LocatorError::RuntimeNotFound {
            dir: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

    let mut found = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                // .DS_Store 같은 숨김 파일은 무시
                if !entry.file_name().to_string_lossy().starts_with('.') {
                    found.push(entry.path());
                }
            }
            Ok(None) => break,
            Err(e) => {
                return Err(LocatorError::RuntimeNotFound {
                    dir: dir.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(LocatorError::RuntimeNotFound {
            dir: dir.to_path_buf(),
            reason: "directory is empty".to_string(),
        }),
        n => Err(LocatorError::RuntimeNotFound {
            dir: dir.to_path_buf(),
            reason: format!("expected one runtime, found {}", n),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_per_platform() {
        assert_eq!(PlatformProfile::for_platform(Platform::Windows).separator, ';');
        assert_eq!(PlatformProfile::for_platform(Platform::Linux).separator, ':');
        assert_eq!(PlatformProfile::for_platform(Platform::MacOs).separator, ':');
    }

    #[test]
    fn installed_layout_library_order() {
        let profile = PlatformProfile::for_platform(Platform::Linux);
        let root = Path::new("/opt/app");
        assert_eq!(
            profile.library_paths(root),
            vec![
                root.join("lib"),
                root.join("core").join("library"),
                root.join("modes").join("java").join("mode"),
            ]
        );
        assert_eq!(profile.version_file_path(root), root.join("lib").join("version.txt"));
    }

    #[test]
    fn bundle_layout_nests_under_contents_java() {
        let profile = PlatformProfile::for_platform(Platform::MacOs);
        let root = Path::new("/Applications/Processing.app");
        let dirs = profile.library_paths(root);
        assert_eq!(dirs[0], root.join("Contents").join("Java"));
        assert!(dirs.iter().all(|d| d.starts_with(root.join("Contents").join("Java"))));
    }

    #[tokio::test]
    async fn relative_executable_paths() {
        let root = Path::new("/opt/app");
        let linux = PlatformProfile::for_platform(Platform::Linux);
        assert_eq!(
            linux.find_executable(root).await.unwrap(),
            root.join("java").join("bin").join("java")
        );
        let windows = PlatformProfile::for_platform(Platform::Windows);
        assert_eq!(
            windows.find_executable(root).await.unwrap(),
            root.join("java").join("bin").join("java.exe")
        );
    }

    #[tokio::test]
    async fn bundle_executable_resolves_sole_runtime_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("Contents").join("PlugIns");
        std::fs::create_dir_all(plugins.join("jdk-17.0.8+7")).unwrap();
        std::fs::write(plugins.join(".DS_Store"), b"").unwrap();

        let profile = PlatformProfile::for_platform(Platform::MacOs);
        let exe = profile.find_executable(tmp.path()).await.unwrap();
        assert_eq!(
            exe,
            plugins
                .join("jdk-17.0.8+7")
                .join("Contents")
                .join("Home")
                .join("bin")
                .join("java")
        );
    }

    #[tokio::test]
    async fn bundle_executable_rejects_ambiguous_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let plugins = tmp.path().join("Contents").join("PlugIns");
        std::fs::create_dir_all(plugins.join("jdk-17")).unwrap();
        std::fs::create_dir_all(plugins.join("jdk-21")).unwrap();

        let profile = PlatformProfile::for_platform(Platform::MacOs);
        let err = profile.find_executable(tmp.path()).await.unwrap_err();
        assert!(matches!(err, LocatorError::RuntimeNotFound { .. }));
    }

    #[tokio::test]
    async fn bundle_executable_missing_plugin_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let profile = PlatformProfile::for_platform(Platform::MacOs);
        assert!(profile.find_executable(tmp.path()).await.is_err());
    }
}
