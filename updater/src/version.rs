//! Host version parsing and server build matching (외부 semver 크레이트 없이)

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Oldest host release the language server supports.
pub const MIN_SUPPORTED: HostVersion = HostVersion { major: 4, minor: 1, patch: 0 };

/// Version of an installed host application (`major.minor[.patch]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl HostVersion {
    /// Parse "4.1", "4.1.2" or "v4.1.2". Anything after the first whitespace
    /// (build notes, revision numbers) is ignored. Patch defaults to 0.
    pub fn parse(s: &str) -> Option<Self> {
        let token = s.split_whitespace().next()?;
        let token = token.strip_prefix('v').unwrap_or(token);
        // "4.1.2-beta" 같은 접미사는 버림
        let token = token.split('-').next()?;

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return None;
        }

        let major = parts[0].parse().ok()?;
        let minor = parts[1].parse().ok()?;
        let patch = match parts.get(2) {
            Some(p) => p.parse().ok()?,
            None => 0,
        };

        Some(Self { major, minor, patch })
    }

    pub fn components(&self) -> [u64; 3] {
        [self.major, self.minor, self.patch]
    }

    pub fn is_supported(&self) -> bool {
        *self >= MIN_SUPPORTED
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Ord for HostVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(&other.components())
    }
}

impl PartialOrd for HostVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn artifact_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<base>\d+(?:\.\d+)*)-(?P<build>\d+)\.(?P<ext>[A-Za-z0-9]+)$")
            .expect("artifact name pattern is valid")
    })
}

/// A server build published in the remote index, named
/// `<base_version>-<build_number>.<extension>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteArtifact {
    pub base_version: String,
    pub build_number: u64,
    pub extension: String,
}

impl RemoteArtifact {
    /// Parse an index entry. Leading directories are ignored.
    pub fn parse_file_name(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next()?;
        let caps = artifact_name_regex().captures(name)?;
        Some(Self {
            base_version: caps["base"].to_string(),
            build_number: caps["build"].parse().ok()?,
            extension: caps["ext"].to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.{}", self.base_version, self.build_number, self.extension)
    }

    /// True when the dotted components of the base version are a prefix of
    /// the host's `[major, minor, patch]`; `4.1` matches `4.1.2` but never `4.10`.
    pub fn is_compatible_with(&self, host: &HostVersion) -> bool {
        let host_parts = host.components();
        let mut count = 0;
        for part in self.base_version.split('.') {
            let Ok(value) = part.parse::<u64>() else {
                return false;
            };
            match host_parts.get(count) {
                Some(h) if *h == value => count += 1,
                _ => return false,
            }
        }
        count > 0
    }
}

impl fmt::Display for RemoteArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base_version, self.build_number)
    }
}

/// Pick the compatible entry with the highest build number.
pub fn resolve_compatible_build<'a, I>(host: &HostVersion, entries: I) -> Option<RemoteArtifact>
where
    I: IntoIterator<Item = &'a RemoteArtifact>,
{
    entries
        .into_iter()
        .filter(|a| a.is_compatible_with(host))
        .max_by_key(|a| a.build_number)
        .cloned()
}
