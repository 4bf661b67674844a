//! Tool identity and versioning.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel version that bypasses version comparison entirely.
pub const VERSION_NO_CHECK: &str = "no_check";

/// Which command-line dialect a tool speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainKind {
    /// Resolve from the executable name at first use.
    #[default]
    Auto,
    Gcc,
    Clang,
    Msvc,
}

impl ToolchainKind {
    /// Guess the dialect from an executable path or basename.
    ///
    /// `g__~1` is the Windows 8.3 short name for `g++`.
    pub fn guess(executable: &str) -> Self {
        let name = executable
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(executable)
            .to_ascii_lowercase();
        if name.contains("cl.exe") || name == "cl" {
            return Self::Msvc;
        }
        if name.contains("clang") {
            return Self::Clang;
        }
        for gcc_name in ["gcc", "g++", "mingw", "g__~1"] {
            if name.contains(gcc_name) {
                return Self::Gcc;
            }
        }
        Self::Auto
    }
}

impl fmt::Display for ToolchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Gcc => "gcc",
            Self::Clang => "clang",
            Self::Msvc => "msvc",
        };
        f.write_str(s)
    }
}

/// A tool version as extracted from the compiler or pinned in config.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolVersion(pub String);

impl ToolVersion {
    pub fn no_check() -> Self {
        Self(VERSION_NO_CHECK.to_string())
    }

    pub fn is_no_check(&self) -> bool {
        self.0 == VERSION_NO_CHECK
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Two versions are considered matching when equal or when either side
    /// opted out of checking.
    pub fn matches(&self, other: &ToolVersion) -> bool {
        self.is_no_check() || other.is_no_check() || self.0 == other.0
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ToolVersion {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Versions of every locally configured tool, keyed by tool id.
pub type VersionMap = BTreeMap<String, ToolVersion>;

/// True when every required tool the server advertises matches ours.
pub fn versions_compatible(
    required_tool_ids: &[String],
    mine: &VersionMap,
    theirs: &VersionMap,
) -> bool {
    for tool_id in required_tool_ids {
        let (Some(my_version), Some(their_version)) = (mine.get(tool_id), theirs.get(tool_id))
        else {
            continue;
        };
        if !my_version.matches(their_version) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_toolchain_from_executable() {
        assert_eq!(ToolchainKind::guess("/usr/bin/g++"), ToolchainKind::Gcc);
        assert_eq!(ToolchainKind::guess("clang++-15"), ToolchainKind::Clang);
        assert_eq!(
            ToolchainKind::guess("C:\\VC\\bin\\cl.exe"),
            ToolchainKind::Msvc
        );
        assert_eq!(ToolchainKind::guess("x86_64-w64-mingw32-gcc"), ToolchainKind::Gcc);
        assert_eq!(ToolchainKind::guess("g__~1.exe"), ToolchainKind::Gcc);
        assert_eq!(ToolchainKind::guess("rustc"), ToolchainKind::Auto);
    }

    #[test]
    fn no_check_matches_anything() {
        let pinned = ToolVersion::from("9.3.0");
        assert!(ToolVersion::no_check().matches(&pinned));
        assert!(pinned.matches(&ToolVersion::no_check()));
        assert!(pinned.matches(&pinned.clone()));
        assert!(!pinned.matches(&ToolVersion::from("10.2.0")));
    }

    #[test]
    fn compatibility_checks_only_required_tools() {
        let mut mine = VersionMap::new();
        mine.insert("gcc9".into(), ToolVersion::from("9.3.0"));
        mine.insert("clang12".into(), ToolVersion::from("12.0.1"));

        let mut theirs = VersionMap::new();
        theirs.insert("gcc9".into(), ToolVersion::from("9.3.0"));
        theirs.insert("clang12".into(), ToolVersion::from("13.0.0"));

        let required = vec!["gcc9".to_string()];
        assert!(versions_compatible(&required, &mine, &theirs));

        let required = vec!["gcc9".to_string(), "clang12".to_string()];
        assert!(!versions_compatible(&required, &mine, &theirs));
    }
}
