//! Build identification printed by `esmeralda version`.

use std::path::Path;

const DEFAULT_COMMIT: &str = "2000.01.01.release";
const DEFAULT_BUILDSTAMP: &str = "2000-01-01T00:00:00+0800";

/// Name, commit and build time of the running binary.
///
/// Commit and build stamp are baked in at compile time from
/// `ESMERALDA_COMMIT` and `ESMERALDA_BUILDSTAMP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub name: String,
    pub commit: String,
    pub buildstamp: String,
}

impl BuildInfo {
    pub fn current(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit: option_env!("ESMERALDA_COMMIT")
                .unwrap_or(DEFAULT_COMMIT)
                .to_string(),
            buildstamp: option_env!("ESMERALDA_BUILDSTAMP")
                .unwrap_or(DEFAULT_BUILDSTAMP)
                .to_string(),
        }
    }

    /// Build info named after the base name of `argv[0]`.
    pub fn from_argv0(argv0: Option<&str>) -> Self {
        let name = argv0
            .and_then(|a| Path::new(a).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self::current(name)
    }

    /// The lines printed by the version command.
    pub fn banner(&self) -> String {
        format!(
            "{}\ncommit: {}, build: {}\nCopyright (c) 2017, chuanyun.io. All rights reserved.",
            self.name, self.commit, self.buildstamp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_base_name_of_argv0() {
        let info = BuildInfo::from_argv0(Some("/usr/local/bin/esmeralda-server"));
        assert_eq!(info.name, "esmeralda-server");
    }

    #[test]
    fn test_missing_argv0_falls_back_to_package_name() {
        let info = BuildInfo::from_argv0(None);
        assert_eq!(info.name, "esmeralda");
    }

    #[test]
    fn test_banner_contains_commit_and_build() {
        let info = BuildInfo {
            name: "esmeralda".to_string(),
            commit: "abc123".to_string(),
            buildstamp: "2024-05-01T00:00:00Z".to_string(),
        };
        let banner = info.banner();
        let mut lines = banner.lines();
        assert_eq!(lines.next(), Some("esmeralda"));
        assert_eq!(
            lines.next(),
            Some("commit: abc123, build: 2024-05-01T00:00:00Z")
        );
        assert!(lines.next().unwrap().starts_with("Copyright"));
    }
}
