/// varnishstat version discovery.
///
/// Runs `varnishstat -V` once at startup and extracts the release triple from
/// the banner, e.g. `varnishstat (varnish-6.0.0 revision a068361...)`.
/// The probed version gates which arguments later scrapes may pass.
use crate::varnishstat::{run_bounded, Invocation, StatsError};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"varnish-(?:plus-)?(\d+)\.(\d+)(?:\.(\d+))?").unwrap()
});

/// Parsed varnishstat release. Immutable once probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarnishVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub valid: bool,
}

/// Errors produced while probing the varnishstat version.
#[derive(Debug)]
pub enum VersionError {
    /// varnishstat could not be started or exited abnormally.
    Run(StatsError),
    /// varnishstat ran but printed nothing that looks like a version.
    Unrecognized { output: String },
}

impl std::fmt::Display for VersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionError::Run(e) => write!(f, "varnishstat -V failed: {e}"),
            VersionError::Unrecognized { output } => {
                write!(f, "no version found in varnishstat -V output: {output:?}")
            }
        }
    }
}

impl std::error::Error for VersionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VersionError::Run(e) => Some(e),
            VersionError::Unrecognized { .. } => None,
        }
    }
}

impl From<StatsError> for VersionError {
    fn from(e: StatsError) -> Self {
        VersionError::Run(e)
    }
}

impl VarnishVersion {
    /// A version known to be valid. Mostly useful for tests and fixtures.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            valid: true,
        }
    }

    /// Probe the installed varnishstat. On failure the caller keeps
    /// `VarnishVersion::default()`, which is invalid.
    pub async fn initialize(
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<VarnishVersion, VersionError> {
        let output = run_bounded(invocation, &["-V".to_string()], timeout).await?;
        // Older releases print the banner on stderr.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        match Self::parse(&text) {
            Some(version) => {
                tracing::debug!(%version, "parsed varnishstat version");
                Ok(version)
            }
            None => Err(VersionError::Unrecognized {
                output: text.trim().to_string(),
            }),
        }
    }

    /// Extract the first `varnish-X.Y[.Z]` token from free-form text.
    pub fn parse(text: &str) -> Option<VarnishVersion> {
        let caps = VERSION_PATTERN.captures(text)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        let patch = match caps.get(3) {
            Some(m) => m.as_str().parse().ok()?,
            None => 0,
        };
        Some(VarnishVersion::new(major, minor, patch))
    }

    /// Compare on `(major, minor)` only. An invalid version never qualifies.
    pub fn equals_or_greater(&self, major: u32, minor: u32) -> bool {
        self.valid && (self.major, self.minor) >= (major, minor)
    }
}

impl std::fmt::Display for VarnishVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.valid {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        } else {
            write!(f, "unknown")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varnishstat::tests::fake_varnishstat;

    #[test]
    fn test_parse_standard_banner() {
        let v = VarnishVersion::parse(
            "varnishstat (varnish-6.0.0 revision a068361dff0d25a0d85cf82a6e5fdaf315e06a7d)",
        )
        .unwrap();
        assert_eq!(v, VarnishVersion::new(6, 0, 0));
    }

    #[test]
    fn test_parse_plus_banner() {
        let v = VarnishVersion::parse("varnishstat (varnish-plus-4.1.7r1 revision 123)").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (4, 1, 7));
    }

    #[test]
    fn test_parse_without_patch() {
        let v = VarnishVersion::parse("varnishstat (varnish-3.0 revision x)").unwrap();
        assert_eq!(v, VarnishVersion::new(3, 0, 0));
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(VarnishVersion::parse("").is_none());
        assert!(VarnishVersion::parse("varnishstat: command not found").is_none());
        assert!(VarnishVersion::parse("varnish-x.y.z").is_none());
    }

    #[test]
    fn test_equals_or_greater() {
        for (major, minor, patch) in [(4, 0, 0), (4, 1, 2), (6, 0, 0)] {
            let v = VarnishVersion::new(major, minor, patch);
            assert!(v.equals_or_greater(4, 0), "{v} should be >= 4.0");
        }
        for (major, minor, patch) in [(3, 0, 6), (3, 9, 9)] {
            let v = VarnishVersion::new(major, minor, patch);
            assert!(!v.equals_or_greater(4, 0), "{v} should be < 4.0");
        }
    }

    #[test]
    fn test_equals_or_greater_ignores_patch() {
        let v = VarnishVersion::new(4, 1, 0);
        assert!(v.equals_or_greater(4, 1));
        assert!(!v.equals_or_greater(4, 2));
    }

    #[test]
    fn test_invalid_version_never_qualifies() {
        let v = VarnishVersion::default();
        assert!(!v.valid);
        assert!(!v.equals_or_greater(0, 0));
        assert_eq!(v.to_string(), "unknown");
    }

    #[tokio::test]
    async fn test_initialize_from_fake_binary() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_varnishstat(
            dir.path(),
            r#"echo "varnishstat (varnish-6.2.1 revision 9f8588e4ab785244e06c3446fe09bf9db5dd8753)""#,
        );
        let invocation = Invocation::direct(exe.to_string_lossy().as_ref());
        let v = VarnishVersion::initialize(&invocation, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(v, VarnishVersion::new(6, 2, 1));
    }

    #[tokio::test]
    async fn test_initialize_reads_stderr_banner() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_varnishstat(dir.path(), r#"echo "varnishstat (varnish-3.0.5 revision 1a89b1f)" >&2"#);
        let invocation = Invocation::direct(exe.to_string_lossy().as_ref());
        let v = VarnishVersion::initialize(&invocation, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(v, VarnishVersion::new(3, 0, 5));
    }

    #[tokio::test]
    async fn test_initialize_unrecognized_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_varnishstat(dir.path(), "echo hello");
        let invocation = Invocation::direct(exe.to_string_lossy().as_ref());
        let err = VarnishVersion::initialize(&invocation, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::Unrecognized { .. }));
    }

    #[tokio::test]
    async fn test_initialize_missing_binary() {
        let invocation = Invocation::direct("nonexistent-varnishstat-xyz");
        let err = VarnishVersion::initialize(&invocation, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::Run(StatsError::Spawn { .. })));
    }
}
