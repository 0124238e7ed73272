//! Build-time metadata embedded by the build script.
//!
//! Reported by `--version`, the startup log line and the `/health` route.

/// The git commit hash at build time (short form).
pub const GIT_HASH: &str = env!("F2B_EXPORTER_GIT_HASH");

/// The build timestamp as a Unix epoch string.
pub const BUILD_TIMESTAMP: &str = env!("F2B_EXPORTER_BUILD_TIMESTAMP");

/// The build profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("F2B_EXPORTER_BUILD_PROFILE");

/// The target triple the binary was compiled for.
pub const BUILD_TARGET: &str = env!("F2B_EXPORTER_BUILD_TARGET");

/// The crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Return a formatted version string including git hash, profile and platform.
///
/// Example: `"v0.1.0 (abc1234, release) on linux/x86_64"`
pub fn version_string() -> String {
    format!(
        "v{VERSION} ({GIT_HASH}, {BUILD_PROFILE}) on {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
