// ABOUTME: Host platform detection and image tagging helpers shared by run and build paths

use super::error::Result;
use super::executor::{CommandExecutor, ExecOptions};
use tracing::debug;

/// One build target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineArch {
    /// Directory name, e.g. `linux-x64`.
    pub arch_dir: &'static str,
    /// Engine architecture name, e.g. `amd64`.
    pub arch: &'static str,
    /// Operating system, always `linux` for now.
    pub os: &'static str,
}

/// Architectures images are built for, keyed by their directory name.
pub const ENGINE_ARCHS: [EngineArch; 2] = [
    EngineArch {
        arch_dir: "linux-arm64",
        arch: "arm64",
        os: "linux",
    },
    EngineArch {
        arch_dir: "linux-x64",
        arch: "amd64",
        os: "linux",
    },
];

/// Look up a target by directory name.
pub fn engine_arch(arch_dir: &str) -> Option<&'static EngineArch> {
    ENGINE_ARCHS.iter().find(|a| a.arch_dir == arch_dir)
}

/// `arm64` on aarch64 hosts, `amd64` everywhere else.
pub fn current_platform() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "amd64"
    }
}

/// Directory name for the host architecture.
pub fn current_platform_arch() -> &'static str {
    if current_platform() == "arm64" {
        "linux-arm64"
    } else {
        "linux-x64"
    }
}

/// `tag source target`, returning the engine's output.
pub async fn tag_image(
    executor: &dyn CommandExecutor,
    source: &str,
    target: &str,
    options: &ExecOptions,
) -> Result<String> {
    debug!("Tagging image: {} -> {}", source, target);
    let args = vec!["tag".to_string(), source.to_string(), target.to_string()];
    executor.execute(&args, options).await
}
