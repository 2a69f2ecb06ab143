// ABOUTME: Container engine CLI integration: command execution, listing, and platform helpers

/// Listing containers with `ps`.
pub mod containers;
/// Error type and result alias.
pub mod error;
/// Running engine commands.
pub mod executor;
/// Host platform detection and image tagging.
pub mod platform;

pub use containers::{list_containers, ContainerListing, ListOptions};
pub use error::{EngineError, Result};
pub use executor::{argv, CliExecutor, CommandExecutor, EngineProcess, ExecOptions, RetryPolicy};
pub use platform::{current_platform, current_platform_arch, tag_image, ENGINE_ARCHS};
