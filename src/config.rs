//! Context configuration

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit GLSL compiler binary
pub const COMPILER_ENV: &str = "HLX_GLSLC";

/// Environment variable enabling verbose traces ("1", "true", "on")
pub const DEBUG_ENV: &str = "HLX_COMPUTE_DEBUG";

/// Tunables for a [`ComputeContext`](crate::ComputeContext).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Application name reported to the Vulkan driver
    pub app_name: String,

    /// Explicit compiler path; falls back to `glslc`, then `glslangValidator`
    pub compiler: Option<PathBuf>,

    /// Insert a full visibility barrier after every dispatch
    pub auto_barrier: bool,

    /// Upper bound for `wait_async`
    pub async_timeout: Duration,

    /// Start with verbose traces enabled
    pub debug: bool,

    /// Descriptor sets available per batch before a forced flush
    pub max_descriptor_sets: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            app_name: "hlx-compute".to_string(),
            compiler: None,
            auto_barrier: true,
            async_timeout: Duration::from_secs(1),
            debug: false,
            max_descriptor_sets: 64,
        }
    }
}

impl ContextConfig {
    /// Defaults overridden by `HLX_GLSLC` and `HLX_COMPUTE_DEBUG`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(COMPILER_ENV) {
            config.compiler = Some(PathBuf::from(path));
        }
        if let Ok(value) = std::env::var(DEBUG_ENV) {
            config.debug = parse_flag(&value);
        }
        config
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}
