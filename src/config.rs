//! Driver configuration.

/// Default module capacity of the registry.
///
/// Matches the number of module slots the hypervisor core reserves.
pub const DEFAULT_MAX_MODULES: usize = 75;

/// Configuration for a driver instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Maximum number of modules the registry holds at once.
    pub max_modules: usize,
}

impl DriverConfig {
    /// Create a configuration with the given module capacity.
    pub fn with_max_modules(max_modules: usize) -> Self {
        Self { max_modules }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_modules: DEFAULT_MAX_MODULES,
        }
    }
}
