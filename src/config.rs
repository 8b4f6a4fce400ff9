use std::env;

/// Environment variable enabling the device allocation reuse cache.
pub const ENV_DEVICE_ALLOCATION_CACHE: &str = "USM_DEVICE_ALLOCATION_CACHE";
/// Environment variable bounding the bytes held by the device allocation cache.
pub const ENV_DEVICE_ALLOCATION_CACHE_MAX_BYTES: &str = "USM_DEVICE_ALLOCATION_CACHE_MAX_BYTES";
/// Environment variable forcing KMD-migrated shared allocations on or off.
pub const ENV_KMD_MIGRATED_SHARED: &str = "USM_KMD_MIGRATED_SHARED";

/// Tunables for an `SvmAllocsManager`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmManagerConfig {
    /// Keep freed device allocations around for reuse.
    pub device_allocation_cache: bool,
    /// Upper bound on the bytes the cache may hold. `None` means unbounded.
    pub device_allocation_cache_max_bytes: Option<u64>,
    /// Overrides the memory manager's KMD migration capability for shared allocations.
    pub kmd_migrated_shared_allocations: Option<bool>,
    /// Backing allocations may be used by several OS contexts at once.
    pub multi_os_context_support: bool,
}

impl SvmManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn device_allocation_cache(mut self) -> Self {
        self.device_allocation_cache = true;
        self
    }

    #[must_use]
    pub const fn device_allocation_cache_max_bytes(mut self, max_bytes: u64) -> Self {
        self.device_allocation_cache_max_bytes = Some(max_bytes);
        self
    }

    #[must_use]
    pub const fn kmd_migrated_shared_allocations(mut self, enabled: bool) -> Self {
        self.kmd_migrated_shared_allocations = Some(enabled);
        self
    }

    #[must_use]
    pub const fn multi_os_context_support(mut self) -> Self {
        self.multi_os_context_support = true;
        self
    }

    /// Builds a config from the defaults with any `USM_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`. Unparseable values are ignored.
    #[must_use]
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(enabled) = lookup(ENV_DEVICE_ALLOCATION_CACHE).and_then(|v| parse_flag(&v)) {
            self.device_allocation_cache = enabled;
        }

        if let Some(raw) = lookup(ENV_DEVICE_ALLOCATION_CACHE_MAX_BYTES) {
            match raw.trim().parse::<u64>() {
                Ok(max_bytes) => self.device_allocation_cache_max_bytes = Some(max_bytes),
                Err(e) => tracing::warn!(
                    value = %raw,
                    error = %e,
                    "ignoring invalid {ENV_DEVICE_ALLOCATION_CACHE_MAX_BYTES}"
                ),
            }
        }

        if let Some(enabled) = lookup(ENV_KMD_MIGRATED_SHARED).and_then(|v| parse_flag(&v)) {
            self.kmd_migrated_shared_allocations = Some(enabled);
        }

        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        other => {
            tracing::warn!(value = other, "ignoring unrecognised boolean override");
            None
        }
    }
}
