//! Runtime-configurable sizing for the all-to-all communicator.
//!
//! All values have defaults sized for the attention-layout shuffles this
//! path was built for. Override via environment variables (prefixed
//! `XA2A_`) or by constructing a custom `A2aConfig`.

/// World sizes the native kernel's block layout can partition.
pub const SUPPORTED_WORLD_SIZES: [usize; 4] = [2, 4, 6, 8];

/// Fast-path transfers move 16-byte packets; inputs must be a whole number of them.
pub const ALIGNMENT: usize = 16;

/// 2048 rows per chunk x 128 heads x 576 head dim x 2-byte elements.
pub const DEFAULT_MAX_SIZE: usize = 2048 * 128 * 576 * 2;

/// Per-rank output metadata: 8 ranks x 8 x 2 bytes.
pub const DEFAULT_PEER_OUTPUT_SIZE: usize = 128;

/// `sizeof(u32) * (MAX_ALL_TO_ALL_BLOCKS + 2) * MAX_RANKS_PER_NODE`.
pub const DEFAULT_BARRIER_MAX_SIZE: usize = 8 * (64 + 2) * 8;

/// Scratch region handed to the kernel context, local to each rank.
pub const DEFAULT_RANK_DATA_SIZE: usize = 8 * 1024 * 1024;

/// Sizing and switches read once at communicator construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A2aConfig {
    /// Payload buffer size, and the traffic bound for the fast path.
    pub max_size: usize,

    /// Size of the per-rank output metadata buffer family.
    pub peer_output_size: usize,

    /// Size of each barrier buffer family (inbound and outbound).
    pub barrier_max_size: usize,

    /// Size of the locally owned scratch region.
    pub rank_data_size: usize,

    /// Operator kill-switch. When set the communicator is always disabled.
    pub disabled: bool,

    /// Rank-ordered visible physical devices, from `CUDA_VISIBLE_DEVICES`.
    /// `None` means logical index == physical id.
    pub visible_devices: Option<Vec<u32>>,
}

impl Default for A2aConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            peer_output_size: DEFAULT_PEER_OUTPUT_SIZE,
            barrier_max_size: DEFAULT_BARRIER_MAX_SIZE,
            rank_data_size: DEFAULT_RANK_DATA_SIZE,
            disabled: false,
            visible_devices: None,
        }
    }
}

impl A2aConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `XA2A_MAX_SIZE`
    /// - `XA2A_PEER_OUTPUT_SIZE`
    /// - `XA2A_BARRIER_MAX_SIZE`
    /// - `XA2A_RANK_DATA_SIZE`
    /// - `XA2A_DISABLE` (`1` or `true`)
    /// - `CUDA_VISIBLE_DEVICES`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(n) = lookup("XA2A_MAX_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            cfg.max_size = n;
        }
        if let Some(n) = lookup("XA2A_PEER_OUTPUT_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            cfg.peer_output_size = n;
        }
        if let Some(n) = lookup("XA2A_BARRIER_MAX_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            cfg.barrier_max_size = n;
        }
        if let Some(n) = lookup("XA2A_RANK_DATA_SIZE").and_then(|v| v.parse::<usize>().ok()) {
            cfg.rank_data_size = n;
        }
        if let Some(v) = lookup("XA2A_DISABLE") {
            cfg.disabled = matches!(v.trim(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = lookup("CUDA_VISIBLE_DEVICES") {
            cfg.visible_devices = parse_visible_devices(&v);
        }

        cfg
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_visible_devices(mut self, devices: Vec<u32>) -> Self {
        self.visible_devices = Some(devices);
        self
    }
}

/// Parse a comma separated device list. Empty or malformed lists yield `None`.
pub fn parse_visible_devices(value: &str) -> Option<Vec<u32>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value
        .split(',')
        .map(|s| s.trim().parse::<u32>().ok())
        .collect()
}
