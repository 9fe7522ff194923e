// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Environment-driven configuration, read once when a registry is created.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ShimError, ShimResult};

/// Default transport chunk bound (8 MiB), matching the emulation shim's message size.
pub const DEFAULT_MESSAGE_SIZE: usize = 0x80_0000;

const DEFAULT_BANK_COUNT: u64 = 4;
const DEFAULT_BANK_SIZE: u64 = 1 << 30;

/// One simulated DDR bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankConfig {
    pub tag: String,
    pub base: u64,
    pub size: u64,
}

impl BankConfig {
    pub fn new(tag: &str, base: u64, size: u64) -> Self {
        Self {
            tag: tag.to_owned(),
            base,
            size,
        }
    }
}

/// `count` contiguous banks of `size` bytes named `bank0`, `bank1`, ...
pub fn uniform_banks(count: u64, size: u64) -> Vec<BankConfig> {
    (0..count)
        .map(|i| BankConfig::new(&format!("bank{i}"), i * size, size))
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Emulation process binary used by `DeviceRegistry::open`.
    pub device_binary: Option<PathBuf>,
    /// Extra arguments passed to the emulation process.
    pub device_args: Vec<String>,
    /// Directory holding the per-launch unix sockets.
    pub socket_dir: PathBuf,
    /// Largest payload chunk sent in one exchange.
    pub message_size: usize,
    pub launch_timeout: Duration,
    pub shutdown_grace: Duration,
    /// How often outstanding commands are polled for completion.
    pub poll_interval: Duration,
    pub banks: Vec<BankConfig>,
    pub device_count: u32,
    pub debug: bool,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_binary: None,
            device_args: Vec::new(),
            socket_dir: std::env::temp_dir(),
            message_size: DEFAULT_MESSAGE_SIZE,
            launch_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(2),
            banks: uniform_banks(DEFAULT_BANK_COUNT, DEFAULT_BANK_SIZE),
            device_count: 1,
            debug: false,
            log_filter: "info".to_owned(),
        }
    }
}

impl Config {
    /// Read `SWEMU_*` variables from the process environment.
    pub fn from_env() -> ShimResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> ShimResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("SWEMU_DEVICE_BINARY") {
            cfg.device_binary = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SWEMU_DEVICE_ARGS") {
            cfg.device_args = v.split_whitespace().map(str::to_owned).collect();
        }
        if let Some(v) = lookup("SWEMU_SOCKET_DIR") {
            cfg.socket_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SWEMU_MESSAGE_SIZE") {
            let size = parse_number("SWEMU_MESSAGE_SIZE", &v)?;
            if size == 0 {
                return Err(ShimError::Config("SWEMU_MESSAGE_SIZE must be non-zero".into()));
            }
            cfg.message_size = usize::try_from(size)
                .map_err(|_| ShimError::Config(format!("SWEMU_MESSAGE_SIZE too large: {v}")))?;
        }
        if let Some(v) = lookup("SWEMU_LAUNCH_TIMEOUT_MS") {
            let ms = parse_number("SWEMU_LAUNCH_TIMEOUT_MS", &v)?;
            cfg.launch_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("SWEMU_SHUTDOWN_GRACE_MS") {
            let ms = parse_number("SWEMU_SHUTDOWN_GRACE_MS", &v)?;
            cfg.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("SWEMU_POLL_INTERVAL_MS") {
            let ms = parse_number("SWEMU_POLL_INTERVAL_MS", &v)?;
            cfg.poll_interval = Duration::from_millis(ms);
        }

        let bank_count = match lookup("SWEMU_DDR_BANKS") {
            Some(v) => parse_number("SWEMU_DDR_BANKS", &v)?,
            None => DEFAULT_BANK_COUNT,
        };
        let bank_size = match lookup("SWEMU_DDR_BANK_SIZE") {
            Some(v) => parse_number("SWEMU_DDR_BANK_SIZE", &v)?,
            None => DEFAULT_BANK_SIZE,
        };
        if bank_count == 0 || bank_size == 0 {
            return Err(ShimError::Config("DDR bank count and size must be non-zero".into()));
        }
        cfg.banks = uniform_banks(bank_count, bank_size);

        if let Some(v) = lookup("SWEMU_DEVICE_COUNT") {
            cfg.device_count = u32::try_from(parse_number("SWEMU_DEVICE_COUNT", &v)?)
                .map_err(|_| ShimError::Config(format!("SWEMU_DEVICE_COUNT out of range: {v}")))?;
        }
        if let Some(v) = lookup("SWEMU_DEBUG") {
            cfg.debug = parse_bool("SWEMU_DEBUG", &v)?;
        }
        if let Some(v) = lookup("SWEMU_LOG") {
            cfg.log_filter = v;
        }

        Ok(cfg)
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(key: &str, value: &str) -> ShimResult<u64> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => v.parse::<u64>(),
    };
    parsed.map_err(|_| ShimError::Config(format!("{key}: not a number: {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> ShimResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        _ => Err(ShimError::Config(format!("{key}: not a boolean: {value:?}"))),
    }
}
