// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Environment-driven configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use swemu::config::{parse_number, DEFAULT_MESSAGE_SIZE};
use swemu::{Config, ShimError};

fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ShimError> {
    let env: HashMap<String, String> = pairs
        .iter()
        .map(|&(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    Config::from_lookup(|k| env.get(k).cloned())
}

#[test]
fn defaults() {
    let cfg = from_pairs(&[]).unwrap();
    assert_eq!(cfg.device_binary, None);
    assert!(cfg.device_args.is_empty());
    assert_eq!(cfg.message_size, DEFAULT_MESSAGE_SIZE);
    assert_eq!(cfg.poll_interval, Duration::from_millis(2));
    assert_eq!(cfg.banks.len(), 4);
    assert!(cfg.banks.iter().all(|b| b.size == 1 << 30));
    assert_eq!(cfg.banks[1].base, 1 << 30);
    assert_eq!(cfg.device_count, 1);
    assert!(!cfg.debug);
    assert_eq!(cfg.log_filter, "info");
}

#[test]
fn every_variable() {
    let cfg = from_pairs(&[
        ("SWEMU_DEVICE_BINARY", "/opt/swemu/bin/device"),
        ("SWEMU_DEVICE_ARGS", "--exec-latency-ms 5  --name card"),
        ("SWEMU_SOCKET_DIR", "/run/swemu"),
        ("SWEMU_MESSAGE_SIZE", "0x1000"),
        ("SWEMU_LAUNCH_TIMEOUT_MS", "250"),
        ("SWEMU_SHUTDOWN_GRACE_MS", "0"),
        ("SWEMU_POLL_INTERVAL_MS", "7"),
        ("SWEMU_DDR_BANKS", "2"),
        ("SWEMU_DDR_BANK_SIZE", "0x100000"),
        ("SWEMU_DEVICE_COUNT", "3"),
        ("SWEMU_DEBUG", "yes"),
        ("SWEMU_LOG", "swemu=trace"),
    ])
    .unwrap();

    assert_eq!(cfg.device_binary, Some(PathBuf::from("/opt/swemu/bin/device")));
    assert_eq!(cfg.device_args, ["--exec-latency-ms", "5", "--name", "card"]);
    assert_eq!(cfg.socket_dir, PathBuf::from("/run/swemu"));
    assert_eq!(cfg.message_size, 0x1000);
    assert_eq!(cfg.launch_timeout, Duration::from_millis(250));
    assert_eq!(cfg.shutdown_grace, Duration::ZERO);
    assert_eq!(cfg.poll_interval, Duration::from_millis(7));
    assert_eq!(cfg.banks.len(), 2);
    assert_eq!(cfg.banks[1].base, 0x100000);
    assert_eq!(cfg.banks[1].tag, "bank1");
    assert_eq!(cfg.device_count, 3);
    assert!(cfg.debug);
    assert_eq!(cfg.log_filter, "swemu=trace");
}

#[test]
fn malformed_values_are_rejected() {
    for (key, value) in [
        ("SWEMU_MESSAGE_SIZE", "lots"),
        ("SWEMU_MESSAGE_SIZE", "0"),
        ("SWEMU_POLL_INTERVAL_MS", "-1"),
        ("SWEMU_DDR_BANKS", "0"),
        ("SWEMU_DEVICE_COUNT", "0x1_0000_0000"),
        ("SWEMU_DEVICE_COUNT", "4294967296"),
        ("SWEMU_DEBUG", "maybe"),
    ] {
        let err = from_pairs(&[(key, value)]).unwrap_err();
        assert!(matches!(err, ShimError::Config(_)), "{key}={value}: {err}");
    }
}

#[test]
fn number_formats() {
    assert_eq!(parse_number("k", "42").unwrap(), 42);
    assert_eq!(parse_number("k", " 0x2A ").unwrap(), 42);
    assert_eq!(parse_number("k", "0X2a").unwrap(), 42);
    assert!(parse_number("k", "0x").is_err());
    assert!(parse_number("k", "").is_err());
}
