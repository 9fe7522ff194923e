// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Emulation process for one device. Launched by the shim's supervisor:
//
//   swemu-device --socket PATH --device N [--message-size BYTES]
//                [--exec-latency-ms MS] [--name NAME] [--debug]

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use swemu::config::{parse_number, Config};
use swemu::emulator::{DeviceOptions, DeviceServer};
use tracing_subscriber::EnvFilter;

struct Args {
    socket: PathBuf,
    device: u32,
    options: DeviceOptions,
    debug: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut socket = None;
    let mut device = 0u32;
    let mut options = DeviceOptions::default();
    let mut debug = false;

    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("{name} needs a value"));
        match flag.as_str() {
            "--socket" => socket = Some(PathBuf::from(value("--socket")?)),
            "--device" => {
                let v = value("--device")?;
                device = parse_number("--device", &v)
                    .ok()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| format!("bad device index {v}"))?;
            }
            "--message-size" => {
                let v = value("--message-size")?;
                options.message_size = parse_number("--message-size", &v)
                    .map_err(|e| e.to_string())? as usize;
            }
            "--exec-latency-ms" => {
                let v = value("--exec-latency-ms")?;
                let ms = parse_number("--exec-latency-ms", &v).map_err(|e| e.to_string())?;
                options.exec_latency = Duration::from_millis(ms);
            }
            "--name" => options.name = value("--name")?,
            "--debug" => debug = true,
            other => return Err(format!("unknown argument {other}")),
        }
    }

    Ok(Args {
        socket: socket.ok_or("--socket is required")?,
        device,
        options,
        debug,
    })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("swemu-device: {e}");
            return ExitCode::from(2);
        }
    };

    let filter = match Config::from_env() {
        Ok(c) if !(args.debug && std::env::var_os("SWEMU_LOG").is_none()) => c.log_filter,
        Ok(_) => "debug".to_owned(),
        Err(e) => {
            eprintln!("swemu-device: {e}");
            return ExitCode::from(2);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let stream = match UnixStream::connect(&args.socket) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(socket = %args.socket.display(), error = %e, "cannot connect to host");
            return ExitCode::FAILURE;
        }
    };

    let server = DeviceServer::new(args.device, args.options);
    match server.serve(stream) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(device = args.device, error = %e, "device stopped");
            ExitCode::FAILURE
        }
    }
}
