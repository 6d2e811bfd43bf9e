// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// Flash monitor image transfer over a serial link
mod config;
mod downloader;
mod progress;
mod protocol;
mod serial;
mod session;
mod uploader;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use config::{TransferConfig, DEFAULT_BAUD, DEFAULT_IMAGE, DEFAULT_PORT, DEFAULT_STALL_SECS, DEFAULT_TIMEOUT_MS};
use protocol::TRANSFER_SIZE;
use serial::RealSerialPort;
use session::Session;

#[derive(Parser)]
#[command(name = "flashlink")]
#[command(about = "Read or write a 1 MiB flash image through the device's serial flash monitor", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyACM0 or COM18)
    #[arg(short, long, global = true, default_value = DEFAULT_PORT)]
    port: String,

    /// Baud rate
    #[arg(short, long, global = true, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Read timeout for each serial read
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT_MS, value_name = "MS")]
    timeout: u64,

    /// Give up when the device stays silent this long during a handshake (0 waits forever)
    #[arg(long, global = true, default_value_t = DEFAULT_STALL_SECS, value_name = "SECS")]
    stall_timeout: u64,

    /// Start without waiting for Enter
    #[arg(short, long, global = true)]
    yes: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read 1 MiB of flash into a file
    Download {
        /// File to save the image to
        #[arg(default_value = DEFAULT_IMAGE)]
        file: PathBuf,
    },
    /// Erase flash and write a file into it, padded to 1 MiB with 0xFF
    Upload {
        /// Image to write
        #[arg(default_value = DEFAULT_IMAGE)]
        file: PathBuf,

        /// Compare the crc32b the device reports after writing
        #[arg(long)]
        verify: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let file = match &cli.command {
        Commands::Download { file } => file.clone(),
        Commands::Upload { file, .. } => file.clone(),
    };

    let config = match TransferConfig::new(cli.port, cli.baud, cli.timeout, cli.stall_timeout, file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Download { .. } => download(config, cli.yes),
        Commands::Upload { verify, .. } => upload(config, verify, cli.yes),
    }
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn open_session(config: &TransferConfig) -> Session {
    info!("Opening serial port {} at {} baud", config.port, config.baud);

    match RealSerialPort::open(&config.port, config.baud, config.timeout) {
        Ok(port) => Session::new(Box::new(port), config.timeout, config.stall),
        Err(e) => {
            eprintln!("Error: could not open serial port {}: {}", config.port, e);
            eprintln!("Check that you don't have a serial console session open!");
            eprintln!("Check the port name!");
            std::process::exit(1);
        }
    }
}

/// Wait for Enter; Ctrl-C here ends the process before anything is sent
fn confirm(skip: bool) {
    if skip {
        return;
    }

    println!("Press Enter to start, or Ctrl-C to exit");
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(n) if n > 0 => {}
        _ => {
            eprintln!("Aborted");
            std::process::exit(1);
        }
    }
}

fn download(config: TransferConfig, yes: bool) {
    use downloader::{run_download, DownloaderFsm};

    let session = open_session(&config);

    println!("This program will read 1 MByte of Flash memory and save it to {}", config.path.display());
    confirm(yes);
    println!("Starting...");

    let report = match run_download(DownloaderFsm::new(session, config.path.clone())) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Download failed: {}", e);
            std::process::exit(1);
        }
    };

    if report.is_complete() {
        println!("Success, saved to {}", config.path.display());
    } else {
        warn!(
            "expected {} bytes, received {} (discrepancy of {} bytes)",
            TRANSFER_SIZE,
            report.received,
            report.discrepancy()
        );
        println!("WARNING: expected {} bytes, received {}", TRANSFER_SIZE, report.received);
        println!("Discrepancy of {} bytes, partial image kept in {}", report.discrepancy(), config.path.display());
    }
    println!("crc32b: {} {:X}", report.crc, report.crc);
}

fn upload(config: TransferConfig, verify: bool, yes: bool) {
    use uploader::{prepare_upload, run_upload, UploaderFsm};

    let (source, len, session) = match prepare_upload(&config.path, || open_session(&config)) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("This program will transfer file {} ({} bytes) to 1 MByte of Flash memory", config.path.display(), len);
    println!("WARNING - all existing contents of Flash memory will be erased!");
    confirm(yes);

    let fsm = UploaderFsm::new(session, source, config.path.clone(), verify);
    match run_upload(fsm) {
        Ok(report) => {
            println!("Done");
            println!("Sent {} bytes from {} and {} bytes of padding", report.source_bytes, config.path.display(), report.padding_bytes);
            println!("crc32b: {} {:X}", report.crc, report.crc);
        }
        Err(e) => {
            eprintln!("Upload failed: {}", e);
            std::process::exit(1);
        }
    }
}
