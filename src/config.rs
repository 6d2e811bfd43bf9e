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

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[cfg(windows)]
pub const DEFAULT_PORT: &str = "COM18";
#[cfg(not(windows))]
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_STALL_SECS: u64 = 60;
pub const DEFAULT_IMAGE: &str = "data.bin";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("baud rate must be greater than zero")]
    ZeroBaud,
    #[error("read timeout must be greater than zero")]
    ZeroTimeout,
}

/// How long a wait may go without the device saying anything.
///
/// Expressed as a count of consecutive idle reads so it behaves the same
/// against a scripted port, where a timeout costs no wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// Fail after this many consecutive reads return nothing
    IdleReads(u32),
    /// Wait forever
    Unbounded,
}

impl StallPolicy {
    pub fn from_timeouts(stall: Duration, read_timeout: Duration) -> Self {
        if stall.is_zero() {
            return StallPolicy::Unbounded;
        }
        let reads = stall.as_millis().div_ceil(read_timeout.as_millis().max(1));
        StallPolicy::IdleReads(u32::try_from(reads).unwrap_or(u32::MAX).max(1))
    }

    pub fn exceeded(&self, idle_reads: u32) -> bool {
        match self {
            StallPolicy::IdleReads(limit) => idle_reads >= *limit,
            StallPolicy::Unbounded => false,
        }
    }
}

/// Everything one transfer needs, fixed for the whole invocation
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub port: String,
    pub baud: u32,
    pub timeout: Duration,
    /// Download sink or upload source
    pub path: PathBuf,
    pub stall: StallPolicy,
}

impl TransferConfig {
    pub fn new(
        port: String,
        baud: u32,
        timeout_ms: u64,
        stall_secs: u64,
        path: PathBuf,
    ) -> Result<Self, ConfigError> {
        if baud == 0 {
            return Err(ConfigError::ZeroBaud);
        }
        if timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let timeout = Duration::from_millis(timeout_ms);
        Ok(TransferConfig {
            port,
            baud,
            timeout,
            path,
            stall: StallPolicy::from_timeouts(Duration::from_secs(stall_secs), timeout),
        })
    }
}
