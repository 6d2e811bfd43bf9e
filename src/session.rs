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

//! One open connection to the flash monitor and the handshake primitives
//! both transfer directions are built from.

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};
use crate::config::StallPolicy;
use crate::protocol::{describe, ACK, CONFIRM};
use crate::serial::SerialPort;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device went quiet while waiting for {waiting_for} ({idle_reads} reads timed out)")]
    ProtocolTimeout { waiting_for: String, idle_reads: u32 },
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    port: Box<dyn SerialPort>,
    timeout: Duration,
    stall: StallPolicy,
}

impl Session {
    pub fn new(port: Box<dyn SerialPort>, timeout: Duration, stall: StallPolicy) -> Self {
        Session { port, timeout, stall }
    }

    /// Pick a monitor menu entry and confirm it with `y`
    pub fn send_choice(&mut self, choice: u8, settle: Duration) -> Result<(), SessionError> {
        self.port.write_all(&[choice])?;
        debug!("Sent: '{}'", choice as char);
        if !settle.is_zero() {
            self.settle(settle);
        }
        self.port.write_all(&[CONFIRM])?;
        self.port.flush()?;
        debug!("Sent: '{}'", CONFIRM as char);
        Ok(())
    }

    pub fn settle(&self, delay: Duration) {
        std::thread::sleep(delay);
    }

    /// Read up to and including `\n`. Returns whatever arrived before the
    /// device went quiet for a full read timeout, which may be empty or an
    /// unterminated prompt. Once bytes are flowing the line is capped at one
    /// timeout past its first byte.
    pub fn read_line(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        let mut deadline = None;

        loop {
            if self.read_some(&mut byte, self.timeout)? == 0 {
                break;
            }
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
            let cap = *deadline.get_or_insert_with(|| Instant::now() + self.timeout);
            if Instant::now() >= cap {
                break;
            }
        }

        Ok(line)
    }

    /// Fill `buf` until it is full, the device goes quiet for a read timeout,
    /// or one timeout has passed since the first byte arrived.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let mut filled = 0;
        let mut deadline = None;

        while filled < buf.len() {
            let n = self.read_some(&mut buf[filled..], self.timeout)?;
            if n == 0 {
                break;
            }
            filled += n;
            let cap = *deadline.get_or_insert_with(|| Instant::now() + self.timeout);
            if Instant::now() >= cap {
                break;
            }
        }

        Ok(filled)
    }

    /// Discard lines until one equals `sentinel` exactly.
    /// Returns the number of lines thrown away.
    pub fn await_sentinel(&mut self, sentinel: &[u8]) -> Result<usize, SessionError> {
        let mut discarded = 0;
        self.scan_lines(&describe(sentinel), |line| {
            if line == sentinel {
                true
            } else {
                discarded += 1;
                false
            }
        })?;
        debug!("Received: \"{}\" ({} lines skipped)", describe(sentinel), discarded);
        Ok(discarded)
    }

    /// Discard lines until one starts with `prefix` and return it.
    pub fn await_line_starting_with(&mut self, prefix: &[u8]) -> Result<Vec<u8>, SessionError> {
        let line = self.scan_lines(&describe(prefix), |line| line.starts_with(prefix))?;
        debug!("Received: \"{}\"", describe(&line));
        Ok(line)
    }

    pub fn send_byte(&mut self, byte: u8) -> Result<(), SessionError> {
        self.port.write_all(&[byte])?;
        Ok(())
    }

    /// Block until the device echoes the per-byte acknowledgement.
    /// Other bytes are device chatter and are skipped.
    pub fn await_ack(&mut self) -> Result<(), SessionError> {
        let mut idle_reads = 0;
        let mut byte = [0u8; 1];

        loop {
            if self.read_some(&mut byte, self.timeout)? == 0 {
                idle_reads += 1;
                if self.stall.exceeded(idle_reads) {
                    return Err(SessionError::ProtocolTimeout {
                        waiting_for: format!("acknowledgement '{}'", ACK as char),
                        idle_reads,
                    });
                }
                continue;
            }

            if byte[0] == ACK {
                return Ok(());
            }

            trace!("Skipping 0x{:02X} while waiting for ack", byte[0]);
            idle_reads = 0;
        }
    }

    fn scan_lines<F>(&mut self, waiting_for: &str, mut matches: F) -> Result<Vec<u8>, SessionError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut idle_reads = 0;

        loop {
            let line = self.read_line()?;

            if line.is_empty() {
                idle_reads += 1;
                if self.stall.exceeded(idle_reads) {
                    return Err(SessionError::ProtocolTimeout {
                        waiting_for: format!("\"{}\"", waiting_for),
                        idle_reads,
                    });
                }
                continue;
            }

            if matches(&line) {
                return Ok(line);
            }

            trace!("Discarding: \"{}\"", describe(&line));
            idle_reads = 0;
        }
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        match self.port.read_timeout(buf, timeout) {
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
