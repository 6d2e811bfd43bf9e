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

use std::marker::PhantomData;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use crc::Digest;
use thiserror::Error;
use tracing::{debug, info};
use crate::progress::Progress;
use crate::protocol::*;
use crate::session::{Session, SessionError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{source} (in state: {state})")]
    Session {
        state: &'static str,
        #[source]
        source: SessionError,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub received: usize,
    pub chunks_read: usize,
    pub crc: u32,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.received == TRANSFER_SIZE
    }

    /// Bytes still missing; negative would mean the device sent too much
    pub fn discrepancy(&self) -> i64 {
        TRANSFER_SIZE as i64 - self.received as i64
    }
}

// ============================================================================
// States
// ============================================================================

pub struct SelectReadFlash;
pub struct AwaitSending;
pub struct ReceiveImage;
pub struct Finish;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct DownloaderFsm<State> {
    state: PhantomData<State>,
    session: Session,
    sink_path: PathBuf,
    sink: Option<BufWriter<File>>,
    chunk: [u8; CHUNK_SIZE],
    chunks_read: usize,
    received: usize,
    crc: Digest<'static, u32>,
    progress: Progress,
}

// ============================================================================
// Trait
// ============================================================================

pub enum DownloadStep {
    Next(Box<dyn DownloaderState>),
    Done(DownloadReport),
}

pub trait DownloaderState: Send {
    fn step(self: Box<Self>) -> Result<DownloadStep, DownloadError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S: Send + 'static> DownloaderFsm<S> {
    fn transition<T: Send + 'static>(self) -> DownloadStep
    where
        DownloaderFsm<T>: DownloaderState,
    {
        DownloadStep::Next(Box::new(DownloaderFsm::<T> {
            state: PhantomData,
            session: self.session,
            sink_path: self.sink_path,
            sink: self.sink,
            chunk: self.chunk,
            chunks_read: self.chunks_read,
            received: self.received,
            crc: self.crc,
            progress: self.progress,
        }))
    }

    fn session_error(e: SessionError) -> DownloadError {
        let type_name = std::any::type_name::<S>();
        let state = type_name.split("::").last().unwrap_or(type_name);
        DownloadError::Session { state, source: e }
    }

    fn sink_error(&self, e: std::io::Error) -> DownloadError {
        DownloadError::Sink { path: self.sink_path.clone(), source: e }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl DownloaderState for DownloaderFsm<SelectReadFlash> {
    fn step(self: Box<Self>) -> Result<DownloadStep, DownloadError> {
        let mut fsm = *self;
        fsm.session.send_choice(READ_FLASH, DOWNLOAD_SETTLE).map_err(Self::session_error)?;
        Ok(fsm.transition::<AwaitSending>())
    }
}

impl DownloaderState for DownloaderFsm<AwaitSending> {
    fn step(self: Box<Self>) -> Result<DownloadStep, DownloadError> {
        let mut fsm = *self;
        fsm.session.await_sentinel(SENDING).map_err(Self::session_error)?;

        // Only touch the sink once the device has committed to sending
        let file = File::create(&fsm.sink_path).map_err(|e| fsm.sink_error(e))?;
        fsm.sink = Some(BufWriter::new(file));
        info!("Receiving flash image into {}", fsm.sink_path.display());

        Ok(fsm.transition::<ReceiveImage>())
    }
}

impl DownloaderState for DownloaderFsm<ReceiveImage> {
    fn step(self: Box<Self>) -> Result<DownloadStep, DownloadError> {
        let mut fsm = *self;

        let wanted = CHUNK_SIZE.min(TRANSFER_SIZE - fsm.received);
        let n = fsm.session.read_chunk(&mut fsm.chunk[..wanted]).map_err(Self::session_error)?;
        if n < wanted {
            debug!("Short read: {} of {} bytes (chunk {})", n, wanted, fsm.chunks_read);
        }

        let written = match fsm.sink.as_mut() {
            Some(sink) => sink.write_all(&fsm.chunk[..n]),
            None => Ok(()),
        };
        if let Err(e) = written {
            return Err(fsm.sink_error(e));
        }
        fsm.crc.update(&fsm.chunk[..n]);
        fsm.received += n;
        fsm.progress.tick(fsm.chunks_read);
        fsm.chunks_read += 1;

        // A stalled read still spends one of the chunk reads
        if fsm.received == TRANSFER_SIZE || fsm.chunks_read == CHUNK_COUNT {
            Ok(fsm.transition::<Finish>())
        } else {
            Ok(DownloadStep::Next(Box::new(fsm)))
        }
    }
}

impl DownloaderState for DownloaderFsm<Finish> {
    fn step(self: Box<Self>) -> Result<DownloadStep, DownloadError> {
        let mut fsm = *self;
        fsm.progress.finish();

        if let Some(mut sink) = fsm.sink.take() {
            if let Err(e) = sink.flush() {
                return Err(fsm.sink_error(e));
            }
        }

        let report = DownloadReport {
            received: fsm.received,
            chunks_read: fsm.chunks_read,
            crc: fsm.crc.finalize(),
        };
        info!(
            "Received {} bytes in {} reads, crc32b 0x{:08X}",
            report.received, report.chunks_read, report.crc
        );
        Ok(DownloadStep::Done(report))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl DownloaderFsm<SelectReadFlash> {
    pub fn new(session: Session, sink_path: PathBuf) -> Box<dyn DownloaderState> {
        Box::new(DownloaderFsm {
            state: PhantomData::<SelectReadFlash>,
            session,
            sink_path,
            sink: None,
            chunk: [0; CHUNK_SIZE],
            chunks_read: 0,
            received: 0,
            crc: IMAGE_CRC.digest(),
            progress: Progress::new(100),
        })
    }
}

pub fn run_download(mut fsm: Box<dyn DownloaderState>) -> Result<DownloadReport, DownloadError> {
    loop {
        match fsm.step()? {
            DownloadStep::Next(next) => fsm = next,
            DownloadStep::Done(report) => return Ok(report),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
