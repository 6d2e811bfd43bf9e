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
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use crc::Digest;
use thiserror::Error;
use tracing::{debug, info, warn};
use crate::progress::Progress;
use crate::protocol::*;
use crate::session::{Session, SessionError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{source} (in state: {state})")]
    Session {
        state: &'static str,
        #[source]
        source: SessionError,
    },

    #[error("cannot read {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device sent an unreadable crc report: \"{0}\"")]
    MalformedCrcReport(String),

    #[error("crc mismatch: host sent 0x{host:08X}, device wrote 0x{device:08X}")]
    CrcMismatch { host: u32, device: u32 },
}

// ============================================================================
// Source Image
// ============================================================================

/// Open the image to upload. Runs before the serial port is touched.
pub fn open_source(path: &Path) -> Result<(File, u64), UploadError> {
    let source_error = |e| UploadError::Source { path: path.to_path_buf(), source: e };

    let file = File::open(path).map_err(source_error)?;
    let metadata = file.metadata().map_err(source_error)?;

    // Directories open fine on unix; the first read would fail after the erase
    if !metadata.is_file() {
        return Err(source_error(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    let len = metadata.len();

    if len > TRANSFER_SIZE as u64 {
        warn!(
            "{} is {} bytes; only the first {} will be written, {} bytes are dropped",
            path.display(),
            len,
            TRANSFER_SIZE,
            len - TRANSFER_SIZE as u64
        );
    }

    Ok((file, len))
}

/// Check the image, and only then open the device session with `open_session`
pub fn prepare_upload<T, F>(path: &Path, open_session: F) -> Result<(File, u64, T), UploadError>
where
    F: FnOnce() -> T,
{
    let (file, len) = open_source(path)?;
    Ok((file, len, open_session()))
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub source_bytes: usize,
    pub padding_bytes: usize,
    pub crc: u32,
    /// Only filled in when the device report was requested
    pub device_crc: Option<u32>,
}

// ============================================================================
// States
// ============================================================================

pub struct EraseFlash;
pub struct AwaitErased;
pub struct AwaitMenu;
pub struct SelectWriteFlash;
pub struct AwaitReady;
pub struct SendImage;
pub struct Finish;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct UploaderFsm<State> {
    state: PhantomData<State>,
    session: Session,
    source_path: PathBuf,
    source: BufReader<File>,
    at_eof: bool,
    source_bytes: usize,
    padding_bytes: usize,
    crc: Digest<'static, u32>,
    progress: Progress,
    verify: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub enum UploadStep {
    Next(Box<dyn UploaderState>),
    Done(UploadReport),
}

pub trait UploaderState: Send {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S: Send + 'static> UploaderFsm<S> {
    fn transition<T: Send + 'static>(self) -> UploadStep
    where
        UploaderFsm<T>: UploaderState,
    {
        UploadStep::Next(Box::new(UploaderFsm::<T> {
            state: PhantomData,
            session: self.session,
            source_path: self.source_path,
            source: self.source,
            at_eof: self.at_eof,
            source_bytes: self.source_bytes,
            padding_bytes: self.padding_bytes,
            crc: self.crc,
            progress: self.progress,
            verify: self.verify,
        }))
    }

    fn session_error(e: SessionError) -> UploadError {
        let type_name = std::any::type_name::<S>();
        let state = type_name.split("::").last().unwrap_or(type_name);
        UploadError::Session { state, source: e }
    }

    fn sent(&self) -> usize {
        self.source_bytes + self.padding_bytes
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl UploaderState for UploaderFsm<EraseFlash> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;
        println!("Erasing Flash memory...");
        fsm.session.send_choice(ERASE_FLASH, std::time::Duration::ZERO).map_err(Self::session_error)?;
        Ok(fsm.transition::<AwaitErased>())
    }
}

impl UploaderState for UploaderFsm<AwaitErased> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;
        fsm.session.await_sentinel(FLASH_ERASED).map_err(Self::session_error)?;
        info!("Flash erased");
        Ok(fsm.transition::<AwaitMenu>())
    }
}

impl UploaderState for UploaderFsm<AwaitMenu> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;
        fsm.session.await_sentinel(ENTER_CHOICE).map_err(Self::session_error)?;
        Ok(fsm.transition::<SelectWriteFlash>())
    }
}

impl UploaderState for UploaderFsm<SelectWriteFlash> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;
        fsm.session.settle(UPLOAD_SETTLE);
        println!("Preparing to write to Flash...");
        fsm.session.send_choice(WRITE_FLASH, std::time::Duration::ZERO).map_err(Self::session_error)?;
        Ok(fsm.transition::<AwaitReady>())
    }
}

impl UploaderState for UploaderFsm<AwaitReady> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;
        fsm.session.await_sentinel(READY_FOR_DATA).map_err(Self::session_error)?;
        println!("Sending, this will take several minutes...");
        Ok(fsm.transition::<SendImage>())
    }
}

impl UploaderState for UploaderFsm<SendImage> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;

        let byte = if fsm.at_eof {
            PAD
        } else {
            let mut buf = [0u8; 1];
            let n = fsm.source.read(&mut buf).map_err(|e| UploadError::Source {
                path: fsm.source_path.clone(),
                source: e,
            })?;
            if n == 0 {
                debug!("End of source after {} bytes", fsm.source_bytes);
                fsm.at_eof = true;
                println!("Sending padding...");
                PAD
            } else {
                buf[0]
            }
        };

        // One byte out, one ack in
        fsm.session.send_byte(byte).map_err(Self::session_error)?;
        fsm.session.await_ack().map_err(Self::session_error)?;

        if fsm.at_eof {
            fsm.padding_bytes += 1;
        } else {
            fsm.source_bytes += 1;
        }
        fsm.crc.update(&[byte]);
        fsm.progress.tick(fsm.sent());

        if fsm.sent() == TRANSFER_SIZE {
            Ok(fsm.transition::<Finish>())
        } else {
            Ok(UploadStep::Next(Box::new(fsm)))
        }
    }
}

impl UploaderState for UploaderFsm<Finish> {
    fn step(self: Box<Self>) -> Result<UploadStep, UploadError> {
        let mut fsm = *self;
        fsm.progress.finish();

        let crc = fsm.crc.finalize();
        info!(
            "Sent {} source bytes and {} padding bytes, crc32b 0x{:08X}",
            fsm.source_bytes, fsm.padding_bytes, crc
        );

        let device_crc = if fsm.verify {
            let line = fsm.session.await_line_starting_with(CRC_REPORT).map_err(Self::session_error)?;
            let device = parse_crc_report(&line)?;
            if device != crc {
                return Err(UploadError::CrcMismatch { host: crc, device });
            }
            info!("Device crc32b matches");
            Some(device)
        } else {
            None
        };

        Ok(UploadStep::Done(UploadReport {
            source_bytes: fsm.source_bytes,
            padding_bytes: fsm.padding_bytes,
            crc,
            device_crc,
        }))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl UploaderFsm<EraseFlash> {
    pub fn new(session: Session, source: File, source_path: PathBuf, verify: bool) -> Box<dyn UploaderState> {
        Box::new(UploaderFsm {
            state: PhantomData::<EraseFlash>,
            session,
            source_path,
            source: BufReader::new(source),
            at_eof: false,
            source_bytes: 0,
            padding_bytes: 0,
            crc: IMAGE_CRC.digest(),
            progress: Progress::new(10240),
            verify,
        })
    }
}

pub fn run_upload(mut fsm: Box<dyn UploaderState>) -> Result<UploadReport, UploadError> {
    loop {
        match fsm.step()? {
            UploadStep::Next(next) => fsm = next,
            UploadStep::Done(report) => return Ok(report),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Pull the decimal value out of `crc32b: <dec> <HEX>\r\n`
fn parse_crc_report(line: &[u8]) -> Result<u32, UploadError> {
    line.strip_prefix(CRC_REPORT)
        .map(String::from_utf8_lossy)
        .and_then(|rest| rest.split_whitespace().next().and_then(|dec| dec.parse::<u32>().ok()))
        .ok_or_else(|| UploadError::MalformedCrcReport(describe(line)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use crate::config::StallPolicy;
    use crate::serial::{script, MockSerialPort, SerialPort};

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 + i / 509) as u8).collect()
    }

    fn handshake() -> Vec<Option<u8>> {
        let mut responses = script(b"Erasing flash, please wait\r\n");
        responses.push(None);
        responses.extend(script(FLASH_ERASED));
        responses.extend(script(b"\r\n1. Read ID\r\n"));
        responses.extend(script(ENTER_CHOICE));
        responses.push(None);
        responses.extend(script(b"7\r\n"));
        responses.extend(script(READY_FOR_DATA));
        responses
    }

    fn commands() -> Vec<u8> {
        vec![ERASE_FLASH, CONFIRM, WRITE_FLASH, CONFIRM]
    }

    fn source_file(dir: &tempfile::TempDir, content: &[u8]) -> PathBuf {
        let path = dir.path().join("image.bin");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn upload(port: Box<dyn SerialPort>, path: &Path, verify: bool) -> Result<UploadReport, UploadError> {
        let (file, _) = open_source(path)?;
        let session = Session::new(port, Duration::from_secs(1), StallPolicy::IdleReads(3));
        run_upload(UploaderFsm::new(session, file, path.to_path_buf(), verify))
    }

    /// Upload `content` against a scripted port and check every byte on the wire
    fn upload_scripted(content: &[u8]) -> UploadReport {
        let dir = tempfile::tempdir().unwrap();
        let path = source_file(&dir, content);

        let sent = content.len().min(TRANSFER_SIZE);
        let mut expected_writes = commands();
        expected_writes.extend_from_slice(&content[..sent]);
        expected_writes.resize(commands().len() + TRANSFER_SIZE, PAD);

        let mut responses = handshake();
        responses.extend(std::iter::repeat(Some(ACK)).take(TRANSFER_SIZE));

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        upload(mock, &path, false).unwrap()
    }

    // ------------------------------------------------------------------------
    // Simulated device that enforces one ack per byte
    // ------------------------------------------------------------------------

    struct SimulatedFlash {
        output: VecDeque<Option<u8>>,
        commands: Vec<u8>,
        flash: Vec<u8>,
        pending_ack: bool,
        corrupt_report: bool,
    }

    impl SimulatedFlash {
        fn new(corrupt_report: bool) -> Self {
            SimulatedFlash {
                output: handshake().into(),
                commands: Vec::new(),
                flash: Vec::new(),
                pending_ack: false,
                corrupt_report,
            }
        }
    }

    impl SerialPort for SimulatedFlash {
        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            for &byte in buf {
                if self.commands.len() < commands().len() {
                    self.commands.push(byte);
                    continue;
                }

                assert!(!self.pending_ack, "byte {} sent before the previous ack", self.flash.len());
                self.flash.push(byte);
                self.pending_ack = true;

                if self.flash.len() == TRANSFER_SIZE {
                    let mut crc = IMAGE_CRC.checksum(&self.flash);
                    if self.corrupt_report {
                        crc ^= 1;
                    }
                    let report = format!("Total written: {} bytes\r\ncrc32b: {} {:X}\r\n", self.flash.len(), crc, crc);
                    self.output.push_back(None);
                    self.output.extend(script(report.as_bytes()));
                }
            }
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
            if self.pending_ack {
                self.pending_ack = false;
                buf[0] = ACK;
                return Ok(1);
            }

            match self.output.pop_front() {
                Some(Some(byte)) => {
                    buf[0] = byte;
                    Ok(1)
                }
                _ => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Simulated timeout")),
            }
        }
    }

    impl Drop for SimulatedFlash {
        fn drop(&mut self) {
            if std::thread::panicking() {
                return;
            }
            assert_eq!(self.commands, commands());
            assert_eq!(self.flash.len(), TRANSFER_SIZE);
        }
    }

    // ------------------------------------------------------------------------

    #[test]
    fn test_upload_small_image_is_padded() {
        let report = upload_scripted(b"Hello, flash");

        assert_eq!(report.source_bytes, 12);
        assert_eq!(report.padding_bytes, TRANSFER_SIZE - 12);
        assert_eq!(report.device_crc, None);

        let mut expected = b"Hello, flash".to_vec();
        expected.resize(TRANSFER_SIZE, PAD);
        assert_eq!(report.crc, IMAGE_CRC.checksum(&expected));
    }

    #[test]
    fn test_upload_empty_image_is_all_padding() {
        let report = upload_scripted(&[]);

        assert_eq!(report.source_bytes, 0);
        assert_eq!(report.padding_bytes, TRANSFER_SIZE);
        assert_eq!(report.crc, IMAGE_CRC.checksum(&vec![PAD; TRANSFER_SIZE]));
    }

    #[test]
    fn test_upload_full_image_has_no_padding() {
        let content = image(TRANSFER_SIZE);
        let report = upload_scripted(&content);

        assert_eq!(report.source_bytes, TRANSFER_SIZE);
        assert_eq!(report.padding_bytes, 0);
        assert_eq!(report.crc, IMAGE_CRC.checksum(&content));
    }

    #[test]
    fn test_upload_oversize_image_is_truncated() {
        let content = image(TRANSFER_SIZE + 4096);
        let report = upload_scripted(&content);

        assert_eq!(report.source_bytes, TRANSFER_SIZE);
        assert_eq!(report.padding_bytes, 0);
        assert_eq!(report.crc, IMAGE_CRC.checksum(&content[..TRANSFER_SIZE]));
    }

    #[test]
    fn test_upload_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");

        match open_source(&path) {
            Err(UploadError::Source { path: reported, source }) => {
                assert_eq!(reported, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("Expected Source error, got {:?}", other.map(|(_, len)| len)),
        }
    }

    #[test]
    fn test_upload_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();

        match open_source(dir.path()) {
            Err(UploadError::Source { path: reported, source }) => {
                assert_eq!(reported, dir.path());
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidInput);
            }
            other => panic!("Expected Source error, got {:?}", other.map(|(_, len)| len)),
        }
    }

    #[test]
    fn test_prepare_upload_bad_source_never_opens_port() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");

        for path in [missing.as_path(), dir.path()] {
            let mut opened = false;
            let result = prepare_upload(path, || opened = true);

            assert!(matches!(result, Err(UploadError::Source { .. })), "{} was accepted", path.display());
            assert!(!opened, "port opened for {}", path.display());
        }
    }

    #[test]
    fn test_prepare_upload_opens_port_after_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_file(&dir, b"abcd");

        let (_, len, session) = prepare_upload(&path, || "session").unwrap();

        assert_eq!(len, 4);
        assert_eq!(session, "session");
    }

    #[test]
    fn test_upload_waits_for_each_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_file(&dir, &image(300_000));

        let report = upload(Box::new(SimulatedFlash::new(false)), &path, false).unwrap();

        assert_eq!(report.source_bytes, 300_000);
        assert_eq!(report.padding_bytes, TRANSFER_SIZE - 300_000);
    }

    #[test]
    fn test_upload_verify_against_device_crc() {
        let dir = tempfile::tempdir().unwrap();
        let content = image(4096);
        let path = source_file(&dir, &content);

        let report = upload(Box::new(SimulatedFlash::new(false)), &path, true).unwrap();

        assert_eq!(report.device_crc, Some(report.crc));
    }

    #[test]
    fn test_upload_verify_detects_crc_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_file(&dir, &image(4096));

        match upload(Box::new(SimulatedFlash::new(true)), &path, true) {
            Err(UploadError::CrcMismatch { host, device }) => assert_eq!(host ^ 1, device),
            Err(e) => panic!("Expected CrcMismatch, got {}", e),
            Ok(report) => panic!("Expected CrcMismatch, got {:?}", report),
        }
    }

    #[test]
    fn test_upload_times_out_waiting_for_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_file(&dir, b"abcd");

        let mut responses = handshake();
        responses.extend(script(b"..."));
        responses.extend([None, None, None]);

        let mut expected_writes = commands();
        expected_writes.extend_from_slice(b"abcd");

        let mock = Box::new(MockSerialPort::new(responses, expected_writes));
        match upload(mock, &path, false) {
            Err(UploadError::Session { state, source: SessionError::ProtocolTimeout { .. } }) => {
                assert_eq!(state, "SendImage");
            }
            Err(e) => panic!("Expected ProtocolTimeout, got {}", e),
            Ok(report) => panic!("Expected ProtocolTimeout, got {:?}", report),
        }
    }

    #[test]
    fn test_upload_times_out_waiting_for_erase() {
        let dir = tempfile::tempdir().unwrap();
        let path = source_file(&dir, b"abcd");

        let mut responses = script(b"Erasing flash, please wait\r\n");
        responses.extend([None, None, None]);

        let mock = Box::new(MockSerialPort::new(responses, vec![ERASE_FLASH, CONFIRM]));
        match upload(mock, &path, false) {
            Err(UploadError::Session { state, .. }) => assert_eq!(state, "AwaitErased"),
            Err(e) => panic!("Expected ProtocolTimeout, got {}", e),
            Ok(report) => panic!("Expected ProtocolTimeout, got {:?}", report),
        }
    }

    #[test]
    fn test_parse_crc_report() {
        assert_eq!(parse_crc_report(b"crc32b: 3141592653 BB3D5B4D\r\n").unwrap(), 3_141_592_653);
        assert!(matches!(
            parse_crc_report(b"crc32b: \r\n"),
            Err(UploadError::MalformedCrcReport(_))
        ));
        assert!(matches!(
            parse_crc_report(b"crc32b: -1 FFFFFFFF\r\n"),
            Err(UploadError::MalformedCrcReport(_))
        ));
    }
}
