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

//! Flash monitor protocol constants

use std::time::Duration;
use crc::{Crc, CRC_32_ISO_HDLC};

/// Every transfer moves exactly this many bytes, in either direction
pub const TRANSFER_SIZE: usize = 1024 * 1024;

/// Bytes requested per read while downloading
pub const CHUNK_SIZE: usize = 128;

/// Number of chunk reads issued while downloading
pub const CHUNK_COUNT: usize = TRANSFER_SIZE / CHUNK_SIZE;

/// Menu choice - read flash and stream it to the host
pub const READ_FLASH: u8 = b'5';

/// Menu choice - erase the whole flash chip
pub const ERASE_FLASH: u8 = b'6';

/// Menu choice - write binary data received from the host into flash
pub const WRITE_FLASH: u8 = b'7';

/// Confirms the menu choice that was just sent
pub const CONFIRM: u8 = b'y';

/// Device is about to stream the flash contents
pub const SENDING: &[u8] = b"[SENDING]\r\n";

/// Device finished erasing flash
pub const FLASH_ERASED: &[u8] = b"Flash fully erased\r\n";

/// Device menu prompt (not line terminated)
pub const ENTER_CHOICE: &[u8] = b"Enter choice: ";

/// Device is ready to accept image bytes
pub const READY_FOR_DATA: &[u8] = b"*** Ready for binary data ***\r\n";

/// Device consumed one image byte
pub const ACK: u8 = b'.';

/// Filler written after the end of a short source image
pub const PAD: u8 = 0xFF;

/// Prefix of the line the device prints after a write, `crc32b: <dec> <HEX>`
pub const CRC_REPORT: &[u8] = b"crc32b: ";

/// Delay between the read-flash choice and its confirmation
pub const DOWNLOAD_SETTLE: Duration = Duration::from_millis(100);

/// Delay after the menu prompt before selecting write-flash
pub const UPLOAD_SETTLE: Duration = Duration::from_millis(500);

/// Same CRC-32 the device firmware computes over written bytes
pub static IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Render a sentinel for log output, escaping CR/LF
pub fn describe(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}
