// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash layout of an environment blob.
//!
//! ```text
//! +--------+-------+--------------------------------------------+
//! | crc32  | flags | name=value\0 ... name=value\0 \0 | 00 ...   |
//! | 4B LE  | 1B    |                                             |
//! +--------+-------+--------------------------------------------+
//! ```
//!
//! The `flags` byte is only present in the redundant format, where it holds
//! a serial number used to pick the newer of two copies. The CRC covers the
//! entire data region, including the zero fill after the terminator.

use static_assertions::const_assert_eq;
use zerocopy::{byteorder::little_endian as le, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{Env, EnvError};

static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC-32 (the zlib polynomial) as used by U-Boot's `env` headers.
pub fn crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
struct SingleHeader {
    crc: le::U32,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
struct RedundantHeader {
    crc: le::U32,
    flags: u8,
}

const_assert_eq!(core::mem::size_of::<SingleHeader>(), 4);
const_assert_eq!(core::mem::size_of::<RedundantHeader>(), 5);

/// Which header precedes the data.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Format {
    /// CRC only.
    Single,
    /// CRC followed by a one-byte serial.
    Redundant,
}

impl Format {
    pub const fn header_len(self) -> usize {
        match self {
            Format::Single => core::mem::size_of::<SingleHeader>(),
            Format::Redundant => core::mem::size_of::<RedundantHeader>(),
        }
    }
}

/// A blob split into its header fields and data region, without any
/// validation of the contents.
#[derive(Copy, Clone, Debug)]
pub struct Blob<'a> {
    pub crc: u32,
    /// Serial byte, for [`Format::Redundant`] only.
    pub flags: Option<u8>,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> {
    pub fn parse(buf: &'a [u8], format: Format) -> Result<Self, EnvError> {
        let blob = match format {
            Format::Single => {
                let (hdr, data) = SingleHeader::read_from_prefix(buf)
                    .map_err(|_| EnvError::Truncated)?;
                Blob {
                    crc: hdr.crc.get(),
                    flags: None,
                    data,
                }
            }
            Format::Redundant => {
                let (hdr, data) = RedundantHeader::read_from_prefix(buf)
                    .map_err(|_| EnvError::Truncated)?;
                Blob {
                    crc: hdr.crc.get(),
                    flags: Some(hdr.flags),
                    data,
                }
            }
        };
        if blob.data.is_empty() {
            return Err(EnvError::Truncated);
        }
        Ok(blob)
    }

    pub fn is_valid(&self) -> bool {
        crc32(self.data) == self.crc
    }

    pub fn check(&self) -> Result<(), EnvError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(EnvError::BadCrc)
        }
    }
}

pub(crate) fn export(
    env: &Env,
    buf: &mut [u8],
    format: Format,
    flags: u8,
) -> Result<(), EnvError> {
    let header_len = format.header_len();
    if buf.len() <= header_len {
        return Err(EnvError::Truncated);
    }
    let (header, data) = buf.split_at_mut(header_len);

    // One byte is reserved for the terminating empty entry.
    let entries = env.as_bytes();
    if entries.len() + 1 > data.len() {
        return Err(EnvError::TooLarge);
    }

    data.fill(0);
    data[..entries.len()].copy_from_slice(entries);

    let crc = le::U32::new(crc32(data));
    match format {
        Format::Single => SingleHeader { crc }
            .write_to(header)
            .map_err(|_| EnvError::Truncated),
        Format::Redundant => RedundantHeader { crc, flags }
            .write_to(header)
            .map_err(|_| EnvError::Truncated),
    }
}
