// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API crate for raw SPI-NOR / SPI-NAND flash access.
//!
//! Everything above the SPI transport talks to the chip through the [`Flash`]
//! trait: byte-addressed reads, erase-block granular erases, and programs
//! that can only clear bits. The transport itself (register pokes, polling
//! for completion) lives behind an implementation of this trait.

#![cfg_attr(not(test), no_std)]

pub mod ram;

pub use ram::{FlashOp, RamFlash};

/// Number of attempts [`with_retries`] makes before giving up on a transient
/// transport error.
pub const TRANSFER_RETRIES: usize = 3;

/// Typical SPI-NOR sector (smallest erasable unit) size.
pub const SECTOR_SIZE_BYTES: u32 = 4096;

/// Typical SPI-NOR page (largest single program operation) size.
pub const PAGE_SIZE_BYTES: u32 = 256;

#[derive(Copy, Clone, Debug, Eq, PartialEq, counters::Count)]
pub enum FlashError {
    /// The chip did not finish the operation within its poll budget.
    Timeout,
    /// The SPI controller reported a failed transfer.
    TransferError,
    /// The range falls outside the chip.
    BadAddress,
    /// An erase was requested on a range that is not erase-block aligned.
    Unaligned,
    /// A program would need to set bits that are currently clear.
    NotErased,
    WriteProtected,
}

impl FlashError {
    /// Transport failures are worth retrying; everything else is a property
    /// of the request and will fail the same way again.
    pub fn is_transient(self) -> bool {
        matches!(self, FlashError::Timeout | FlashError::TransferError)
    }
}

/// Shape of a flash device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Total size in bytes.
    pub size: u32,
    /// Erase block size in bytes.
    pub erase_size: u32,
    /// Program page size in bytes.
    pub page_size: u32,
}

impl Geometry {
    /// Checks that `offset..offset + len` lies within the device.
    pub fn check_range(&self, offset: u32, len: usize) -> Result<(), FlashError> {
        let len = u32::try_from(len).map_err(|_| FlashError::BadAddress)?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(FlashError::BadAddress),
        }
    }

    /// Checks that `offset..offset + len` lies within the device and covers
    /// whole erase blocks.
    pub fn check_erase(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        self.check_range(offset, len as usize)?;
        if offset % self.erase_size != 0 || len % self.erase_size != 0 {
            return Err(FlashError::Unaligned);
        }
        Ok(())
    }

    /// Rounds `len` up to a whole number of erase blocks.
    pub fn erase_len(&self, len: u32) -> u32 {
        len.div_ceil(self.erase_size) * self.erase_size
    }
}

/// Raw access to a flash chip.
///
/// All operations block until the chip reports completion.
pub trait Flash {
    fn geometry(&self) -> Geometry;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erases `len` bytes starting at `offset`, leaving them all `0xff`.
    ///
    /// Both `offset` and `len` must be multiples of the erase block size.
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;

    /// Programs `data` at `offset`. Programming can only clear bits, so the
    /// target range must have been erased first.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        (**self).erase(offset, len)
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program(offset, data)
    }
}

/// Runs `op`, re-issuing it while it fails with a transient error, up to
/// [`TRANSFER_RETRIES`] attempts in total.
pub fn with_retries<T>(
    mut op: impl FnMut() -> Result<T, FlashError>,
) -> Result<T, FlashError> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < TRANSFER_RETRIES => {
                attempt += 1;
            }
            r => return r,
        }
    }
}
