// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`Flash`] backed by memory.
//!
//! This behaves like a NOR part: erase sets whole blocks to `0xff` and
//! program can only clear bits. It also keeps a log of the operations issued
//! against it and can be told to fail upcoming operations, which makes it
//! useful for exercising recovery paths and for host tools that operate on a
//! flash dump.

use core::ops::Range;

use crate::{Flash, FlashError, Geometry};

/// Number of operations [`RamFlash`] remembers. Once the log is full, newer
/// operations are only counted, in [`RamFlash::ops_dropped`], until
/// [`RamFlash::clear_ops`] is called.
pub const OP_LOG_LEN: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOp {
    Read { offset: u32, len: u32 },
    Erase { offset: u32, len: u32 },
    Program { offset: u32, len: u32 },
}

#[derive(Copy, Clone, Debug, Default)]
struct Fault {
    remaining: usize,
    error: Option<FlashError>,
}

impl Fault {
    fn take(&mut self) -> Result<(), FlashError> {
        match self.error {
            Some(e) if self.remaining > 0 => {
                self.remaining -= 1;
                Err(e)
            }
            _ => Ok(()),
        }
    }
}

pub struct RamFlash<S> {
    storage: S,
    geometry: Geometry,
    protected: Option<Range<u32>>,
    read_fault: Fault,
    erase_fault: Fault,
    program_fault: Fault,
    ops: heapless::Vec<FlashOp, OP_LOG_LEN>,
    dropped: usize,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> RamFlash<S> {
    /// Wraps `storage` as a flash device. The storage length must be a
    /// multiple of `erase_size`.
    pub fn new(
        storage: S,
        erase_size: u32,
        page_size: u32,
    ) -> Result<Self, FlashError> {
        let size = u32::try_from(storage.as_ref().len())
            .map_err(|_| FlashError::BadAddress)?;
        if erase_size == 0 || size % erase_size != 0 || page_size == 0 {
            return Err(FlashError::Unaligned);
        }
        Ok(Self {
            storage,
            geometry: Geometry {
                size,
                erase_size,
                page_size,
            },
            protected: None,
            read_fault: Fault::default(),
            erase_fault: Fault::default(),
            program_fault: Fault::default(),
            ops: heapless::Vec::new(),
            dropped: 0,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_ref()
    }

    /// Direct access to the backing memory, bypassing NOR semantics. Useful
    /// for planting images or corrupting them.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut()
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Rejects erases and programs that touch `range`.
    pub fn protect(&mut self, range: Range<u32>) {
        self.protected = Some(range);
    }

    /// Fails the next `count` reads with `error`.
    pub fn fail_reads(&mut self, count: usize, error: FlashError) {
        self.read_fault = Fault {
            remaining: count,
            error: Some(error),
        };
    }

    /// Fails the next `count` erases with `error`.
    pub fn fail_erases(&mut self, count: usize, error: FlashError) {
        self.erase_fault = Fault {
            remaining: count,
            error: Some(error),
        };
    }

    /// Fails the next `count` programs with `error`.
    pub fn fail_programs(&mut self, count: usize, error: FlashError) {
        self.program_fault = Fault {
            remaining: count,
            error: Some(error),
        };
    }

    /// Operations issued so far, including ones that failed. Only the first
    /// [`OP_LOG_LEN`] are kept; check [`RamFlash::ops_dropped`] before
    /// relying on the log being complete.
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    /// Operations issued after the log filled up.
    pub fn ops_dropped(&self) -> usize {
        self.dropped
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
        self.dropped = 0;
    }

    fn record(&mut self, op: FlashOp) {
        if self.ops.push(op).is_err() {
            self.dropped += 1;
        }
    }

    fn check_protected(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        match &self.protected {
            Some(p) if offset < p.end && p.start < offset + len => {
                Err(FlashError::WriteProtected)
            }
            _ => Ok(()),
        }
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> Flash for RamFlash<S> {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.record(FlashOp::Read {
            offset,
            len: buf.len() as u32,
        });
        self.read_fault.take()?;
        self.geometry.check_range(offset, buf.len())?;

        let start = offset as usize;
        buf.copy_from_slice(&self.storage.as_ref()[start..][..buf.len()]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        self.record(FlashOp::Erase { offset, len });
        self.erase_fault.take()?;
        self.geometry.check_erase(offset, len)?;
        self.check_protected(offset, len)?;

        let start = offset as usize;
        self.storage.as_mut()[start..][..len as usize].fill(0xff);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.record(FlashOp::Program {
            offset,
            len: data.len() as u32,
        });
        self.program_fault.take()?;
        self.geometry.check_range(offset, data.len())?;
        self.check_protected(offset, data.len() as u32)?;

        let start = offset as usize;
        let target = &mut self.storage.as_mut()[start..][..data.len()];
        if target.iter().zip(data).any(|(&old, &new)| old & new != new) {
            return Err(FlashError::NotErased);
        }
        for (old, new) in target.iter_mut().zip(data) {
            *old &= *new;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flash() -> RamFlash<Vec<u8>> {
        RamFlash::new(vec![0u8; 0x4000], 0x1000, 256).unwrap()
    }

    #[test]
    fn rejects_odd_sizes() {
        assert!(RamFlash::new(vec![0u8; 0x1800], 0x1000, 256).is_err());
        assert!(RamFlash::new([0u8; 0x2000], 0x1000, 256).is_ok());
    }

    #[test]
    fn program_requires_erase() {
        let mut f = flash();
        assert_eq!(f.program(0x1000, b"hello"), Err(FlashError::NotErased));

        f.erase(0x1000, 0x1000).unwrap();
        f.program(0x1000, b"hello").unwrap();
        let mut buf = [0u8; 5];
        f.read(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Clearing more bits is fine; setting them again is not.
        f.program(0x1000, &[0x00]).unwrap();
        assert_eq!(f.program(0x1000, &[0x01]), Err(FlashError::NotErased));
        assert_eq!(f.as_bytes()[0x1000], 0);
        assert_eq!(f.as_bytes()[0x1001], b'e');
    }

    #[test]
    fn erase_alignment_and_bounds() {
        let mut f = flash();
        assert_eq!(f.erase(0x800, 0x1000), Err(FlashError::Unaligned));
        assert_eq!(f.erase(0x3000, 0x2000), Err(FlashError::BadAddress));
        let mut buf = [0u8; 2];
        assert_eq!(f.read(0x3fff, &mut buf), Err(FlashError::BadAddress));
    }

    #[test]
    fn protected_range() {
        let mut f = flash();
        f.protect(0..0x1000);
        assert_eq!(f.erase(0, 0x1000), Err(FlashError::WriteProtected));
        assert_eq!(f.erase(0x1000, 0x1000), Ok(()));
        assert_eq!(f.program(0xfff, &[0, 0]), Err(FlashError::WriteProtected));
    }

    #[test]
    fn injected_faults_and_log() {
        let mut f = flash();
        f.fail_erases(1, FlashError::Timeout);
        assert_eq!(f.erase(0, 0x1000), Err(FlashError::Timeout));
        assert_eq!(f.erase(0, 0x1000), Ok(()));

        f.fail_programs(2, FlashError::TransferError);
        let r = crate::with_retries(|| f.program(0, &[0xaa]));
        assert_eq!(r, Ok(()));
        assert_eq!(f.as_bytes()[0], 0xaa);

        assert_eq!(
            f.ops(),
            &[
                FlashOp::Erase { offset: 0, len: 0x1000 },
                FlashOp::Erase { offset: 0, len: 0x1000 },
                FlashOp::Program { offset: 0, len: 1 },
                FlashOp::Program { offset: 0, len: 1 },
                FlashOp::Program { offset: 0, len: 1 },
            ]
        );
        f.clear_ops();
        assert!(f.ops().is_empty());
    }

    #[test]
    fn full_log_counts_dropped_ops() {
        let mut f = flash();
        let mut buf = [0u8; 1];
        for _ in 0..OP_LOG_LEN {
            f.read(0, &mut buf).unwrap();
        }
        assert_eq!(f.ops_dropped(), 0);

        f.erase(0, 0x1000).unwrap();
        f.program(0, &[0x55]).unwrap();
        assert_eq!(f.ops().len(), OP_LOG_LEN);
        assert_eq!(f.ops_dropped(), 2);
        assert!(f.ops().iter().all(|op| matches!(op, FlashOp::Read { .. })));

        f.clear_ops();
        assert_eq!(f.ops_dropped(), 0);
        f.erase(0, 0x1000).unwrap();
        assert_eq!(f.ops(), &[FlashOp::Erase { offset: 0, len: 0x1000 }]);
    }
}
