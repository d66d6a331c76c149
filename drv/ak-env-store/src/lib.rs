// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent environment store.
//!
//! This keeps the bootloader environment in two copies on raw flash and
//! decides, once per boot, which copy (if either) to trust:
//!
//! - With [`Layout::Backup`], the primary copy wins whenever its CRC is good.
//!   If it is corrupt but the backup is intact, the backup is imported and
//!   written back over the primary. If neither is intact, the compiled-in
//!   defaults are used.
//! - With [`Layout::Redundant`], both copies carry a serial number and the
//!   newer intact one wins. Saves go to the other copy, so an interrupted
//!   save leaves the previous environment in place. Once the new copy is
//!   written, the old one's flags byte is cleared to [`FLAG_OBSOLETE`].
//!
//! Only a failed read or a CRC mismatch makes a copy corrupt. A copy whose
//! CRC matches is never overwritten during load, even if its contents
//! cannot be imported.
//!
//! Flash writes are erase-then-program with no atomicity in between; the
//! second copy is the only recovery mechanism.

#![cfg_attr(not(test), no_std)]

mod config;

pub use config::{
    Layout, StoreConfig, DEFAULT_ENVBK_OFFSET, DEFAULT_ENV_OFFSET,
    DEFAULT_ENV_SIZE,
};

use ak_env::{Blob, Env, EnvError};
use drv_ak_flash_api::{with_retries, Flash, FlashError};
use ringbuf::{Ringbuf, RingbufEntry};

/// Largest blob the store will handle. Anything this size imports in full.
pub const MAX_ENV_SIZE: usize = ak_env::ENV_CAPACITY;

/// Flags byte of a redundant copy that has been superseded. Live copies
/// carry a serial in `1..=255`.
pub const FLAG_OBSOLETE: u8 = 0;

/// Number of entries kept in the store's trace buffer.
pub const TRACE_DEPTH: usize = 32;

/// Which copy the live environment came from, and therefore which copy the
/// next save treats as current.
#[derive(Copy, Clone, Debug, Eq, PartialEq, counters::Count)]
pub enum EnvValid {
    /// Neither copy was intact; the defaults are in use.
    Invalid,
    Primary,
    /// The backup (or, for the redundant layout, secondary) copy.
    Backup,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    Flash(FlashError),
    Env(EnvError),
    /// The layout does not fit the device or the partitions.
    BadConfig,
}

impl From<FlashError> for StoreError {
    fn from(e: FlashError) -> Self {
        StoreError::Flash(e)
    }
}

impl From<EnvError> for StoreError {
    fn from(e: EnvError) -> Self {
        StoreError::Env(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, counters::Count)]
pub enum Trace {
    #[count(skip)]
    None,
    Loaded(#[count(children)] EnvValid),
    ReadFailed {
        offset: u32,
        err: FlashError,
    },
    BadCopy {
        offset: u32,
        err: EnvError,
    },
    /// The copy's CRC matched but its contents could not be imported.
    Unimportable {
        offset: u32,
        err: EnvError,
    },
    /// The backup was copied over the primary.
    Restored(u32),
    RestoreFailed(#[count(children)] FlashError),
    Saved {
        offset: u32,
        serial: u8,
    },
    /// The old redundant copy at this offset was marked obsolete.
    Superseded(u32),
    ExportFailed(EnvError),
    SaveFailed {
        offset: u32,
        #[count(children)]
        err: FlashError,
    },
}

macro_rules! trace {
    ($store:expr, $event:expr) => {{
        let event = $event;
        counters::Count::count(&event, &$store.counts);
        $store.trace.entry(line!() as u16, event);
    }};
}

/// One copy read back from flash.
struct StoredCopy {
    env: Env,
    serial: u8,
}

enum ReadOutcome {
    Good(StoredCopy),
    /// Unreadable, or the CRC does not match.
    Corrupt,
    /// The CRC matches, so the copy is what was written, but it does not
    /// import.
    Unimportable,
}

impl ReadOutcome {
    fn good(self) -> Option<StoredCopy> {
        match self {
            ReadOutcome::Good(copy) => Some(copy),
            ReadOutcome::Corrupt | ReadOutcome::Unimportable => None,
        }
    }
}

pub struct EnvStore<F> {
    flash: F,
    config: StoreConfig,
    defaults: Env,
    env: Env,
    state: EnvValid,
    /// Serial of the current copy, for the redundant layout.
    serial: u8,
    scratch: [u8; MAX_ENV_SIZE],
    trace: Ringbuf<Trace, TRACE_DEPTH>,
    counts: TraceCounts,
}

impl<F: Flash> EnvStore<F> {
    /// Creates a store over `flash`. Until [`EnvStore::load`] runs, the
    /// environment holds `defaults` and the state is [`EnvValid::Invalid`].
    pub fn new(
        flash: F,
        config: StoreConfig,
        defaults: Env,
    ) -> Result<Self, StoreError> {
        config.check(&flash.geometry())?;
        Ok(Self {
            flash,
            config,
            env: defaults.clone(),
            defaults,
            state: EnvValid::Invalid,
            serial: 0,
            scratch: [0; MAX_ENV_SIZE],
            trace: Ringbuf {
                last: None,
                buffer: [RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: Trace::None,
                }; TRACE_DEPTH],
            },
            counts: <Trace as counters::Count>::NEW_COUNTERS,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> EnvValid {
        self.state
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Changes made here only reach flash on the next [`EnvStore::save`].
    pub fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env.get(name)
    }

    pub fn setenv(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        self.env.set(name, value)?;
        Ok(())
    }

    /// Replaces the live environment with the defaults. Flash is untouched.
    pub fn reset_to_default(&mut self) {
        self.env = self.defaults.clone();
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_DEPTH> {
        &self.trace
    }

    pub fn counters(&self) -> &TraceCounts {
        &self.counts
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Direct access to the device. Anything written here is only seen by
    /// the store on the next [`EnvStore::load`].
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Reads the environment from flash, choosing a copy as described in the
    /// crate documentation. This never fails: when nothing usable is found,
    /// the defaults are loaded and the result is [`EnvValid::Invalid`].
    pub fn load(&mut self) -> EnvValid {
        let state = match self.config.layout {
            Layout::Backup { primary, backup } => {
                self.load_backup(primary, backup)
            }
            Layout::Redundant { primary, secondary } => {
                self.load_redundant(primary, secondary)
            }
        };
        self.state = state;
        trace!(self, Trace::Loaded(state));
        state
    }

    fn load_backup(&mut self, primary: u32, backup: u32) -> EnvValid {
        let restore = match self.read_copy(primary) {
            ReadOutcome::Good(copy) => {
                self.env = copy.env;
                return EnvValid::Primary;
            }
            ReadOutcome::Corrupt => true,
            ReadOutcome::Unimportable => false,
        };
        if let Some(copy) = self.read_copy(backup).good() {
            if restore {
                // The scratch buffer still holds the backup image.
                let [(_, size), _] = self.config.regions();
                match self.write_scratch(primary, size) {
                    Ok(()) => trace!(self, Trace::Restored(primary)),
                    Err(e) => trace!(self, Trace::RestoreFailed(e)),
                }
            }
            self.env = copy.env;
            return EnvValid::Backup;
        }
        self.env = self.defaults.clone();
        EnvValid::Invalid
    }

    fn load_redundant(&mut self, primary: u32, secondary: u32) -> EnvValid {
        let a = self.read_copy(primary).good();
        let b = self.read_copy(secondary).good();
        let (copy, state) = match (a, b) {
            (Some(a), Some(b)) => {
                if secondary_is_newer(a.serial, b.serial) {
                    (b, EnvValid::Backup)
                } else {
                    (a, EnvValid::Primary)
                }
            }
            (Some(a), None) => (a, EnvValid::Primary),
            (None, Some(b)) => (b, EnvValid::Backup),
            (None, None) => {
                self.env = self.defaults.clone();
                self.serial = 0;
                return EnvValid::Invalid;
            }
        };
        self.env = copy.env;
        self.serial = copy.serial;
        state
    }

    /// Reads and imports the copy at `offset`. A transport error counts the
    /// same as corruption.
    fn read_copy(&mut self, offset: u32) -> ReadOutcome {
        let len = self.config.env_size as usize;
        let format = self.config.format();
        let buf = &mut self.scratch[..len];
        let flash = &mut self.flash;
        if let Err(err) = with_retries(|| flash.read(offset, buf)) {
            trace!(self, Trace::ReadFailed { offset, err });
            return ReadOutcome::Corrupt;
        }

        let image = &self.scratch[..len];
        let blob = match Blob::parse(image, format).and_then(|blob| {
            blob.check()?;
            Ok(blob)
        }) {
            Ok(blob) => blob,
            Err(err) => {
                trace!(self, Trace::BadCopy { offset, err });
                return ReadOutcome::Corrupt;
            }
        };
        let serial = blob.flags.unwrap_or(0);
        match Env::from_data(blob.data) {
            Ok(env) => ReadOutcome::Good(StoredCopy { env, serial }),
            Err(err) => {
                trace!(self, Trace::Unimportable { offset, err });
                ReadOutcome::Unimportable
            }
        }
    }

    /// Erases the `size`-byte partition at `offset` and programs the scratch
    /// image into its start.
    fn write_scratch(
        &mut self,
        offset: u32,
        size: u32,
    ) -> Result<(), FlashError> {
        let len = self.config.env_size as usize;
        let flash = &mut self.flash;
        let image = &self.scratch[..len];
        with_retries(|| flash.erase(offset, size))?;
        with_retries(|| flash.program(offset, image))
    }

    /// Clears the flags byte of the redundant copy at `offset`. Programming
    /// only clears bits, so no erase is needed.
    fn mark_obsolete(&mut self, offset: u32) -> Result<(), FlashError> {
        let flash = &mut self.flash;
        with_retries(|| flash.program(offset + 4, &[FLAG_OBSOLETE]))
    }

    /// Writes the live environment to flash.
    ///
    /// If the environment does not fit in a blob, nothing is written and the
    /// error is returned. Flash errors are returned as-is once the transport
    /// retries are exhausted; the copy being written is then in an unknown
    /// state.
    ///
    /// With the redundant layout, a failure to mark the old copy obsolete is
    /// returned too, but the new copy is already in place and current.
    pub fn save(&mut self) -> Result<(), StoreError> {
        let len = self.config.env_size as usize;
        let format = self.config.format();
        let [(primary, primary_size), (other, other_size)] =
            self.config.regions();
        // (target, target size, serial, new state, copy to retire)
        let (target, size, serial, state, retire) = match self.config.layout {
            Layout::Backup { .. } => {
                (primary, primary_size, 0, EnvValid::Primary, None)
            }
            Layout::Redundant { .. } => {
                let serial = next_serial(self.serial);
                match self.state {
                    EnvValid::Primary => (
                        other,
                        other_size,
                        serial,
                        EnvValid::Backup,
                        Some(primary),
                    ),
                    EnvValid::Backup => (
                        primary,
                        primary_size,
                        serial,
                        EnvValid::Primary,
                        Some(other),
                    ),
                    EnvValid::Invalid => {
                        (primary, primary_size, serial, EnvValid::Primary, None)
                    }
                }
            }
        };

        if let Err(e) = self.env.export(&mut self.scratch[..len], format, serial)
        {
            trace!(self, Trace::ExportFailed(e));
            return Err(e.into());
        }

        if let Err(err) = self.write_scratch(target, size) {
            trace!(self, Trace::SaveFailed { offset: target, err });
            return Err(err.into());
        }
        trace!(self, Trace::Saved { offset: target, serial });
        self.state = state;
        self.serial = serial;

        match self.config.layout {
            Layout::Backup { .. } => {
                if let Err(err) = self.write_scratch(other, other_size) {
                    trace!(self, Trace::SaveFailed { offset: other, err });
                    return Err(err.into());
                }
                trace!(self, Trace::Saved { offset: other, serial });
            }
            Layout::Redundant { .. } => {
                if let Some(old) = retire {
                    if let Err(err) = self.mark_obsolete(old) {
                        trace!(self, Trace::SaveFailed { offset: old, err });
                        return Err(err.into());
                    }
                    trace!(self, Trace::Superseded(old));
                }
            }
        }
        Ok(())
    }
}

/// Serial for the next redundant save. Zero is reserved for
/// [`FLAG_OBSOLETE`], so 255 wraps to 1.
fn next_serial(serial: u8) -> u8 {
    match serial.wrapping_add(1) {
        FLAG_OBSOLETE => 1,
        n => n,
    }
}

/// Picks between two intact redundant copies. An obsolete copy loses to a
/// live one. Otherwise serials are compared modulo 256, so 1 is newer than
/// 255, and a tie goes to the primary.
fn secondary_is_newer(primary: u8, secondary: u8) -> bool {
    match (primary, secondary) {
        (_, FLAG_OBSOLETE) => false,
        (FLAG_OBSOLETE, _) => true,
        (a, b) => (b.wrapping_sub(a) as i8) > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ak_env::defaults::DEFAULT_ENV;
    use ak_env::Format;
    use core::sync::atomic::Ordering;
    use drv_ak_flash_api::{FlashOp, RamFlash};

    const FLASH_SIZE: usize = 0x40000 + 0x1000 * 4;

    fn store(config: StoreConfig) -> EnvStore<RamFlash<Vec<u8>>> {
        let flash = RamFlash::new(vec![0xff; FLASH_SIZE], 0x1000, 256).unwrap();
        EnvStore::new(flash, config, Env::from_pairs(DEFAULT_ENV).unwrap())
            .unwrap()
    }

    fn plant(
        s: &mut EnvStore<RamFlash<Vec<u8>>>,
        offset: u32,
        pairs: &[(&str, &str)],
        flags: u8,
    ) {
        let len = s.config().env_size as usize;
        let format = s.config().format();
        let env = Env::from_pairs(pairs).unwrap();
        let dst = &mut s.flash.as_bytes_mut()[offset as usize..][..len];
        env.export(dst, format, flags).unwrap();
    }

    fn entries(s: &EnvStore<RamFlash<Vec<u8>>>) -> Vec<Trace> {
        // Tests never log enough to wrap the buffer.
        let rb = s.trace();
        match rb.last {
            Some(last) => rb.buffer[..=last].iter().map(|e| e.payload).collect(),
            None => vec![],
        }
    }

    #[test]
    fn serial_ordering() {
        assert!(secondary_is_newer(1, 2));
        assert!(!secondary_is_newer(2, 1));
        assert!(!secondary_is_newer(7, 7));
        assert!(secondary_is_newer(255, 1));
        assert!(!secondary_is_newer(1, 255));
        assert!(secondary_is_newer(FLAG_OBSOLETE, 255));
        assert!(!secondary_is_newer(3, FLAG_OBSOLETE));
        assert!(!secondary_is_newer(FLAG_OBSOLETE, FLAG_OBSOLETE));

        assert_eq!(next_serial(0), 1);
        assert_eq!(next_serial(41), 42);
        assert_eq!(next_serial(255), 1);
    }

    #[test]
    fn blank_flash_uses_defaults() {
        let mut s = store(StoreConfig::default());
        assert_eq!(s.load(), EnvValid::Invalid);
        assert_eq!(s.getenv("baudrate"), Some("115200"));
        assert_eq!(s.counters().Loaded.Invalid.load(Ordering::Relaxed), 1);
        assert_eq!(s.counters().BadCopy.load(Ordering::Relaxed), 2);
        // Nothing gets written during a load that finds no intact copy.
        assert!(s
            .flash()
            .ops()
            .iter()
            .all(|op| matches!(op, FlashOp::Read { .. })));
    }

    #[test]
    fn primary_wins() {
        let mut s = store(StoreConfig::default());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 0);
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "backup")], 0);
        assert_eq!(s.load(), EnvValid::Primary);
        assert_eq!(s.getenv("who"), Some("primary"));
        assert_eq!(s.getenv("baudrate"), None);
        assert_eq!(entries(&s), [Trace::Loaded(EnvValid::Primary)]);
    }

    #[test]
    fn large_primary_is_imported_in_place() {
        let mut s = store(StoreConfig::default());
        let names: Vec<String> = (0..70).map(|i| format!("var{i}")).collect();
        let bootargs = "console=ttySAK0,115200 ".repeat(27);
        assert!(bootargs.len() > 600);
        let mut pairs: Vec<(&str, &str)> =
            names.iter().map(|n| (n.as_str(), "1")).collect();
        pairs.push(("bootargs", &bootargs));
        plant(&mut s, DEFAULT_ENV_OFFSET, &pairs, 0);
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "backup")], 0);
        let primary_before =
            s.flash().as_bytes()[DEFAULT_ENV_OFFSET as usize..][..0x1000]
                .to_vec();

        assert_eq!(s.load(), EnvValid::Primary);
        assert_eq!(s.env().len(), 71);
        assert_eq!(s.getenv("var69"), Some("1"));
        assert_eq!(s.getenv("bootargs"), Some(bootargs.as_str()));
        assert_eq!(s.getenv("who"), None);
        assert_eq!(
            &s.flash().as_bytes()[DEFAULT_ENV_OFFSET as usize..][..0x1000],
            &primary_before[..]
        );
        assert!(s
            .flash()
            .ops()
            .iter()
            .all(|op| matches!(op, FlashOp::Read { .. })));
    }

    #[test]
    fn unimportable_primary_is_not_overwritten() {
        let mut s = store(StoreConfig::default());
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "backup")], 0);
        // A well-formed header over data with no terminating empty entry.
        let primary = DEFAULT_ENV_OFFSET as usize;
        {
            let bytes = &mut s.flash.as_bytes_mut()[primary..][..0x1000];
            bytes[4..].fill(b'a');
            bytes[4..8].copy_from_slice(b"x=1\0");
            let crc = ak_env::crc32(&bytes[4..]);
            bytes[..4].copy_from_slice(&crc.to_le_bytes());
        }
        let primary_before =
            s.flash().as_bytes()[primary..][..0x1000].to_vec();

        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("who"), Some("backup"));
        assert_eq!(
            &s.flash().as_bytes()[primary..][..0x1000],
            &primary_before[..]
        );
        assert_eq!(s.counters().Unimportable.load(Ordering::Relaxed), 1);
        assert_eq!(s.counters().Restored.load(Ordering::Relaxed), 0);
        assert!(entries(&s).contains(&Trace::Unimportable {
            offset: DEFAULT_ENV_OFFSET,
            err: EnvError::Malformed
        }));
    }

    #[test]
    fn read_errors_count_as_corruption() {
        let mut s = store(StoreConfig::default());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 0);
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "backup")], 0);
        s.flash.fail_reads(3, FlashError::Timeout);
        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("who"), Some("backup"));
        assert_eq!(
            entries(&s)[0],
            Trace::ReadFailed {
                offset: DEFAULT_ENV_OFFSET,
                err: FlashError::Timeout
            }
        );
    }

    #[test]
    fn failed_restore_still_imports() {
        let mut s = store(StoreConfig::default());
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "backup")], 0);
        s.flash.protect(DEFAULT_ENV_OFFSET..DEFAULT_ENV_OFFSET + 0x1000);
        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("who"), Some("backup"));
        assert_eq!(
            s.counters()
                .RestoreFailed
                .WriteProtected
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn setenv_then_save_mirrors() {
        let mut s = store(StoreConfig::default());
        s.load();
        s.setenv("bootdelay", "0").unwrap();
        s.save().unwrap();
        assert_eq!(s.state(), EnvValid::Primary);

        let bytes = s.flash().as_bytes();
        let primary = &bytes[DEFAULT_ENV_OFFSET as usize..][..0x1000];
        let backup = &bytes[DEFAULT_ENVBK_OFFSET as usize..][..0x1000];
        assert_eq!(primary, backup);
        let env = Env::import(primary, Format::Single, true).unwrap();
        assert_eq!(env.get("bootdelay"), Some("0"));
    }

    #[test]
    fn oversized_env_is_not_written() {
        let mut s = store(StoreConfig::default());
        s.load();
        // Eight of these overflow a 4 KiB blob but fit the table.
        let big = "x".repeat(512);
        for i in 0..8 {
            s.setenv(&format!("big{i}"), &big).unwrap();
        }
        s.flash.clear_ops();
        assert_eq!(s.save(), Err(StoreError::Env(EnvError::TooLarge)));
        assert!(s.flash().ops().is_empty());
        assert_eq!(s.state(), EnvValid::Invalid);
        assert_eq!(s.getenv("big0"), Some(big.as_str()));
        assert_eq!(s.counters().ExportFailed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn save_surfaces_flash_errors() {
        let mut s = store(StoreConfig::default());
        s.load();
        s.flash
            .fail_erases(drv_ak_flash_api::TRANSFER_RETRIES, FlashError::Timeout);
        assert_eq!(s.save(), Err(StoreError::Flash(FlashError::Timeout)));
        assert_eq!(s.state(), EnvValid::Invalid);
        assert_eq!(
            s.counters().SaveFailed.Timeout.load(Ordering::Relaxed),
            1
        );
        // No program was attempted after the failed erase.
        assert!(!s
            .flash()
            .ops()
            .iter()
            .any(|op| matches!(op, FlashOp::Program { .. })));
    }

    #[test]
    fn redundant_alternates_copies() {
        let mut s = store(StoreConfig::default().redundant());
        assert_eq!(s.load(), EnvValid::Invalid);

        s.setenv("n", "1").unwrap();
        s.save().unwrap();
        assert_eq!(s.state(), EnvValid::Primary);

        s.setenv("n", "2").unwrap();
        s.save().unwrap();
        assert_eq!(s.state(), EnvValid::Backup);

        let bytes = s.flash().as_bytes();
        let a = Blob::parse(
            &bytes[DEFAULT_ENV_OFFSET as usize..][..0x1000],
            Format::Redundant,
        )
        .unwrap();
        let b = Blob::parse(
            &bytes[DEFAULT_ENVBK_OFFSET as usize..][..0x1000],
            Format::Redundant,
        )
        .unwrap();
        // The first save had no older copy to retire; the second one
        // marked the primary obsolete.
        assert_eq!((a.flags, b.flags), (Some(FLAG_OBSOLETE), Some(2)));
        assert!(a.is_valid());
        assert!(entries(&s).contains(&Trace::Superseded(DEFAULT_ENV_OFFSET)));

        let flash = s.into_flash();
        let mut s = EnvStore::new(
            flash,
            StoreConfig::default().redundant(),
            Env::new(),
        )
        .unwrap();
        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("n"), Some("2"));
    }

    #[test]
    fn redundant_serial_wraps() {
        let mut s = store(StoreConfig::default().redundant());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 255);
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "secondary")], 1);
        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("who"), Some("secondary"));

        s.save().unwrap();
        assert_eq!(s.state(), EnvValid::Primary);
        let bytes = s.flash().as_bytes();
        assert_eq!(bytes[DEFAULT_ENV_OFFSET as usize + 4], 2);
        assert_eq!(bytes[DEFAULT_ENVBK_OFFSET as usize + 4], FLAG_OBSOLETE);

        // From 255 the next serial skips the obsolete marker.
        let mut s = store(StoreConfig::default().redundant());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 255);
        assert_eq!(s.load(), EnvValid::Primary);
        s.save().unwrap();
        let bytes = s.flash().as_bytes();
        assert_eq!(bytes[DEFAULT_ENVBK_OFFSET as usize + 4], 1);
        assert_eq!(bytes[DEFAULT_ENV_OFFSET as usize + 4], FLAG_OBSOLETE);
    }

    #[test]
    fn obsolete_copy_loses() {
        let mut s = store(StoreConfig::default().redundant());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 200);
        plant(
            &mut s,
            DEFAULT_ENVBK_OFFSET,
            &[("who", "secondary")],
            FLAG_OBSOLETE,
        );
        assert_eq!(s.load(), EnvValid::Primary);
        assert_eq!(s.getenv("who"), Some("primary"));

        // An obsolete copy is still used when it is the only intact one.
        s.flash.as_bytes_mut()[DEFAULT_ENV_OFFSET as usize + 8] ^= 0x01;
        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("who"), Some("secondary"));
    }

    #[test]
    fn failed_obsolete_mark_keeps_new_copy() {
        let mut s = store(StoreConfig::default().redundant());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 3);
        assert_eq!(s.load(), EnvValid::Primary);
        s.setenv("who", "new").unwrap();

        // The secondary is writable; the primary's flags byte is not.
        s.flash.protect(DEFAULT_ENV_OFFSET..DEFAULT_ENV_OFFSET + 0x1000);
        assert_eq!(
            s.save(),
            Err(StoreError::Flash(FlashError::WriteProtected))
        );
        assert_eq!(s.state(), EnvValid::Backup);
        assert_eq!(
            s.counters().SaveFailed.WriteProtected.load(Ordering::Relaxed),
            1
        );

        let flash = s.into_flash();
        let mut s = EnvStore::new(
            flash,
            StoreConfig::default().redundant(),
            Env::new(),
        )
        .unwrap();
        assert_eq!(s.load(), EnvValid::Backup);
        assert_eq!(s.getenv("who"), Some("new"));
    }

    #[test]
    fn redundant_skips_corrupt_newer_copy() {
        let mut s = store(StoreConfig::default().redundant());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 4);
        plant(&mut s, DEFAULT_ENVBK_OFFSET, &[("who", "secondary")], 5);
        s.flash.as_bytes_mut()[DEFAULT_ENVBK_OFFSET as usize + 8] ^= 0x10;
        assert_eq!(s.load(), EnvValid::Primary);
        assert_eq!(s.getenv("who"), Some("primary"));

        // The corrupt copy is the one that gets overwritten next, and the
        // copy it replaces as current is retired.
        s.save().unwrap();
        assert_eq!(s.state(), EnvValid::Backup);
        let bytes = s.flash().as_bytes();
        assert_eq!(bytes[DEFAULT_ENVBK_OFFSET as usize + 4], 5);
        assert_eq!(bytes[DEFAULT_ENV_OFFSET as usize + 4], FLAG_OBSOLETE);
    }

    #[test]
    fn reset_to_default_keeps_flash() {
        let mut s = store(StoreConfig::default());
        plant(&mut s, DEFAULT_ENV_OFFSET, &[("who", "primary")], 0);
        s.load();
        s.flash.clear_ops();
        s.reset_to_default();
        assert_eq!(s.getenv("who"), None);
        assert_eq!(s.getenv("baudrate"), Some("115200"));
        assert_eq!(s.state(), EnvValid::Primary);
        assert!(s.flash().ops().is_empty());
    }

    #[test]
    fn rejects_bad_config() {
        let flash = RamFlash::new(vec![0xff; 0x10000], 0x1000, 256).unwrap();
        let r = EnvStore::new(flash, StoreConfig::default(), Env::new());
        assert!(matches!(r, Err(StoreError::BadConfig)));
    }
}
