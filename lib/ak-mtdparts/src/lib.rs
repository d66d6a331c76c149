// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash partition tables, as described by an `mtdparts=` string.
//!
//! The textual form is the one shared by U-Boot and the Linux command line
//! partition parser:
//!
//! ```text
//! mtdparts=<mtd-id>:<part>[,<part>...][;<mtd-id>:<part>...]
//! <part>   := <size>[@<offset>][(<name>)][ro][lk]
//! <size>   := <num>[KMG] | - | +<num>[KMG]
//! ```
//!
//! Parsing happens in two steps. [`MtdParts::parse`] turns the string into a
//! list of [`DeviceSpec`]s, which still carry unresolved sizes and offsets.
//! [`DeviceSpec::resolve`] then lays the partitions out on a device of known
//! size and erase granularity, producing an immutable [`PartitionTable`].
//!
//! A missing offset means "immediately after the previous partition", a `-`
//! size means "the rest of the device" (and must come last), and a `+` size
//! is rounded up to the erase block size.

#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};

/// Maximum number of partitions on a single device.
pub const MAX_PARTITIONS: usize = 16;

/// Maximum number of devices in a single `mtdparts=` string.
pub const MAX_DEVICES: usize = 4;

/// Maximum length of a partition name, in bytes.
pub const NAME_LEN: usize = 16;

/// Maximum length of an mtd-id (e.g. `spi0.0`), in bytes.
pub const MTD_ID_LEN: usize = 32;

/// Smallest partition we are willing to lay out.
pub const MIN_PART_SIZE: u32 = 4096;

pub type Name = heapless::String<NAME_LEN>;
pub type MtdId = heapless::String<MTD_ID_LEN>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The string does not start with `mtdparts=`.
    MissingPrefix,
    /// A device definition has no `<mtd-id>:` in front of it.
    MissingMtdId,
    MtdIdTooLong,
    /// A device definition has no partitions.
    NoPartitions,
    BadSize,
    BadOffset,
    UnterminatedName,
    EmptyName,
    NameTooLong,
    /// Something other than `,`, `ro` or `lk` follows a partition.
    TrailingGarbage,
    TooManyPartitions,
    TooManyDevices,
    /// A `-` (remaining space) partition is followed by another partition.
    RemainingNotLast,
    /// A partition is smaller than [`MIN_PART_SIZE`].
    TooSmall,
    /// An offset or size is not a multiple of the erase block size.
    Unaligned,
    Overlap,
    /// A partition runs past the end of the device.
    OutOfBounds,
}

/// Size of a partition as written in the `mtdparts=` string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartSize {
    Fixed(u32),
    /// `+<num>`: rounded up to a whole number of erase blocks.
    RoundUp(u32),
    /// `-`: everything from the offset to the end of the device.
    Remaining,
}

/// A single partition definition before it has been laid out on a device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartSpec {
    pub name: Option<Name>,
    pub size: PartSize,
    pub offset: Option<u32>,
    pub read_only: bool,
    pub locked: bool,
}

impl PartSpec {
    /// Parses one `<size>[@<offset>][(<name>)][ro][lk]` definition.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let mut cursor = Cursor { rest: s };
        let spec = cursor.part()?;
        if !cursor.rest.is_empty() {
            return Err(ParseError::TrailingGarbage);
        }
        Ok(spec)
    }
}

/// All partition definitions for one `<mtd-id>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceSpec {
    pub mtd_id: MtdId,
    pub parts: heapless::Vec<PartSpec, MAX_PARTITIONS>,
}

/// The parsed (but not yet resolved) contents of an `mtdparts=` string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MtdParts {
    devices: heapless::Vec<DeviceSpec, MAX_DEVICES>,
}

impl MtdParts {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let body = s
            .trim()
            .strip_prefix("mtdparts=")
            .ok_or(ParseError::MissingPrefix)?;

        let mut devices = heapless::Vec::new();
        for def in body.split(';') {
            let device = DeviceSpec::parse(def)?;
            devices
                .push(device)
                .map_err(|_| ParseError::TooManyDevices)?;
        }
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    /// Looks up the definitions for `mtd_id`.
    pub fn device(&self, mtd_id: &str) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.mtd_id.as_str() == mtd_id)
    }
}

impl DeviceSpec {
    fn parse(def: &str) -> Result<Self, ParseError> {
        let (id, parts) = def.split_once(':').ok_or(ParseError::MissingMtdId)?;
        if id.is_empty() {
            return Err(ParseError::MissingMtdId);
        }
        let mut mtd_id = MtdId::new();
        mtd_id
            .push_str(id)
            .map_err(|_| ParseError::MtdIdTooLong)?;

        if parts.is_empty() {
            return Err(ParseError::NoPartitions);
        }

        let mut cursor = Cursor { rest: parts };
        let mut specs: heapless::Vec<PartSpec, MAX_PARTITIONS> =
            heapless::Vec::new();
        loop {
            if matches!(specs.last(), Some(p) if p.size == PartSize::Remaining)
            {
                return Err(ParseError::RemainingNotLast);
            }
            let spec = cursor.part()?;
            specs
                .push(spec)
                .map_err(|_| ParseError::TooManyPartitions)?;

            if cursor.rest.is_empty() {
                break;
            }
            if !cursor.eat(",") {
                return Err(ParseError::TrailingGarbage);
            }
        }

        Ok(Self {
            mtd_id,
            parts: specs,
        })
    }

    /// Lays the partitions out on a device of `device_size` bytes that
    /// erases in units of `erase_size` bytes.
    pub fn resolve(
        &self,
        device_size: u32,
        erase_size: u32,
    ) -> Result<PartitionTable, ParseError> {
        let mut table = PartitionTable {
            mtd_id: self.mtd_id.clone(),
            device_size,
            erase_size,
            parts: heapless::Vec::new(),
        };

        let mut next = 0u32;
        for (i, spec) in self.parts.iter().enumerate() {
            let offset = spec.offset.unwrap_or(next);
            let size = match spec.size {
                PartSize::Fixed(size) => size,
                PartSize::RoundUp(size) => round_up(size, erase_size)?,
                PartSize::Remaining => device_size
                    .checked_sub(offset)
                    .ok_or(ParseError::OutOfBounds)?,
            };
            let name = match &spec.name {
                Some(name) => name.clone(),
                None => default_name(i),
            };

            let part = Partition {
                name,
                offset,
                size,
                read_only: spec.read_only,
                locked: spec.locked,
            };
            table.insert(part)?;
            next = offset + size;
        }

        Ok(table)
    }
}

/// A partition laid out on a device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Partition {
    pub name: Name,
    pub offset: u32,
    pub size: u32,
    pub read_only: bool,
    pub locked: bool,
}

impl Partition {
    /// Builds a partition for a compiled-in table.
    ///
    /// Names longer than [`NAME_LEN`] are rejected.
    pub fn new(name: &str, offset: u32, size: u32) -> Result<Self, ParseError> {
        let mut n = Name::new();
        n.push_str(name).map_err(|_| ParseError::NameTooLong)?;
        Ok(Self {
            name: n,
            offset,
            size,
            read_only: false,
            locked: false,
        })
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// One past the last byte of the partition, clamped to `u32::MAX` for
    /// partitions that run off the end of the address space.
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.size)
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Validated partitions for a single device, in definition order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionTable {
    mtd_id: MtdId,
    device_size: u32,
    erase_size: u32,
    parts: heapless::Vec<Partition, MAX_PARTITIONS>,
}

impl PartitionTable {
    /// Builds a table from a compiled-in list, as the SPL does, applying the
    /// same checks as [`DeviceSpec::resolve`].
    pub fn from_fixed(
        mtd_id: &str,
        device_size: u32,
        erase_size: u32,
        parts: &[Partition],
    ) -> Result<Self, ParseError> {
        let mut id = MtdId::new();
        id.push_str(mtd_id).map_err(|_| ParseError::MtdIdTooLong)?;
        let mut table = Self {
            mtd_id: id,
            device_size,
            erase_size,
            parts: heapless::Vec::new(),
        };
        for part in parts {
            table.insert(part.clone())?;
        }
        Ok(table)
    }

    fn insert(&mut self, part: Partition) -> Result<(), ParseError> {
        if part.size < MIN_PART_SIZE {
            return Err(ParseError::TooSmall);
        }
        if self.erase_size == 0
            || part.offset % self.erase_size != 0
            || part.size % self.erase_size != 0
        {
            return Err(ParseError::Unaligned);
        }
        match part.offset.checked_add(part.size) {
            Some(end) if end <= self.device_size => (),
            _ => return Err(ParseError::OutOfBounds),
        }
        if self
            .parts
            .iter()
            .any(|p| part.offset < p.end() && p.offset < part.end())
        {
            return Err(ParseError::Overlap);
        }
        self.parts
            .push(part)
            .map_err(|_| ParseError::TooManyPartitions)
    }

    pub fn mtd_id(&self) -> &str {
        &self.mtd_id
    }

    pub fn device_size(&self) -> u32 {
        self.device_size
    }

    pub fn erase_size(&self) -> u32 {
        self.erase_size
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.iter()
    }

    /// Finds a partition by name. A missing name is not an error; callers
    /// are expected to fall back to their defaults.
    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.parts.iter().find(|p| p.name.as_str() == name)
    }

    /// Finds the partition that contains byte `offset` of the device.
    pub fn containing(&self, offset: u32) -> Option<&Partition> {
        self.parts.iter().find(|p| p.contains(offset))
    }
}

/// Formats the table back into `mtdparts=` form, always with explicit
/// offsets.
impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mtdparts={}:", self.mtd_id)?;
        for (i, p) in self.parts.iter().enumerate() {
            if i != 0 {
                f.write_char(',')?;
            }
            write_size(f, p.size)?;
            write!(f, "@0x{:x}({})", p.offset, p.name)?;
            if p.read_only {
                f.write_str("ro")?;
            }
            if p.locked {
                f.write_str("lk")?;
            }
        }
        Ok(())
    }
}

fn write_size(f: &mut fmt::Formatter<'_>, size: u32) -> fmt::Result {
    const G: u32 = 1 << 30;
    const M: u32 = 1 << 20;
    const K: u32 = 1 << 10;
    if size != 0 && size % G == 0 {
        write!(f, "{}G", size / G)
    } else if size != 0 && size % M == 0 {
        write!(f, "{}M", size / M)
    } else if size != 0 && size % K == 0 {
        write!(f, "{}K", size / K)
    } else {
        write!(f, "0x{size:x}")
    }
}

fn round_up(size: u32, erase_size: u32) -> Result<u32, ParseError> {
    if erase_size == 0 {
        return Err(ParseError::Unaligned);
    }
    size.checked_next_multiple_of(erase_size)
        .ok_or(ParseError::OutOfBounds)
}

fn default_name(index: usize) -> Name {
    let mut name = Name::new();
    // "part" plus at most two digits always fits.
    let _ = write!(name, "part{index}");
    name
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn eat(&mut self, prefix: &str) -> bool {
        match self.rest.strip_prefix(prefix) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    /// Parses a number with an optional `0x` prefix and `K`/`M`/`G`
    /// multiplier.
    fn number(&mut self) -> Option<u32> {
        let (radix, digits) = match self
            .rest
            .strip_prefix("0x")
            .or_else(|| self.rest.strip_prefix("0X"))
        {
            Some(hex) => (16, hex),
            None => (10, self.rest),
        };
        let len = digits
            .find(|c: char| !c.is_digit(radix))
            .unwrap_or(digits.len());
        if len == 0 {
            return None;
        }
        let value = u64::from_str_radix(&digits[..len], radix).ok()?;

        let mut rest = &digits[len..];
        let shift = match rest.as_bytes().first() {
            Some(b'K' | b'k') => 10,
            Some(b'M' | b'm') => 20,
            Some(b'G' | b'g') => 30,
            _ => 0,
        };
        if shift != 0 {
            rest = &rest[1..];
        }
        let value = value.checked_mul(1 << shift)?;

        self.rest = rest;
        u32::try_from(value).ok()
    }

    fn part(&mut self) -> Result<PartSpec, ParseError> {
        let size = if self.eat("-") {
            PartSize::Remaining
        } else if self.eat("+") {
            PartSize::RoundUp(self.number().ok_or(ParseError::BadSize)?)
        } else {
            PartSize::Fixed(self.number().ok_or(ParseError::BadSize)?)
        };

        let offset = if self.eat("@") {
            Some(self.number().ok_or(ParseError::BadOffset)?)
        } else {
            None
        };

        let name = if self.eat("(") {
            let end = self.rest.find(')').ok_or(ParseError::UnterminatedName)?;
            let raw = &self.rest[..end];
            if raw.is_empty() {
                return Err(ParseError::EmptyName);
            }
            let mut name = Name::new();
            name.push_str(raw).map_err(|_| ParseError::NameTooLong)?;
            self.rest = &self.rest[end + 1..];
            Some(name)
        } else {
            None
        };

        let mut read_only = false;
        let mut locked = false;
        loop {
            if self.eat("ro") {
                read_only = true;
            } else if self.eat("lk") {
                locked = true;
            } else {
                break;
            }
        }

        Ok(PartSpec {
            name,
            size,
            offset,
            read_only,
            locked,
        })
    }
}
