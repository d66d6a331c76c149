// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use ak_env::Format;
use ak_mtdparts::PartitionTable;
use drv_ak_flash_api::Geometry;

use crate::{StoreError, MAX_ENV_SIZE};

/// Where the primary copy lives when the partition table has no `ENV`.
pub const DEFAULT_ENV_OFFSET: u32 = 0x37000;
/// Where the backup copy lives when the partition table has no `ENVBK`.
pub const DEFAULT_ENVBK_OFFSET: u32 = 0x38000;
pub const DEFAULT_ENV_SIZE: u32 = 0x1000;

/// How the two copies of the environment relate to each other.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// `primary` is authoritative and every save is mirrored into `backup`.
    /// Blobs carry a CRC-only header.
    Backup { primary: u32, backup: u32 },
    /// Saves alternate between the two copies, and a serial number in the
    /// header says which one is newer.
    Redundant { primary: u32, secondary: u32 },
}

impl Layout {
    pub fn format(&self) -> Format {
        match self {
            Layout::Backup { .. } => Format::Single,
            Layout::Redundant { .. } => Format::Redundant,
        }
    }

    /// Offsets of the two copies, primary first.
    pub fn offsets(&self) -> [u32; 2] {
        match *self {
            Layout::Backup { primary, backup } => [primary, backup],
            Layout::Redundant { primary, secondary } => [primary, secondary],
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoreConfig {
    /// Size of one blob, header included.
    pub env_size: u32,
    pub layout: Layout,
    /// Size of the partition holding each copy, primary first. A save
    /// erases the whole partition before programming the blob into it.
    pub part_sizes: [u32; 2],
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            env_size: DEFAULT_ENV_SIZE,
            layout: Layout::Backup {
                primary: DEFAULT_ENV_OFFSET,
                backup: DEFAULT_ENVBK_OFFSET,
            },
            part_sizes: [DEFAULT_ENV_SIZE; 2],
        }
    }
}

impl StoreConfig {
    /// Locates the `ENV` and `ENVBK` partitions in `table`, falling back to
    /// the default offsets for whichever is missing. A missing partition is
    /// taken to be one blob long, in whole [`DEFAULT_ENV_SIZE`] units.
    pub fn from_partitions(
        table: &PartitionTable,
        env_size: u32,
    ) -> Result<Self, StoreError> {
        let locate = |name: &str, default: u32| match table.find(name) {
            Some(p) if p.size < env_size => Err(StoreError::BadConfig),
            Some(p) => Ok((p.offset, p.size)),
            None => Ok((
                default,
                env_size
                    .div_ceil(DEFAULT_ENV_SIZE)
                    .saturating_mul(DEFAULT_ENV_SIZE),
            )),
        };
        let (primary, primary_size) = locate("ENV", DEFAULT_ENV_OFFSET)?;
        let (backup, backup_size) = locate("ENVBK", DEFAULT_ENVBK_OFFSET)?;
        Ok(Self {
            env_size,
            layout: Layout::Backup { primary, backup },
            part_sizes: [primary_size, backup_size],
        })
    }

    /// Switches to the serial-numbered layout over the same two regions.
    pub fn redundant(self) -> Self {
        let [primary, secondary] = self.layout.offsets();
        Self {
            layout: Layout::Redundant { primary, secondary },
            ..self
        }
    }

    pub fn format(&self) -> Format {
        self.layout.format()
    }

    /// The `(offset, size)` of the partition holding each copy, primary
    /// first.
    pub fn regions(&self) -> [(u32, u32); 2] {
        let [a, b] = self.layout.offsets();
        let [a_size, b_size] = self.part_sizes;
        [(a, a_size), (b, b_size)]
    }

    /// Checks the layout against a device.
    ///
    /// Each partition must hold a blob, cover whole erase blocks, lie on the
    /// device and not overlap the other one.
    pub fn check(&self, geometry: &Geometry) -> Result<(), StoreError> {
        let size = self.env_size as usize;
        if size <= self.format().header_len() || size > MAX_ENV_SIZE {
            return Err(StoreError::BadConfig);
        }
        let [(a, a_size), (b, b_size)] = self.regions();
        for (offset, len) in [(a, a_size), (b, b_size)] {
            if len < self.env_size {
                return Err(StoreError::BadConfig);
            }
            geometry
                .check_erase(offset, len)
                .map_err(|_| StoreError::BadConfig)?;
        }
        // Both ranges are on the device, so neither end overflows.
        if a < b + b_size && b < a + a_size {
            return Err(StoreError::BadConfig);
        }
        Ok(())
    }
}
