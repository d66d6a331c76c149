// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bootloader environment: an in-memory table of `name=value` strings,
//! plus the codec that turns it into (and back from) the CRC-guarded blob
//! stored in flash.
//!
//! The table is fixed-capacity so that it can live in the bootloader without
//! an allocator. It is kept in the same shape as a blob's data region (sorted
//! `name=value\0` entries) and holds up to [`ENV_CAPACITY`] bytes of them, so
//! any blob of up to that size imports in full, however its bytes are split
//! between names, values and entries.

#![cfg_attr(not(test), no_std)]

use core::cmp::Ordering;

mod blob;
pub mod defaults;

pub use blob::{crc32, Blob, Format};

/// Bytes of `name=value\0` entries the table can hold. This is also the
/// largest blob a store may be configured with.
pub const ENV_CAPACITY: usize = 0x4000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnvError {
    /// Names must be non-empty and contain neither `=` nor NUL.
    BadName,
    /// Values must not contain NUL.
    BadValue,
    /// The entries would exceed [`ENV_CAPACITY`].
    TableFull,
    /// The exported environment does not fit in the blob.
    TooLarge,
    /// The buffer is too small to hold a header and any data.
    Truncated,
    /// The stored CRC does not match the data.
    BadCrc,
    /// An entry without `=`, or data without a terminating empty entry.
    Malformed,
    BadUtf8,
}

/// The live environment table.
///
/// Entries are stored sorted by name with no duplicates, so two tables with
/// the same variables have the same bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Env {
    data: heapless::Vec<u8, ENV_CAPACITY>,
}

/// One stored entry and where its bytes sit in `Env::data`.
struct Entry<'a> {
    start: usize,
    end: usize,
    name: &'a str,
    value: &'a str,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from a list of `(name, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self, EnvError> {
        let mut env = Self::new();
        for (name, value) in pairs {
            env.set(name, value)?;
        }
        Ok(env)
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes used by the entries, not counting the blob terminator.
    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries().find(|e| e.name == name).map(|e| e.value)
    }

    /// Reads `name` as an unsigned number in `base`, the way U-Boot's
    /// `env_get_ulong` does: leading digits are converted and anything after
    /// them is ignored. A base of 0 picks 16 for `0x` prefixes, 8 for a
    /// leading `0`, and 10 otherwise. Returns `default` only if the variable
    /// is unset.
    pub fn get_ulong(&self, name: &str, base: u32, default: u64) -> u64 {
        match self.get(name) {
            Some(v) => parse_ulong(v, base),
            None => default,
        }
    }

    /// Sets `name` to `value`. As in U-Boot, an empty value deletes the
    /// variable. On error the table is unchanged.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), EnvError> {
        check_name(name)?;
        if value.is_empty() {
            self.remove(name);
            return Ok(());
        }
        if value.contains('\0') {
            return Err(EnvError::BadValue);
        }

        let needed = name.len() + 1 + value.len() + 1;
        let slot = self.locate(name);
        let replaced = match slot {
            Ok((start, end)) => end - start,
            Err(_) => 0,
        };
        if self.data.len() - replaced + needed > ENV_CAPACITY {
            return Err(EnvError::TableFull);
        }

        let at = match slot {
            Ok((start, end)) => {
                self.cut(start, end);
                start
            }
            Err(at) => at,
        };
        self.splice(at, &[name.as_bytes(), b"=", value.as_bytes(), b"\0"])
    }

    /// Deletes `name`, returning whether it was set.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.locate(name) {
            Ok((start, end)) => {
                self.cut(start, end);
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Replaces the whole table with `pairs`. On error the table is left as
    /// it was.
    pub fn reset_to(&mut self, pairs: &[(&str, &str)]) -> Result<(), EnvError> {
        *self = Self::from_pairs(pairs)?;
        Ok(())
    }

    /// Iterates over all variables, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries().map(|e| (e.name, e.value))
    }

    /// Applies `name=value` lines, in the format accepted by `mkenvimage`
    /// and `env import -t`.
    ///
    /// Blank lines and lines starting with `#` are skipped, and `name=`
    /// deletes `name`. Either every line is applied or, on error, none are.
    pub fn import_text(&mut self, text: &str) -> Result<(), EnvError> {
        let mut next = self.clone();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, value) =
                line.split_once('=').ok_or(EnvError::Malformed)?;
            next.set(name, value)?;
        }
        *self = next;
        Ok(())
    }

    /// Serializes the table into `buf`, which must be exactly one blob
    /// long. `flags` is only stored for [`Format::Redundant`].
    pub fn export(
        &self,
        buf: &mut [u8],
        format: Format,
        flags: u8,
    ) -> Result<(), EnvError> {
        blob::export(self, buf, format, flags)
    }

    /// Parses a blob, optionally verifying its CRC first.
    pub fn import(
        buf: &[u8],
        format: Format,
        check: bool,
    ) -> Result<Self, EnvError> {
        let blob = Blob::parse(buf, format)?;
        if check {
            blob.check()?;
        }
        Self::from_data(blob.data)
    }

    /// Parses the data region of a blob: `name=value` entries separated by
    /// NUL and terminated by an empty entry.
    pub fn from_data(data: &[u8]) -> Result<Self, EnvError> {
        let mut env = Self::new();
        let mut rest = data;
        loop {
            let end = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(EnvError::Malformed)?;
            if end == 0 {
                return Ok(env);
            }
            let entry = core::str::from_utf8(&rest[..end])
                .map_err(|_| EnvError::BadUtf8)?;
            let (name, value) =
                entry.split_once('=').ok_or(EnvError::Malformed)?;
            env.set(name, value)?;
            rest = &rest[end + 1..];
        }
    }

    /// The stored entries, in blob order.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn entries(&self) -> impl Iterator<Item = Entry<'_>> + '_ {
        let data: &[u8] = &self.data;
        let mut start = 0;
        core::iter::from_fn(move || {
            let rest = data.get(start..)?;
            let len = rest.iter().position(|&b| b == 0)?;
            let text = core::str::from_utf8(&rest[..len]).ok()?;
            let (name, value) = text.split_once('=')?;
            let entry = Entry {
                start,
                end: start + len + 1,
                name,
                value,
            };
            start = entry.end;
            Some(entry)
        })
    }

    /// Finds `name`, returning its byte range, or else the offset where it
    /// would be inserted to keep the entries sorted.
    fn locate(&self, name: &str) -> Result<(usize, usize), usize> {
        for e in self.entries() {
            match e.name.cmp(name) {
                Ordering::Less => continue,
                Ordering::Equal => return Ok((e.start, e.end)),
                Ordering::Greater => return Err(e.start),
            }
        }
        Err(self.data.len())
    }

    fn cut(&mut self, start: usize, end: usize) {
        let len = self.data.len();
        self.data.copy_within(end..len, start);
        self.data.truncate(len - (end - start));
    }

    fn splice(&mut self, at: usize, parts: &[&[u8]]) -> Result<(), EnvError> {
        let n: usize = parts.iter().map(|p| p.len()).sum();
        let len = self.data.len();
        self.data
            .resize(len + n, 0)
            .map_err(|_| EnvError::TableFull)?;
        self.data.copy_within(at..len, at + n);
        let mut pos = at;
        for p in parts {
            self.data[pos..pos + p.len()].copy_from_slice(p);
            pos += p.len();
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), EnvError> {
    if name.is_empty() || name.contains(['=', '\0']) {
        return Err(EnvError::BadName);
    }
    Ok(())
}

fn parse_ulong(s: &str, base: u32) -> u64 {
    let s = s.trim_start();
    let (base, digits) = match base {
        0 => {
            if let Some(hex) =
                s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
            {
                (16, hex)
            } else if s.len() > 1 && s.starts_with('0') {
                (8, &s[1..])
            } else {
                (10, s)
            }
        }
        16 => (
            16,
            s.strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s),
        ),
        b => (b, s),
    };
    if !(2..=36).contains(&base) {
        return 0;
    }
    digits
        .chars()
        .map_while(|c| c.to_digit(base))
        .fold(0u64, |acc, d| {
            acc.wrapping_mul(u64::from(base)).wrapping_add(u64::from(d))
        })
}
