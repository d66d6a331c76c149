// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compiled-in environment, used when neither stored copy is valid.

/// Partition layout the environment itself lives in when the board does not
/// supply one.
pub const MTDPARTS: &str = "mtdparts=spi0.0:4K@0x37000(ENV),4K@0x38000(ENVBK)";

pub const DEFAULT_ENV: &[(&str, &str)] = &[
    ("baudrate", "115200"),
    ("bootdelay", "1"),
    ("loadaddr", "0x81000000"),
    ("fdt_addr", "0x81300000"),
    (
        "bootcmd",
        "sf probe 0; \
         sf read ${fdt_addr} DTB; \
         sf read ${loadaddr} KERNEL; \
         bootm ${loadaddr} - ${fdt_addr}",
    ),
    (
        "bootargs",
        "console=ttySAK0,115200n8 root=/dev/mtdblock4 rootfstype=squashfs \
         init=/sbin/init",
    ),
    ("mtdparts", MTDPARTS),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Env, Format};

    #[test]
    fn defaults_are_valid_and_fit() {
        let env = Env::from_pairs(DEFAULT_ENV).unwrap();
        assert_eq!(env.len(), DEFAULT_ENV.len());
        assert_eq!(env.get_ulong("baudrate", 10, 0), 115200);
        assert_eq!(env.get("mtdparts"), Some(MTDPARTS));

        let mut buf = [0u8; 4096];
        env.export(&mut buf, Format::Single, 0).unwrap();
    }
}
