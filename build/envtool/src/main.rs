// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side tool for bootloader environments: builds images the way
//! `mkenvimage` does, and reads or edits the environment in a flash dump the
//! way `fw_printenv`/`fw_setenv` do, using the same code as the bootloader.

use std::path::{Path, PathBuf};

use ak_env::{Env, Format};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use drv_ak_env_store::{EnvStore, EnvValid};
use drv_ak_flash_api::{RamFlash, PAGE_SIZE_BYTES};

mod config;

use config::BoardConfig;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "bootloader environment tool")]
struct Args {
    /// Board description (TOML). Without one, the built-in layout is used.
    #[clap(short, long)]
    board: Option<PathBuf>,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print the resolved partition table
    Parts,
    /// Build a single environment blob from `name=value` lines
    Mkimage {
        /// Input text, one `name=value` per line
        text: PathBuf,
        #[clap(short, long)]
        output: PathBuf,
    },
    /// Print variables from a flash dump, as the bootloader would see them
    Print {
        image: PathBuf,
        /// Variables to print; all of them if none are given
        names: Vec<String>,
    },
    /// Set (or, with an empty value, delete) variables in a flash dump
    Set {
        image: PathBuf,
        #[clap(required = true)]
        assignments: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let board = BoardConfig::load(args.board.as_deref())?;

    match args.cmd {
        Cmd::Parts => print_parts(&board),
        Cmd::Mkimage { text, output } => mkimage(&board, &text, &output),
        Cmd::Print { image, names } => print_env(&board, &image, &names),
        Cmd::Set { image, assignments } => {
            set_env(&board, &image, &assignments)
        }
    }
}

fn print_parts(board: &BoardConfig) -> Result<()> {
    for table in board.partition_tables()? {
        println!("device {} ({:#x} bytes)", table.mtd_id(), table.device_size());
        println!("  {:<16} {:>10} {:>10}  flags", "name", "offset", "size");
        for p in table.iter() {
            let mut flags = String::new();
            if p.read_only {
                flags.push_str("ro ");
            }
            if p.locked {
                flags.push_str("lk");
            }
            println!(
                "  {:<16} {:>#10x} {:>#10x}  {}",
                p.name.as_str(),
                p.offset,
                p.size,
                flags.trim_end()
            );
        }
        println!("{table}");
    }
    Ok(())
}

/// Encodes `name=value` text as one blob, laid out as the board expects.
fn build_image(board: &BoardConfig, text: &str) -> Result<Vec<u8>> {
    let mut env = Env::new();
    env.import_text(text)
        .map_err(|e| anyhow!("bad environment text: {e:?}"))?;

    let (format, flags) = if board.redundant {
        // A freshly built image is the active copy.
        (Format::Redundant, 1)
    } else {
        (Format::Single, 0)
    };
    let mut blob = vec![0u8; board.env_size as usize];
    env.export(&mut blob, format, flags)
        .map_err(|e| anyhow!("cannot encode environment: {e:?}"))?;
    Ok(blob)
}

fn mkimage(board: &BoardConfig, text: &Path, output: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(text)
        .with_context(|| format!("could not read {}", text.display()))?;
    let blob = build_image(board, &contents)?;
    std::fs::write(output, &blob)
        .with_context(|| format!("could not write {}", output.display()))?;
    Ok(())
}

fn open_store(
    board: &BoardConfig,
    image: &Path,
) -> Result<EnvStore<RamFlash<Vec<u8>>>> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("could not read {}", image.display()))?;
    if bytes.len() != board.flash_size as usize {
        bail!(
            "{} is {:#x} bytes but the board's flash is {:#x}",
            image.display(),
            bytes.len(),
            board.flash_size
        );
    }
    let flash = RamFlash::new(bytes, board.erase_size, PAGE_SIZE_BYTES)
        .map_err(|e| {
            anyhow!(
                "{} is not a whole number of {:#x}-byte blocks: {e:?}",
                image.display(),
                board.erase_size
            )
        })?;
    EnvStore::new(flash, board.store_config()?, board.defaults()?)
        .map_err(|e| anyhow!("environment does not fit the image: {e:?}"))
}

fn describe(state: EnvValid) -> &'static str {
    match state {
        EnvValid::Primary => "primary copy",
        EnvValid::Backup => "backup copy",
        EnvValid::Invalid => "defaults (no valid copy found)",
    }
}

fn print_env(board: &BoardConfig, image: &Path, names: &[String]) -> Result<()> {
    let mut store = open_store(board, image)?;
    let state = store.load();
    eprintln!("environment from {}", describe(state));

    if names.is_empty() {
        for (name, value) in store.env().iter() {
            println!("{name}={value}");
        }
        return Ok(());
    }

    let mut missing = vec![];
    for name in names {
        match store.getenv(name) {
            Some(value) => println!("{name}={value}"),
            None => missing.push(name.as_str()),
        }
    }
    if !missing.is_empty() {
        bail!("not defined: {}", missing.join(", "));
    }
    Ok(())
}

fn set_env(
    board: &BoardConfig,
    image: &Path,
    assignments: &[String],
) -> Result<()> {
    let mut store = open_store(board, image)?;
    let state = store.load();
    eprintln!("environment from {}", describe(state));

    for a in assignments {
        let Some((name, value)) = a.split_once('=') else {
            bail!("expected name=value, got {a:?}");
        };
        store
            .setenv(name, value)
            .map_err(|e| anyhow!("cannot set {name:?}: {e:?}"))?;
    }
    store
        .save()
        .map_err(|e| anyhow!("saving environment failed: {e:?}"))?;

    let flash = store.into_flash();
    std::fs::write(image, flash.as_bytes())
        .with_context(|| format!("could not write {}", image.display()))?;
    Ok(())
}
