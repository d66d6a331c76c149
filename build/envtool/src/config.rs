// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use ak_env::Env;
use ak_mtdparts::{MtdParts, PartitionTable};
use anyhow::{anyhow, bail, Context, Result};
use drv_ak_env_store::{StoreConfig, DEFAULT_ENV_SIZE};
use drv_ak_flash_api::SECTOR_SIZE_BYTES;
use indexmap::IndexMap;
use serde::Deserialize;

/// A board description, as found in `board.toml`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    #[serde(default = "default_mtdparts")]
    pub mtdparts: String,
    #[serde(default = "default_flash_size")]
    pub flash_size: u32,
    #[serde(default = "default_erase_size")]
    pub erase_size: u32,
    #[serde(default = "default_env_size")]
    pub env_size: u32,
    #[serde(default)]
    pub redundant: bool,
    /// Replaces the compiled-in default environment.
    #[serde(default)]
    pub default_env: Option<IndexMap<String, String>>,
}

fn default_mtdparts() -> String {
    ak_env::defaults::MTDPARTS.to_string()
}

fn default_flash_size() -> u32 {
    16 << 20
}

fn default_erase_size() -> u32 {
    SECTOR_SIZE_BYTES
}

fn default_env_size() -> u32 {
    DEFAULT_ENV_SIZE
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            mtdparts: default_mtdparts(),
            flash_size: default_flash_size(),
            erase_size: default_erase_size(),
            env_size: default_env_size(),
            redundant: false,
            default_env: None,
        }
    }
}

impl BoardConfig {
    /// Loads `path`, or the built-in board if no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("could not parse {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Resolves every device named in `mtdparts` against the board's flash
    /// geometry.
    pub fn partition_tables(&self) -> Result<Vec<PartitionTable>> {
        let parts = MtdParts::parse(&self.mtdparts)
            .map_err(|e| anyhow!("bad mtdparts {:?}: {e:?}", self.mtdparts))?;
        parts
            .devices()
            .iter()
            .map(|dev| {
                dev.resolve(self.flash_size, self.erase_size).map_err(|e| {
                    anyhow!("cannot lay out {}: {e:?}", dev.mtd_id.as_str())
                })
            })
            .collect()
    }

    /// The store layout, taken from the first device's partitions.
    pub fn store_config(&self) -> Result<StoreConfig> {
        let tables = self.partition_tables()?;
        let Some(table) = tables.first() else {
            bail!("mtdparts names no devices");
        };
        let cfg = StoreConfig::from_partitions(table, self.env_size)
            .map_err(|e| anyhow!("environment does not fit: {e:?}"))?;
        Ok(if self.redundant { cfg.redundant() } else { cfg })
    }

    pub fn defaults(&self) -> Result<Env> {
        let env = match &self.default_env {
            Some(vars) => {
                let pairs: Vec<(&str, &str)> = vars
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                Env::from_pairs(&pairs)
            }
            None => Env::from_pairs(ak_env::defaults::DEFAULT_ENV),
        };
        env.map_err(|e| anyhow!("bad default environment: {e:?}"))
    }
}
