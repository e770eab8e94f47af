// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{peers::PeerId, serializers::seconds};

const BYTES_PER_MB: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChainSyncConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid chain sync configuration: {0}")]
    Invalid(String),
}

/// Tunables for chain synchronisation. Every field has a default, so a partial `[chain_sync]` table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainSyncConfig {
    /// Period of the sync loop
    #[serde(with = "seconds")]
    pub sync_cycle: Duration,
    /// Maximum number of blocks served or requested in a single Blocks message
    pub max_num_of_blocks_per_msg: u64,
    /// Maximum number of headers served in a single Headers message
    pub max_num_of_headers_per_msg: u64,
    /// Maximum number of blocks requested in one regular sync cycle
    pub max_num_of_blocks_regular_sync: u64,
    /// A reference skeleton shorter than this is a protocol violation
    pub min_size_of_sync_skeleton: usize,
    pub max_size_of_sync_skeleton: usize,
    /// Height distance between consecutive skeleton headers
    pub num_of_blocks_skeleton_gap: u64,
    /// Distance kept between the fast sync target and the reference peer's justified height
    pub fast_sync_pivot_gap: u64,
    /// Fast sync is only chosen when a peer's justified height is at least this far ahead
    pub min_gap_start_fast_sync: u64,
    pub max_num_of_parallel_fetch_blocks: usize,
    /// Downloaded blocks above this budget spill to the disk tier
    pub max_byte_of_storage_ram: usize,
    /// Upper bound of a serialised Blocks response. Half of this is used for block payloads.
    pub max_blockchain_response_size: usize,
    #[serde(with = "seconds")]
    pub require_block_timeout: Duration,
    #[serde(with = "seconds")]
    pub require_headers_timeout: Duration,
    #[serde(with = "seconds")]
    pub require_blocks_timeout: Duration,
    /// Interval at which a parallel fetch checks whether the session peer pool has been exhausted
    #[serde(with = "seconds")]
    pub check_sync_peer_num_interval: Duration,
    /// Time budget for collecting blocks when serving a GetBlocks request
    #[serde(with = "seconds")]
    pub serve_blocks_timeout: Duration,
    /// Consecutive regular sync requests that may fail to advance the local tip before the cycle is abandoned
    pub max_regular_sync_stalls: usize,
    /// Times the same height may be re-requested after an orphan result in one regular sync cycle
    pub max_regular_sync_orphan_retries: usize,
    /// Ban period for peers that sent illegal data
    #[serde(with = "seconds")]
    pub ban_period: Duration,
    /// Ban period for peers that timed out or dropped a request
    #[serde(with = "seconds")]
    pub short_ban_period: Duration,
    /// Peers that are never banned by the sync process
    pub forced_sync_peers: Vec<PeerId>,
    /// Directory of the LMDB environment backing the fast sync disk tier
    pub fast_sync_db_path: PathBuf,
    /// Map size of the fast sync LMDB environment in MB
    pub fast_sync_db_map_size_mb: usize,
}

impl Default for ChainSyncConfig {
    fn default() -> Self {
        Self {
            sync_cycle: Duration::from_secs(5),
            max_num_of_blocks_per_msg: 64,
            max_num_of_headers_per_msg: 1000,
            max_num_of_blocks_regular_sync: 128,
            min_size_of_sync_skeleton: 2,
            max_size_of_sync_skeleton: 11,
            num_of_blocks_skeleton_gap: 64,
            fast_sync_pivot_gap: 64,
            min_gap_start_fast_sync: 128,
            max_num_of_parallel_fetch_blocks: 7,
            max_byte_of_storage_ram: 800 * BYTES_PER_MB,
            max_blockchain_response_size: 22 * BYTES_PER_MB,
            require_block_timeout: Duration::from_secs(20),
            require_headers_timeout: Duration::from_secs(30),
            require_blocks_timeout: Duration::from_secs(90),
            check_sync_peer_num_interval: Duration::from_secs(5),
            serve_blocks_timeout: Duration::from_secs(9),
            max_regular_sync_stalls: 1,
            max_regular_sync_orphan_retries: 3,
            ban_period: Duration::from_secs(30 * 60),
            short_ban_period: Duration::from_secs(60),
            forced_sync_peers: Vec::new(),
            fast_sync_db_path: PathBuf::from("data/fastsync"),
            fast_sync_db_map_size_mb: 1024,
        }
    }
}

impl ChainSyncConfig {
    pub const fn main_key_prefix() -> &'static str {
        "chain_sync"
    }

    /// Load the `[chain_sync]` table from `cfg`, falling back to the defaults if it is absent.
    pub fn load_from(cfg: &config::Config) -> Result<Self, ChainSyncConfigError> {
        let sync_config = match cfg.get::<ChainSyncConfig>(Self::main_key_prefix()) {
            Ok(sync_config) => sync_config,
            Err(config::ConfigError::NotFound(_)) => Self::default(),
            Err(err) => return Err(err.into()),
        };
        sync_config.validate()?;
        Ok(sync_config)
    }

    /// The furthest a single fast sync session may advance the chain
    pub fn max_num_of_blocks_per_sync(&self) -> u64 {
        self.num_of_blocks_skeleton_gap * (self.max_size_of_sync_skeleton as u64).saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), ChainSyncConfigError> {
        if self.min_size_of_sync_skeleton < 2 {
            return Err(ChainSyncConfigError::Invalid(
                "min_size_of_sync_skeleton must be at least 2".to_string(),
            ));
        }
        if self.max_size_of_sync_skeleton < self.min_size_of_sync_skeleton {
            return Err(ChainSyncConfigError::Invalid(format!(
                "max_size_of_sync_skeleton ({}) is smaller than min_size_of_sync_skeleton ({})",
                self.max_size_of_sync_skeleton, self.min_size_of_sync_skeleton
            )));
        }
        if self.num_of_blocks_skeleton_gap == 0 {
            return Err(ChainSyncConfigError::Invalid(
                "num_of_blocks_skeleton_gap must be greater than 0".to_string(),
            ));
        }
        if self.max_num_of_blocks_per_msg == 0 || self.max_num_of_headers_per_msg == 0 {
            return Err(ChainSyncConfigError::Invalid(
                "message size limits must be greater than 0".to_string(),
            ));
        }
        if self.max_num_of_parallel_fetch_blocks == 0 {
            return Err(ChainSyncConfigError::Invalid(
                "max_num_of_parallel_fetch_blocks must be greater than 0".to_string(),
            ));
        }
        if self.max_regular_sync_stalls == 0 {
            return Err(ChainSyncConfigError::Invalid(
                "max_regular_sync_stalls must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use config::{Config, File, FileFormat};

    use super::*;

    fn load(toml: &str) -> Result<ChainSyncConfig, ChainSyncConfigError> {
        let cfg = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        ChainSyncConfig::load_from(&cfg)
    }

    #[test]
    fn it_uses_defaults_when_section_is_missing() {
        let config = load("[other]\nvalue = 1\n").unwrap();
        assert_eq!(config.sync_cycle, Duration::from_secs(5));
        assert_eq!(config.max_num_of_blocks_per_sync(), 640);
    }

    #[test]
    fn it_overrides_individual_fields() {
        let config = load(
            r#"
            [chain_sync]
            require_blocks_timeout = 10
            max_num_of_parallel_fetch_blocks = 3
            forced_sync_peers = ["alice"]
            "#,
        )
        .unwrap();
        assert_eq!(config.require_blocks_timeout, Duration::from_secs(10));
        assert_eq!(config.max_num_of_parallel_fetch_blocks, 3);
        assert_eq!(config.forced_sync_peers, vec![PeerId::from("alice")]);
        assert_eq!(config.require_block_timeout, Duration::from_secs(20));
    }

    #[test]
    fn it_rejects_invalid_skeleton_bounds() {
        let err = load("[chain_sync]\nmin_size_of_sync_skeleton = 1\n").unwrap_err();
        assert!(matches!(err, ChainSyncConfigError::Invalid(_)));
        let err = load("[chain_sync]\nmax_size_of_sync_skeleton = 1\n").unwrap_err();
        assert!(matches!(err, ChainSyncConfigError::Invalid(_)));
    }
}
