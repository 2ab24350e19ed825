use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, ValueEnum};

use crate::broker::{BrokerConfig, delivery::MAX_RETRIES};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// Durable RocksDB store under `--data-dir`
    Rocksdb,
    /// Volatile in-process store, lost on exit
    Memory,
}

/// strand - a small partitioned message broker
#[derive(Parser, Debug, Clone)]
#[command(name = "strand", version, about)]
pub struct ServerConfig {
    /// Address the HTTP API binds to
    #[arg(long, env = "STRAND_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Directory for the RocksDB store
    #[arg(long, env = "STRAND_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "STRAND_STORAGE", value_enum, default_value = "rocksdb")]
    pub storage: StorageBackend,

    /// Delay between retry scheduler cycles
    #[arg(long, env = "STRAND_RETRY_INTERVAL_MS", default_value_t = 10_000)]
    pub retry_interval_ms: u64,

    /// Failed messages handled per retry cycle
    #[arg(long, env = "STRAND_RETRY_BATCH", default_value_t = 10)]
    pub retry_batch: usize,

    /// Delivery attempts before a message is dead-lettered
    #[arg(long, env = "STRAND_MAX_RETRIES", default_value_t = MAX_RETRIES)]
    pub max_retries: u32,

    /// Emit logs as JSON lines
    #[arg(long, env = "STRAND_LOG_JSON")]
    pub log_json: bool,
}

impl ServerConfig {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_retries: self.max_retries.max(1),
            retry_interval_ms: self.retry_interval_ms,
            retry_batch_max: self.retry_batch,
            ..BrokerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_policy() {
        let cfg = ServerConfig::parse_from(["strand"]);
        assert_eq!(cfg.storage, StorageBackend::Rocksdb);

        let broker = cfg.broker_config();
        assert_eq!(broker.max_retries, 3);
        assert_eq!(broker.retry_interval_ms, 10_000);
        assert_eq!(broker.retry_batch_max, 10);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = ServerConfig::parse_from([
            "strand",
            "--storage",
            "memory",
            "--retry-interval-ms",
            "250",
            "--max-retries",
            "5",
            "--bind",
            "127.0.0.1:9000",
        ]);
        assert_eq!(cfg.storage, StorageBackend::Memory);
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.broker_config().retry_policy().max_retries, 5);
        assert_eq!(cfg.broker_config().retry_interval_ms, 250);
    }
}
