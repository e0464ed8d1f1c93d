use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::codec::CodecMode;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// JSON-RPC endpoint of the ledger store.
    pub ledger_url: String,
    pub contract_address: String,
    /// Funded account for ledger writes; empty asks the store for one.
    pub account: String,
    /// Advertised spare capacity in MB.
    pub memory_mb: u16,
    pub p2p_port: u16,
    pub discovery_port: u16,
    pub api_port: u16,
    pub poll_interval_ms: u64,
    pub capacity_codec: CodecMode,
    pub cluster_secret: String,
    /// Node identity key file; generated on first start when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger_url: "http://localhost:7545".into(),
            contract_address: "0xF3C0eb6bfc9faa44014975baA2Bf7Dc143D90c2B".into(),
            account: String::new(),
            memory_mb: 4096,
            p2p_port: 5000,
            discovery_port: 5670,
            api_port: 3000,
            poll_interval_ms: 1000,
            capacity_codec: CodecMode::Masked,
            cluster_secret: "default_insecure_secret".into(),
            secret_key_file: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("canteen.toml"))
            .merge(Json::file("canteen.json"))
            .merge(Env::prefixed("CANTEEN_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("CANTEEN_CLUSTER_SECRET_FILE") {
            config.cluster_secret = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        if config.ledger_url.is_empty() {
            return Err(anyhow::anyhow!("ledger_url must be set"));
        }
        if config.contract_address.is_empty() {
            return Err(anyhow::anyhow!("contract_address must be set"));
        }

        Ok(config)
    }
}
