use std::env;

use alloy::primitives::{Address, B256};
use config::{Config, File};
use engine_core::chain::ChainEndpoint;
use engine_executors::{indexer::ContractEventSubscription, options::EngineOptions};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub store: StoreBackend,
    #[serde(default)]
    pub engine: EngineOptions,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    pub signer: SignerConfig,
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub private_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub hmac_secret: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    pub id: String,
    pub chain_id: u64,
    pub address: Address,
    pub topic0: Option<B256>,
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".into(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl RelayConfig {
    pub fn chain_endpoints(&self) -> Vec<ChainEndpoint> {
        self.chains
            .iter()
            .map(|chain| ChainEndpoint {
                chain_id: chain.chain_id,
                rpc_url: chain.rpc_url.clone(),
            })
            .collect()
    }

    pub fn event_subscriptions(&self) -> Vec<ContractEventSubscription> {
        self.subscriptions
            .iter()
            .map(|subscription| ContractEventSubscription {
                id: subscription.id.clone(),
                chain_id: subscription.chain_id,
                address: subscription.address,
                topic0: subscription.topic0,
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine the current directory: {0}")]
    CurrentDir(#[from] std::io::Error),

    #[error("Failed to parse APP_ENVIRONMENT: {0}")]
    Environment(String),

    #[error(
        "Configuration error: {0}. Make sure all required fields are set correctly in your configuration files or environment variables."
    )]
    Load(#[from] config::ConfigError),
}

pub fn get_config() -> Result<RelayConfig, ConfigError> {
    let base_path = env::current_dir()?;
    let configuration_directory = base_path.join("configuration");

    // Detect the running environment
    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Environment)?;

    let environment_filename = format!("server_{}.yaml", environment.as_str());

    let config = Config::builder()
        .add_source(File::from(configuration_directory.join("server_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(
            config::Environment::with_prefix("app")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("signer.private_keys")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize::<RelayConfig>()?)
}

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local`, `development`, or `production`.",
                other
            )),
        }
    }
}
