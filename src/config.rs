// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::service::MessageServiceConfig;

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct NodeConfig {
    /// WS endpoint of the chain node's JSON-RPC.
    pub url: String,
    /// Bearer token for the node, empty for open endpoints.
    pub token: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            url: "ws://127.0.0.1:3453/rpc/v0".to_string(),
            token: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct RpcConfig {
    pub listen: String,
    /// JWT secret, used verbatim when non-empty. When empty, a secret is
    /// generated on first use and persisted at `jwt_secret_path`.
    pub jwt_secret: String,
    /// Where the generated secret lives, so token minting and the daemon
    /// share it across separate invocations.
    pub jwt_secret_path: PathBuf,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            listen: "127.0.0.1:39812".to_string(),
            jwt_secret: String::new(),
            jwt_secret_path: PathBuf::from("messager_jwt.secret"),
        }
    }
}

impl RpcConfig {
    /// The JWT secret every invocation agrees on: the configured one, the
    /// previously persisted one, or a fresh one written out for next time.
    pub fn secret(&self) -> anyhow::Result<Vec<u8>> {
        if !self.jwt_secret.is_empty() {
            return Ok(self.jwt_secret.as_bytes().to_vec());
        }
        if self.jwt_secret_path.exists() {
            let raw = std::fs::read_to_string(&self.jwt_secret_path)?;
            return Ok(hex::decode(raw.trim())?);
        }
        let secret = crate::auth::generate_secret();
        if let Some(dir) = self.jwt_secret_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(&self.jwt_secret_path, hex::encode(&secret))?;
        Ok(secret)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct MessagerConfig {
    pub tipset_file_path: PathBuf,
    pub republish_interval_secs: u64,
}

impl Default for MessagerConfig {
    fn default() -> Self {
        MessagerConfig {
            tipset_file_path: PathBuf::from("messager_tipset.json"),
            republish_interval_secs: 30,
        }
    }
}

impl MessagerConfig {
    pub fn service_config(&self) -> MessageServiceConfig {
        MessageServiceConfig {
            tipset_file_path: self.tipset_file_path.clone(),
            republish_interval: Duration::from_secs(self.republish_interval_secs),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct DbConfig {
    /// Storage backend. Only `memory` ships in-tree; durable backends plug
    /// in behind the repository traits.
    pub backend: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            backend: "memory".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct LogConfig {
    pub default_level: String,
    pub filters: Vec<LogValue>,
}

impl LogConfig {
    pub fn to_filter_string(&self) -> String {
        let mut parts = vec![self.default_level.clone()];
        parts.extend(
            self.filters
                .iter()
                .map(|f| format!("{}={}", f.module, f.level)),
        );
        parts.join(",")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            filters: vec![
                LogValue::new("jsonrpsee", "warn"),
                LogValue::new("hyper", "warn"),
                LogValue::new("tower", "warn"),
            ],
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Hash, Debug, Clone)]
pub struct LogValue {
    pub module: String,
    pub level: String,
}

impl LogValue {
    pub fn new(module: &str, level: &str) -> Self {
        Self {
            module: module.to_string(),
            level: level.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub rpc: RpcConfig,
    pub messager: MessagerConfig,
    pub db: DbConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::Arbitrary;
    use quickcheck_macros::quickcheck;
    use tracing_subscriber::EnvFilter;

    use super::*;

    /// Partial configuration over the plain-data fields.
    #[derive(Clone, Debug)]
    struct ConfigPartial {
        node_url: String,
        node_token: String,
        listen: String,
        tipset_file_path: PathBuf,
        republish_interval_secs: u64,
    }

    impl From<ConfigPartial> for Config {
        fn from(val: ConfigPartial) -> Self {
            Config {
                node: NodeConfig {
                    url: val.node_url,
                    token: val.node_token,
                },
                rpc: RpcConfig {
                    listen: val.listen,
                    ..Default::default()
                },
                messager: MessagerConfig {
                    tipset_file_path: val.tipset_file_path,
                    republish_interval_secs: val.republish_interval_secs,
                },
                db: Default::default(),
                log: Default::default(),
            }
        }
    }

    impl Arbitrary for ConfigPartial {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            ConfigPartial {
                node_url: String::arbitrary(g),
                node_token: String::arbitrary(g),
                listen: String::arbitrary(g),
                tipset_file_path: PathBuf::arbitrary(g),
                republish_interval_secs: u64::arbitrary(g),
            }
        }
    }

    #[quickcheck]
    fn test_config_all_params_under_section(config: ConfigPartial) {
        let config = Config::from(config);
        let serialized_config =
            toml::to_string(&config).expect("could not serialize the configuration");
        assert_eq!(
            serialized_config
                .trim_start()
                .chars()
                .next()
                .expect("configuration empty"),
            '['
        )
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let decoded: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_default_log_filters() {
        let config = LogConfig::default();
        EnvFilter::builder()
            .parse(config.to_filter_string())
            .unwrap();
    }

    #[test]
    fn generated_jwt_secret_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jwt.secret");
        let config = RpcConfig {
            jwt_secret_path: path.clone(),
            ..Default::default()
        };

        let first = config.secret().unwrap();
        assert!(path.exists());
        assert_eq!(config.secret().unwrap(), first);

        // a separate invocation against the same path, e.g. token minting
        // before the daemon starts, sees the very same secret
        let other = RpcConfig {
            jwt_secret_path: path,
            ..Default::default()
        };
        assert_eq!(other.secret().unwrap(), first);
    }

    #[test]
    fn explicit_jwt_secret_wins() {
        let dir = tempfile::tempdir().unwrap();
        let config = RpcConfig {
            jwt_secret: "correct-horse".to_string(),
            jwt_secret_path: dir.path().join("jwt.secret"),
            ..Default::default()
        };
        assert_eq!(config.secret().unwrap(), b"correct-horse".to_vec());
        // nothing is written when the secret is configured inline
        assert!(!dir.path().join("jwt.secret").exists());
    }
}
