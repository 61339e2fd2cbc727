//! Network configuration
//!
//! Everything the flow needs from the environment is gathered into
//! [`NetworkConfig`] once, at startup, and passed into constructors from there.
//! Empty variables count as unset.

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PkpPublicKey;
use crate::models::MintParams;

/// Longest session lifetime accepted from the environment (30 days)
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 86_400;
/// Furthest a minted credit may expire
pub const MAX_CREDIT_DAYS: u32 = 365;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not defined, please define it in the environment")]
    Missing(&'static str),

    #[error("{name} is invalid: {message}")]
    Invalid { name: &'static str, message: String },
}

/// Which deployment of the network to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LitNetwork {
    #[default]
    DatilDev,
    DatilTest,
    Datil,
}

impl LitNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            LitNetwork::DatilDev => "datil-dev",
            LitNetwork::DatilTest => "datil-test",
            LitNetwork::Datil => "datil",
        }
    }
}

impl std::fmt::Display for LitNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LitNetwork {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "datil-dev" => Ok(LitNetwork::DatilDev),
            "datil-test" => Ok(LitNetwork::DatilTest),
            "datil" => Ok(LitNetwork::Datil),
            _ => Err(ConfigError::Invalid {
                name: "LIT_NETWORK",
                message: format!("unknown network {}", s),
            }),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct NetworkConfig {
    /// Network to connect to
    #[arg(long, env = "LIT_NETWORK", value_enum, default_value_t = LitNetwork::DatilDev)]
    pub network: LitNetwork,

    /// Base URL of the network gateway
    #[arg(long, env = "LIT_GATEWAY_URL", default_value = "http://127.0.0.1:7470")]
    pub gateway_url: String,

    #[arg(long, env = "LIT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Reuse this capacity credit instead of minting one
    #[arg(long, env = "LIT_CAPACITY_CREDIT_TOKEN_ID")]
    pub capacity_token_id: Option<String>,

    /// PKP that actions sign with
    #[arg(long, env = "LIT_PKP_PUBLIC_KEY")]
    pub pkp_public_key: Option<String>,

    #[arg(long, env = "LIT_REQUESTS_PER_KILOSECOND", default_value_t = 10)]
    pub requests_per_kilosecond: u64,

    /// Days until the minted credit expires (at UTC midnight)
    #[arg(long, env = "LIT_CREDIT_DAYS", default_value_t = 1)]
    pub credit_days: u32,

    #[arg(long, env = "LIT_DELEGATION_USES", default_value_t = 1)]
    pub delegation_uses: u32,

    /// Session signature lifetime in seconds
    #[arg(long, env = "LIT_SESSION_TTL_SECS", default_value_t = 86_400)]
    pub session_ttl_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: LitNetwork::DatilDev,
            gateway_url: "http://127.0.0.1:7470".to_string(),
            api_key: None,
            capacity_token_id: None,
            pkp_public_key: None,
            requests_per_kilosecond: 10,
            credit_days: 1,
            delegation_uses: 1,
            session_ttl_secs: 86_400,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl NetworkConfig {
    pub fn api_key(&self) -> Option<&str> {
        non_empty(&self.api_key)
    }

    pub fn capacity_token_id(&self) -> Option<&str> {
        non_empty(&self.capacity_token_id)
    }

    pub fn pkp_public_key(&self) -> Result<Option<PkpPublicKey>, ConfigError> {
        non_empty(&self.pkp_public_key)
            .map(|key| {
                key.parse().map_err(|e: crate::identity::IdentityError| ConfigError::Invalid {
                    name: "LIT_PKP_PUBLIC_KEY",
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn mint_params(&self) -> MintParams {
        MintParams {
            requests_per_kilosecond: self.requests_per_kilosecond,
            days_until_utc_midnight_expiration: self.credit_days,
        }
    }

    /// Session lifetime, clamped to [`MAX_SESSION_TTL_SECS`]
    pub fn session_ttl(&self) -> chrono::Duration {
        let secs = self.session_ttl_secs.min(MAX_SESSION_TTL_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(&self.gateway_url).map_err(|e| ConfigError::Invalid {
            name: "LIT_GATEWAY_URL",
            message: e.to_string(),
        })?;
        if self.requests_per_kilosecond == 0 {
            return Err(ConfigError::Invalid {
                name: "LIT_REQUESTS_PER_KILOSECOND",
                message: "must be at least 1".to_string(),
            });
        }
        if self.credit_days == 0 || self.credit_days > MAX_CREDIT_DAYS {
            return Err(ConfigError::Invalid {
                name: "LIT_CREDIT_DAYS",
                message: format!("must be between 1 and {}", MAX_CREDIT_DAYS),
            });
        }
        if self.delegation_uses == 0 {
            return Err(ConfigError::Invalid {
                name: "LIT_DELEGATION_USES",
                message: "must be at least 1".to_string(),
            });
        }
        if self.session_ttl_secs == 0 || self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::Invalid {
                name: "LIT_SESSION_TTL_SECS",
                message: format!("must be between 1 and {}", MAX_SESSION_TTL_SECS),
            });
        }
        self.pkp_public_key()?;
        Ok(())
    }
}

/// Read a required secret, treating an empty value as missing
pub fn require(name: &'static str, value: Option<&str>) -> Result<String, ConfigError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(name))
}
