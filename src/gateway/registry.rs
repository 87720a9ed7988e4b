//! Host and transfer-recipe registry.
//!
//! A read-only table mapping host aliases to SSH endpoints and transfer
//! names to server-to-server copy recipes. Loaded once at startup from the
//! environment; lookups are O(1) and a missing entry is a domain error, not
//! a panic.
//!
//! # Environment layout
//!
//! The roster variables list the configured entries, one alias per
//! comma-separated item; each entry then has its own variable group:
//!
//! ```text
//! GATEWAY_SSH_HOSTS=mdwap1p,mypap1d
//! SSH_MDWAP1P_HOST=10.1.2.3
//! SSH_MDWAP1P_PORT=22
//! SSH_MDWAP1P_USERNAME=hiware
//! SSH_MDWAP1P_PASSWORD=...
//!
//! GATEWAY_SCP_TRANSFERS=stub_data_transfer
//! SCP_STUB_DATA_TRANSFER_SRC_ALIAS=mdwap1p
//! SCP_STUB_DATA_TRANSFER_SRC_PATH=/nbsftp/myd/myp/snd/postgresql_unload/*.dat
//! SCP_STUB_DATA_TRANSFER_DST_ALIAS=mypap1d
//! SCP_STUB_DATA_TRANSFER_DST_PATH=/shbftp/myd/myp/rcv/mock/
//! ```
//!
//! Any missing or invalid value fails startup.

use std::collections::HashMap;
use std::env;

use super::error::GatewayError;

/// Connection parameters for one configured SSH endpoint.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// A named server-to-server file copy specification.
#[derive(Debug, Clone)]
pub struct TransferRecipe {
    pub name: String,
    pub src_alias: String,
    pub src_path: String,
    pub dst_alias: String,
    pub dst_path: String,
}

/// Immutable lookup tables for hosts and transfer recipes.
#[derive(Debug)]
pub struct HostRegistry {
    hosts: HashMap<String, HostConfig>,
    transfers: HashMap<String, TransferRecipe>,
}

impl HostRegistry {
    /// Build a registry from explicit entries, validating every one.
    pub fn new(
        hosts: Vec<HostConfig>,
        transfers: Vec<TransferRecipe>,
    ) -> Result<Self, GatewayError> {
        let mut host_map = HashMap::new();
        for host in hosts {
            if host.host.is_empty() {
                return Err(GatewayError::InvalidConfig(format!(
                    "host for alias '{}' is empty",
                    host.alias
                )));
            }
            if host.port == 0 {
                return Err(GatewayError::InvalidConfig(format!(
                    "port for alias '{}' is out of range",
                    host.alias
                )));
            }
            if host.username.is_empty() {
                return Err(GatewayError::InvalidConfig(format!(
                    "username for alias '{}' is empty",
                    host.alias
                )));
            }
            let key = host.alias.to_lowercase();
            if host_map.insert(key, host).is_some() {
                return Err(GatewayError::InvalidConfig(
                    "duplicate host alias in configuration".to_string(),
                ));
            }
        }

        let mut transfer_map = HashMap::new();
        for recipe in transfers {
            for alias in [&recipe.src_alias, &recipe.dst_alias] {
                if !host_map.contains_key(&alias.to_lowercase()) {
                    return Err(GatewayError::InvalidConfig(format!(
                        "transfer '{}' references unknown alias '{}'",
                        recipe.name, alias
                    )));
                }
            }
            transfer_map.insert(recipe.name.to_lowercase(), recipe);
        }

        Ok(Self {
            hosts: host_map,
            transfers: transfer_map,
        })
    }

    /// Load the registry from the environment. Missing or malformed
    /// variables fail with a configuration error so startup can abort.
    pub fn from_env() -> Result<Self, GatewayError> {
        let aliases = roster("GATEWAY_SSH_HOSTS")?;
        let mut hosts = Vec::with_capacity(aliases.len());
        for alias in &aliases {
            let prefix = format!("SSH_{}", alias.to_uppercase());
            let port_raw = optional_var(&format!("{}_PORT", prefix));
            let port = match port_raw {
                Some(raw) => raw.parse::<u16>().map_err(|e| {
                    GatewayError::InvalidConfig(format!(
                        "invalid port for alias '{}': {}",
                        alias, e
                    ))
                })?,
                None => 22,
            };
            hosts.push(HostConfig {
                alias: alias.clone(),
                host: required_var(&format!("{}_HOST", prefix))?,
                port,
                username: required_var(&format!("{}_USERNAME", prefix))?,
                password: required_var(&format!("{}_PASSWORD", prefix))?,
            });
        }

        let names = match optional_var("GATEWAY_SCP_TRANSFERS") {
            Some(raw) => split_roster(&raw),
            None => Vec::new(),
        };
        let mut transfers = Vec::with_capacity(names.len());
        for name in &names {
            let prefix = format!("SCP_{}", name.to_uppercase());
            transfers.push(TransferRecipe {
                name: name.clone(),
                src_alias: required_var(&format!("{}_SRC_ALIAS", prefix))?,
                src_path: required_var(&format!("{}_SRC_PATH", prefix))?,
                dst_alias: required_var(&format!("{}_DST_ALIAS", prefix))?,
                dst_path: required_var(&format!("{}_DST_PATH", prefix))?,
            });
        }

        Self::new(hosts, transfers)
    }

    /// Resolve a host alias (case-insensitive).
    pub fn resolve_host(&self, alias: &str) -> Result<&HostConfig, GatewayError> {
        self.hosts
            .get(&alias.to_lowercase())
            .ok_or_else(|| GatewayError::UnknownHost(alias.to_string()))
    }

    /// Resolve a transfer recipe by name (case-insensitive).
    pub fn resolve_transfer(&self, name: &str) -> Result<&TransferRecipe, GatewayError> {
        self.transfers
            .get(&name.to_lowercase())
            .ok_or_else(|| GatewayError::UnknownTransfer(name.to_string()))
    }

    /// All configured hosts, for the health monitor.
    pub fn all_hosts(&self) -> Vec<HostConfig> {
        self.hosts.values().cloned().collect()
    }
}

fn roster(var: &str) -> Result<Vec<String>, GatewayError> {
    let raw = required_var(var)?;
    let entries = split_roster(&raw);
    if entries.is_empty() {
        return Err(GatewayError::InvalidConfig(format!("{} is empty", var)));
    }
    Ok(entries)
}

fn split_roster(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn required_var(var: &str) -> Result<String, GatewayError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(GatewayError::InvalidConfig(format!("{} is not set", var))),
    }
}

fn optional_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}
