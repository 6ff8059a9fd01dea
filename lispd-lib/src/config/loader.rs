use std::fs;
use std::path::Path;

use crate::auth;
use crate::config::{Config, DeviceMode};
use crate::error::{LispError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| LispError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| LispError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.debug > 3 {
        return Err(LispError::Config(format!("debug level {} out of range 0..=3", cfg.debug)));
    }

    match cfg.mode {
        DeviceMode::Xtr | DeviceMode::Mn => {
            if cfg.eids.is_empty() {
                return Err(LispError::Config("at least one EID prefix is required".into()));
            }
            if cfg.mode == DeviceMode::Mn && cfg.eids.len() > 1 {
                return Err(LispError::Config(
                    "a mobile node registers exactly one EID".into(),
                ));
            }
            if cfg.map_resolvers.is_empty() {
                return Err(LispError::Config("at least one map-resolver is required".into()));
            }
            if cfg.map_servers.is_empty() {
                return Err(LispError::Config("at least one map-server is required".into()));
            }
        }
        DeviceMode::Ms => {
            if cfg.sites.is_empty() {
                return Err(LispError::Config(
                    "a map-server needs at least one site entry".into(),
                ));
            }
        }
        DeviceMode::Rtr => {}
    }

    for ms in &cfg.map_servers {
        if ms.key.is_empty() {
            return Err(LispError::Config(format!("map-server {} has an empty key", ms.address)));
        }
        auth::mac_len(ms.key_id).map_err(|_| {
            LispError::Config(format!("map-server {}: unknown key-id {}", ms.address, ms.key_id))
        })?;
    }

    for site in &cfg.sites {
        if site.key.is_empty() {
            return Err(LispError::Config(format!("site {} has an empty key", site.prefix)));
        }
        auth::mac_len(site.key_id).map_err(|_| {
            LispError::Config(format!("site {}: unknown key-id {}", site.prefix, site.key_id))
        })?;
    }

    Ok(())
}
