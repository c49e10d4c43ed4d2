//! Declarative service list, loaded from `services.toml` under the root
//! directory. Declared order defines start order; stop order is the reverse.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Oneshot,
    Longrun,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    pub kind: ServiceKind,
    /// Longrun: the supervised command.
    #[serde(default)]
    pub command: Option<String>,
    /// Oneshot: run once on start.
    #[serde(default)]
    pub up: Option<String>,
    /// Oneshot: run once on stop. Optional, skipped when absent.
    #[serde(default)]
    pub down: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDef>,
}

pub fn load(path: &Path) -> Result<ServicesConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: ServicesConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ServicesConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for def in &config.services {
        if def.name.is_empty() {
            bail!("service with empty name");
        }
        if !seen.insert(def.name.as_str()) {
            bail!("duplicate service name: {}", def.name);
        }
        match def.kind {
            ServiceKind::Longrun if def.command.as_deref().unwrap_or("").is_empty() => {
                bail!("longrun service {} requires a command", def.name);
            }
            ServiceKind::Oneshot if def.up.as_deref().unwrap_or("").is_empty() => {
                bail!("oneshot service {} requires an up command", def.name);
            }
            _ => {}
        }
    }
    Ok(())
}
