//! Load agent config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use s2s_core::{ClientConfig, DeliveryConfig};
use serde::Deserialize;

/// Agent configuration. File: $S2S_CONFIG, ~/.config/s2s-agent/config.toml
/// or /etc/s2s-agent/config.toml, first one present wins.
/// Env overrides: S2S_URLS (comma separated), S2S_PORT_NAME, S2S_PORT_ID,
/// S2S_COMPRESSION.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub client: ClientConfig,
    pub delivery: DeliveryConfig,
}

/// Load config: defaults, then the config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    load_from(&config_paths(), |key| std::env::var(key).ok())
}

fn load_from(paths: &[PathBuf], env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(path) => load_file(path)?,
        None => Config::default(),
    };
    apply_env(&mut c, env)?;
    Ok(c)
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(c)
}

fn apply_env(c: &mut Config, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(s) = env("S2S_URLS") {
        c.client.urls = s
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = env("S2S_PORT_NAME") {
        c.client.port_name = Some(s);
    }
    if let Some(s) = env("S2S_PORT_ID") {
        c.client.port_identifier = Some(s);
    }
    if let Some(s) = env("S2S_COMPRESSION") {
        c.client.use_compression = s
            .trim()
            .parse()
            .with_context(|| format!("S2S_COMPRESSION must be true or false, got {s:?}"))?;
    }
    Ok(())
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("S2S_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/s2s-agent/config.toml"));
    }
    out.push(PathBuf::from("/etc/s2s-agent/config.toml"));
    out
}
