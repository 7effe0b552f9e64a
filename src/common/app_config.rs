// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<DataplaneConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static DataplaneConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = DataplaneConfig::load_from_file(path.as_ref())?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static DataplaneConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static DataplaneConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAROCKS_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p.trim()));
    }

    let candidate = PathBuf::from("novarocks.toml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow!(
        "missing config file: set $NOVAROCKS_CONFIG or create ./novarocks.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct DataplaneConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression, takes precedence over `log_level`.
    /// Example: "novarocks_dataplane=debug,parquet=warn"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub writer: WriterConfig,
}

impl DataplaneConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: DataplaneConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.exchange.high_water_mark_bytes == 0 {
            return Err(anyhow!("exchange.high_water_mark_bytes must be positive"));
        }
        if self.exchange.max_request_bytes == 0 {
            return Err(anyhow!("exchange.max_request_bytes must be positive"));
        }
        // A zero long-poll wait turns every local pull into a busy loop.
        if self.exchange.request_wait_ms == 0 {
            return Err(anyhow!("exchange.request_wait_ms must be positive"));
        }
        Ok(())
    }

    /// Filter expression handed to the log subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or(&self.log_level)
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            exchange: ExchangeConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExchangeConfig {
    /// Sources stop issuing pulls while the page buffer holds at least this many bytes.
    #[serde(default = "default_high_water_mark_bytes")]
    pub high_water_mark_bytes: usize,
    /// Upper bound on the payload one pull may return.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Long-poll wait of the local transport before an empty response is returned.
    #[serde(default = "default_request_wait_ms")]
    pub request_wait_ms: u64,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

fn default_high_water_mark_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_max_request_bytes() -> usize {
    1024 * 1024
}
fn default_request_wait_ms() -> u64 {
    200
}
fn default_io_threads() -> usize {
    4
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            high_water_mark_bytes: default_high_water_mark_bytes(),
            max_request_bytes: default_max_request_bytes(),
            request_wait_ms: default_request_wait_ms(),
            io_threads: default_io_threads(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WriterConfig {
    /// Roll to a new file after this many rows; 0 keeps one file per partition.
    #[serde(default)]
    pub max_rows_per_file: usize,
    #[serde(default = "default_compression")]
    pub compression: String,
}

fn default_compression() -> String {
    "snappy".to_string()
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_rows_per_file: 0,
            compression: default_compression(),
        }
    }
}
