use std::collections::HashSet;

use serde::Deserialize;
use thiserror::Error;

use crate::{
    buffer::DirtyLineBuffer,
    error::SimError,
    nvm::{Nvm, NvmConfig},
    sim::WriteLightCache,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line size {0} is not a power of two")]
    LineSize(u64),

    #[error("config lists no buffers")]
    NoBuffers,

    #[error("buffer name `{0}` is used more than once")]
    DuplicateName(String),

    #[error(
        "buffer `{name}`: waterline {waterline} must be below max_dirty_lines {max_dirty_lines}"
    )]
    Waterline {
        name: String,
        max_dirty_lines: usize,
        waterline: usize,
    },

    #[error("buffer `{name}`: fault rate {rate} not in [0, 1]")]
    FaultRate { name: String, rate: f64 },

    #[error("synthetic workload: {0}")]
    Workload(String),
}

/// What a cache does with a line the NVM failed to take.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Count the line as lost and keep going.
    #[default]
    Drop,
    /// Insert the line again once.
    Reinsert,
    /// Stop the run.
    Abort,
}

fn default_line_size() -> u64 {
    64
}

fn default_max_dirty_lines() -> usize {
    6
}

fn default_waterline() -> usize {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    pub name: String,
    #[serde(default = "default_max_dirty_lines")]
    pub max_dirty_lines: usize,
    #[serde(default = "default_waterline")]
    pub waterline: usize,
    #[serde(default)]
    pub coalesce: bool,
    #[serde(default = "default_true")]
    pub flush_on_exit: bool,
    #[serde(default)]
    pub fault_policy: FaultPolicy,
    #[serde(default)]
    pub nvm: NvmConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_line_size")]
    pub line_size: u64,
    pub buffers: Vec<BufferConfig>,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.line_size.is_power_of_two() {
            return Err(ConfigError::LineSize(self.line_size));
        }
        if self.buffers.is_empty() {
            return Err(ConfigError::NoBuffers);
        }
        let mut names = HashSet::new();
        for bc in &self.buffers {
            if !names.insert(bc.name.as_str()) {
                return Err(ConfigError::DuplicateName(bc.name.clone()));
            }
            if bc.waterline >= bc.max_dirty_lines {
                return Err(ConfigError::Waterline {
                    name: bc.name.clone(),
                    max_dirty_lines: bc.max_dirty_lines,
                    waterline: bc.waterline,
                });
            }
            if !(0.0..=1.0).contains(&bc.nvm.fault_rate) {
                return Err(ConfigError::FaultRate {
                    name: bc.name.clone(),
                    rate: bc.nvm.fault_rate,
                });
            }
        }
        Ok(())
    }

    pub fn to_caches(self) -> Result<Vec<WriteLightCache>, SimError> {
        let line_size = self.line_size;
        self.buffers
            .into_iter()
            .map(|bc| -> Result<WriteLightCache, SimError> {
                let nvm = Nvm::from_config(&bc.nvm)?;
                let buffer = DirtyLineBuffer::new(bc.max_dirty_lines, bc.waterline, nvm)
                    .map_err(|source| SimError::Buffer {
                        name: bc.name.clone(),
                        source,
                    })?;
                Ok(WriteLightCache::new(
                    bc.name,
                    line_size,
                    buffer,
                    bc.coalesce,
                    bc.flush_on_exit,
                    bc.fault_policy,
                )?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_cache() {
        let config = Config::from_json(r#"{ "buffers": [{ "name": "dcache" }] }"#).unwrap();
        assert_eq!(config.line_size, 64);
        let bc = &config.buffers[0];
        assert_eq!((bc.max_dirty_lines, bc.waterline), (6, 5));
        assert!(!bc.coalesce);
        assert!(bc.flush_on_exit);
        assert_eq!(bc.fault_policy, FaultPolicy::Drop);
        assert_eq!(bc.nvm.fault_rate, 0.0);
        assert!(bc.nvm.log.is_none());
    }

    #[test]
    fn full_entry() {
        let config = Config::from_json(
            r#"{
                "line_size": 128,
                "buffers": [{
                    "name": "wl",
                    "max_dirty_lines": 32,
                    "waterline": 8,
                    "coalesce": true,
                    "flush_on_exit": false,
                    "fault_policy": "reinsert",
                    "nvm": { "fault_rate": 0.01, "seed": 5 }
                }]
            }"#,
        )
        .unwrap();
        let bc = &config.buffers[0];
        assert_eq!(bc.fault_policy, FaultPolicy::Reinsert);
        assert_eq!(bc.nvm.seed, 5);

        let caches = config.to_caches().unwrap();
        assert_eq!(caches.len(), 1);
        assert_eq!(caches[0].name(), "wl");
        assert_eq!(caches[0].buffer().capacity(), 32);
        assert_eq!(caches[0].buffer().watermark(), 8);
    }

    #[test]
    fn rejects_bad_configs() {
        let cases = [
            (r#"{ "line_size": 48, "buffers": [{ "name": "a" }] }"#, "line size"),
            (r#"{ "buffers": [] }"#, "no buffers"),
            (
                r#"{ "buffers": [{ "name": "a" }, { "name": "a" }] }"#,
                "more than once",
            ),
            (
                r#"{ "buffers": [{ "name": "a", "max_dirty_lines": 4, "waterline": 4 }] }"#,
                "waterline 4",
            ),
            (
                r#"{ "buffers": [{ "name": "a", "nvm": { "fault_rate": 2.0 } }] }"#,
                "fault rate",
            ),
            (r#"{ "buffers": [{ "name": "a", "ways": 2 }] }"#, "malformed"),
            (
                r#"{ "buffers": [{ "name": "a", "fault_policy": "retry" }] }"#,
                "malformed",
            ),
        ];
        for (json, needle) in cases {
            let err = Config::from_json(json).unwrap_err();
            assert!(err.to_string().contains(needle), "{json}: {err}");
        }
    }

    #[test]
    fn zero_capacity_is_caught_at_validation() {
        let err = Config::from_json(
            r#"{ "buffers": [{ "name": "a", "max_dirty_lines": 0, "waterline": 0 }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Waterline { .. }));
    }
}
