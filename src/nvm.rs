use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

use crate::buffer::Sink;

#[derive(Debug, Error)]
pub enum NvmError {
    #[error("writeback log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("injected NVM write fault for line {line:#x}")]
    Injected { line: u64 },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmConfig {
    #[serde(default)]
    pub fault_rate: f64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub log: Option<PathBuf>,
}

/// Non-volatile backing store model. Latency is not modeled; a write either
/// commits or faults.
#[derive(Debug)]
pub struct Nvm {
    fault_rate: f64,
    rng: fastrand::Rng,
    log: Option<BufWriter<File>>,
    writebacks: u64,
    faults: u64,
}

impl Nvm {
    pub fn new(fault_rate: f64, seed: u64) -> Self {
        Nvm {
            fault_rate,
            rng: fastrand::Rng::with_seed(seed),
            log: None,
            writebacks: 0,
            faults: 0,
        }
    }

    pub fn from_config(config: &NvmConfig) -> Result<Self, NvmError> {
        let mut nvm = Nvm::new(config.fault_rate, config.seed);
        if let Some(path) = &config.log {
            nvm.log = Some(BufWriter::new(File::create(path)?));
        }
        Ok(nvm)
    }

    pub fn writebacks(&self) -> u64 {
        self.writebacks
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn clear_stats(&mut self) {
        self.writebacks = 0;
        self.faults = 0;
    }

    pub fn flush(&mut self) -> Result<(), NvmError> {
        if let Some(log) = &mut self.log {
            log.flush()?;
        }
        Ok(())
    }
}

impl Sink<u64> for Nvm {
    type Error = NvmError;

    fn write(&mut self, line: &u64) -> Result<(), NvmError> {
        if self.fault_rate > 0.0 && self.rng.f64() < self.fault_rate {
            self.faults += 1;
            return Err(NvmError::Injected { line: *line });
        }
        trace!("writing dirty line {:#x} to NVM", line);
        if let Some(log) = &mut self.log {
            writeln!(log, "{:#x}", line)?;
        }
        self.writebacks += 1;
        Ok(())
    }
}
