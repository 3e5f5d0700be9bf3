use serde::Serialize;
use tracing::{info, warn};

use crate::{
    buffer::{BufferError, DirtyLineBuffer},
    config::{ConfigError, FaultPolicy},
    error::SimError,
    nvm::{Nvm, NvmError},
    trace::{Instr, Trace},
    workload::Workload,
};

#[derive(Debug, Serialize)]
pub struct WriteLightStats {
    name: String,
    stores: u64,
    coalesced: u64,
    inserted: u64,
    drains: u64,
    writebacks: u64,
    failed_writebacks: u64,
    lost_lines: u64,
    residual: usize,
    peak_occupancy: usize,
    writebacks_per_store: f64,
}

/// A data cache seen only through its dirty lines: every store dirties a
/// line, and dirty lines reach NVM through a [`DirtyLineBuffer`].
#[derive(Debug)]
pub struct WriteLightCache {
    name: String,
    line_shift: u32,
    coalesce: bool,
    flush_on_exit: bool,
    fault_policy: FaultPolicy,
    buffer: DirtyLineBuffer<u64, Nvm>,
    stores: u64,
    coalesced: u64,
    lost: u64,
}

impl WriteLightCache {
    pub fn new(
        name: String,
        line_size: u64,
        buffer: DirtyLineBuffer<u64, Nvm>,
        coalesce: bool,
        flush_on_exit: bool,
        fault_policy: FaultPolicy,
    ) -> Result<Self, ConfigError> {
        if !line_size.is_power_of_two() {
            return Err(ConfigError::LineSize(line_size));
        }
        Ok(WriteLightCache {
            name,
            line_shift: line_size.trailing_zeros(),
            coalesce,
            flush_on_exit,
            fault_policy,
            buffer,
            stores: 0,
            coalesced: 0,
            lost: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &DirtyLineBuffer<u64, Nvm> {
        &self.buffer
    }

    pub fn store(&mut self, addr: u64) -> Result<(), SimError> {
        self.stores += 1;
        let line = addr >> self.line_shift;
        if self.coalesce && self.buffer.contains(&line) {
            self.coalesced += 1;
            return Ok(());
        }
        match self.buffer.insert(line) {
            Ok(()) => Ok(()),
            Err(err) => self.recover(err, true),
        }
    }

    /// Writes back everything still buffered, if configured to, and flushes
    /// the NVM log.
    pub fn finish(&mut self) -> Result<(), SimError> {
        if self.flush_on_exit {
            while let Err(err) = self.buffer.drain_all() {
                self.recover(err, false)?;
            }
        }
        self.buffer.sink_mut().flush()?;
        Ok(())
    }

    fn recover(
        &mut self,
        err: BufferError<u64, NvmError>,
        may_reinsert: bool,
    ) -> Result<(), SimError> {
        let (line, source) = match err {
            BufferError::SinkFailure { line, source } => (line, source),
            err => return Err(self.fail(err)),
        };
        match self.fault_policy {
            FaultPolicy::Abort => Err(self.fail(BufferError::SinkFailure { line, source })),
            FaultPolicy::Reinsert if may_reinsert => {
                warn!(cache = %self.name, "{source}, reinserting line {line:#x}");
                match self.buffer.insert(line) {
                    Ok(()) => Ok(()),
                    Err(BufferError::SinkFailure { line, source }) => {
                        self.lose(line, &source);
                        Ok(())
                    }
                    Err(err) => Err(self.fail(err)),
                }
            }
            FaultPolicy::Reinsert | FaultPolicy::Drop => {
                self.lose(line, &source);
                Ok(())
            }
        }
    }

    fn lose(&mut self, line: u64, source: &NvmError) {
        warn!(cache = %self.name, "{source}, line {line:#x} lost");
        self.lost += 1;
    }

    fn fail(&self, source: BufferError<u64, NvmError>) -> SimError {
        SimError::Buffer {
            name: self.name.clone(),
            source,
        }
    }

    pub fn clear_stats(&mut self) {
        self.stores = 0;
        self.coalesced = 0;
        self.lost = 0;
        self.buffer.clear_stats();
        self.buffer.sink_mut().clear_stats();
    }

    pub fn make_stats(&self) -> WriteLightStats {
        let stats = self.buffer.stats();
        let writebacks_per_store = if self.stores == 0 {
            0.0
        } else {
            stats.written_back as f64 / self.stores as f64
        };
        WriteLightStats {
            name: self.name.clone(),
            stores: self.stores,
            coalesced: self.coalesced,
            inserted: stats.inserted,
            drains: stats.drains,
            writebacks: stats.written_back,
            failed_writebacks: stats.failed,
            lost_lines: self.lost,
            residual: self.buffer.len(),
            peak_occupancy: stats.peak_len,
            writebacks_per_store,
        }
    }
}

/// Feeds every store in `instrs` to every cache. Caches are independent
/// configurations replaying the same stream, not a hierarchy.
pub fn operate(caches: &mut [WriteLightCache], instrs: &[Instr]) -> Result<u64, SimError> {
    for instr in instrs {
        for addr in instr.stores() {
            for cache in caches.iter_mut() {
                cache.store(addr)?;
            }
        }
    }
    Ok(instrs.len() as u64)
}

pub enum Source {
    Trace(Trace),
    /// Generates blocks of up to the given number of records.
    Synthetic(Workload, usize),
}

impl Source {
    /// Next block of records, `None` once the source is exhausted. Synthetic
    /// blocks never exceed `max`; trace blocks come as read.
    pub fn next_block(&mut self, max: usize) -> Option<Result<Vec<Instr>, SimError>> {
        match self {
            Source::Trace(trace) => trace.rec.recv().ok().map(|b| b.map_err(SimError::from)),
            Source::Synthetic(workload, n) => Some(Ok(workload.next_block((*n).min(max)))),
        }
    }
}

/// Replays `n_warm` records, clears stats, then replays `n_instr` measured
/// records. Blocks are split so both phases end on the exact record. Returns
/// the number of records replayed.
pub fn replay(
    source: &mut Source,
    caches: &mut [WriteLightCache],
    n_warm: u64,
    n_instr: u64,
    heartbeat_int: u64,
) -> Result<u64, SimError> {
    let mut instr_idx = 0;
    let mut next_heartbeat = heartbeat_int;
    let mut warmup = n_warm > 0;
    let mut goal = if warmup { n_warm } else { n_instr };
    let left = |goal: u64, idx: u64| usize::try_from(goal - idx).unwrap_or(usize::MAX);

    while warmup || instr_idx < goal {
        let Some(instr_block) = source.next_block(left(goal, instr_idx)) else {
            break;
        };
        let instr_block = instr_block?;
        let mut rest = instr_block.as_slice();
        while !rest.is_empty() {
            let (now, later) = rest.split_at(rest.len().min(left(goal, instr_idx)));
            instr_idx += operate(caches, now)?;
            rest = later;
            if instr_idx < goal {
                continue;
            }
            if !warmup {
                break;
            }
            caches.iter_mut().for_each(|c| c.clear_stats());
            goal = instr_idx + n_instr;
            warmup = false;
            info!("Finished Warmup!");
        }

        if heartbeat_int != 0 && instr_idx > next_heartbeat {
            info!("Instr: {}", instr_idx);
            while next_heartbeat < instr_idx {
                next_heartbeat += heartbeat_int;
            }
        }
    }
    Ok(instr_idx)
}
