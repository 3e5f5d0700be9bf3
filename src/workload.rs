use crate::{config::ConfigError, trace::Instr};

// Keeps generated addresses clear of 0, which the trace format reserves for
// unused slots.
const BASE_ADDR: u64 = 0x1000_0000;
const BASE_IP: u64 = 0x40_0000;

/// Synthetic store stream with a hot set: a `hot_fraction` share of stores
/// land on the first `hot_lines` lines, the rest anywhere in the footprint.
#[derive(Debug)]
pub struct Workload {
    footprint_lines: u64,
    hot_lines: u64,
    hot_fraction: f64,
    line_size: u64,
    rng: fastrand::Rng,
    ip: u64,
}

impl Workload {
    pub fn new(
        footprint_lines: u64,
        hot_lines: u64,
        hot_fraction: f64,
        line_size: u64,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        if !line_size.is_power_of_two() {
            return Err(ConfigError::LineSize(line_size));
        }
        if footprint_lines == 0 {
            return Err(ConfigError::Workload("footprint must be at least one line".into()));
        }
        if footprint_lines
            .checked_mul(line_size)
            .and_then(|bytes| bytes.checked_add(BASE_ADDR))
            .is_none()
        {
            return Err(ConfigError::Workload(format!(
                "footprint of {footprint_lines} lines of {line_size} bytes overflows the address space"
            )));
        }
        if hot_lines > footprint_lines {
            return Err(ConfigError::Workload(format!(
                "hot set of {hot_lines} lines exceeds footprint of {footprint_lines}"
            )));
        }
        if !(0.0..=1.0).contains(&hot_fraction) {
            return Err(ConfigError::Workload(format!(
                "hot fraction {hot_fraction} not in [0, 1]"
            )));
        }
        Ok(Workload {
            footprint_lines,
            hot_lines,
            hot_fraction,
            line_size,
            rng: fastrand::Rng::with_seed(seed),
            ip: BASE_IP,
        })
    }

    pub fn next_addr(&mut self) -> u64 {
        let line = if self.hot_lines > 0 && self.rng.f64() < self.hot_fraction {
            self.rng.u64(0..self.hot_lines)
        } else {
            self.rng.u64(0..self.footprint_lines)
        };
        BASE_ADDR + line * self.line_size + self.rng.u64(0..self.line_size)
    }

    pub fn next_block(&mut self, n: usize) -> Vec<Instr> {
        (0..n)
            .map(|_| {
                self.ip += 4;
                let addr = self.next_addr();
                Instr::store(self.ip, addr)
            })
            .collect()
    }
}
