//! Per-opcode dispatch counters.
//!
//! The dispatch loop records every opcode byte it executes; the aggregated
//! counts back `Evaluator::dump_status` so callers can see where a workload
//! spends its dispatches without rerunning it under instrumentation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bytecode::Opcode;

/// Dispatch counters indexed by raw opcode byte.
pub struct OpStats {
    counts: Box<[u64; 256]>,
    total: u64,
}

impl OpStats {
    pub fn new() -> Self {
        Self {
            counts: Box::new([0; 256]),
            total: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, opcode: u8) {
        self.counts[opcode as usize] += 1;
        self.total += 1;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn count(&self, opcode: Opcode) -> u64 {
        self.counts[opcode as u8 as usize]
    }

    /// Snapshot of every opcode executed at least once, in byte order.
    pub fn report(&self) -> OpStatusReport {
        let per_opcode = (0u16..=255)
            .filter_map(|byte| {
                let count = self.counts[byte as usize];
                if count == 0 {
                    return None;
                }
                Opcode::from_byte(byte as u8).map(|opcode| OpCount { opcode, count })
            })
            .collect();
        OpStatusReport {
            total: self.total,
            per_opcode,
        }
    }
}

impl Default for OpStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One executed opcode and its dispatch count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCount {
    pub opcode: Opcode,
    pub count: u64,
}

/// Aggregate dispatch report emitted by `dump_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStatusReport {
    pub total: u64,
    pub per_opcode: Vec<OpCount>,
}

impl fmt::Display for OpStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} operations executed", self.total)?;
        for entry in &self.per_opcode {
            writeln!(f, "{:>20?} : {:>10}", entry.opcode, entry.count)?;
        }
        Ok(())
    }
}
