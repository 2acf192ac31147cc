use crate::board::IndicatorState;
use crate::machine::RunReport;
use chipcheck_config::{StopReason, Verdict};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub chip: String,
    pub verdict: Verdict,
    pub stop_reason: StopReason,
    pub window: WindowSnapshot,
    pub passes: u64,
    pub heartbeats: u64,
    pub sim_time_ms: u64,
    pub wall_time_ms: u64,
    pub corruption: Option<CorruptionSnapshot>,
    pub indicators: Vec<IndicatorState>,
    pub uart: String,
    pub uart_dropped: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub start: u32,
    pub end: u32,
    pub cells: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionSnapshot {
    pub address: u32,
    pub cell: usize,
    pub expected: u32,
    pub actual: u32,
}

impl From<&RunReport> for RunSnapshot {
    fn from(report: &RunReport) -> Self {
        Self {
            chip: report.chip.clone(),
            verdict: report.verdict,
            stop_reason: report.stop_reason,
            window: WindowSnapshot {
                start: report.window.start(),
                end: report.window.end(),
                cells: report.window.len(),
            },
            passes: report.passes,
            heartbeats: report.heartbeats,
            sim_time_ms: report.sim_time.as_millis() as u64,
            wall_time_ms: report.wall_time.as_millis() as u64,
            corruption: report.corruption.map(|c| CorruptionSnapshot {
                address: c.address,
                cell: c.cell,
                expected: c.expected,
                actual: c.actual,
            }),
            indicators: report.indicators.clone(),
            uart: String::from_utf8_lossy(&report.uart).into_owned(),
            uart_dropped: report.uart_dropped,
        }
    }
}

impl RunSnapshot {
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write snapshot {:?}: {}", path.as_ref(), e))
    }
}
