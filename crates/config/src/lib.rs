use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// End of the Cortex-M3 address space.
const ADDRESS_SPACE_END: u64 = 1 << 32;

fn default_sysclk_hz() -> u32 {
    72_000_000
}

/// What the SRAM array does with addresses past its physical size.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Overflow {
    /// Partial address decode: the array repeats every `size` bytes.
    #[default]
    Alias,
    /// Nothing answers: writes are lost, reads return open-bus ones.
    Float,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RamConfig {
    pub base: u64,
    pub size: String, // e.g. "20KiB"
    /// Decoded address range. Defaults to `size`.
    #[serde(default)]
    pub span: Option<String>,
    #[serde(default)]
    pub overflow: Overflow,
}

/// A bit pattern forced onto one word of SRAM, whatever was written.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StuckBits {
    pub address: u64,
    pub mask: u32,
    pub value: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeripheralConfig {
    pub id: String,
    pub r#type: String, // "gpio", "uart", "timer", "rcc", "nvic"
    pub base_address: u64,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub irq: Option<u32>,
}

/// One simulated part: what it really has, not what is printed on it.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChipDescriptor {
    pub name: String,
    #[serde(default = "default_sysclk_hz")]
    pub sysclk_hz: u32,
    pub ram: RamConfig,
    /// Static data at the bottom of SRAM. The memory test starts above it.
    #[serde(default)]
    pub statics: Option<String>,
    #[serde(default)]
    pub peripherals: Vec<PeripheralConfig>,
    #[serde(default)]
    pub faults: Vec<StuckBits>,
}

impl ChipDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open chip descriptor at {:?}", path.as_ref()))?;
        let chip: Self =
            serde_yaml::from_reader(f).context("Failed to parse Chip Descriptor")?;
        chip.validate()?;
        Ok(chip)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sysclk_hz == 0 {
            anyhow::bail!("Chip '{}': sysclk_hz must be greater than zero", self.name);
        }

        let size = self.ram_size()?;
        if size == 0 || size % 4 != 0 {
            anyhow::bail!(
                "Chip '{}': ram.size must be a non-zero multiple of 4 bytes (got {})",
                self.name,
                size
            );
        }

        let span = self.ram_span()?;
        if span < size {
            anyhow::bail!(
                "Chip '{}': ram.span ({}) is smaller than ram.size ({})",
                self.name,
                span,
                size
            );
        }

        if self.statics_size()? > size {
            anyhow::bail!("Chip '{}': statics do not fit in SRAM", self.name);
        }

        let ram_end = self
            .ram
            .base
            .checked_add(span)
            .filter(|&end| end <= ADDRESS_SPACE_END)
            .with_context(|| {
                format!(
                    "Chip '{}': SRAM at {:#x} (+{:#x}) does not fit in the 32-bit address space",
                    self.name, self.ram.base, span
                )
            })?;
        let physical_end = ram_end - (span - size);

        for fault in &self.faults {
            if fault.address < self.ram.base || fault.address >= physical_end {
                anyhow::bail!(
                    "Chip '{}': stuck bits at {:#x} are outside physical SRAM",
                    self.name,
                    fault.address
                );
            }
        }

        let mut seen = std::collections::HashSet::new();
        for p in &self.peripherals {
            if !seen.insert(p.id.as_str()) {
                anyhow::bail!("Chip '{}': duplicate peripheral id '{}'", self.name, p.id);
            }
            if p.base_address >= ADDRESS_SPACE_END {
                anyhow::bail!(
                    "Chip '{}': peripheral '{}' at {:#x} is outside the 32-bit address space",
                    self.name,
                    p.id,
                    p.base_address
                );
            }
        }

        Ok(())
    }

    pub fn ram_size(&self) -> Result<u64> {
        parse_size(&self.ram.size).context("ram.size")
    }

    pub fn ram_span(&self) -> Result<u64> {
        match &self.ram.span {
            Some(span) => parse_size(span).context("ram.span"),
            None => self.ram_size(),
        }
    }

    pub fn statics_size(&self) -> Result<u64> {
        match &self.statics {
            Some(s) => parse_size(s).context("statics"),
            None => Ok(0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestInputs {
    pub chip: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TestLimits {
    #[serde(default)]
    pub max_passes: Option<u64>,
    /// Simulated time, in milliseconds of device time.
    #[serde(default)]
    pub sim_time_ms: Option<u64>,
    #[serde(default)]
    pub wall_time_ms: Option<u64>,
    /// Simulated time per real time. Unset runs as fast as the host allows.
    #[serde(default)]
    pub speed: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxPasses,
    SimTime,
    WallTime,
    Latched,
}

/// What someone watching the board would conclude.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Steady blink: timer and memory both present.
    Blinking,
    /// Never lit: no timer.
    Dark,
    /// Solid: the memory test failed.
    Solid,
    /// Stopped before a missing heartbeat could be told from a slow one.
    Inconclusive,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct VerdictAssertion {
    pub expected_verdict: Verdict,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UartContainsAssertion {
    pub uart_contains: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MinHeartbeatsAssertion {
    pub min_heartbeats: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StopReasonAssertion {
    pub expected_stop_reason: StopReason,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TestAssertion {
    ExpectedVerdict(VerdictAssertion),
    UartContains(UartContainsAssertion),
    MinHeartbeats(MinHeartbeatsAssertion),
    ExpectedStopReason(StopReasonAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TestScript {
    pub schema_version: String,
    pub inputs: TestInputs,
    pub limits: TestLimits,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

impl TestScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open test script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Test Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.inputs.chip.trim().is_empty() {
            anyhow::bail!("Input 'chip' path cannot be empty");
        }

        let limits = &self.limits;
        if limits.max_passes == Some(0) {
            anyhow::bail!("Limit 'max_passes' must be greater than zero");
        }
        if limits.sim_time_ms == Some(0) || limits.wall_time_ms == Some(0) {
            anyhow::bail!("Time limits must be greater than zero");
        }
        if limits.max_passes.is_none()
            && limits.sim_time_ms.is_none()
            && limits.wall_time_ms.is_none()
        {
            anyhow::bail!(
                "At least one of 'max_passes', 'sim_time_ms' or 'wall_time_ms' is required"
            );
        }
        if let Some(speed) = limits.speed {
            if !(speed.is_finite() && speed > 0.0) {
                anyhow::bail!("Limit 'speed' must be a positive number (got {})", speed);
            }
        }

        Ok(())
    }
}

/// Accepts human sizes ("20KiB", "1MiB") or a plain byte count.
pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    if let Ok(bytes) = size_str.trim().parse::<u64>() {
        return Ok(bytes);
    }
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format '{}': {}", size_str, e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
