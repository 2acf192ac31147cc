use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chipcheck_config::{ChipDescriptor, StopReason, TestLimits, Verdict};
use chipcheck_selftest::{configure, Corruption, Heartbeat, Window, HEARTBEAT_PERIOD};

use crate::board::{
    self, lock, IndicatorState, IrqGate, SharedBus, SimLed, SimSerial, SimTimer, TIM4_IRQ,
};
use crate::bus::SystemBus;
use crate::memory::SramBank;
use crate::peripherals::nvic::NvicState;
use crate::{Bus, SimResult, SimulationError, SimulationObserver};

/// Heartbeat as installed in the TIM4 vector.
pub type SimHeartbeat = Heartbeat<SimTimer, [SimLed; 2], SimSerial>;

/// Device time the interrupt thread advances between NVIC checks.
const QUANTUM: Duration = Duration::from_millis(1);

/// Longest sleep of a paced interrupt thread, so a halt is seen promptly.
const MAX_NAP: Duration = Duration::from_millis(10);

/// Without a heartbeat for this long, the timer is taken to be absent.
pub const DARK_AFTER: Duration = Duration::from_millis(2 * HEARTBEAT_PERIOD.as_millis() as u64);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Limits {
    pub max_passes: Option<u64>,
    pub sim_time: Option<Duration>,
    pub wall_time: Option<Duration>,
    /// Device time per host time; `None` runs flat out.
    pub speed: Option<f64>,
}

impl Limits {
    pub fn validate(&self) -> SimResult<()> {
        if self.max_passes.is_none() && self.sim_time.is_none() && self.wall_time.is_none() {
            return Err(SimulationError::InvalidConfig(
                "no stop condition: set max passes, simulated time or wall time".to_string(),
            ));
        }
        if let Some(speed) = self.speed {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(SimulationError::InvalidConfig(format!(
                    "speed must be positive, got {}",
                    speed
                )));
            }
        }
        Ok(())
    }
}

impl From<&TestLimits> for Limits {
    fn from(limits: &TestLimits) -> Self {
        Self {
            max_passes: limits.max_passes,
            sim_time: limits.sim_time_ms.map(Duration::from_millis),
            wall_time: limits.wall_time_ms.map(Duration::from_millis),
            speed: limits.speed,
        }
    }
}

/// What an observer would have seen, plus the counters behind it.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub chip: String,
    pub stop_reason: StopReason,
    pub verdict: Verdict,
    pub window: Window,
    pub passes: u64,
    pub heartbeats: u64,
    pub sim_time: Duration,
    pub wall_time: Duration,
    pub corruption: Option<Corruption>,
    pub indicators: Vec<IndicatorState>,
    pub uart: Vec<u8>,
    pub uart_dropped: u64,
}

/// Classifies a run the way someone watching the LEDs would.
pub fn classify(latched: bool, heartbeats: u64, sim_time: Duration) -> Verdict {
    if latched {
        Verdict::Solid
    } else if heartbeats > 0 {
        Verdict::Blinking
    } else if sim_time >= DARK_AFTER {
        Verdict::Dark
    } else {
        Verdict::Inconclusive
    }
}

/// The asynchronous context: simulated time, the NVIC and the TIM4 vector.
pub struct InterruptContext {
    bus: SharedBus,
    nvic: Arc<NvicState>,
    gate: Arc<IrqGate>,
    heartbeat: SimHeartbeat,
    observers: Vec<Arc<dyn SimulationObserver>>,
    sysclk_hz: u32,
    cycles: u64,
}

impl InterruptContext {
    pub fn new(
        bus: SharedBus,
        gate: Arc<IrqGate>,
        heartbeat: SimHeartbeat,
        observers: Vec<Arc<dyn SimulationObserver>>,
        sysclk_hz: u32,
    ) -> Self {
        let nvic = lock(&bus).nvic.clone();
        Self {
            bus,
            nvic,
            gate,
            heartbeat,
            observers,
            sysclk_hz,
            cycles: 0,
        }
    }

    pub fn sim_time(&self) -> Duration {
        let micros = self.cycles as u128 * 1_000_000 / self.sysclk_hz as u128;
        Duration::from_micros(micros as u64)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeat.firings()
    }

    /// Advances every peripheral by `cycles`, then takes a pending TIM4
    /// interrupt if the core would.
    pub fn tick(&mut self, cycles: u64) -> bool {
        lock(&self.bus).advance(cycles);
        self.cycles += cycles;
        self.service()
    }

    fn service(&mut self) -> bool {
        let Some(_in_handler) = self.gate.enter() else {
            return false;
        };
        if !self.nvic.is_enabled(TIM4_IRQ) || !self.nvic.take_pending(TIM4_IRQ) {
            return false;
        }

        self.heartbeat.fire();
        let (firing, phase) = (self.heartbeat.firings(), self.heartbeat.phase());
        tracing::debug!("TIM4: heartbeat {} ({:?}) at {:?}", firing, phase, self.sim_time());
        for observer in &self.observers {
            observer.on_heartbeat(firing, phase);
        }
        true
    }

    /// Runs until `halt` is raised, or raises it on reaching `sim_limit`.
    fn run(
        mut self,
        halt: &AtomicBool,
        sim_limit: Option<Duration>,
        speed: Option<f64>,
        started: Instant,
    ) -> Self {
        let quantum = (self.sysclk_hz as u128 * QUANTUM.as_nanos() / 1_000_000_000).max(1) as u64;

        while !halt.load(Ordering::SeqCst) {
            if let Some(speed) = speed {
                let due = self.sim_time().div_f64(speed);
                let elapsed = started.elapsed();
                if due > elapsed {
                    thread::sleep((due - elapsed).min(MAX_NAP));
                    continue;
                }
            }

            self.tick(quantum);

            if sim_limit.is_some_and(|limit| self.sim_time() >= limit) {
                halt.store(true, Ordering::SeqCst);
            }
        }
        self
    }
}

/// One simulated STM32F103-marked part, ready to run the self-test once.
pub struct Machine {
    chip: String,
    sysclk_hz: u32,
    bus: SharedBus,
    sram: SramBank,
    window: Window,
    uart: Arc<Mutex<Vec<u8>>>,
    pub observers: Vec<Arc<dyn SimulationObserver>>,
}

impl Machine {
    pub fn from_config(chip: &ChipDescriptor) -> anyhow::Result<Self> {
        chip.validate()?;
        let bus = SystemBus::from_config(chip)?;
        let sram = SramBank::from_config(chip)?;

        let statics = chip.statics_size()?;
        let start = chip
            .ram
            .base
            .checked_add(statics)
            .and_then(|start| u32::try_from(start).ok())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "SRAM at {:#x} (+{:#x} statics) is outside the 32-bit address space",
                    chip.ram.base,
                    statics
                )
            })?;

        Ok(Self::with_parts(
            &chip.name,
            chip.sysclk_hz,
            bus,
            sram,
            Window::up_to_required(start),
        ))
    }

    pub fn with_parts(
        name: &str,
        sysclk_hz: u32,
        mut bus: SystemBus,
        sram: SramBank,
        window: Window,
    ) -> Self {
        let uart = Arc::new(Mutex::new(Vec::new()));
        bus.attach_uart_tx_sink(uart.clone(), false);
        Self {
            chip: name.to_string(),
            sysclk_hz,
            bus: Arc::new(Mutex::new(bus)),
            sram,
            window,
            uart,
            observers: Vec::new(),
        }
    }

    /// Also print serial output to stdout as it is produced.
    pub fn echo_uart(&mut self, echo: bool) {
        lock(&self.bus).attach_uart_tx_sink(self.uart.clone(), echo);
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Powers the part up and runs the self-test until a limit or the latch.
    pub fn run(self, limits: &Limits) -> SimResult<RunReport> {
        limits.validate()?;
        let started = Instant::now();

        let Machine {
            chip,
            sysclk_hz,
            bus,
            sram,
            window,
            uart,
            observers,
        } = self;

        tracing::info!(
            "Starting {}: window {:#010x}..{:#010x} ({} cells)",
            chip,
            window.start(),
            window.end(),
            window.len()
        );
        for observer in &observers {
            observer.on_run_start(&chip);
        }

        board::bring_up(&bus);
        let gate = Arc::new(IrqGate::default());
        let (heartbeat, mut diagnostic) =
            configure(board::assemble(&bus, &gate, sram, window, sysclk_hz));

        // Install the handler before unmasking the line. Device time starts
        // once startup is over.
        let context =
            InterruptContext::new(bus.clone(), gate, heartbeat, observers.clone(), sysclk_hz);
        let halt = Arc::new(AtomicBool::new(false));
        let go = Arc::new(Barrier::new(2));
        let handle = thread::Builder::new()
            .name("tim4-irq".to_string())
            .spawn({
                let halt = halt.clone();
                let go = go.clone();
                let sim_limit = limits.sim_time;
                let speed = limits.speed;
                move || {
                    go.wait();
                    context.run(&halt, sim_limit, speed, started)
                }
            })
            .map_err(|e| SimulationError::InterruptThread(e.to_string()))?;

        diagnostic.arm();
        go.wait();

        let cells = window.len();
        let mut passes = 0;
        let mut corruption = None;
        let stop_reason = loop {
            if halt.load(Ordering::SeqCst) {
                break StopReason::SimTime;
            }
            if limits.wall_time.is_some_and(|w| started.elapsed() >= w) {
                break StopReason::WallTime;
            }
            if limits.max_passes.is_some_and(|m| passes >= m) {
                break StopReason::MaxPasses;
            }

            match diagnostic.step() {
                Ok(next) => {
                    diagnostic = next;
                    passes = diagnostic.passes();
                    for observer in &observers {
                        observer.on_pass_complete(passes, cells);
                    }
                }
                Err(latched) => {
                    let c = latched.corruption();
                    tracing::error!(
                        "SRAM corruption at {:#010x} (cell {}): wrote {:#010x}, read {:#010x}",
                        c.address,
                        c.cell,
                        c.expected,
                        c.actual
                    );
                    for observer in &observers {
                        observer.on_latch(&c);
                    }
                    corruption = Some(c);
                    break StopReason::Latched;
                }
            }
        };

        halt.store(true, Ordering::SeqCst);
        let context = handle
            .join()
            .map_err(|_| SimulationError::InterruptThread("panicked".to_string()))?;

        let heartbeats = context.heartbeats();
        let sim_time = context.sim_time();
        let verdict = classify(corruption.is_some(), heartbeats, sim_time);
        let (indicators, uart_dropped) = {
            let bus = lock(&bus);
            (board::indicator_states(&bus), board::uart_dropped(&bus))
        };
        let uart = lock(&uart).clone();
        let wall_time = started.elapsed();

        tracing::info!(
            "Stopped ({:?}) after {} passes, {} heartbeats, {:?} simulated: {:?}",
            stop_reason,
            passes,
            heartbeats,
            sim_time,
            verdict
        );
        for observer in &observers {
            observer.on_run_stop(stop_reason);
        }

        Ok(RunReport {
            chip,
            stop_reason,
            verdict,
            window,
            passes,
            heartbeats,
            sim_time,
            wall_time,
            corruption,
            indicators,
            uart,
            uart_dropped,
        })
    }
}
