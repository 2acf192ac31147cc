#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;
    use std::time::Duration;

    use crate::hal::{
        Indicator, InterruptControl, Level, MemoryCells, Parity, PeriodicTimer, SerialConfig,
        SerialTx,
    };
    use crate::{configure, Board, Heartbeat, Window, HEARTBEAT_PERIOD, SRAM_BASE};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        SerialConfigured(SerialConfig),
        LedConfigured(usize),
        TimerStarted(Duration),
        TimerCleared,
        Led(usize, Level),
        Tx(u8),
        IrqEnabled,
        IrqDisabled,
    }

    /// Stand-in for the chip: records every capability call in order and
    /// gates heartbeat delivery on the interrupt switches.
    #[derive(Default)]
    struct BenchState {
        events: Vec<Event>,
        leds: [Option<Level>; 2],
        tx: Vec<u8>,
        irq_enabled: bool,
        masked: bool,
    }

    #[derive(Clone, Default)]
    struct Bench(Rc<RefCell<BenchState>>);

    impl Bench {
        fn log(&self, event: Event) {
            self.0.borrow_mut().events.push(event);
        }

        /// One timer update. Runs the handler only if delivery is allowed.
        fn deliver<T, I, S>(&self, heartbeat: &mut Heartbeat<T, I, S>) -> bool
        where
            T: PeriodicTimer,
            I: Indicator,
            S: SerialTx,
        {
            let allowed = {
                let state = self.0.borrow();
                state.irq_enabled && !state.masked
            };
            if allowed {
                heartbeat.fire();
            }
            allowed
        }

        fn leds(&self) -> [Option<Level>; 2] {
            self.0.borrow().leds
        }

        fn tx(&self) -> Vec<u8> {
            self.0.borrow().tx.clone()
        }

        fn events(&self) -> Vec<Event> {
            self.0.borrow().events.clone()
        }
    }

    struct Led {
        bench: Bench,
        pin: usize,
    }

    impl Indicator for Led {
        fn configure(&mut self) {
            self.bench.log(Event::LedConfigured(self.pin));
            self.bench.0.borrow_mut().leds[self.pin] = Some(Level::Off);
        }

        fn set(&mut self, level: Level) {
            self.bench.log(Event::Led(self.pin, level));
            self.bench.0.borrow_mut().leds[self.pin] = Some(level);
        }
    }

    struct Serial(Bench);

    impl SerialTx for Serial {
        fn configure(&mut self, config: SerialConfig) {
            self.0.log(Event::SerialConfigured(config));
        }

        fn transmit(&mut self, byte: u8) {
            self.0.log(Event::Tx(byte));
            self.0 .0.borrow_mut().tx.push(byte);
        }
    }

    struct Timer(Bench);

    impl PeriodicTimer for Timer {
        fn start(&mut self, period: Duration) {
            self.0.log(Event::TimerStarted(period));
        }

        fn clear_pending(&mut self) {
            self.0.log(Event::TimerCleared);
        }
    }

    struct Irq(Bench);

    impl InterruptControl for Irq {
        fn enable_heartbeat(&mut self) {
            self.0.log(Event::IrqEnabled);
            self.0 .0.borrow_mut().irq_enabled = true;
        }

        fn disable_all(&mut self) {
            self.0.log(Event::IrqDisabled);
            self.0 .0.borrow_mut().masked = true;
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Access {
        Write(usize),
        Read(usize),
    }

    /// Word array with an access log. Optionally flips one bit of the value
    /// written to `flip_cell`, as a defective cell would.
    struct LoggedCells {
        base: u32,
        words: Vec<u32>,
        log: Vec<Access>,
        flip_cell: Option<usize>,
    }

    impl LoggedCells {
        fn new(base: u32, cells: usize) -> Self {
            Self {
                base,
                words: vec![0; cells],
                log: Vec::new(),
                flip_cell: None,
            }
        }

        fn index(&self, addr: u32) -> usize {
            ((addr - self.base) / 4) as usize
        }
    }

    impl MemoryCells for LoggedCells {
        fn write(&mut self, addr: u32, value: u32) {
            let i = self.index(addr);
            self.log.push(Access::Write(i));
            self.words[i] = if self.flip_cell == Some(i) {
                value ^ (1 << 7)
            } else {
                value
            };
        }

        fn read(&mut self, addr: u32) -> u32 {
            let i = self.index(addr);
            self.log.push(Access::Read(i));
            self.words[i]
        }
    }

    /// Nothing behind the addresses: writes vanish, reads float to zero.
    struct Unbacked {
        reads: usize,
    }

    impl MemoryCells for Unbacked {
        fn write(&mut self, _addr: u32, _value: u32) {}

        fn read(&mut self, _addr: u32) -> u32 {
            self.reads += 1;
            0
        }
    }

    fn board<M: MemoryCells>(
        bench: &Bench,
        cells: M,
        window: Window,
    ) -> Board<M, Timer, [Led; 2], Serial, Irq> {
        let leds = |bench: &Bench| {
            [
                Led {
                    bench: bench.clone(),
                    pin: 0,
                },
                Led {
                    bench: bench.clone(),
                    pin: 1,
                },
            ]
        };
        Board {
            cells,
            window,
            timer: Timer(bench.clone()),
            heartbeat_leds: leds(bench),
            latch_leds: leds(bench),
            serial: Serial(bench.clone()),
            irq: Irq(bench.clone()),
        }
    }

    fn window_of(cells: usize) -> Window {
        Window::new(SRAM_BASE, SRAM_BASE + 4 * cells as u32)
    }

    #[test]
    fn test_startup_order() {
        let bench = Bench::default();
        let cells = LoggedCells::new(SRAM_BASE, 4);
        let (_heartbeat, mut diag) = configure(board(&bench, cells, window_of(4)));

        assert_eq!(
            bench.events(),
            [
                Event::SerialConfigured(SerialConfig {
                    baud: 9600,
                    data_bits: 8,
                    parity: Parity::None,
                    stop_bits: 1,
                }),
                Event::LedConfigured(0),
                Event::LedConfigured(1),
                Event::TimerStarted(HEARTBEAT_PERIOD),
            ]
        );
        assert_eq!(bench.leds(), [Some(Level::Off); 2]);

        // Delivery stays off until armed.
        diag.arm();
        assert_eq!(bench.events().last(), Some(&Event::IrqEnabled));
    }

    #[test]
    fn test_unbacked_memory_latches_on_first_cell() {
        let bench = Bench::default();
        let cells = Unbacked { reads: 0 };
        let (_heartbeat, mut diag) = configure(board(&bench, cells, window_of(64)));
        diag.arm();

        let latched = match diag.step() {
            Ok(_) => panic!("unbacked memory passed"),
            Err(latched) => latched,
        };
        let corruption = latched.corruption();
        assert_eq!(corruption.cell, 0);
        assert_eq!(corruption.address, SRAM_BASE);
        assert_eq!(corruption.expected, 0xafdd_364e);
        assert_eq!(corruption.actual, 0);
        assert_eq!(bench.leds(), [Some(Level::Fault); 2]);
    }

    #[test]
    fn test_unbacked_memory_reads_exactly_one_cell() {
        let bench = Bench::default();
        let mut cells = Unbacked { reads: 0 };
        let (_heartbeat, diag) = configure(board(&bench, &mut cells, window_of(64)));
        let _ = diag.run();
        assert_eq!(cells.reads, 1);
    }

    #[test]
    fn test_good_memory_never_latches() {
        let bench = Bench::default();
        let cells = LoggedCells::new(SRAM_BASE, 64);
        let (mut heartbeat, mut diag) = configure(board(&bench, cells, window_of(64)));
        diag.arm();

        let mut states = HashSet::new();
        for pass in 0..500u64 {
            diag = match diag.step() {
                Ok(diag) => diag,
                Err(latched) => panic!("latched on pass {}: {:?}", pass, latched),
            };
            assert!(
                states.insert(diag.generator_state()),
                "state repeated on pass {}",
                pass
            );

            if pass % 50 == 0 {
                assert!(bench.deliver(&mut heartbeat));
            }
        }
        assert_eq!(diag.passes(), 500);
        assert_eq!(bench.tx().len(), 10);
        assert!(!bench.events().contains(&Event::IrqDisabled));
    }

    #[test]
    fn test_heartbeat_parity_through_bench() {
        for n in 0..=10usize {
            let bench = Bench::default();
            let cells = LoggedCells::new(SRAM_BASE, 1);
            let (mut heartbeat, mut diag) = configure(board(&bench, cells, window_of(1)));
            diag.arm();

            for _ in 0..n {
                assert!(bench.deliver(&mut heartbeat));
            }

            let expected = if n % 2 == 1 { Level::On } else { Level::Off };
            assert_eq!(bench.leds(), [Some(expected); 2], "after {} firings", n);
            assert_eq!(bench.tx(), vec![b'.'; n]);

            let clears = bench
                .events()
                .iter()
                .filter(|e| **e == Event::TimerCleared)
                .count();
            assert_eq!(clears, n);
        }
    }

    #[test]
    fn test_no_heartbeat_after_latch() {
        let bench = Bench::default();
        let mut cells = LoggedCells::new(SRAM_BASE, 8);
        cells.flip_cell = Some(3);
        let (mut heartbeat, mut diag) = configure(board(&bench, cells, window_of(8)));
        diag.arm();

        for _ in 0..3 {
            assert!(bench.deliver(&mut heartbeat));
        }
        assert_eq!(bench.leds(), [Some(Level::On); 2]);

        let latched = diag.step().err().expect("flipped bit not detected");
        assert_eq!(latched.corruption().cell, 3);

        let leds = bench.leds();
        let tx = bench.tx();
        for _ in 0..10 {
            assert!(!bench.deliver(&mut heartbeat));
        }
        assert_eq!(leds, [Some(Level::Fault); 2]);
        assert_eq!(bench.leds(), leds);
        assert_eq!(bench.tx(), tx);
        assert_eq!(heartbeat.firings(), 3);
    }

    #[test]
    fn test_latch_masks_before_driving_leds() {
        let bench = Bench::default();
        let cells = Unbacked { reads: 0 };
        let (_heartbeat, diag) = configure(board(&bench, cells, window_of(4)));
        let _ = diag.run();

        let events = bench.events();
        let disabled = events.iter().position(|e| *e == Event::IrqDisabled).unwrap();
        let faults: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::Led(_, Level::Fault)))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(faults.len(), 2);
        assert!(faults.iter().all(|&i| i > disabled));
        assert_eq!(events.iter().filter(|e| **e == Event::IrqDisabled).count(), 1);
    }

    #[test]
    fn test_bit_flip_at_cell_37_of_64() {
        let bench = Bench::default();
        let mut cells = LoggedCells::new(SRAM_BASE, 64);
        cells.flip_cell = Some(37);
        let (_heartbeat, diag) = configure(board(&bench, cells, window_of(64)));

        let latched = match diag.step() {
            Ok(_) => panic!("bit flip at cell 37 not detected"),
            Err(latched) => latched,
        };
        let corruption = latched.corruption();
        assert_eq!(corruption.cell, 37);
        assert_eq!(corruption.address, SRAM_BASE + 37 * 4);
        assert_eq!(corruption.actual, corruption.expected ^ (1 << 7));
        assert_eq!(bench.leds(), [Some(Level::Fault); 2]);
    }

    #[test]
    fn test_bit_flip_stops_verify_at_cell_37() {
        let bench = Bench::default();
        let mut cells = LoggedCells::new(SRAM_BASE, 64);
        cells.flip_cell = Some(37);
        let (_heartbeat, diag) = configure(board(&bench, &mut cells, window_of(64)));
        let latched = diag.run();
        assert_eq!(latched.corruption().cell, 37);

        // The whole window is filled once, then verified up to and including
        // cell 37. Nothing after it is read or written.
        let writes: Vec<Access> = (0..64).map(Access::Write).collect();
        let reads: Vec<Access> = (0..=37).map(Access::Read).collect();
        assert_eq!(cells.log.len(), 64 + 38);
        assert_eq!(cells.log[..64], writes[..]);
        assert_eq!(cells.log[64..], reads[..]);
    }

    #[test]
    fn test_zero_length_window_never_latches() {
        let bench = Bench::default();
        let (_heartbeat, mut diag) = configure(board(
            &bench,
            Unbacked { reads: 0 },
            Window::new(SRAM_BASE + 0x100, SRAM_BASE + 0x100),
        ));
        diag.arm();

        let initial = diag.generator_state();
        for _ in 0..1000 {
            diag = diag.step().expect("empty window latched");
        }
        assert_eq!(diag.passes(), 1000);
        assert_eq!(diag.memory().reads, 0);
        // Nothing consumed from the generator either.
        assert_eq!(diag.generator_state(), initial);
        assert!(!bench.events().contains(&Event::IrqDisabled));
    }

    #[test]
    fn test_inverted_window_never_latches() {
        let bench = Bench::default();
        let (_heartbeat, mut diag) = configure(board(
            &bench,
            Unbacked { reads: 0 },
            Window::new(SRAM_BASE + 0x5000, SRAM_BASE),
        ));
        for _ in 0..100 {
            diag = diag.step().expect("inverted window latched");
        }
        assert_eq!(diag.memory().reads, 0);
    }
}
