//! SRAM fill/verify loop.

use crate::hal::MemoryCells;
use crate::prng::Xorshift32;

/// Size of one tested cell. One generator output fills one cell.
pub const CELL_BYTES: u32 = 4;

/// Start of SRAM on the STM32F1 family.
pub const SRAM_BASE: u32 = 0x2000_0000;

/// Minimum SRAM a genuine STM32F103x8/xB has. Low-density remarks have less.
pub const REQUIRED_RAM: u32 = 20 * 1024;

/// Byte range `[start, end)` under test.
///
/// `start <= end` is not checked. An inverted or empty window has no cells,
/// so every pass succeeds without touching memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    start: u32,
    end: u32,
}

impl Window {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// From `start` (normally the end of static data) to the end of the
    /// required capacity.
    pub const fn up_to_required(start: u32) -> Self {
        Self::new(start, SRAM_BASE + REQUIRED_RAM)
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Cell addresses in walk order.
    pub fn cells(self) -> impl Iterator<Item = u32> {
        (self.start..self.end).step_by(CELL_BYTES as usize)
    }

    pub fn len(&self) -> usize {
        if self.end <= self.start {
            return 0;
        }
        let bytes = self.end - self.start;
        (bytes / CELL_BYTES + u32::from(bytes % CELL_BYTES != 0)) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First cell that did not return what was written to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption {
    pub address: u32,
    /// Position of the cell in walk order.
    pub cell: usize,
    pub expected: u32,
    pub actual: u32,
}

/// Proves every cell in a [`Window`] stores and returns arbitrary values.
///
/// Missing cells, stuck bits and aliased addresses (the signature of an
/// undersized die) all show up as a mismatch on the verify walk.
pub struct MemoryTest<M> {
    cells: M,
    window: Window,
    rng: Xorshift32,
}

impl<M: MemoryCells> MemoryTest<M> {
    pub fn new(cells: M, window: Window, rng: Xorshift32) -> Self {
        Self { cells, window, rng }
    }

    /// One fill walk followed by one verify walk.
    ///
    /// The verify walk regenerates the sequence from a checkpoint instead of
    /// storing it, and stops at the first mismatch. On success the generator
    /// is left past the checkpoint, so the next pass writes new values.
    pub fn run_pass(&mut self) -> Result<(), Corruption> {
        let window = self.window;
        let checkpoint = self.rng.checkpoint();

        for address in window.cells() {
            self.cells.write(address, self.rng.next_u32());
        }

        self.rng.restore(checkpoint);

        for (cell, address) in window.cells().enumerate() {
            let expected = self.rng.next_u32();
            let actual = self.cells.read(address);
            if actual != expected {
                return Err(Corruption {
                    address,
                    cell,
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    }

    /// Runs passes until one fails. Never returns on good memory.
    pub fn run(&mut self) -> Corruption {
        loop {
            if let Err(corruption) = self.run_pass() {
                return corruption;
            }
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn generator(&self) -> &Xorshift32 {
        &self.rng
    }

    pub fn cells(&self) -> &M {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapCells(HashMap<u32, u32>);

    impl MemoryCells for MapCells {
        fn write(&mut self, addr: u32, value: u32) {
            self.0.insert(addr, value);
        }

        fn read(&mut self, addr: u32) -> u32 {
            self.0.get(&addr).copied().unwrap_or(0)
        }
    }

    /// Only `size` bytes exist; higher addresses wrap around onto them.
    struct AliasedCells {
        words: Vec<u32>,
        base: u32,
    }

    impl AliasedCells {
        fn index(&self, addr: u32) -> usize {
            ((addr - self.base) / CELL_BYTES) as usize % self.words.len()
        }
    }

    impl MemoryCells for AliasedCells {
        fn write(&mut self, addr: u32, value: u32) {
            let i = self.index(addr);
            self.words[i] = value;
        }

        fn read(&mut self, addr: u32) -> u32 {
            self.words[self.index(addr)]
        }
    }

    #[test]
    fn test_window_len() {
        assert_eq!(Window::new(0x100, 0x100).len(), 0);
        assert_eq!(Window::new(0x100, 0x104).len(), 1);
        assert_eq!(Window::new(0x100, 0x105).len(), 2);
        assert_eq!(Window::new(0x200, 0x100).len(), 0);
        assert_eq!(Window::new(0x100, 0x200).cells().count(), 64);
    }

    #[test]
    fn test_window_up_to_required() {
        let w = Window::up_to_required(0x2000_0800);
        assert_eq!(w.end(), 0x2000_5000);
        assert_eq!(w.len(), (0x5000 - 0x800) / 4);
    }

    #[test]
    fn test_window_near_top_of_address_space() {
        let w = Window::new(0xffff_fff0, 0xffff_ffff);
        assert_eq!(w.cells().count(), 4);
        assert_eq!(w.len(), 4);
    }

    #[test]
    fn test_pass_on_good_memory() {
        let mut test = MemoryTest::new(
            MapCells::default(),
            Window::new(SRAM_BASE, SRAM_BASE + 256),
            Xorshift32::default(),
        );
        for _ in 0..10 {
            assert_eq!(test.run_pass(), Ok(()));
        }
        assert_eq!(test.cells().0.len(), 64);
    }

    #[test]
    fn test_generator_advances_by_one_window_per_pass() {
        let window = Window::new(SRAM_BASE, SRAM_BASE + 64);
        let mut test = MemoryTest::new(MapCells::default(), window, Xorshift32::default());
        test.run_pass().unwrap();

        let mut reference = Xorshift32::default();
        for _ in 0..window.len() {
            reference.next_u32();
        }
        assert_eq!(test.generator(), &reference);
    }

    #[test]
    fn test_aliased_half_size_memory_fails() {
        // 8 KiB of real storage behind a 16 KiB window: the second half of the
        // fill overwrites the first, so the very first cell reads back wrong.
        let size = 8 * 1024;
        let mut test = MemoryTest::new(
            AliasedCells {
                words: vec![0; size / 4],
                base: SRAM_BASE,
            },
            Window::new(SRAM_BASE, SRAM_BASE + 2 * size as u32),
            Xorshift32::default(),
        );

        let corruption = test.run_pass().unwrap_err();
        assert_eq!(corruption.cell, 0);
        assert_eq!(corruption.address, SRAM_BASE);
        assert_eq!(corruption.expected, 0xafdd_364e);
    }

    #[test]
    fn test_run_returns_first_corruption() {
        struct StuckBit;
        impl MemoryCells for StuckBit {
            fn write(&mut self, _addr: u32, _value: u32) {}
            fn read(&mut self, _addr: u32) -> u32 {
                0
            }
        }

        let mut test = MemoryTest::new(
            StuckBit,
            Window::new(SRAM_BASE, SRAM_BASE + 16),
            Xorshift32::default(),
        );
        let corruption = test.run();
        assert_eq!(corruption.cell, 0);
        assert_eq!(corruption.actual, 0);
    }
}
