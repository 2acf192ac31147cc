use core::num::NonZeroU32;

/// Seed used at every boot. Any non-zero value works; this one is fixed so
/// every device runs the same sequence.
pub const SEED: NonZeroU32 = match NonZeroU32::new(0x87a2_263c) {
    Some(seed) => seed,
    None => panic!("seed must be non-zero"),
};

/// One xorshift32 round. Zero maps to zero, anything else stays non-zero.
pub const fn step(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Saved generator position, for replaying a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(u32);

/// xorshift32 pseudorandom generator.
///
/// The output of each step is also the new state, so restoring a
/// [`Checkpoint`] reproduces exactly the values that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    pub const fn new(seed: NonZeroU32) -> Self {
        Self { state: seed.get() }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = step(self.state);
        self.state
    }

    pub fn state(&self) -> u32 {
        self.state
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.state)
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.state = checkpoint.0;
    }
}

impl Default for Xorshift32 {
    fn default() -> Self {
        Self::new(SEED)
    }
}
