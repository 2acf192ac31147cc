pub mod gpio;
pub mod nvic;
pub mod rcc;
pub mod timer;
pub mod uart;
