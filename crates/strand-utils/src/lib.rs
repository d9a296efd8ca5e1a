mod assert;
pub mod signal;
mod spin;
mod thread;

pub use spin::{SpinBit, spin_state, spin_state_enable};
pub use thread::{TxThreadMode, boot_tx_thread};
