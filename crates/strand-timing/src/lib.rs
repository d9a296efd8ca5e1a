mod clock;
mod duration;
mod instant;

pub use clock::{Clock, cycles_per_usec, global_clock};
pub use duration::Duration;
pub use instant::Instant;
