mod error;
mod seq;
mod timer;

pub use error::{ErrorDebugger, MediaError};
pub use seq::{is_late, normalize_seq, RETRANSMIT_WINDOW};
pub use timer::{ManualTimer, SystemTimer, Timer};
