use std::fmt::Debug;

/// Transport-facing error carrying a stable code plus a human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaError {
    pub code: String,
    pub message: String,
}

impl MediaError {
    pub fn build<C: ToString, M: ToString>(code: C, message: M) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// Log-and-continue helper for results whose failure must not stop a loop,
/// like single packet writes to a sink.
pub trait ErrorDebugger {
    fn log_error(&self, msg: &str);
}

impl<D, E: Debug> ErrorDebugger for Result<D, E> {
    fn log_error(&self, msg: &str) {
        if let Err(e) = self {
            log::error!("{}: {:?}", msg, e);
        }
    }
}
