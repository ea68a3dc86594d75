use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond clock used by every time-dependent decision in the workspace.
/// Injected so rate-limit and hold-off logic can be tested without sleeping.
pub trait Timer: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Default)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn now_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before unix epoch").as_millis() as u64
    }
}

/// Test clock driven by hand.
#[derive(Clone, Default)]
pub struct ManualTimer {
    now_ms: Arc<AtomicU64>,
}

impl ManualTimer {
    pub fn set(&self, value_ms: u64) {
        self.now_ms.store(value_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Timer for ManualTimer {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}
