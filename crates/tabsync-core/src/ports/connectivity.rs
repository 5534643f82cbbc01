//! Connectivity port - オフライン判定
//!
//! 粗いヒューリスティックです（到達性のプローブではない）。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Shared flag flipped by the HTTP client: offline after a connect failure,
/// online again after any response.
#[derive(Debug, Clone)]
pub struct OnlineFlag {
    online: Arc<AtomicBool>,
}

impl OnlineFlag {
    pub fn new() -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for OnlineFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl Connectivity for OnlineFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}
