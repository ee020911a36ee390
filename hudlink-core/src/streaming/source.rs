use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::cot::PositionFix;

/// The host's "current position" accessor, polled at transmit time.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// `None` when no self position is known yet.
    async fn current_position(&self) -> Option<PositionFix>;
}

/// A position slot the host overwrites as new fixes arrive.
#[derive(Debug, Clone, Default)]
pub struct LatestPosition {
    fix: Arc<Mutex<Option<PositionFix>>>,
}

impl LatestPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fix(fix: PositionFix) -> Self {
        let source = Self::new();
        source.set(fix);
        source
    }

    pub fn set(&self, fix: PositionFix) {
        *self.fix.lock().unwrap_or_else(PoisonError::into_inner) = Some(fix);
    }

    pub fn clear(&self) {
        *self.fix.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn get(&self) -> Option<PositionFix> {
        self.fix
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PositionSource for LatestPosition {
    async fn current_position(&self) -> Option<PositionFix> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_position_tracks_updates() {
        let source = LatestPosition::new();
        assert!(source.current_position().await.is_none());

        source.set(PositionFix::test_pattern("A"));
        let shared = source.clone();
        source.set(PositionFix::new(1.0, 2.0, 3.0, 4.0, "B"));
        assert_eq!(shared.current_position().await.unwrap().callsign, "B");

        shared.clear();
        assert!(source.get().is_none());
    }
}
