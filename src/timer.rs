//! Single-shot, tag-stamped timeout guard.
//!
//! Every arm captures the guard's current tag. Expiry is reported through a
//! callback (usually a registry dispatch) carrying that tag, and the owner
//! asks [`TimeoutGuard::take_expired`] whether it still applies. Cancelling
//! only bumps the tag, so an expiry that already left the sleeper task is
//! harmless.

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    ReadNextMessage,
    WriteResponse,
    HandleRequest,
    Sendfile,
    WsKeepalive,
    WsCloseHandshake,
}

/// Expiry notice of one particular arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    tag: u64,
}

#[derive(Debug, Default)]
pub struct TimeoutGuard {
    tag: u64,
    armed: Option<(TimeoutKind, Instant)>,
    sleeper: Option<JoinHandle<()>>,
}

impl TimeoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any pending wait. `on_expire` runs once the deadline passes,
    /// unless the guard is cancelled or re-armed first.
    pub fn arm<F>(&mut self, deadline: Instant, kind: TimeoutKind, on_expire: F)
    where
        F: FnOnce(Expired) + Send + 'static,
    {
        self.cancel();

        let expired = Expired { tag: self.tag };
        self.armed = Some((kind, deadline));
        self.sleeper = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            on_expire(expired);
        }));
    }

    /// Idempotent.
    pub fn cancel(&mut self) {
        self.tag = self.tag.wrapping_add(1);
        self.armed = None;
        if let Some(sleeper) = self.sleeper.take() {
            sleeper.abort();
        }
    }

    /// Returns the kind of the current arm if `expired` belongs to it, and
    /// disarms the guard. Stale notices yield `None`.
    pub fn take_expired(&mut self, expired: Expired) -> Option<TimeoutKind> {
        if expired.tag != self.tag {
            return None;
        }
        let (kind, _) = self.armed.take()?;
        self.tag = self.tag.wrapping_add(1);
        self.sleeper = None;
        Some(kind)
    }

    pub fn armed(&self) -> Option<(TimeoutKind, Instant)> {
        self.armed
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reports_matching_expiry_once() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut guard = TimeoutGuard::new();
        guard.arm(Instant::now() + Duration::from_millis(50), TimeoutKind::HandleRequest, move |e| {
            let _ = tx.send(e);
        });

        let expired = rx.recv().await.unwrap();
        assert_eq!(guard.take_expired(expired), Some(TimeoutKind::HandleRequest));
        assert_eq!(guard.take_expired(expired), None);
        assert_eq!(guard.armed(), None);
    }
}
