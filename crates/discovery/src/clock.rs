//! Sleep source for retry backoff

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Provides the waits between retries.
#[async_trait]
pub trait Clock: Debug + Send + Sync + 'static {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingClock;

#[cfg(test)]
mod recording {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::Clock;

    /// Records requested sleeps and returns immediately.
    #[derive(Clone, Debug, Default)]
    pub struct RecordingClock {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingClock {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every sleep requested so far, in order.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().clone()
        }
    }

    #[async_trait]
    impl Clock for RecordingClock {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
            tokio::task::yield_now().await;
        }
    }
}
