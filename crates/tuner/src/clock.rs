use std::time::Duration;
use async_trait::async_trait;

/// Injectable sleep source for the polling loops.
///
/// The job lifecycle tracks its own accumulated wait, so the only thing it
/// needs from the environment is the ability to pause. Tests substitute a
/// recording clock and run the stability/timeout logic without wall-clock
/// delay.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer.
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
