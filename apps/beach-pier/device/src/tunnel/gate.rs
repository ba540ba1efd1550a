use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};

pub const DEFAULT_GATE_WAIT: Duration = Duration::from_secs(15);

/// Limits how many tunnels may be mid-handshake at once.
///
/// One gate is built at startup and handed to every [`CloudTunnel`]; holders
/// keep their permit from transport start until the connection is up (or a
/// short hold expires), never for the life of the connection.
///
/// [`CloudTunnel`]: super::CloudTunnel
#[derive(Debug)]
pub struct DialGate {
    permits: Arc<Semaphore>,
    wait: Duration,
}

impl DialGate {
    pub fn new(concurrent_dials: usize, wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(concurrent_dials.max(1))),
            wait,
        })
    }

    /// Single-dial gate with the default wait.
    pub fn serial() -> Arc<Self> {
        Self::new(1, DEFAULT_GATE_WAIT)
    }

    /// Waits up to the configured bound for a permit. `None` means the wait
    /// timed out; callers dial anyway rather than stall forever.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        timeout(self.wait, Arc::clone(&self.permits).acquire_owned())
            .await
            .ok()
            .and_then(Result::ok)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_dial_waits_for_the_first() {
        let gate = DialGate::new(1, Duration::from_secs(15));
        let first = gate.acquire().await.expect("first permit");
        assert_eq!(gate.available(), 0);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.is_some() })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(first);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_bounded() {
        let gate = DialGate::new(1, Duration::from_secs(15));
        let _held = gate.acquire().await.expect("permit");
        let started = tokio::time::Instant::now();
        assert!(gate.acquire().await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(15));
    }
}
