//! Poll-until-state helper shared by every `await_*` operation.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Spacing and deadline of a polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    /// Lower bound on the spacing between two polls.
    pub const MIN_INTERVAL: Duration = Duration::from_secs(2);

    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(Self::MIN_INTERVAL),
            timeout,
        }
    }

    /// Load balancer work requests.
    pub fn work_request() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10 * 60))
    }

    /// Block volumes becoming AVAILABLE.
    pub fn volume() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10 * 60))
    }

    /// File systems, exports and mount targets becoming ACTIVE.
    pub fn file_storage() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(5 * 60))
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::work_request()
    }
}

/// Call `check` until it yields a value, fails permanently, or the deadline passes.
///
/// The first check runs immediately. Transient API errors (throttling, 5xx,
/// transport) are logged and retried on the next tick; any other error ends
/// the loop.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => debug!("{} not ready (attempt {})", what, attempt),
            Err(e) if e.is_transient() => {
                warn!("Transient error polling {} (attempt {}): {}", what, attempt, e)
            }
            Err(e) => return Err(e),
        }

        if Instant::now() + policy.interval > deadline {
            return Err(Error::Timeout(format!(
                "{} after {:?} ({} attempts)",
                what, policy.timeout, attempt
            )));
        }
        sleep(policy.interval).await;
    }
}
