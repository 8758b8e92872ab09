//! The one blocking loop of the crate. Protocol calls never wait on an event; they repeatedly drive
//! their transport until the expected message shows up or the budget runs out.

use std::time::{Duration, Instant};

use crate::error::Error;
use crate::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Point in time after which a wait is abandoned. Can be pushed back, e.g. on "response pending".
#[derive(Debug, Copy, Clone)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Restart the wait with a new budget counted from now.
    pub fn reset(&mut self, timeout: Duration) {
        self.at = Instant::now() + timeout;
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Call `step` until it yields a value or `deadline` expires. `step` must re-drive the transport
/// itself. It is always called at least once, and once more after the deadline passed so a
/// response arriving during the last sleep is not lost.
pub fn poll_with_deadline<T>(
    deadline: &mut Deadline,
    mut step: impl FnMut(&mut Deadline) -> Result<Option<T>>,
) -> Result<T> {
    loop {
        let expired = deadline.expired();
        if let Some(value) = step(deadline)? {
            return Ok(value);
        }
        if expired {
            return Err(Error::Timeout);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// [`poll_with_deadline`] with a fixed budget.
pub fn poll_until<T>(timeout: Duration, mut step: impl FnMut() -> Result<Option<T>>) -> Result<T> {
    let mut deadline = Deadline::after(timeout);
    poll_with_deadline(&mut deadline, |_| step())
}

/// Collect everything `step` yields until `window` has passed. Used for broadcasts, where zero or
/// more answers are valid.
pub fn collect_for<T>(window: Duration, mut step: impl FnMut() -> Result<Option<T>>) -> Result<Vec<T>> {
    let deadline = Deadline::after(window);
    let mut collected = vec![];
    loop {
        let expired = deadline.expired();
        while let Some(value) = step()? {
            collected.push(value);
        }
        if expired {
            return Ok(collected);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
