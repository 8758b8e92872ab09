//! Background keep-alive. Gateways drop their routing when the diagnostic session times out, so
//! while sessions are routed the last gateway of every route gets a one-way tester present on each
//! tick.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::osy::SharedOsyClient;
use crate::types::ServerId;

const TICK_RESOLUTION: Duration = Duration::from_millis(5);

struct Wait {
    id: u64,
    expected: Duration,
    deadline: Instant,
    overdue: bool,
}

#[derive(Default)]
struct Shared {
    targets: Mutex<HashMap<ServerId, SharedOsyClient>>,
    /// Long operations currently running
    waits: Mutex<Vec<Wait>>,
    next_wait: AtomicU64,
    /// Tick requested ahead of schedule
    kick: AtomicBool,
    ticks: AtomicU64,
}

impl Shared {
    fn tick(&self) {
        let targets: Vec<(ServerId, SharedOsyClient)> = self
            .targets
            .lock()
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();

        for (id, client) in targets {
            if let Err(e) = client.lock().tester_present_one_way() {
                warn!("Keep-alive for {} failed: {}", id, e);
            }
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark waits that ran past their expected duration. True if any did since the last call.
    fn expire_waits(&self) -> bool {
        let now = Instant::now();
        let mut expired = false;
        for wait in self.waits.lock().iter_mut() {
            if !wait.overdue && now >= wait.deadline {
                warn!("Operation still running after {:?}", wait.expected);
                wait.overdue = true;
                expired = true;
            }
        }
        expired
    }
}

fn process(shared: Arc<Shared>, interval: Duration, mut shutdown_receiver: oneshot::Receiver<()>) {
    let mut last = Instant::now();
    while shutdown_receiver.try_recv().is_err() {
        let expired = shared.expire_waits();
        if expired || shared.kick.swap(false, Ordering::Relaxed) || last.elapsed() >= interval {
            shared.tick();
            last = Instant::now();
        }
        std::thread::sleep(TICK_RESOLUTION);
    }
}

/// Periodic tester present to the last hop of every routed session. Dropping it stops the thread
/// after the running tick completed.
pub struct KeepAlive {
    shared: Arc<Shared>,
    processing_handle: Option<std::thread::JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl KeepAlive {
    pub fn start(interval: Duration) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let shared = Arc::new(Shared::default());

        let thread_shared = shared.clone();
        let processing_handle = std::thread::spawn(move || {
            process(thread_shared, interval, shutdown_receiver);
        });

        Self {
            shared,
            processing_handle: Some(processing_handle),
            shutdown: Some(shutdown_sender),
        }
    }

    pub fn register(&self, id: ServerId, client: SharedOsyClient) {
        debug!("Keep-alive for {}", id);
        self.shared.targets.lock().insert(id, client);
    }

    pub fn unregister(&self, id: ServerId) {
        self.shared.targets.lock().remove(&id);
    }

    pub fn registered(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.shared.targets.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of ticks sent so far.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Announce an operation that may run longer than the session timeout. The sessions are
    /// refreshed right away and again as soon as `expected` has elapsed with the guard still alive.
    pub fn wait_time(&self, expected: Duration) -> WaitTime {
        info!("Waiting up to {:?}", expected);
        let id = self.shared.next_wait.fetch_add(1, Ordering::Relaxed);
        self.shared.waits.lock().push(Wait {
            id,
            expected,
            deadline: Instant::now() + expected,
            overdue: false,
        });
        self.shared.kick.store(true, Ordering::Relaxed);
        WaitTime {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Long operations currently announced with [`KeepAlive::wait_time`].
    pub fn pending_waits(&self) -> usize {
        self.shared.waits.lock().len()
    }

    /// Announced operations running longer than they said they would.
    pub fn overdue_waits(&self) -> usize {
        self.shared.waits.lock().iter().filter(|w| w.overdue).count()
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(handle) = self.processing_handle.take() {
            // Send shutdown signal to background thread
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            let _ = handle.join();
        }
    }
}

/// Registration of a long operation.
pub struct WaitTime {
    id: u64,
    shared: Arc<Shared>,
}

impl Drop for WaitTime {
    fn drop(&mut self) {
        self.shared.waits.lock().retain(|w| w.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::osy::{OsyClient, OsyTransport};

    /// Records every request; the first `failures` sends fail.
    struct Recorder {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        attempts: Arc<AtomicU64>,
        failures: u64,
    }

    impl OsyTransport for Recorder {
        fn send(&mut self, request: &[u8]) -> crate::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            if attempt < self.failures {
                return Err(crate::Error::Timeout);
            }
            self.sent.lock().push(request.to_vec());
            Ok(())
        }

        fn poll(&mut self) -> crate::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn gateway(failures: u64) -> (SharedOsyClient, Arc<Mutex<Vec<Vec<u8>>>>, Arc<AtomicU64>) {
        let sent = Arc::new(Mutex::new(vec![]));
        let attempts = Arc::new(AtomicU64::new(0));
        let transport = Recorder {
            sent: sent.clone(),
            attempts: attempts.clone(),
            failures,
        };
        let id = ServerId { bus: 0, node: 1 };
        let client = OsyClient::new(Box::new(transport), id, &StackConfig::default());
        (client.into_shared(), sent, attempts)
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn ticks_without_targets_and_stops_on_drop() {
        let keep_alive = KeepAlive::start(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));
        assert!(keep_alive.ticks() >= 2);
        drop(keep_alive);
    }

    #[test]
    fn tester_present_to_registered_gateway() {
        let keep_alive = KeepAlive::start(Duration::from_millis(10));
        let (client, sent, _) = gateway(0);
        keep_alive.register(ServerId { bus: 0, node: 1 }, client);

        wait_for(|| sent.lock().len() >= 2);
        let sent = sent.lock().clone();
        assert!(sent.len() >= 2);
        assert!(sent.iter().all(|request| request == &[0x3e, 0x80]));
    }

    #[test]
    fn failing_send_is_retried_on_next_tick() {
        let keep_alive = KeepAlive::start(Duration::from_millis(10));
        let (client, sent, attempts) = gateway(2);
        keep_alive.register(ServerId { bus: 0, node: 1 }, client);

        wait_for(|| !sent.lock().is_empty());
        assert!(attempts.load(Ordering::Relaxed) >= 3);
        assert_eq!(sent.lock()[0], vec![0x3e, 0x80]);

        keep_alive.unregister(ServerId { bus: 0, node: 1 });
        assert!(keep_alive.registered().is_empty());
    }

    #[test]
    fn wait_time_is_counted() {
        let keep_alive = KeepAlive::start(Duration::from_secs(60));
        {
            let _wait = keep_alive.wait_time(Duration::from_secs(5));
            assert_eq!(keep_alive.pending_waits(), 1);
            wait_for(|| keep_alive.ticks() > 0);
            assert_eq!(keep_alive.ticks(), 1);
            assert_eq!(keep_alive.overdue_waits(), 0);
        }
        assert_eq!(keep_alive.pending_waits(), 0);
    }

    #[test]
    fn overrunning_wait_refreshes_again() {
        let keep_alive = KeepAlive::start(Duration::from_secs(60));
        let wait = keep_alive.wait_time(Duration::from_millis(50));
        wait_for(|| keep_alive.ticks() >= 2);
        assert_eq!(keep_alive.ticks(), 2);
        assert_eq!(keep_alive.overdue_waits(), 1);
        drop(wait);
        assert_eq!(keep_alive.overdue_waits(), 0);
    }
}
