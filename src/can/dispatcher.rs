//! Client multiplexing on top of a [`CanAdapter`]. Every protocol instance registers itself as a client,
//! installs a receive filter and reads its own FIFO queue. Incoming traffic is only pulled from the
//! adapter when somebody calls [`CanDispatcher::dispatch_incoming`], so blocking protocol calls re-drive
//! the dispatcher on every iteration of their polling loop.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::can::{CanAdapter, Frame, Identifier};
use crate::error::Error;
use crate::Result;

const CAN_RX_QUEUE_SIZE: usize = 1024;
const DEBUG: bool = false;

/// Index of a registered dispatcher client.
pub type ClientHandle = usize;

/// Dispatcher shared between all protocol instances talking on the same physical bus.
pub type SharedCanDispatcher = Arc<Mutex<dyn CanDispatcher>>;

/// Acceptance filter. A frame passes if the identifier type matches and `(id & mask) == (filter.id & mask)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RxFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl RxFilter {
    /// Filter letting exactly one identifier pass.
    pub fn exact(id: Identifier) -> Self {
        Self {
            id: id.into(),
            mask: 0x1fff_ffff,
            extended: id.is_extended(),
        }
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        let id: u32 = frame.id.into();
        frame.id.is_extended() == self.extended && (id & self.mask) == (self.id & self.mask)
    }
}

/// Send, receive-queue and filter primitives every bus transport offers to the protocol layers.
pub trait CanDispatcher: Send {
    fn register_client(&mut self) -> ClientHandle;
    fn remove_client(&mut self, handle: ClientHandle);
    /// `None` removes the filter and lets every frame pass.
    fn set_rx_filter(&mut self, handle: ClientHandle, filter: Option<RxFilter>) -> Result<()>;
    fn clear_rx_queue(&mut self, handle: ClientHandle) -> Result<()>;
    /// Pop the oldest frame queued for this client, if any.
    fn read_from_queue(&mut self, handle: ClientHandle) -> Result<Option<Frame>>;
    /// Pull everything the transport has received and distribute it to the client queues.
    fn dispatch_incoming(&mut self) -> Result<()>;
    fn send(&mut self, frame: &Frame) -> Result<()>;
}

struct ClientQueue {
    filter: Option<RxFilter>,
    queue: VecDeque<Frame>,
}

/// Per-client receive queues. Shared by all [`CanDispatcher`] implementations.
#[derive(Default)]
pub struct ClientQueues {
    clients: Vec<Option<ClientQueue>>,
}

impl ClientQueues {
    pub fn register(&mut self) -> ClientHandle {
        self.clients.push(Some(ClientQueue {
            filter: None,
            queue: VecDeque::new(),
        }));
        self.clients.len() - 1
    }

    pub fn remove(&mut self, handle: ClientHandle) {
        if let Some(slot) = self.clients.get_mut(handle) {
            *slot = None;
        }
    }

    fn client(&mut self, handle: ClientHandle) -> Result<&mut ClientQueue> {
        self.clients
            .get_mut(handle)
            .and_then(|c| c.as_mut())
            .ok_or(Error::NotFound)
    }

    pub fn set_filter(&mut self, handle: ClientHandle, filter: Option<RxFilter>) -> Result<()> {
        self.client(handle)?.filter = filter;
        Ok(())
    }

    pub fn clear(&mut self, handle: ClientHandle) -> Result<()> {
        self.client(handle)?.queue.clear();
        Ok(())
    }

    pub fn pop(&mut self, handle: ClientHandle) -> Result<Option<Frame>> {
        Ok(self.client(handle)?.queue.pop_front())
    }

    /// Append a frame to the queue of every client whose filter accepts it.
    pub fn distribute(&mut self, frame: &Frame) {
        for client in self.clients.iter_mut().flatten() {
            if client.filter.map_or(true, |f| f.matches(frame)) {
                if client.queue.len() >= CAN_RX_QUEUE_SIZE {
                    warn!("RX queue full, dropping oldest frame");
                    client.queue.pop_front();
                }
                client.queue.push_back(frame.clone());
            }
        }
    }
}

/// [`CanDispatcher`] backed directly by a hardware adapter.
pub struct AdapterDispatcher<A: CanAdapter> {
    adapter: A,
    clients: ClientQueues,
}

impl<A: CanAdapter + Send + 'static> AdapterDispatcher<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            clients: ClientQueues::default(),
        }
    }

    /// Convenience constructor wrapping the dispatcher for sharing between protocol instances.
    pub fn new_shared(adapter: A) -> SharedCanDispatcher {
        Arc::new(Mutex::new(Self::new(adapter)))
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

impl<A: CanAdapter + Send> CanDispatcher for AdapterDispatcher<A> {
    fn register_client(&mut self) -> ClientHandle {
        self.clients.register()
    }

    fn remove_client(&mut self, handle: ClientHandle) {
        self.clients.remove(handle)
    }

    fn set_rx_filter(&mut self, handle: ClientHandle, filter: Option<RxFilter>) -> Result<()> {
        self.clients.set_filter(handle, filter)
    }

    fn clear_rx_queue(&mut self, handle: ClientHandle) -> Result<()> {
        self.clients.clear(handle)
    }

    fn read_from_queue(&mut self, handle: ClientHandle) -> Result<Option<Frame>> {
        self.clients.pop(handle)
    }

    fn dispatch_incoming(&mut self) -> Result<()> {
        for frame in self.adapter.recv()? {
            // Our own frames coming back from the adapter are not traffic
            if frame.loopback {
                continue;
            }
            if DEBUG {
                debug! {"RX {:?}", frame};
            }
            self.clients.distribute(&frame);
        }
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        if DEBUG {
            debug! {"TX {:?}", frame};
        }
        self.adapter.send(std::slice::from_ref(frame))
    }
}
