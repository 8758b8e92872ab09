use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::can::dispatcher::ClientQueues;
use crate::can::{CanDispatcher, ClientHandle, Frame, Identifier, RxFilter, SharedCanDispatcher};
use crate::osy::SharedOsyClient;
use crate::Result;

/// CAN dispatcher relaying through the CAN tunnel of a gateway. Frames sent by clients go out on
/// the gateway's `bus`; frames tunneled back are only passed on if they carry `response_id`.
pub struct RoutingDispatcher {
    gateway: SharedOsyClient,
    bus: u8,
    response_id: Identifier,
    clients: ClientQueues,
}

impl RoutingDispatcher {
    pub fn new(gateway: SharedOsyClient, bus: u8, response_id: Identifier) -> Self {
        Self {
            gateway,
            bus,
            response_id,
            clients: ClientQueues::default(),
        }
    }

    pub fn new_shared(gateway: SharedOsyClient, bus: u8, response_id: Identifier) -> SharedCanDispatcher {
        Arc::new(Mutex::new(Self::new(gateway, bus, response_id)))
    }
}

impl CanDispatcher for RoutingDispatcher {
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
        let frames = {
            let mut gateway = self.gateway.lock();
            gateway.poll_events()?;
            gateway.take_tunneled_frames()
        };
        for frame in frames {
            if frame.id != self.response_id {
                debug!("Dropping tunneled {:?}", frame);
                continue;
            }
            self.clients.distribute(&frame);
        }
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut relayed = frame.clone();
        relayed.bus = self.bus;
        self.gateway.lock().send_can_message(&relayed)
    }
}
