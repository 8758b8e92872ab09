//! Legacy bus protocol of the STW flashloader family ("KEFEX"). Services address variables by a 16 bit
//! index or memory by a 32 bit address, and every request is answered by exactly one response frame.
//!
//! Requests go out on `BaseID` as `[server address, tag, payload...]`, responses come back on
//! `BaseID + 1` as `[tag | error bit, index..., payload...]`. Cyclic transmissions registered by the
//! client arrive on the same identifier and are handed to a callback instead of the response slot.
//!
//! All calls block, driving the dispatcher until the expected response arrives or the configured
//! timeout expires. Variables and values larger than six bytes use the segmented services in
//! [`segmented`], bulk memory writes use [`ssl`].
pub mod codec;
pub mod constants;
pub mod error;
pub mod locks;
pub mod segmented;
pub mod ssl;

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::can::{ClientHandle, Frame, Identifier, RxFilter, SharedCanDispatcher};
use crate::config::CommConfiguration;
use crate::error::Error as StackError;
use crate::poll::poll_until;
use crate::types::ServerId;
use crate::Result;

pub use codec::{CyclicCallback, CyclicTransmission, ServiceResponse};
pub use constants::ServiceTag;
pub use error::Error;
pub use locks::{LockCategory, LockSet};

/// Communication parameters of one protocol instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KefexSettings {
    /// Request identifier; responses use `base_id + 1`
    pub base_id: u32,
    pub client_address: u8,
    pub server_address: u8,
    pub timeout_ms: u64,
    pub block_size: u8,
    pub bus: u8,
}

impl Default for KefexSettings {
    fn default() -> Self {
        Self {
            base_id: 0x600,
            client_address: 0,
            server_address: 1,
            timeout_ms: 200,
            block_size: 20,
            bus: 0,
        }
    }
}

impl KefexSettings {
    /// Parameter list with the static ranges and defaults, ready to be loaded from a section.
    pub fn default_configuration() -> CommConfiguration {
        let mut config = CommConfiguration::new();
        for (name, min, max, default) in constants::DEFAULT_PARAMETERS {
            // Names in the static table are unique
            let _ = config.add(name, *min, *max, *default);
        }
        config
    }

    pub fn from_configuration(config: &CommConfiguration) -> Result<Self> {
        let get = |name: &str| -> Result<i64> {
            let parameter = config.parameter(name).ok_or(StackError::NotConfigured)?;
            if parameter.value < parameter.min || parameter.value > parameter.max {
                return Err(StackError::Range);
            }
            Ok(parameter.value)
        };
        let settings = Self {
            base_id: get("BaseID")? as u32,
            client_address: get("ClientAddress")? as u8,
            server_address: get("ServerAddress")? as u8,
            timeout_ms: get("Timeout")? as u64,
            block_size: get("BlockSize")? as u8,
            bus: get("Bus")? as u8,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_configuration(&self) -> CommConfiguration {
        let mut config = Self::default_configuration();
        for (name, value) in [
            ("BaseID", self.base_id as i64),
            ("ClientAddress", self.client_address as i64),
            ("ServerAddress", self.server_address as i64),
            ("Timeout", self.timeout_ms as i64),
            ("BlockSize", self.block_size as i64),
            ("Bus", self.bus as i64),
        ] {
            let _ = config.set(name, value);
        }
        config
    }

    fn validate(&self) -> Result<()> {
        if self.base_id > constants::MAX_BASE_ID || self.block_size == 0 {
            return Err(StackError::Range);
        }
        Ok(())
    }

    pub fn request_id(&self) -> Identifier {
        Identifier::Standard(self.base_id)
    }

    pub fn response_id(&self) -> Identifier {
        Identifier::Standard(self.base_id + 1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

struct Link {
    settings: KefexSettings,
    dispatcher: SharedCanDispatcher,
    client: ClientHandle,
    slot: codec::ResponseSlot,
}

impl Link {
    /// Pull at most one frame for this client, re-driving the dispatcher if its queue is empty.
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut dispatcher = self.dispatcher.lock();
        if let Some(frame) = dispatcher.read_from_queue(self.client)? {
            return Ok(Some(frame));
        }
        dispatcher.dispatch_incoming()?;
        dispatcher.read_from_queue(self.client)
    }
}

/// One client session of the legacy protocol talking to one server.
pub struct KefexProtocol {
    link: Mutex<Link>,
    locks: LockSet,
    cyclic: Mutex<Option<CyclicCallback>>,
    write_state: Mutex<segmented::WriteState>,
}

impl KefexProtocol {
    pub fn new(dispatcher: SharedCanDispatcher, settings: KefexSettings) -> Result<Self> {
        settings.validate()?;
        let client = {
            let mut d = dispatcher.lock();
            let client = d.register_client();
            d.set_rx_filter(client, Some(RxFilter::exact(settings.response_id())))?;
            client
        };
        Ok(Self {
            link: Mutex::new(Link {
                settings,
                dispatcher,
                client,
                slot: Default::default(),
            }),
            locks: LockSet::new(),
            cyclic: Mutex::new(None),
            write_state: Mutex::new(segmented::WriteState::Idle),
        })
    }

    pub fn settings(&self) -> KefexSettings {
        self.link.lock().settings
    }

    /// Apply new communication parameters. The response filter follows the new base identifier.
    pub fn set_settings(&self, settings: KefexSettings) -> Result<()> {
        settings.validate()?;
        let mut link = self.link.lock();
        link.dispatcher
            .lock()
            .set_rx_filter(link.client, Some(RxFilter::exact(settings.response_id())))?;
        link.settings = settings;
        link.slot.clear();
        Ok(())
    }

    pub fn server_id(&self) -> ServerId {
        let settings = self.settings();
        ServerId {
            bus: settings.bus,
            node: settings.server_address,
        }
    }

    pub fn locks(&self) -> &LockSet {
        &self.locks
    }

    /// State the last segmented write ended in.
    pub fn write_state(&self) -> segmented::WriteState {
        *self.write_state.lock()
    }

    fn set_write_state(&self, state: segmented::WriteState) {
        *self.write_state.lock() = state;
    }

    pub fn dispatcher(&self) -> SharedCanDispatcher {
        self.link.lock().dispatcher.clone()
    }

    /// Move the session to another dispatcher, e.g. one that tunnels through a gateway. Returns the
    /// previous dispatcher so it can be restored later.
    pub fn set_dispatcher(&self, dispatcher: SharedCanDispatcher) -> Result<SharedCanDispatcher> {
        let mut link = self.link.lock();
        let filter = RxFilter::exact(link.settings.response_id());
        let client = {
            let mut d = dispatcher.lock();
            let client = d.register_client();
            d.set_rx_filter(client, Some(filter))?;
            client
        };
        link.dispatcher.lock().remove_client(link.client);
        link.client = client;
        link.slot.clear();
        Ok(std::mem::replace(&mut link.dispatcher, dispatcher))
    }

    /// Install or remove the receiver of cyclic transmissions.
    pub fn set_cyclic_callback(&self, callback: Option<CyclicCallback>) {
        *self.cyclic.lock() = callback;
    }

    pub(crate) fn request(&self, tag: ServiceTag, payload: &[u8]) -> Result<()> {
        let link = self.link.lock();
        let data = codec::encode_request(link.settings.server_address, tag, payload)?;
        let frame = Frame::new(link.settings.bus, link.settings.request_id(), &data)?;
        debug!("KEFEX TX {:?} {}", tag, hex::encode(&data));
        let sent = link.dispatcher.lock().send(&frame);
        sent
    }

    /// Drain incoming frames until a response to `tag` sits in the slot.
    fn poll_response(&self, tag: ServiceTag) -> Result<Option<ServiceResponse>> {
        let mut link = self.link.lock();
        loop {
            if let Some(response) = link.slot.take_matching(tag) {
                return Ok(Some(response));
            }
            let Some(frame) = link.next_frame()? else {
                return Ok(None);
            };

            match codec::decode(&frame.data) {
                Ok(codec::Decoded::Response(response)) => link.slot.set(response),
                Ok(codec::Decoded::Cyclic(transmission)) => {
                    if let Some(callback) = self.cyclic.lock().as_mut() {
                        callback(transmission);
                    }
                }
                Err(e) => warn!("Ignoring frame {:?}: {}", frame, e),
            }
        }
    }

    /// Wait for the response to `tag`. Error responses and responses for another index are
    /// reported as errors.
    pub(crate) fn wait_response(&self, tag: ServiceTag, index: Option<u32>) -> Result<ServiceResponse> {
        let timeout = self.settings().timeout();
        let response = poll_until(timeout, || self.poll_response(tag))?;
        debug!("KEFEX RX {:?} {}", tag, hex::encode(response.payload()));

        if let Some(code) = response.error_code() {
            return Err(Error::NegativeResponse(code).into());
        }
        if let Some(expected) = index {
            if response.index != expected {
                return Err(Error::UnexpectedIndex {
                    expected,
                    actual: response.index,
                }
                .into());
            }
        }
        Ok(response)
    }

    /// Consume the unread response, whatever service it answers.
    pub fn take_response(&self) -> Option<ServiceResponse> {
        self.link.lock().slot.take()
    }

    fn check_index(index: u32) -> Result<[u8; 2]> {
        u16::try_from(index)
            .map(|i| i.to_le_bytes())
            .map_err(|_| StackError::Range)
    }

    /// Log on with the CRC of the server's parameter set. The server echoes the CRC.
    pub fn logon(&self, crc: u16) -> Result<()> {
        let _guard = self.locks.acquire(LockCategory::Logon);
        self.request(ServiceTag::Logon, &crc.to_le_bytes())?;
        let response = self.wait_response(ServiceTag::Logon, None)?;
        if response.value_u16() != crc {
            return Err(Error::UnexpectedEcho.into());
        }
        Ok(())
    }

    pub fn logoff(&self) -> Result<()> {
        let _guard = self.locks.acquire(LockCategory::Logon);
        self.request(ServiceTag::Logoff, &[])?;
        self.wait_response(ServiceTag::Logoff, None)?;
        Ok(())
    }

    /// Read a variable of up to four bytes.
    pub fn read(&self, index: u32) -> Result<i32> {
        let idx = Self::check_index(index)?;
        let _guard = self.locks.acquire(LockCategory::GenericRequest);
        self.request(ServiceTag::SingleRead, &idx)?;
        let response = self.wait_response(ServiceTag::SingleRead, Some(index))?;
        Ok(response.value_u32() as i32)
    }

    /// Write a variable of up to four bytes, answered once the server applied it.
    pub fn write_immediate(&self, index: u32, value: i32) -> Result<()> {
        let idx = Self::check_index(index)?;
        let _guard = self.locks.acquire(LockCategory::ImmediateWrite);
        let mut payload = idx.to_vec();
        payload.extend(value.to_le_bytes());
        self.request(ServiceTag::ImmediateWrite, &payload)?;
        self.wait_response(ServiceTag::ImmediateWrite, Some(index))?;
        Ok(())
    }

    /// Register a cyclic transmission of `index` every `interval_ms`.
    pub fn register_cyclic_timer(&self, index: u32, interval_ms: u16) -> Result<()> {
        let idx = Self::check_index(index)?;
        let _guard = self.locks.acquire(LockCategory::GenericRequest);
        let mut payload = idx.to_vec();
        payload.extend(interval_ms.to_le_bytes());
        self.request(ServiceTag::TimerCyclicRegister, &payload)?;
        self.wait_response(ServiceTag::TimerCyclicRegister, Some(index))?;
        Ok(())
    }

    /// Register a transmission of `index` whenever it changes by more than `hysteresis`, at most
    /// every `min_interval_ms`.
    pub fn register_cyclic_change(&self, index: u32, min_interval_ms: u16, hysteresis: u16) -> Result<()> {
        let idx = Self::check_index(index)?;
        let _guard = self.locks.acquire(LockCategory::GenericRequest);
        let mut payload = idx.to_vec();
        payload.extend(min_interval_ms.to_le_bytes());
        payload.extend(hysteresis.to_le_bytes());
        self.request(ServiceTag::ChangeCyclicRegister, &payload)?;
        self.wait_response(ServiceTag::ChangeCyclicRegister, Some(index))?;
        Ok(())
    }

    pub fn abort_individual(&self, index: u32) -> Result<()> {
        let idx = Self::check_index(index)?;
        let _guard = self.locks.acquire(LockCategory::AbortIndividual);
        self.request(ServiceTag::AbortIndividual, &idx)?;
        self.wait_response(ServiceTag::AbortIndividual, Some(index))?;
        Ok(())
    }

    pub fn abort_all(&self) -> Result<()> {
        let _guard = self.locks.acquire(LockCategory::AbortAll);
        self.request(ServiceTag::AbortAll, &[])?;
        self.wait_response(ServiceTag::AbortAll, None)?;
        Ok(())
    }

    /// Change the cycle time of one of the server's transmission tasks.
    pub fn update_task(&self, task: u8, interval_ms: u16) -> Result<()> {
        let _guard = self.locks.acquire(LockCategory::UpdateTask);
        let mut payload = vec![task];
        payload.extend(interval_ms.to_le_bytes());
        self.request(ServiceTag::UpdateTask, &payload)?;
        let response = self.wait_response(ServiceTag::UpdateTask, None)?;
        if response.payload() != payload.as_slice() {
            return Err(Error::UnexpectedEcho.into());
        }
        Ok(())
    }

    /// Read one or two bytes of EEPROM.
    pub fn read_eeprom(&self, address: u32, len: u8) -> Result<Vec<u8>> {
        if !(1..=2).contains(&len) {
            return Err(StackError::Range);
        }
        let _guard = self.locks.acquire(LockCategory::EepromRead);
        let mut payload = address.to_le_bytes().to_vec();
        payload.push(len);
        self.request(ServiceTag::EepromRead, &payload)?;
        let response = self.wait_response(ServiceTag::EepromRead, Some(address))?;
        match response.payload().get(..len as usize) {
            Some(data) => Ok(data.to_vec()),
            None => Err(Error::MalformedResponse.into()),
        }
    }

    /// Read an EEPROM block of any length, two bytes per request.
    pub fn read_eeprom_block(&self, address: u32, len: usize) -> Result<Vec<u8>> {
        if len > 0 {
            address.checked_add(len as u32 - 1).ok_or(StackError::Range)?;
        }
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let chunk = (len - data.len()).min(2) as u8;
            data.extend(self.read_eeprom(address + data.len() as u32, chunk)?);
        }
        Ok(data)
    }
}

impl Drop for KefexProtocol {
    fn drop(&mut self) {
        let link = self.link.get_mut();
        link.dispatcher.lock().remove_client(link.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_id_leaves_room_for_the_response_id() {
        let mut config = KefexSettings::default_configuration();
        config.set("BaseID", 0x7fe).unwrap();
        let settings = KefexSettings::from_configuration(&config).unwrap();
        assert_eq!(settings.response_id(), Identifier::Standard(0x7ff));

        config.set("BaseID", 0x7ff).unwrap();
        assert!(matches!(
            KefexSettings::from_configuration(&config),
            Err(StackError::Range)
        ));
    }
}
