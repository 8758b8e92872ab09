//! Flashing orchestrator: one session per node of the system, broadcast discovery, routing through
//! gateways and the update sequence.
//!
//! ## Example
//! ```rust,no_run
//! fn update(
//!     system: ecu_flash::flash::topology::SystemDefinition,
//!     dispatcher: ecu_flash::can::SharedCanDispatcher,
//! ) -> ecu_flash::Result<()> {
//!     let config = ecu_flash::config::StackConfig::default();
//!     let mut orchestrator = ecu_flash::flash::Orchestrator::new(system, config, 0)?;
//!     orchestrator.set_can_dispatcher(dispatcher, 0);
//!
//!     let target = ecu_flash::types::ServerId::new(1, 5)?;
//!     orchestrator.set_active_nodes(&[target])?;
//!     let info = orchestrator.read_flashloader_information(target)?;
//!     println!("{} runs flashloader {}", info.serial_number, info.flashloader_version);
//!     Ok(())
//! }
//! ```
mod error;
pub mod hex;
pub mod keepalive;
pub mod session;
pub mod topology;
mod types;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use error::Error;
pub use keepalive::KeepAlive;
pub use session::Session;
pub use types::*;

use crate::can::{Identifier, SharedCanDispatcher};
use crate::config::StackConfig;
use crate::error::Error as StackError;
use crate::flash::hex::HexFile;
use crate::flash::topology::{BusKind, FlashloaderFamily, SystemDefinition};
use crate::ip::doip::DoIpChannel;
use crate::ip::{SharedIpDispatcher, TcpHandle};
use crate::kefex::{KefexProtocol, KefexSettings};
use crate::osy::broadcast::{CanBroadcast, DeviceInfoResult, IpBroadcast, IpSettings, SerialNumberResult};
use crate::osy::{
    FileTransferMode, Fingerprint, OsyClient, ResetType, SecurityAccessType, SessionType, SharedOsyClient,
};
use crate::routing::{compute_route, Hop, Route, RoutingDispatcher};
use crate::types::{SerialNumber, ServerId};
use crate::Result;

const DEFAULT_RESET_WAIT: Duration = Duration::from_millis(500);

/// Computes the key for a security access seed.
pub type SecurityKeyFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send>;

/// Work list of an update run: every node that is active, online, not yet finished and has
/// something to write, addressed through its first interface that allows updates.
pub fn build_flash_plan(system: &SystemDefinition, states: &HashMap<ServerId, NodeState>) -> Vec<(ServerId, DoFlash)> {
    let mut plan = vec![];
    for node in &system.nodes {
        let Some(id) = node
            .interfaces
            .iter()
            .filter(|i| i.update)
            .filter_map(|i| ServerId::new(i.bus, i.node_id).ok())
            .find(|id| states.get(id).is_some_and(|s| s.active))
        else {
            continue;
        };
        let state = states[&id];
        if !state.online || state.finished {
            debug!("Skipping {}: {:?}", node.name, state);
            continue;
        }

        let do_flash = DoFlash {
            files_to_flash: node.update.files.clone(),
            files_to_write_to_nvm: node.update.nvm_files.clone(),
            pem_file: node.update.pem_file.clone(),
            security_override: node.update.security,
            debugger_override: node.update.debugger,
        };
        if !do_flash.is_empty() {
            plan.push((id, do_flash));
        }
    }
    plan
}

/// Routing installed for one target. Dropping it takes the routing down again and gives a legacy
/// session its original dispatcher back.
#[must_use]
pub struct RouteGuard {
    route: Route,
    routing: Vec<(SharedOsyClient, u8)>,
    tunnel: Option<(SharedOsyClient, u8, Identifier)>,
    restore: Option<(Arc<KefexProtocol>, SharedCanDispatcher)>,
    keep_alive: Option<(Arc<KeepAlive>, ServerId)>,
}

impl RouteGuard {
    fn new(route: Route) -> Self {
        Self {
            route,
            routing: vec![],
            tunnel: None,
            restore: None,
            keep_alive: None,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if let Some((protocol, dispatcher)) = self.restore.take() {
            if let Err(e) = protocol.set_dispatcher(dispatcher) {
                warn!("Restoring dispatcher of {} failed: {}", self.route.target, e);
            }
        }
        if let Some((client, bus, filter)) = self.tunnel.take() {
            if let Err(e) = client.lock().set_can_tunnel(false, bus, filter) {
                warn!("Stopping CAN tunnel to bus {} failed: {}", bus, e);
            }
        }
        if let Some((keep_alive, id)) = self.keep_alive.take() {
            keep_alive.unregister(id);
        }
        while let Some((client, bus)) = self.routing.pop() {
            if let Err(e) = client.lock().set_routing(false, bus) {
                warn!("Stopping routing to bus {} failed: {}", bus, e);
            }
        }
    }
}

pub struct Orchestrator {
    system: SystemDefinition,
    config: StackConfig,
    client_bus: u8,
    can: Option<(SharedCanDispatcher, u8)>,
    ip: Option<SharedIpDispatcher>,
    tcp: HashMap<Ipv4Addr, TcpHandle>,
    sessions: HashMap<ServerId, Session>,
    gateways: HashMap<ServerId, SharedOsyClient>,
    active: Vec<ServerId>,
    keep_alive: Arc<KeepAlive>,
    security_key: Option<SecurityKeyFn>,
}

impl Orchestrator {
    /// `client_bus` is the bus of the system the tool is connected to.
    pub fn new(system: SystemDefinition, config: StackConfig, client_bus: u8) -> Result<Self> {
        if system.bus(client_bus).is_none() && !system.buses.is_empty() {
            return Err(StackError::Config(format!("bus {client_bus} is not part of the system")));
        }
        let keep_alive = Arc::new(KeepAlive::start(config.keep_alive_interval()));
        Ok(Self {
            system,
            config,
            client_bus,
            can: None,
            ip: None,
            tcp: HashMap::new(),
            sessions: HashMap::new(),
            gateways: HashMap::new(),
            active: vec![],
            keep_alive,
            security_key: None,
        })
    }

    /// Use `dispatcher` for CAN traffic. `channel` is the adapter channel connected to the client bus.
    pub fn set_can_dispatcher(&mut self, dispatcher: SharedCanDispatcher, channel: u8) {
        self.can = Some((dispatcher, channel));
    }

    pub fn set_ip_dispatcher(&mut self, dispatcher: SharedIpDispatcher) {
        self.ip = Some(dispatcher);
    }

    pub fn set_security_key_fn(&mut self, key: SecurityKeyFn) {
        self.security_key = Some(key);
    }

    pub fn system(&self) -> &SystemDefinition {
        &self.system
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    fn client_bus_kind(&self) -> BusKind {
        self.system.bus(self.client_bus).map_or(BusKind::Can, |b| b.kind)
    }

    fn tester(&self) -> Result<ServerId> {
        ServerId::new(self.client_bus, self.config.tester_node_id)
    }

    fn route(&self, target: ServerId) -> Result<Route> {
        compute_route(&self.system, self.client_bus, target)
    }

    /// TCP connection to `ip`, shared by every session behind that address.
    fn tcp_handle(&mut self, dispatcher: &SharedIpDispatcher, ip: Ipv4Addr, target: ServerId) -> Result<TcpHandle> {
        if let Some(handle) = self.tcp.get(&ip) {
            return Ok(*handle);
        }

        let handle = {
            let mut d = dispatcher.lock();
            let handle = d.init_tcp(ip);
            d.reconnect_tcp(handle)?;
            if !d.is_tcp_connected(handle)? {
                return Err(StackError::Timeout);
            }
            handle
        };
        let mut channel = DoIpChannel::new(dispatcher.clone(), handle, self.tester()?, target);
        channel.activate_routing(self.config.response_timeout())?;
        self.tcp.insert(ip, handle);
        Ok(handle)
    }

    /// Open a modern protocol client for `target` on whatever the tool is connected to.
    fn open_osy(&mut self, target: ServerId) -> Result<OsyClient> {
        match self.client_bus_kind() {
            BusKind::Can => {
                let (dispatcher, channel) = self.can.clone().ok_or(StackError::NotConfigured)?;
                OsyClient::on_can(dispatcher, channel, target, &self.config)
            }
            BusKind::Ethernet => {
                let dispatcher = self.ip.clone().ok_or(StackError::NotConfigured)?;
                let route = self.route(target)?;
                // Everything behind the first gateway shares its connection
                let entry = match route.hops.first() {
                    Some(hop) => &self.system.nodes[hop.node],
                    None => self.system.node(target).ok_or(Error::UnknownNode(target))?.1,
                };
                let ip = entry
                    .interface(self.client_bus)
                    .and_then(|i| i.ip)
                    .ok_or_else(|| StackError::Config(format!("{} has no IP address", entry.name)))?;
                let handle = self.tcp_handle(&dispatcher, ip, target)?;
                let channel = DoIpChannel::new(dispatcher, handle, self.tester()?, target);
                Ok(OsyClient::new(Box::new(channel), target, &self.config))
            }
        }
    }

    fn open_kefex(&self, target: ServerId, settings: Option<KefexSettings>) -> Result<KefexProtocol> {
        let (dispatcher, channel) = self.can.clone().ok_or(StackError::NotConfigured)?;
        let settings = settings.unwrap_or(KefexSettings {
            server_address: target.node,
            bus: channel,
            ..Default::default()
        });
        KefexProtocol::new(dispatcher, settings)
    }

    /// Create the session of `id`, using the protocol family configured for the node. An existing
    /// session is kept.
    pub fn insert_session(&mut self, id: ServerId) -> Result<()> {
        if self.sessions.contains_key(&id) {
            return Ok(());
        }
        let (family, settings) = match self.system.node(id) {
            Some((_, node)) => (node.family, node.kefex),
            None => return Err(Error::UnknownNode(id).into()),
        };
        let session = match family {
            FlashloaderFamily::OpenSyde => Session::OpenSyde(self.open_osy(id)?.into_shared()),
            FlashloaderFamily::StwFlashloader => Session::StwFlashloader(Arc::new(self.open_kefex(id, settings)?)),
        };
        info!("Session for {}: {:?}", id, session);
        self.sessions.insert(id, session);
        Ok(())
    }

    /// Use a session opened by the caller, e.g. on a transport of its own.
    pub fn set_session(&mut self, id: ServerId, session: Session) {
        self.sessions.insert(id, session);
    }

    /// Nodes taking part in the current run. Creates their sessions and drops all others.
    pub fn set_active_nodes(&mut self, ids: &[ServerId]) -> Result<()> {
        self.sessions.retain(|id, _| ids.contains(id));
        for id in ids {
            self.insert_session(*id)?;
        }
        self.active = ids.to_vec();
        Ok(())
    }

    pub fn active_nodes(&self) -> &[ServerId] {
        &self.active
    }

    pub fn session(&self, id: ServerId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Run `f` on the session of `id`. Nodes without a session get a temporary legacy session on the
    /// shared CAN dispatcher that is torn down afterwards.
    pub fn with_session<T>(&self, id: ServerId, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        if let Some(session) = self.sessions.get(&id) {
            return f(session);
        }
        debug!("Temporary session for {}", id);
        let temporary = Session::StwFlashloader(Arc::new(self.open_kefex(id, None)?));
        f(&temporary)
    }

    /// Client of the gateway at `hop`. Active gateways reuse their session.
    fn hop_client(&mut self, hop: &Hop) -> Result<SharedOsyClient> {
        if let Some(Session::OpenSyde(client)) = self.sessions.get(&hop.address) {
            return Ok(client.clone());
        }
        if let Some(client) = self.gateways.get(&hop.address) {
            return Ok(client.clone());
        }
        let client = self.open_osy(hop.address)?.into_shared();
        self.gateways.insert(hop.address, client.clone());
        Ok(client)
    }

    /// Activate routing on every gateway between the tool and `target`. Legacy targets are reached
    /// through the CAN tunnel of the last gateway. The last gateway is kept alive while the guard
    /// exists.
    pub fn start_routing(&mut self, target: ServerId) -> Result<RouteGuard> {
        let route = self.route(target)?;
        let mut guard = RouteGuard::new(route.clone());
        if route.is_direct() {
            return Ok(guard);
        }

        let mut last = None;
        for hop in &route.hops {
            let client = self.hop_client(hop)?;
            client.lock().set_routing(true, hop.outgoing_bus)?;
            info!("Routing through {} to bus {}", hop.address, hop.outgoing_bus);
            guard.routing.push((client.clone(), hop.outgoing_bus));
            last = Some((client, *hop));
        }
        let Some((gateway, hop)) = last else {
            return Ok(guard);
        };
        self.keep_alive.register(hop.address, gateway.clone());
        guard.keep_alive = Some((self.keep_alive.clone(), hop.address));

        if let Some(Session::StwFlashloader(protocol)) = self.sessions.get(&target) {
            let response_id = protocol.settings().response_id();
            gateway.lock().set_can_tunnel(true, hop.outgoing_bus, response_id)?;
            guard.tunnel = Some((gateway.clone(), hop.outgoing_bus, response_id));

            let relay = RoutingDispatcher::new_shared(gateway, hop.outgoing_bus, response_id);
            let previous = protocol.set_dispatcher(relay)?;
            guard.restore = Some((protocol.clone(), previous));
        }
        Ok(guard)
    }

    /// How long to wait after a reset before the next request: the longest wait any active node
    /// needs on the bus it is addressed through.
    pub fn minimum_reset_wait_time(&self, change: ParameterChange) -> Duration {
        self.active
            .iter()
            .filter_map(|id| {
                let (_, node) = self.system.node(*id)?;
                let kind = self.system.bus(id.bus).map_or(BusKind::Can, |b| b.kind);
                let wait = match self.system.device(&node.device_type) {
                    Some(device) => device.reset_wait.get(kind, change),
                    None => DEFAULT_RESET_WAIT,
                };
                Some(wait)
            })
            .max()
            .unwrap_or(DEFAULT_RESET_WAIT)
    }

    fn osy_session(&self, id: ServerId) -> Result<SharedOsyClient> {
        let session = self.sessions.get(&id).ok_or(StackError::NotConfigured)?;
        Ok(session.osy(id)?.clone())
    }

    /// Read everything the flashloader of `id` reports about itself. The first failing read aborts.
    pub fn read_flashloader_information(&mut self, id: ServerId) -> Result<FlashloaderInformation> {
        let _route = self.start_routing(id)?;
        let client = self.osy_session(id)?;
        let mut client = client.lock();

        let protocol_version = client.read_protocol_version()?;
        let features = client.read_features()?;
        let flashloader_version = client.read_flashloader_version()?;
        let serial_number = if features.extended_serial_number {
            client.read_serial_number_extended()?
        } else {
            client.read_serial_number()?
        };
        let article_number = client.read_article_number()?;
        let hardware_version = client.read_hardware_version()?;
        let fingerprint = client.read_fingerprint()?;
        let flash_count = match features.flash_count {
            true => Some(client.read_flash_count()?),
            false => None,
        };
        let max_block_length = match features.max_block_length {
            true => Some(client.read_max_block_length()?),
            false => None,
        };

        Ok(FlashloaderInformation {
            protocol_version,
            flashloader_version,
            serial_number,
            article_number,
            hardware_version,
            fingerprint,
            flash_count,
            features,
            max_block_length,
        })
    }

    fn can_broadcast(&self) -> Result<CanBroadcast> {
        let (dispatcher, channel) = self.can.clone().ok_or(StackError::NotConfigured)?;
        CanBroadcast::new(
            dispatcher,
            channel,
            self.config.tester_node_id,
            self.config.broadcast_window(),
        )
    }

    fn ip_broadcast(&self) -> Result<IpBroadcast> {
        let dispatcher = self.ip.clone().ok_or(StackError::NotConfigured)?;
        Ok(IpBroadcast::new(dispatcher, self.config.broadcast_window()))
    }

    /// Serial numbers of all devices on the client bus. No answer is not an error.
    pub fn read_serial_numbers(&self) -> Result<Vec<SerialNumberResult>> {
        match self.client_bus_kind() {
            BusKind::Can => self.can_broadcast()?.read_serial_number(),
            BusKind::Ethernet => self.ip_broadcast()?.read_serial_number(),
        }
    }

    pub fn get_device_info(&self) -> Result<Vec<DeviceInfoResult>> {
        match self.client_bus_kind() {
            BusKind::Can => Err(StackError::NotConfigured),
            BusKind::Ethernet => self.ip_broadcast()?.get_device_info(),
        }
    }

    /// Give the device with `serial_number` the address `id`, before any node addressed traffic is
    /// possible.
    pub fn set_node_id_by_serial_number(&self, serial_number: &SerialNumber, id: ServerId) -> Result<()> {
        match self.client_bus_kind() {
            BusKind::Can => self.can_broadcast()?.set_node_id_by_serial_number(serial_number, id),
            BusKind::Ethernet => self.ip_broadcast()?.set_node_id_by_serial_number(serial_number, id),
        }
    }

    pub fn set_ip_address_by_serial_number(
        &self,
        serial_number: &SerialNumber,
        settings: &IpSettings,
        id: ServerId,
    ) -> Result<()> {
        match self.client_bus_kind() {
            BusKind::Can => Err(StackError::NotConfigured),
            BusKind::Ethernet => self
                .ip_broadcast()?
                .set_ip_address_by_serial_number(serial_number, settings, id),
        }
    }

    /// Ask every application on the client bus to stay in its flashloader after the next reset.
    pub fn request_programming(&self) -> Result<()> {
        match self.client_bus_kind() {
            BusKind::Can => self.can_broadcast()?.request_programming(),
            BusKind::Ethernet => self.ip_broadcast()?.request_programming(),
        }
    }

    pub fn net_reset(&self, reset_type: ResetType) -> Result<()> {
        match self.client_bus_kind() {
            BusKind::Can => self.can_broadcast()?.net_reset(reset_type),
            BusKind::Ethernet => self.ip_broadcast()?.net_reset(reset_type),
        }
    }

    /// Check the device type reported by `id` against the one configured for the node. A device
    /// that does not answer in time is asked once more; a name that does not match is compared
    /// against the accepted aliases of the device type.
    pub fn check_device_name(&self, id: ServerId) -> Result<()> {
        let (_, node) = self.system.node(id).ok_or(Error::UnknownNode(id))?;
        let client = self.osy_session(id)?;
        let mut client = client.lock();

        let reported = match client.read_device_name() {
            Err(e) if e.is_timeout() || e.reason_code().is_some() => {
                warn!("Reading device name of {} failed ({}), retrying", id, e);
                client.read_device_name()?
            }
            result => result?,
        };
        self.accept_device_name(&node.device_type, &reported)
    }

    fn accept_device_name(&self, expected: &str, reported: &str) -> Result<()> {
        if reported == expected {
            return Ok(());
        }
        if self.system.device(expected).is_some_and(|d| d.accepts(reported)) {
            debug!("{} accepted as alias of {}", reported, expected);
            return Ok(());
        }
        Err(Error::DeviceTypeMismatch {
            expected: expected.to_string(),
            reported: reported.to_string(),
        }
        .into())
    }

    /// Unlock the programming session. A zero seed means the node is not locked.
    fn unlock(&self, client: &mut OsyClient) -> Result<()> {
        let seed = client.security_access(SecurityAccessType::RequestSeedProgramming as u8, None)?;
        if seed.iter().all(|b| *b == 0) {
            return Ok(());
        }
        let key_fn = self.security_key.as_ref().ok_or(StackError::NotConfigured)?;
        let key = key_fn(&seed);
        client.security_access(SecurityAccessType::SendKeyProgramming as u8, Some(&key))?;
        Ok(())
    }

    /// Update every node of `plan`, then reset them and wait until they are back.
    pub fn update_system(
        &mut self,
        plan: &[(ServerId, DoFlash)],
        fingerprint: &Fingerprint,
        progress: &mut ProgressCallback,
    ) -> Result<()> {
        for (id, do_flash) in plan {
            if !progress(PROGRESS_STATUS, &format!("Updating {id}")) {
                return Err(StackError::Aborted);
            }
            self.insert_session(*id)?;
            let _route = self.start_routing(*id)?;
            let session = self.sessions.get(id).cloned().ok_or(StackError::NotConfigured)?;
            match session {
                Session::OpenSyde(client) => self.update_osy_node(*id, &client, do_flash, fingerprint, progress)?,
                Session::StwFlashloader(protocol) => self.update_stw_node(*id, &protocol, do_flash, progress)?,
            }
            info!("Update of {} done", id);
        }

        for (id, _) in plan {
            if let Some(Session::OpenSyde(client)) = self.sessions.get(id).cloned() {
                let _route = self.start_routing(*id)?;
                client.lock().ecu_reset_one_way(ResetType::HardReset as u8)?;
            }
        }
        let wait = self.minimum_reset_wait_time(ParameterChange::None);
        info!("Waiting {:?} for the nodes to restart", wait);
        std::thread::sleep(wait);
        progress(100, "Update finished");
        Ok(())
    }

    fn update_osy_node(
        &self,
        id: ServerId,
        client: &SharedOsyClient,
        do_flash: &DoFlash,
        fingerprint: &Fingerprint,
        progress: &mut ProgressCallback,
    ) -> Result<()> {
        let (_, node) = self.system.node(id).ok_or(Error::UnknownNode(id))?;
        let device_type = node.device_type.clone();

        {
            let mut c = client.lock();
            c.diagnostic_session_control(SessionType::PreProgramming as u8)?;
            c.diagnostic_session_control(SessionType::Programming as u8)?;
            self.unlock(&mut c)?;
        }
        self.check_device_name(id)?;

        let mut c = client.lock();
        c.write_fingerprint(fingerprint)?;

        for path in &do_flash.files_to_flash {
            let image = HexFile::from_file(path)?;
            if let Some(name) = image.device_name() {
                self.accept_device_name(&device_type, &name)?;
            }
            self.flash_image(&mut c, &image, progress)?;
        }

        let files = do_flash.files_to_write_to_nvm.iter().chain(do_flash.pem_file.iter());
        for path in files {
            self.transfer_file(&mut c, path, progress)?;
        }

        if do_flash.security_override.is_some() || do_flash.debugger_override.is_some() {
            c.set_security_debugger(
                do_flash.security_override.unwrap_or(false),
                do_flash.debugger_override.unwrap_or(false),
            )?;
        }
        Ok(())
    }

    fn transfer_blocks(
        client: &mut OsyClient,
        data: &[u8],
        max_block_length: usize,
        progress: &mut ProgressCallback,
    ) -> Result<()> {
        // Block length includes the service id and the sequence counter
        let chunk = max_block_length.checked_sub(2).filter(|c| *c > 0).ok_or(StackError::Range)?;
        let total = data.chunks(chunk).len().max(1);
        for (index, block) in data.chunks(chunk).enumerate() {
            let counter = ((index + 1) & 0xff) as u8;
            client.transfer_data(counter, block)?;
            let percent = ((index + 1) * 100 / total) as u8;
            if !progress(percent, "Transferring") {
                return Err(StackError::Aborted);
            }
        }
        Ok(())
    }

    fn flash_image(&self, client: &mut OsyClient, image: &HexFile, progress: &mut ProgressCallback) -> Result<()> {
        let signature = image.signature_address();
        for (index, area) in image.areas.iter().enumerate() {
            let size = u32::try_from(area.data.len()).map_err(|_| StackError::Range)?;
            {
                let _wait = self.keep_alive.wait_time(self.config.erase_timeout());
                client.erase_memory(area.address, size)?;
            }
            let max_block_length = client.request_download(area.address, size)?;
            Self::transfer_blocks(client, &area.data, max_block_length, progress)?;

            let last = index + 1 == image.areas.len();
            let exit = signature.filter(|_| last).map(|address| address.to_be_bytes());
            client.request_transfer_exit(exit.as_ref().map(|a| a.as_slice()))?;
        }
        Ok(())
    }

    fn transfer_file(&self, client: &mut OsyClient, path: &Path, progress: &mut ProgressCallback) -> Result<()> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(StackError::Range)?;
        let size = u32::try_from(data.len()).map_err(|_| StackError::Range)?;

        let max_block_length = client.request_file_transfer(FileTransferMode::ReplaceFile, &name, size)?;
        Self::transfer_blocks(client, &data, max_block_length, progress)?;
        client.request_transfer_exit(Some(&hex::crc32(&data).to_be_bytes()))?;
        Ok(())
    }

    fn update_stw_node(
        &self,
        id: ServerId,
        protocol: &KefexProtocol,
        do_flash: &DoFlash,
        progress: &mut ProgressCallback,
    ) -> Result<()> {
        let (_, node) = self.system.node(id).ok_or(Error::UnknownNode(id))?;
        protocol.logon(node.update.logon_crc)?;

        let result = (|| -> Result<()> {
            for path in &do_flash.files_to_flash {
                let image = HexFile::from_file(path)?;
                for area in &image.areas {
                    protocol.write_memory(area.address, &area.data)?;
                    if !progress(PROGRESS_STATUS, &format!("Wrote 0x{:08x}", area.address)) {
                        return Err(StackError::Aborted);
                    }
                }
            }
            for path in &do_flash.files_to_write_to_nvm {
                let image = HexFile::from_file(path)?;
                for area in &image.areas {
                    protocol.write_eeprom(area.address, &area.data)?;
                }
            }
            if do_flash.pem_file.is_some() || do_flash.security_override.is_some() || do_flash.debugger_override.is_some()
            {
                warn!("{} does not support security settings, ignoring them", id);
            }
            Ok(())
        })();

        if let Err(e) = protocol.logoff() {
            warn!("Logoff from {} failed: {}", id, e);
        }
        result
    }
}
