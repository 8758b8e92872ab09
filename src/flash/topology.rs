//! Static description of a system: its buses, the nodes connected to them and the device types the
//! nodes are instances of. Loaded by the host application, e.g. with `toml::from_str`.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flash::ParameterChange;
use crate::kefex::KefexSettings;
use crate::types::ServerId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusKind {
    Can,
    Ethernet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub name: String,
    pub bus_id: u8,
    pub kind: BusKind,
}

/// Protocol family of a node's flashloader.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashloaderFamily {
    /// Modern, UDS based flashloader. Can act as gateway.
    OpenSyde,
    /// Legacy flashloader speaking the segmented KEFEX protocol on CAN.
    StwFlashloader,
}

/// Connection of a node to one bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInterface {
    pub bus: u8,
    pub node_id: u8,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    /// Node forwards diagnostic traffic from and to this interface
    #[serde(default)]
    pub routing: bool,
    /// Node may be updated through this interface
    #[serde(default = "enabled")]
    pub update: bool,
}

fn enabled() -> bool {
    true
}

/// What to write to a node during an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeUpdate {
    /// Intel HEX application images
    pub files: Vec<PathBuf>,
    /// Parameter set files written with a file based transfer
    pub nvm_files: Vec<PathBuf>,
    pub pem_file: Option<PathBuf>,
    pub security: Option<bool>,
    pub debugger: Option<bool>,
    /// Parameter list checksum a legacy flashloader expects at logon
    pub logon_crc: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub device_type: String,
    pub family: FlashloaderFamily,
    pub interfaces: Vec<NodeInterface>,
    #[serde(default)]
    pub update: NodeUpdate,
    /// Communication parameters of a legacy flashloader
    #[serde(default)]
    pub kefex: Option<KefexSettings>,
}

impl Node {
    pub fn interface(&self, bus: u8) -> Option<&NodeInterface> {
        self.interfaces.iter().find(|i| i.bus == bus)
    }

    pub fn server_id(&self, bus: u8) -> Option<ServerId> {
        self.interface(bus).and_then(|i| ServerId::new(i.bus, i.node_id).ok())
    }

    pub fn is_gateway(&self) -> bool {
        self.family == FlashloaderFamily::OpenSyde && self.interfaces.iter().filter(|i| i.routing).count() > 1
    }
}

/// Minimum time to wait after a reset, per change of the communication parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitTimes {
    pub no_change_ms: u32,
    pub partial_change_ms: u32,
    pub fundamental_change_ms: u32,
}

impl Default for WaitTimes {
    fn default() -> Self {
        Self {
            no_change_ms: 500,
            partial_change_ms: 500,
            fundamental_change_ms: 500,
        }
    }
}

impl WaitTimes {
    pub fn get(&self, change: ParameterChange) -> Duration {
        let ms = match change {
            ParameterChange::None => self.no_change_ms,
            ParameterChange::Partial => self.partial_change_ms,
            ParameterChange::Fundamental => self.fundamental_change_ms,
        };
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetWaitTimes {
    pub can: WaitTimes,
    pub ethernet: WaitTimes,
}

impl ResetWaitTimes {
    pub fn get(&self, kind: BusKind, change: ParameterChange) -> Duration {
        match kind {
            BusKind::Can => self.can.get(change),
            BusKind::Ethernet => self.ethernet.get(change),
        }
    }
}

/// Properties of a device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub name: String,
    /// Other names the flashloader of this device type may report
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub reset_wait: ResetWaitTimes,
}

impl DeviceDefinition {
    pub fn accepts(&self, reported: &str) -> bool {
        self.name == reported || self.aliases.iter().any(|a| a == reported)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemDefinition {
    pub buses: Vec<Bus>,
    pub nodes: Vec<Node>,
    pub devices: Vec<DeviceDefinition>,
}

impl SystemDefinition {
    pub fn bus(&self, bus_id: u8) -> Option<&Bus> {
        self.buses.iter().find(|b| b.bus_id == bus_id)
    }

    /// Index and description of the node answering to `id`.
    pub fn node(&self, id: ServerId) -> Option<(usize, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.interface(id.bus).is_some_and(|i| i.node_id == id.node))
    }

    pub fn device(&self, name: &str) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| d.name == name)
    }
}
