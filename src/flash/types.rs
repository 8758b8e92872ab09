//! Data exchanged between the orchestrator and its caller.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::osy::{FeatureSet, Fingerprint};
use crate::types::SerialNumber;

/// How much the communication parameters of a node change with a reset. Determines how long a
/// node needs before it answers again.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterChange {
    #[default]
    None,
    Partial,
    Fundamental,
}

/// Live state of a node during an update run.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub active: bool,
    pub online: bool,
    /// Node was already updated in this run
    pub finished: bool,
}

/// Everything to write to one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoFlash {
    pub files_to_flash: Vec<PathBuf>,
    pub files_to_write_to_nvm: Vec<PathBuf>,
    pub pem_file: Option<PathBuf>,
    pub security_override: Option<bool>,
    pub debugger_override: Option<bool>,
}

impl DoFlash {
    pub fn is_empty(&self) -> bool {
        self.files_to_flash.is_empty()
            && self.files_to_write_to_nvm.is_empty()
            && self.pem_file.is_none()
            && self.security_override.is_none()
            && self.debugger_override.is_none()
    }
}

/// Identity and capabilities reported by a modern flashloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashloaderInformation {
    pub protocol_version: (u8, u8, u8),
    pub flashloader_version: String,
    pub serial_number: SerialNumber,
    pub article_number: u32,
    pub hardware_version: String,
    pub fingerprint: Fingerprint,
    /// Only reported if [`FeatureSet::flash_count`] is set
    pub flash_count: Option<u32>,
    pub features: FeatureSet,
    /// Only reported if [`FeatureSet::max_block_length`] is set
    pub max_block_length: Option<u16>,
}

/// Progress report: percentage 0..=100, or [`PROGRESS_STATUS`] for a plain status text. Returning
/// `false` aborts the running operation.
pub type ProgressCallback<'a> = dyn FnMut(u8, &str) -> bool + 'a;

pub const PROGRESS_STATUS: u8 = 0xff;
