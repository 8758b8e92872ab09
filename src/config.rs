//! Configuration: named communication parameters of the legacy protocol, and the settings of the
//! whole stack.
//!
//! Communication parameters are persisted as one INI-like TOML table per protocol instance, one
//! key per parameter. Keys are matched case-insensitively; missing keys fall back to the static
//! default of the parameter.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ip::IpConfig;
use crate::Result;

/// One named parameter with its range and default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommParameter {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub value: i64,
}

/// Ordered list of uniquely named parameters. Values are not clamped to `[min, max]`; that is up to
/// the caller, who can use [`CommParameter::min`] and [`CommParameter::max`] to do so.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommConfiguration {
    parameters: Vec<CommParameter>,
}

impl CommConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter initialized to its default. Names are unique regardless of case.
    pub fn add(&mut self, name: &str, min: i64, max: i64, default: i64) -> Result<()> {
        if self.parameter(name).is_some() {
            return Err(Error::Range);
        }
        self.parameters.push(CommParameter {
            name: name.to_string(),
            min,
            max,
            default,
            value: default,
        });
        Ok(())
    }

    pub fn parameters(&self) -> &[CommParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&CommParameter> {
        self.parameters.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Result<i64> {
        self.parameter(name).map(|p| p.value).ok_or(Error::NotConfigured)
    }

    pub fn set(&mut self, name: &str, value: i64) -> Result<()> {
        let parameter = self
            .parameters
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or(Error::NotConfigured)?;
        parameter.value = value;
        Ok(())
    }

    pub fn reset_to_defaults(&mut self) {
        for parameter in self.parameters.iter_mut() {
            parameter.value = parameter.default;
        }
    }

    /// Apply the values of a persisted section.
    pub fn load_section(&mut self, section: &toml::Table) -> Result<()> {
        for parameter in self.parameters.iter_mut() {
            let entry = section
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(&parameter.name));

            parameter.value = match entry {
                Some((key, value)) => value
                    .as_integer()
                    .ok_or_else(|| Error::Config(format!("{key}: expected an integer")))?,
                None => parameter.default,
            };
        }
        Ok(())
    }

    pub fn to_section(&self) -> toml::Table {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), toml::Value::Integer(p.value)))
            .collect()
    }

    /// Load the named section from an INI-like TOML document. A missing section means all defaults.
    pub fn load(&mut self, document: &str, section: &str) -> Result<()> {
        let table: toml::Table = toml::from_str(document).map_err(|e| Error::Config(e.to_string()))?;
        let entry = table
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(section))
            .map(|(_, value)| value);

        match entry {
            Some(toml::Value::Table(values)) => self.load_section(values),
            Some(_) => Err(Error::Config(format!("{section}: expected a section"))),
            None => self.load_section(&toml::Table::new()),
        }
    }

    /// Serialize as a document containing only the named section.
    pub fn save(&self, section: &str) -> Result<String> {
        let mut document = toml::Table::new();
        document.insert(section.to_string(), toml::Value::Table(self.to_section()));
        toml::to_string(&document).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Settings of the whole stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Node id the tool uses on every bus
    pub tester_node_id: u8,
    /// Time to wait for a response of the modern protocol (P2)
    pub response_timeout_ms: u64,
    /// Time to wait after the ECU reported "response pending" (P2*)
    pub response_pending_timeout_ms: u64,
    /// How long to collect answers to a broadcast
    pub broadcast_window_ms: u64,
    /// Interval of the tester present keep-alive sent to routing gateways
    pub keep_alive_interval_ms: u64,
    /// Time to wait for an erase to finish
    pub erase_timeout_ms: u64,
    pub ip: IpConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tester_node_id: 126,
            response_timeout_ms: 1000,
            response_pending_timeout_ms: 5000,
            broadcast_window_ms: 1000,
            keep_alive_interval_ms: 2000,
            erase_timeout_ms: 60_000,
            ip: IpConfig::default(),
        }
    }
}

impl StackConfig {
    pub fn from_toml(document: &str) -> Result<Self> {
        toml::from_str(document).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_toml(&document)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.response_pending_timeout_ms)
    }

    pub fn broadcast_window(&self) -> Duration {
        Duration::from_millis(self.broadcast_window_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }
}
