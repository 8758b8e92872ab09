//! # ECU Flash
//! Communication stack for diagnosing and reflashing electronic control units on CAN and Ethernet.
//! Nodes are reached directly or through a chain of gateways; legacy flashloaders speak the
//! segmented KEFEX protocol, modern ones a UDS based protocol over ISO-TP or TCP.
//!
//! ## Legacy Protocol Example
//!
//! Any [`can::CanAdapter`] can be shared between several protocol instances through a dispatcher.
//!
//! ```rust,no_run
//! fn read_variable(adapter: impl ecu_flash::can::CanAdapter + Send + 'static) -> ecu_flash::Result<()> {
//!     let dispatcher = ecu_flash::can::AdapterDispatcher::new_shared(adapter);
//!     let settings = ecu_flash::kefex::KefexSettings {
//!         server_address: 5,
//!         ..Default::default()
//!     };
//!     let protocol = ecu_flash::kefex::KefexProtocol::new(dispatcher, settings)?;
//!
//!     protocol.logon(0x0000)?;
//!     let data = protocol.segmented_read(0x0120, 64)?;
//!     println!("{}", hex::encode(data));
//!     protocol.logoff()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Update Example
//!
//! The [`flash::Orchestrator`] opens one session per node, installs routing through gateways and
//! runs the update sequence. See the [`flash`] module.

pub mod can;
pub mod config;
mod error;
pub mod flash;
pub mod ip;
pub mod isotp;
pub mod kefex;
pub mod osy;
pub mod poll;
pub mod routing;
pub mod types;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
