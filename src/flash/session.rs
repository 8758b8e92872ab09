//! Protocol instance of one node, selected by the node's flashloader family.
use std::sync::Arc;

use crate::flash::topology::FlashloaderFamily;
use crate::flash::Error;
use crate::kefex::KefexProtocol;
use crate::osy::SharedOsyClient;
use crate::types::ServerId;
use crate::Result;

#[derive(Clone)]
pub enum Session {
    OpenSyde(SharedOsyClient),
    StwFlashloader(Arc<KefexProtocol>),
}

impl Session {
    pub fn family(&self) -> FlashloaderFamily {
        match self {
            Session::OpenSyde(_) => FlashloaderFamily::OpenSyde,
            Session::StwFlashloader(_) => FlashloaderFamily::StwFlashloader,
        }
    }

    pub fn osy(&self, id: ServerId) -> Result<&SharedOsyClient> {
        match self {
            Session::OpenSyde(client) => Ok(client),
            Session::StwFlashloader(_) => Err(Error::WrongFamily(id).into()),
        }
    }

    pub fn kefex(&self, id: ServerId) -> Result<&Arc<KefexProtocol>> {
        match self {
            Session::StwFlashloader(protocol) => Ok(protocol),
            Session::OpenSyde(_) => Err(Error::WrongFamily(id).into()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Session::OpenSyde(_) => f.write_str("OpenSyde"),
            Session::StwFlashloader(protocol) => write!(f, "StwFlashloader({})", protocol.server_id()),
        }
    }
}
