//! Reaching nodes on buses the tool is not connected to. A route is the chain of gateways between
//! the tool's bus and the target's bus; every gateway forwards diagnostic traffic to its next bus
//! once routing is activated on it.
mod dispatcher;

use std::collections::{HashSet, VecDeque};

use tracing::debug;

pub use dispatcher::RoutingDispatcher;

use crate::error::Error;
use crate::flash::topology::SystemDefinition;
use crate::types::ServerId;
use crate::Result;

/// One gateway on the way to the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Index of the gateway in the system definition
    pub node: usize,
    /// Address of the gateway on the bus traffic arrives from
    pub address: ServerId,
    /// Bus the gateway forwards to
    pub outgoing_bus: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: ServerId,
    /// Gateways in the order traffic passes them. Empty if the target is on the tool's bus.
    pub hops: Vec<Hop>,
}

impl Route {
    pub fn is_direct(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn last_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }
}

/// Shortest chain of gateways from `client_bus` to the bus of `target`. The target itself never
/// forwards its own traffic.
pub fn compute_route(system: &SystemDefinition, client_bus: u8, target: ServerId) -> Result<Route> {
    let target_node = system.node(target).map(|(index, _)| index);

    // Breadth first over buses, remembering how each bus was reached
    let mut reached_by: Vec<(u8, Option<(usize, Hop)>)> = vec![(client_bus, None)];
    let mut visited = HashSet::from([client_bus]);
    let mut queue = VecDeque::from([0usize]);

    while let Some(entry) = queue.pop_front() {
        let bus = reached_by[entry].0;
        if bus == target.bus {
            let mut hops = vec![];
            let mut cursor = entry;
            while let Some((previous, hop)) = reached_by[cursor].1 {
                hops.push(hop);
                cursor = previous;
            }
            hops.reverse();
            debug!("Route to {}: {:?}", target, hops);
            return Ok(Route { target, hops });
        }

        for (index, node) in system.nodes.iter().enumerate() {
            if Some(index) == target_node || !node.is_gateway() {
                continue;
            }
            let Some(incoming) = node.interface(bus).filter(|i| i.routing) else {
                continue;
            };
            for outgoing in node.interfaces.iter().filter(|i| i.routing && i.bus != bus) {
                if !visited.insert(outgoing.bus) {
                    continue;
                }
                let hop = Hop {
                    node: index,
                    address: ServerId::new(bus, incoming.node_id)?,
                    outgoing_bus: outgoing.bus,
                };
                reached_by.push((outgoing.bus, Some((entry, hop))));
                queue.push_back(reached_by.len() - 1);
            }
        }
    }

    Err(Error::NotFound)
}
