//! EventBus (§9): the single-consumer channel the tethering thread drains
//! every external event from. A platform broadcast, an upstream network
//! callback, a delayed retry timer, or a disconnected listener all arrive as
//! one [`Event`] variant on the same channel, so `TetherOrchestrator` folds
//! them into its state machine in the exact order they occur (§5).

use std::net::Ipv6Addr;

use tethermgr_lib::config::Config;
use tethermgr_lib::upstream::NetworkId;

use super::callback_registry::ListenerId;
use super::upstream_monitor::UpstreamEvent;

#[derive(Debug)]
pub enum Event {
    Upstream(UpstreamEvent),
    RetryUpstream,
    ClearError,
    Nat64RouterAdvertisement { network: NetworkId, prefix: Ipv6Addr },
    Nat64PrefixWithdrawn { network: NetworkId },
    Nat64StackedInterfaceUp { network: NetworkId, interface_name: String },
    ConfigReloaded(Config),
    /// A registered event-callback connection's writer thread observed the
    /// peer go away; fold this back through the core loop rather than
    /// mutating `CallbackRegistry` from off the tethering thread.
    ListenerDisconnected(ListenerId),
}

pub struct EventBus {
    sender: crossbeam_channel::Sender<Event>,
    receiver: crossbeam_channel::Receiver<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        EventBus { sender, receiver }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clonable handle any thread (the accept loop, a retry timer, a
    /// listener's writer thread) can post events through.
    pub fn sender(&self) -> crossbeam_channel::Sender<Event> {
        self.sender.clone()
    }

    pub fn receiver(&self) -> &crossbeam_channel::Receiver<Event> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posted_events_are_received_fifo() {
        let bus = EventBus::new();
        let sender = bus.sender();
        sender.send(Event::RetryUpstream).unwrap();
        sender.send(Event::ClearError).unwrap();
        assert!(matches!(bus.receiver().recv().unwrap(), Event::RetryUpstream));
        assert!(matches!(bus.receiver().recv().unwrap(), Event::ClearError));
    }
}
