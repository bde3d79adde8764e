//! CallbackRegistry (§4.8): redacted fan-out of tethering state to
//! registered listeners. Each listener carries a cookie (`uid` +
//! system-privilege bit); a snapshot's soft-AP configuration and client list
//! are only included for a listener that owns the request or holds system
//! privilege.

use std::collections::HashMap;

use tethermgr_lib::event::{ClientInfo, IpServerSnapshot, TetherEvent};

pub type ListenerId = u64;

struct Listener<S> {
    uid: u32,
    has_system_privilege: bool,
    sink: S,
}

/// Generic over the sink type so the orchestrator can plug in whatever
/// per-connection sender its transport uses (an `mpsc::Sender<TetherEvent>`
/// in production, a `Vec<TetherEvent>` recorder in tests).
pub struct CallbackRegistry<S> {
    listeners: HashMap<ListenerId, Listener<S>>,
    next_id: ListenerId,
}

impl<S> Default for CallbackRegistry<S> {
    fn default() -> Self {
        CallbackRegistry { listeners: HashMap::new(), next_id: 0 }
    }
}

impl<S> CallbackRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, uid: u32, has_system_privilege: bool, sink: S) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.insert(id, Listener { uid, has_system_privilege, sink });
        id
    }

    /// Like [`Self::register`], but builds the sink from the assigned id —
    /// needed when the sink itself (a per-connection writer) must report its
    /// own id back through the event bus on disconnect.
    pub fn register_with(&mut self, uid: u32, has_system_privilege: bool, make_sink: impl FnOnce(ListenerId) -> S) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        let sink = make_sink(id);
        self.listeners.insert(id, Listener { uid, has_system_privilege, sink });
        id
    }

    pub fn unregister(&mut self, id: ListenerId) {
        self.listeners.remove(&id);
    }

    pub fn unregister_by_uid(&mut self, uid: u32) {
        self.listeners.retain(|_, listener| listener.uid != uid);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

/// Redacts a snapshot for a listener that does not own `owner_uid` and lacks
/// system privilege (drop soft-AP config; §4.8, §9's literal interpretation
/// of the redaction rule).
fn redact_for(mut snapshot: IpServerSnapshot, owner_uid: u32, uid: u32, has_system_privilege: bool) -> IpServerSnapshot {
    if uid != owner_uid && !has_system_privilege {
        snapshot.soft_ap_config = None;
    }
    snapshot
}

impl<S> CallbackRegistry<S>
where
    S: Fn(TetherEvent),
{
    fn broadcast(&self, event_for: impl Fn(&Listener<S>) -> TetherEvent) {
        for listener in self.listeners.values() {
            (listener.sink)(event_for(listener));
        }
    }

    pub fn supported_types_changed(&self, types: Vec<tethermgr_lib::downstream::DownstreamType>) {
        self.broadcast(|_| TetherEvent::SupportedTypesChanged(types.clone()));
    }

    pub fn upstream_changed(&self, summary: Option<tethermgr_lib::event::UpstreamSummary>) {
        self.broadcast(|_| TetherEvent::UpstreamChanged(summary.clone()));
    }

    pub fn configuration_changed(&self) {
        self.broadcast(|_| TetherEvent::ConfigurationChanged);
    }

    pub fn orchestrator_state_changed(&self, state: tethermgr_lib::orchestrator_state::OrchestratorState) {
        self.broadcast(|_| TetherEvent::OrchestratorStateChanged(state));
    }

    /// `servers` pairs each snapshot with the uid that originated its active
    /// request, so per-listener redaction can be applied.
    pub fn tether_states_changed(&self, servers: &[(IpServerSnapshot, u32)]) {
        self.broadcast(|listener| {
            let redacted = servers
                .iter()
                .map(|(snapshot, owner_uid)| {
                    redact_for(snapshot.clone(), *owner_uid, listener.uid, listener.has_system_privilege)
                })
                .collect();
            TetherEvent::TetherStatesChanged(redacted)
        });
    }

    /// Privileged listeners only; unprivileged listeners never see this event.
    pub fn clients_changed(&self, clients: Vec<ClientInfo>) {
        for listener in self.listeners.values() {
            if listener.has_system_privilege {
                (listener.sink)(TetherEvent::ClientsChanged(clients.clone()));
            }
        }
    }

    pub fn offload_status_changed(&self, status: tethermgr_lib::event::OffloadStatus) {
        self.broadcast(|_| TetherEvent::OffloadStatusChanged(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tethermgr_lib::downstream::{DownstreamType, SoftApConfig};
    use tethermgr_lib::error::ErrorCode;
    use tethermgr_lib::ip_server_state::IpServerPhase;

    fn snapshot_with_softap() -> IpServerSnapshot {
        IpServerSnapshot {
            interface_name: "wlan0".to_string(),
            downstream_type: DownstreamType::Wifi,
            phase: IpServerPhase::Tethered,
            serving_mode: None,
            last_error: ErrorCode::NoError,
            soft_ap_config: Some(SoftApConfig { ssid: "hotspot".to_string(), passphrase: None, band_preference: None }),
        }
    }

    #[test]
    fn unprivileged_non_owner_does_not_see_softap_config() {
        let mut registry = CallbackRegistry::new();
        let received: Rc<RefCell<Vec<TetherEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink_events = received.clone();
        registry.register(9999, false, move |event: TetherEvent| sink_events.borrow_mut().push(event));

        registry.tether_states_changed(&[(snapshot_with_softap(), 1000)]);

        match &received.borrow()[0] {
            TetherEvent::TetherStatesChanged(servers) => assert!(servers[0].soft_ap_config.is_none()),
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn owner_sees_softap_config() {
        let mut registry = CallbackRegistry::new();
        let received: Rc<RefCell<Vec<TetherEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink_events = received.clone();
        registry.register(1000, false, move |event: TetherEvent| sink_events.borrow_mut().push(event));

        registry.tether_states_changed(&[(snapshot_with_softap(), 1000)]);

        match &received.borrow()[0] {
            TetherEvent::TetherStatesChanged(servers) => assert!(servers[0].soft_ap_config.is_some()),
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn unregistering_stops_delivery() {
        let mut registry = CallbackRegistry::new();
        let received: Rc<RefCell<Vec<TetherEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink_events = received.clone();
        let id = registry.register(1000, true, move |event: TetherEvent| sink_events.borrow_mut().push(event));
        registry.unregister(id);
        registry.configuration_changed();
        assert!(received.borrow().is_empty());
    }
}
