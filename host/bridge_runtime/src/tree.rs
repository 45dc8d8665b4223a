use crate::address::{ChildIds, WidgetAddress};
use crate::bridge::{Bridge, BridgePhase, Delta, Outbound};
use crate::descriptor::ConfigDescriptor;
use crate::error::{SyncFailure, TreeError};
use crate::protocol::BackendEnvelope;
use crate::state::WidgetState;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub child_id: String,
    pub config: Arc<ConfigDescriptor>,
    pub props: Value,
}

impl ChildSpec {
    pub fn new(child_id: impl Into<String>, config: Arc<ConfigDescriptor>, props: Value) -> Self {
        Self {
            child_id: child_id.into(),
            config,
            props,
        }
    }
}

#[derive(Debug)]
pub struct WidgetInstance {
    address: WidgetAddress,
    config: Arc<ConfigDescriptor>,
    props: Value,
    state: WidgetState,
    bridge: Bridge,
    children: ChildIds,
}

impl WidgetInstance {
    pub fn address(&self) -> &WidgetAddress {
        &self.address
    }

    pub fn config(&self) -> &Arc<ConfigDescriptor> {
        &self.config
    }

    pub fn props(&self) -> &Value {
        &self.props
    }

    pub fn state(&self) -> &WidgetState {
        &self.state
    }

    pub fn phase(&self) -> BridgePhase {
        self.bridge.phase()
    }

    pub fn child_ids(&self) -> impl Iterator<Item = &str> {
        self.children.iter()
    }

    fn sync_phase(&mut self) {
        self.state.sync_mut().phase = self.bridge.phase();
    }

    fn record_failure(&mut self, failure: SyncFailure) {
        self.state.sync_mut().failure = Some(failure);
        self.sync_phase();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetView {
    pub address: WidgetAddress,
    pub widget_type: String,
    pub title: String,
    pub props: Value,
    pub state: Map<String, Value>,
    pub phase: BridgePhase,
    pub failure: Option<String>,
}

#[derive(Debug)]
pub struct WidgetTree {
    outbound: Outbound,
    stop_timeout: Duration,
    roots: ChildIds,
    instances: BTreeMap<WidgetAddress, WidgetInstance>,
    draining: Vec<Bridge>,
    dirty: BTreeSet<WidgetAddress>,
}

impl WidgetTree {
    pub fn new(outbound: Outbound, stop_timeout: Duration) -> Self {
        Self {
            outbound,
            stop_timeout,
            roots: ChildIds::default(),
            instances: BTreeMap::new(),
            draining: Vec::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn mount_root(&mut self, spec: ChildSpec) -> Result<WidgetAddress, TreeError> {
        let address = self.roots.claim(&WidgetAddress::root(), &spec.child_id)?;
        Ok(self.insert_and_start(address, spec))
    }

    pub fn mount_child(
        &mut self,
        parent: &WidgetAddress,
        spec: ChildSpec,
    ) -> Result<WidgetAddress, TreeError> {
        let parent_instance = self
            .instances
            .get_mut(parent)
            .ok_or_else(|| TreeError::UnknownParent(parent.clone()))?;
        let address = parent_instance.children.claim(parent, &spec.child_id)?;
        Ok(self.insert_and_start(address, spec))
    }

    fn insert_and_start(&mut self, address: WidgetAddress, spec: ChildSpec) -> WidgetAddress {
        let bridge = Bridge::new(
            address.clone(),
            spec.config.clone(),
            self.outbound.clone(),
            self.stop_timeout,
        );
        let mut instance = WidgetInstance {
            address: address.clone(),
            config: spec.config,
            props: spec.props,
            state: WidgetState::default(),
            bridge,
            children: ChildIds::default(),
        };

        match instance.bridge.start() {
            Ok(_) => instance.sync_phase(),
            Err(failure) => instance.record_failure(failure),
        }

        debug!("mounted {address} ({})", instance.config.widget_type());
        self.dirty.insert(address.clone());
        self.instances.insert(address.clone(), instance);
        address
    }

    /// Stops and removes `address` and everything below it. Unmounting an
    /// address that is not mounted is a no-op and returns false.
    pub fn unmount(&mut self, address: &WidgetAddress, now: Instant) -> bool {
        if !self.instances.contains_key(address) {
            debug!("unmount ignored for {address}: not mounted");
            return false;
        }

        let mut subtree: Vec<WidgetAddress> = self
            .instances
            .range(address.clone()..)
            .map(|(candidate, _)| candidate)
            .take_while(|candidate| *candidate == address || candidate.is_descendant_of(address))
            .cloned()
            .collect();

        // Deepest entries sort last, so reversing stops children before parents.
        subtree.reverse();

        for target in subtree {
            let Some(instance) = self.instances.remove(&target) else {
                continue;
            };

            let mut bridge = instance.bridge;
            bridge.stop(now);
            if !bridge.is_stopped() {
                self.draining.push(bridge);
            }

            self.release_child_id(&target);
            self.dirty.insert(target.clone());
            debug!("unmounted {target}");
        }

        true
    }

    pub fn unmount_all(&mut self, now: Instant) {
        let roots: Vec<WidgetAddress> = self
            .roots
            .iter()
            .map(|child_id| WidgetAddress::from_segments([child_id]))
            .collect();

        for root in roots {
            self.unmount(&root, now);
        }
    }

    fn release_child_id(&mut self, address: &WidgetAddress) {
        let (Some(parent), Some(child_id)) = (address.parent(), address.child_id()) else {
            return;
        };

        if parent.is_root() {
            self.roots.release(child_id);
        } else if let Some(parent_instance) = self.instances.get_mut(&parent) {
            parent_instance.children.release(child_id);
        }
    }

    pub fn update_props(&mut self, address: &WidgetAddress, props: Value) -> Result<(), TreeError> {
        let instance = self.instance_mut(address)?;
        instance.props = props;
        self.dirty.insert(address.clone());
        Ok(())
    }

    pub fn set_ui_field(
        &mut self,
        address: &WidgetAddress,
        field: &str,
        value: Value,
    ) -> Result<Option<Value>, TreeError> {
        let instance = self.instance_mut(address)?;
        let previous = instance
            .state
            .ui_mut()
            .set(&instance.config, field, value)?;
        self.dirty.insert(address.clone());
        Ok(previous)
    }

    pub fn dispatch(&mut self, envelope: BackendEnvelope) {
        match envelope {
            BackendEnvelope::Registered { token, address } => {
                if let Some(instance) = self.mounted_with_token(&address, token) {
                    if instance.bridge.on_registered(token) {
                        instance.sync_phase();
                        self.dirty.insert(address);
                    }
                } else if let Some(bridge) = self.draining_with_token(&address, token) {
                    bridge.on_registered(token);
                } else {
                    debug!("registration ack for unknown {address} token={token}");
                }
            }
            BackendEnvelope::RegistrationFailed {
                token,
                address,
                reason,
            } => {
                if let Some(instance) = self.mounted_with_token(&address, token) {
                    if let Some(failure) = instance.bridge.on_registration_failed(token, &reason) {
                        instance.record_failure(failure);
                        self.dirty.insert(address);
                    }
                } else {
                    debug!("registration failure for unknown {address} token={token}: {reason}");
                }
            }
            BackendEnvelope::Deregistered { token, address } => {
                if let Some(bridge) = self.draining_with_token(&address, token) {
                    bridge.on_deregistered(token);
                    self.draining.retain(|bridge| !bridge.is_stopped());
                } else {
                    debug!("deregistration ack for unknown {address} token={token}");
                }
            }
            BackendEnvelope::State { address, fields } => {
                self.apply_delta(address, Delta::Merge(fields));
            }
            BackendEnvelope::Snapshot { address, fields } => {
                self.apply_delta(address, Delta::Snapshot(fields));
            }
            BackendEnvelope::Patch { address, ops } => {
                self.apply_delta(address, Delta::Ops(ops));
            }
            BackendEnvelope::Error {
                address,
                code,
                message,
            } => match address {
                Some(address) => warn!("backend error for {address}: {code}: {message}"),
                None => warn!("backend error: {code}: {message}"),
            },
        }
    }

    fn apply_delta(&mut self, address: WidgetAddress, delta: Delta) {
        let Some(instance) = self.instances.get_mut(&address) else {
            debug!("dropping delta for unmounted {address}");
            return;
        };

        let report = instance
            .bridge
            .apply(instance.state.backend_mut(), delta);
        if report.is_some_and(|report| report.changed()) {
            self.dirty.insert(address);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        for bridge in &mut self.draining {
            bridge.poll_timeout(now);
        }
        self.draining.retain(|bridge| !bridge.is_stopped());
    }

    pub fn draining(&self) -> usize {
        self.draining.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.draining
            .iter()
            .filter_map(Bridge::stop_deadline)
            .min()
    }

    pub fn take_dirty(&mut self) -> Vec<WidgetAddress> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn instance(&self, address: &WidgetAddress) -> Option<&WidgetInstance> {
        self.instances.get(address)
    }

    pub fn phase(&self, address: &WidgetAddress) -> Option<BridgePhase> {
        self.instance(address).map(WidgetInstance::phase)
    }

    pub fn view(&self, address: &WidgetAddress) -> Option<WidgetView> {
        let instance = self.instance(address)?;
        let sync = instance.state.sync();

        Some(WidgetView {
            address: instance.address.clone(),
            widget_type: instance.config.widget_type().to_string(),
            title: instance.config.title().to_string(),
            props: instance.props.clone(),
            state: instance.state.merged(),
            phase: sync.phase,
            failure: sync.failure.as_ref().map(ToString::to_string),
        })
    }

    pub fn addresses(&self) -> impl Iterator<Item = &WidgetAddress> {
        self.instances.keys()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn instance_mut(&mut self, address: &WidgetAddress) -> Result<&mut WidgetInstance, TreeError> {
        self.instances
            .get_mut(address)
            .ok_or_else(|| TreeError::UnknownWidget(address.clone()))
    }

    fn mounted_with_token(
        &mut self,
        address: &WidgetAddress,
        token: u64,
    ) -> Option<&mut WidgetInstance> {
        self.instances
            .get_mut(address)
            .filter(|instance| instance.bridge.token() == Some(token))
    }

    fn draining_with_token(&mut self, address: &WidgetAddress, token: u64) -> Option<&mut Bridge> {
        self.draining
            .iter_mut()
            .find(|bridge| bridge.address() == address && bridge.token() == Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::protocol::HostEnvelope;
    use serde_json::json;
    use std::sync::mpsc::{self, Receiver};

    const STOP_TIMEOUT: Duration = Duration::from_millis(200);

    fn recording_config() -> Arc<ConfigDescriptor> {
        Arc::new(
            ConfigDescriptor::from_value(
                "Recording",
                json!({
                    "title": "View a recording",
                    "fields": ["status", "status_message", "panel"],
                    "javascript_state": ["panel"],
                    "python_state": ["status", "status_message"]
                }),
            )
            .expect("valid descriptor"),
        )
    }

    fn tree() -> (WidgetTree, Receiver<HostEnvelope>) {
        let (tx, rx) = mpsc::channel();
        (WidgetTree::new(Outbound::new(tx, "S1"), STOP_TIMEOUT), rx)
    }

    fn drain_registrations(rx: &Receiver<HostEnvelope>) -> Vec<(WidgetAddress, u64)> {
        rx.try_iter()
            .filter_map(|envelope| match envelope {
                HostEnvelope::Register { address, token, .. } => Some((address, token)),
                _ => None,
            })
            .collect()
    }

    fn addr(segments: &[&str]) -> WidgetAddress {
        WidgetAddress::from_segments(segments.iter().copied())
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn child_addresses_extend_the_parent_address() {
        let (mut tree, rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        let child = tree
            .mount_child(&root, ChildSpec::new("timeseries", recording_config(), json!({})))
            .expect("mount child");

        assert_eq!(child, addr(&["recording", "timeseries"]));
        let registered = drain_registrations(&rx);
        assert_eq!(registered.len(), 2);
        assert_ne!(registered[0].1, registered[1].1);
        assert_eq!(tree.phase(&child), Some(BridgePhase::Starting));
    }

    #[test]
    fn duplicate_sibling_mount_fails_without_registering() {
        let (mut tree, rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        tree.mount_child(&root, ChildSpec::new("timeseries", recording_config(), json!({})))
            .expect("first child");
        drain_registrations(&rx);

        let err = tree
            .mount_child(&root, ChildSpec::new("timeseries", recording_config(), json!({})))
            .expect_err("duplicate child id");
        assert!(matches!(err, TreeError::DuplicateChildId { .. }));
        assert!(drain_registrations(&rx).is_empty());
    }

    #[test]
    fn mounting_under_unknown_parent_fails() {
        let (mut tree, _rx) = tree();
        let err = tree
            .mount_child(&addr(&["missing"]), ChildSpec::new("x", recording_config(), json!({})))
            .expect_err("unknown parent");
        assert!(matches!(err, TreeError::UnknownParent(_)));
    }

    #[test]
    fn sibling_state_is_independent() {
        let (mut tree, rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        let left = tree
            .mount_child(&root, ChildSpec::new("left", recording_config(), json!({})))
            .expect("left");
        let right = tree
            .mount_child(&root, ChildSpec::new("right", recording_config(), json!({})))
            .expect("right");
        for (address, token) in drain_registrations(&rx) {
            tree.dispatch(BackendEnvelope::Registered { token, address });
        }

        tree.dispatch(BackendEnvelope::State {
            address: left.clone(),
            fields: fields(json!({"status": "running"})),
        });

        let left_view = tree.view(&left).expect("left view");
        let right_view = tree.view(&right).expect("right view");
        assert_eq!(left_view.state["status"], "running");
        assert!(right_view.state.get("status").is_none());
        assert_eq!(right_view.phase, BridgePhase::Active);
    }

    #[test]
    fn unknown_delta_fields_never_reach_state() {
        let (mut tree, rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        let (address, token) = drain_registrations(&rx).remove(0);
        tree.dispatch(BackendEnvelope::Registered { token, address });

        tree.dispatch(BackendEnvelope::State {
            address: root.clone(),
            fields: fields(json!({"status": "finished", "panel": 9, "legacy": true})),
        });

        let view = tree.view(&root).expect("view");
        assert_eq!(view.state["status"], "finished");
        assert!(view.state.get("panel").is_none());
        assert!(view.state.get("legacy").is_none());
    }

    #[test]
    fn registration_failure_is_shown_on_the_ui_side() {
        let (mut tree, rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        let (address, token) = drain_registrations(&rx).remove(0);

        tree.dispatch(BackendEnvelope::RegistrationFailed {
            token,
            address,
            reason: "no such job".to_string(),
        });

        let view = tree.view(&root).expect("view");
        assert_eq!(view.phase, BridgePhase::Stopped);
        assert_eq!(
            view.failure.as_deref(),
            Some("registration failed: no such job")
        );
        assert!(view.state.is_empty());
    }

    #[test]
    fn ui_fields_are_written_through_the_tree() {
        let (mut tree, _rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        tree.take_dirty();

        tree.set_ui_field(&root, "panel", json!(1)).expect("ui write");
        let err = tree
            .set_ui_field(&root, "status", json!("x"))
            .expect_err("backend-owned");
        assert!(matches!(
            err,
            TreeError::State(StateError::BackendOwned(_))
        ));
        assert_eq!(tree.take_dirty(), vec![root.clone()]);
        assert_eq!(tree.view(&root).expect("view").state["panel"], 1);
    }

    #[test]
    fn unmount_stops_children_first_and_drains() {
        let (mut tree, rx) = tree();
        let now = Instant::now();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        tree.mount_child(&root, ChildSpec::new("timeseries", recording_config(), json!({})))
            .expect("mount child");
        for (address, token) in drain_registrations(&rx) {
            tree.dispatch(BackendEnvelope::Registered { token, address });
        }

        assert!(tree.unmount(&root, now));

        let deregistered: Vec<WidgetAddress> = rx
            .try_iter()
            .filter_map(|envelope| match envelope {
                HostEnvelope::Deregister { address, .. } => Some(address),
                _ => None,
            })
            .collect();
        assert_eq!(
            deregistered,
            vec![addr(&["recording", "timeseries"]), addr(&["recording"])]
        );
        assert!(tree.is_empty());
        assert_eq!(tree.draining(), 2);
        assert_eq!(tree.next_deadline(), Some(now + STOP_TIMEOUT));

        tree.tick(now + STOP_TIMEOUT);
        assert_eq!(tree.draining(), 0);
    }

    #[test]
    fn remount_ignores_acks_for_the_previous_registration() {
        let (mut tree, rx) = tree();
        let now = Instant::now();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("mount root");
        let (_, old_token) = drain_registrations(&rx).remove(0);
        assert!(tree.unmount(&root, now));

        tree.mount_root(ChildSpec::new("recording", recording_config(), json!({})))
            .expect("id released on unmount");
        let (_, new_token) = drain_registrations(&rx).remove(0);
        assert_ne!(old_token, new_token);

        tree.dispatch(BackendEnvelope::Registered {
            token: old_token,
            address: root.clone(),
        });
        assert_eq!(tree.phase(&root), Some(BridgePhase::Starting));

        tree.dispatch(BackendEnvelope::Deregistered {
            token: old_token,
            address: root.clone(),
        });
        assert_eq!(tree.draining(), 0);

        tree.dispatch(BackendEnvelope::Registered {
            token: new_token,
            address: root.clone(),
        });
        assert_eq!(tree.phase(&root), Some(BridgePhase::Active));
    }

    #[test]
    fn deltas_for_unmounted_addresses_are_dropped() {
        let (mut tree, _rx) = tree();
        tree.dispatch(BackendEnvelope::State {
            address: addr(&["gone"]),
            fields: fields(json!({"status": "late"})),
        });
        assert!(tree.take_dirty().is_empty());
    }

    #[test]
    fn unmount_all_releases_every_root() {
        let (mut tree, _rx) = tree();
        tree.mount_root(ChildSpec::new("a", recording_config(), json!({})))
            .expect("a");
        tree.mount_root(ChildSpec::new("b", recording_config(), json!({})))
            .expect("b");

        tree.unmount_all(Instant::now());

        assert!(tree.is_empty());
        assert!(tree.mount_root(ChildSpec::new("a", recording_config(), json!({}))).is_ok());
    }

    #[test]
    fn props_are_replaced_without_touching_state() {
        let (mut tree, _rx) = tree();
        let root = tree
            .mount_root(ChildSpec::new("recording", recording_config(), json!({"object": 1})))
            .expect("mount");
        tree.take_dirty();

        tree.update_props(&root, json!({"object": 2})).expect("props");

        assert_eq!(tree.take_dirty(), vec![root.clone()]);
        let view = tree.view(&root).expect("mounted");
        assert_eq!(view.props, json!({"object": 2}));
        assert!(view.state.is_empty());
        assert!(matches!(
            tree.update_props(&addr(&["gone"]), json!({})),
            Err(TreeError::UnknownWidget(_))
        ));
    }
}
