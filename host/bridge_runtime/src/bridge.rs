//! The per-instance synchronization bridge.
//!
//! ```text
//! Idle --start--> Starting --registered--> Active
//!   |                |  \--registration_failed--> Stopped
//!   |               stop                            ^
//!   |                v                              |
//!   +----stop----> Stopping --deregistered/timeout--+
//! ```

use crate::address::WidgetAddress;
use crate::descriptor::ConfigDescriptor;
use crate::error::SyncFailure;
use crate::protocol::{HostEnvelope, PatchOp};
use crate::state::{BackendState, MergeReport};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgePhase {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct Outbound {
    tx: Sender<HostEnvelope>,
    sid: String,
    next_token: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundClosed;

impl Outbound {
    pub fn new(tx: Sender<HostEnvelope>, sid: impl Into<String>) -> Self {
        Self {
            tx,
            sid: sid.into(),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn send(&self, envelope: HostEnvelope) -> Result<(), OutboundClosed> {
        self.tx.send(envelope).map_err(|_| OutboundClosed)
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub enum Delta {
    Merge(Map<String, Value>),
    Snapshot(Map<String, Value>),
    Ops(Vec<PatchOp>),
}

#[derive(Debug)]
pub struct Bridge {
    address: WidgetAddress,
    config: Arc<ConfigDescriptor>,
    outbound: Outbound,
    stop_timeout: Duration,
    phase: BridgePhase,
    token: Option<u64>,
    stop_deadline: Option<Instant>,
}

impl Bridge {
    pub fn new(
        address: WidgetAddress,
        config: Arc<ConfigDescriptor>,
        outbound: Outbound,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            address,
            config,
            outbound,
            stop_timeout,
            phase: BridgePhase::Idle,
            token: None,
            stop_deadline: None,
        }
    }

    pub fn address(&self) -> &WidgetAddress {
        &self.address
    }

    pub fn config(&self) -> &Arc<ConfigDescriptor> {
        &self.config
    }

    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    pub fn token(&self) -> Option<u64> {
        self.token
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == BridgePhase::Stopped
    }

    pub fn start(&mut self) -> Result<bool, SyncFailure> {
        if self.phase != BridgePhase::Idle {
            debug!("{}: start ignored in phase {:?}", self.address, self.phase);
            return Ok(false);
        }

        let token = self.outbound.next_token();
        self.token = Some(token);

        let envelope = HostEnvelope::Register {
            sid: self.outbound.sid().to_string(),
            token,
            address: self.address.clone(),
            config: self.config.clone(),
        };

        if self.outbound.send(envelope).is_err() {
            self.phase = BridgePhase::Stopped;
            warn!("{}: backend unreachable, registration not sent", self.address);
            return Err(SyncFailure::RegistrationFailed {
                reason: "backend unreachable".to_string(),
            });
        }

        self.phase = BridgePhase::Starting;
        Ok(true)
    }

    pub fn on_registered(&mut self, token: u64) -> bool {
        if self.phase != BridgePhase::Starting || self.token != Some(token) {
            debug!(
                "{}: ignoring registration ack token={token} in phase {:?}",
                self.address, self.phase
            );
            return false;
        }

        self.phase = BridgePhase::Active;
        true
    }

    pub fn on_registration_failed(&mut self, token: u64, reason: &str) -> Option<SyncFailure> {
        if self.phase != BridgePhase::Starting || self.token != Some(token) {
            debug!(
                "{}: ignoring registration failure token={token} in phase {:?}",
                self.address, self.phase
            );
            return None;
        }

        warn!("{}: registration failed: {reason}", self.address);
        self.phase = BridgePhase::Stopped;
        Some(SyncFailure::RegistrationFailed {
            reason: reason.to_string(),
        })
    }

    pub fn apply(&mut self, backend: &mut BackendState, delta: Delta) -> Option<MergeReport> {
        if self.phase != BridgePhase::Active {
            debug!("{}: ignoring delta in phase {:?}", self.address, self.phase);
            return None;
        }

        let report = match delta {
            Delta::Merge(fields) => backend.merge(&self.config, fields),
            Delta::Snapshot(fields) => backend.replace(&self.config, fields),
            Delta::Ops(ops) => backend.apply_ops(&self.config, &ops),
        };

        for field in &report.dropped {
            warn!(
                "{}: dropping delta field '{field}' not declared backend-owned by {}",
                self.address,
                self.config.widget_type()
            );
        }

        for reason in &report.rejected {
            warn!("{}: rejected patch op: {reason}", self.address);
        }

        Some(report)
    }

    pub fn stop(&mut self, now: Instant) -> bool {
        match self.phase {
            BridgePhase::Stopping | BridgePhase::Stopped => {
                debug!("{}: stop ignored in phase {:?}", self.address, self.phase);
                false
            }
            BridgePhase::Idle => {
                self.phase = BridgePhase::Stopped;
                true
            }
            BridgePhase::Starting | BridgePhase::Active => {
                if self.send_deregister().is_err() {
                    warn!(
                        "{}: backend unreachable on stop, tearing down locally",
                        self.address
                    );
                    self.phase = BridgePhase::Stopped;
                    return true;
                }

                self.phase = BridgePhase::Stopping;
                self.stop_deadline = Some(now + self.stop_timeout);
                true
            }
        }
    }

    pub fn on_deregistered(&mut self, token: u64) -> bool {
        if self.phase != BridgePhase::Stopping || self.token != Some(token) {
            debug!(
                "{}: ignoring deregistration ack token={token} in phase {:?}",
                self.address, self.phase
            );
            return false;
        }

        self.finish_stop();
        true
    }

    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match (self.phase, self.stop_deadline) {
            (BridgePhase::Stopping, Some(deadline)) if now >= deadline => {
                warn!(
                    "{}: no deregistration ack within {:?}, stopping locally",
                    self.address, self.stop_timeout
                );
                self.finish_stop();
                true
            }
            _ => false,
        }
    }

    pub fn stop_deadline(&self) -> Option<Instant> {
        self.stop_deadline
    }

    fn finish_stop(&mut self) {
        self.phase = BridgePhase::Stopped;
        self.stop_deadline = None;
    }

    fn send_deregister(&self) -> Result<(), OutboundClosed> {
        let Some(token) = self.token else {
            return Ok(());
        };

        self.outbound.send(HostEnvelope::Deregister {
            sid: self.outbound.sid().to_string(),
            token,
            address: self.address.clone(),
        })
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if matches!(self.phase, BridgePhase::Starting | BridgePhase::Active) {
            debug!("{}: dropped while registered, deregistering", self.address);
            let _ = self.send_deregister();
        }
    }
}
