pub mod address;
pub mod bridge;
pub mod descriptor;
pub mod error;
pub mod protocol;
pub mod settings;
pub mod state;
pub mod tree;

use crate::protocol::{reader_loop, ready_envelope, writer_loop};
use log::{error, info, warn};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use crate::address::{ChildIds, WidgetAddress, resolve_child};
pub use crate::bridge::{Bridge, BridgePhase, Delta, Outbound, OutboundClosed};
pub use crate::descriptor::{ConfigDescriptor, DescriptorCache, Ownership};
pub use crate::error::{ConfigError, StateError, SyncFailure, TreeError};
pub use crate::protocol::{BackendEnvelope, HostEnvelope, PatchOp};
pub use crate::settings::HostSettings;
pub use crate::state::{BackendState, MergeReport, SyncStatus, UiState, WidgetState};
pub use crate::tree::{ChildSpec, WidgetInstance, WidgetTree, WidgetView};
pub use serde_json;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub trait WidgetRenderer {
    fn render(&mut self, view: &WidgetView);

    fn unmounted(&mut self, address: &WidgetAddress) {
        let _ = address;
    }
}

#[derive(Debug)]
pub enum HostEvent {
    Backend(BackendEnvelope),
    BackendClosed,
    // Only produced by embedders driving `run_event_loop` from their own
    // event source; `run` ends when the backend closes stdin.
    Shutdown,
}

pub fn run<R, F>(
    settings: HostSettings,
    mut renderer: R,
    mount: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: WidgetRenderer,
    F: FnOnce(&mut WidgetTree) -> Result<(), TreeError>,
{
    let (tx, rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();

    let writer_handle = thread::spawn(move || writer_loop(rx, io::stdout()));

    tx.send(ready_envelope(settings.sid.clone()))
        .map_err(|_| "failed to queue ready envelope")?;

    let outbound = Outbound::new(tx, settings.sid.clone());
    let mut tree = WidgetTree::new(outbound, settings.stop_timeout);
    mount(&mut tree)?;

    let reader_handle = thread::spawn(move || {
        let read_result = reader_loop(io::stdin(), |envelope| {
            let _ = event_tx.send(HostEvent::Backend(envelope));
        });

        if let Err(err) = &read_result {
            error!("reader loop terminated with error: {err}");
        }

        let _ = event_tx.send(HostEvent::BackendClosed);
        read_result
    });

    run_event_loop(&mut tree, &event_rx, &mut renderer, &settings);

    // Dropping the tree releases every outbound sender so the writer drains.
    drop(tree);

    join_with_grace(reader_handle, "reader", Duration::ZERO);
    join_with_grace(writer_handle, "writer", settings.stop_timeout);

    Ok(())
}

pub fn run_event_loop<R: WidgetRenderer>(
    tree: &mut WidgetTree,
    events: &Receiver<HostEvent>,
    renderer: &mut R,
    settings: &HostSettings,
) {
    let backend_alive = loop {
        render_dirty(tree, renderer);

        match events.recv_timeout(settings.tick_interval) {
            Ok(HostEvent::Backend(envelope)) => tree.dispatch(envelope),
            Ok(HostEvent::Shutdown) => break true,
            Ok(HostEvent::BackendClosed) | Err(RecvTimeoutError::Disconnected) => break false,
            Err(RecvTimeoutError::Timeout) => {}
        }

        tree.tick(Instant::now());
    };

    shutdown(tree, events, renderer, settings, backend_alive);
}

fn shutdown<R: WidgetRenderer>(
    tree: &mut WidgetTree,
    events: &Receiver<HostEvent>,
    renderer: &mut R,
    settings: &HostSettings,
    backend_alive: bool,
) {
    let started = Instant::now();
    tree.unmount_all(started);

    if !backend_alive {
        info!("backend closed; abandoning {} pending deregistration(s)", tree.draining());
        tree.tick(started + settings.stop_timeout);
    }

    while tree.draining() > 0 {
        let now = Instant::now();
        let Some(deadline) = tree.next_deadline() else {
            break;
        };
        if now >= deadline {
            tree.tick(now);
            continue;
        }

        match events.recv_timeout((deadline - now).min(settings.tick_interval)) {
            Ok(HostEvent::Backend(envelope)) => tree.dispatch(envelope),
            Ok(HostEvent::Shutdown) | Err(RecvTimeoutError::Timeout) => {}
            Ok(HostEvent::BackendClosed) | Err(RecvTimeoutError::Disconnected) => {
                tree.tick(started + settings.stop_timeout);
            }
        }

        tree.tick(Instant::now());
    }

    render_dirty(tree, renderer);
}

pub fn render_dirty<R: WidgetRenderer>(tree: &mut WidgetTree, renderer: &mut R) {
    for address in tree.take_dirty() {
        match tree.view(&address) {
            Some(view) => renderer.render(&view),
            None => renderer.unmounted(&address),
        }
    }
}

fn join_with_grace(handle: JoinHandle<io::Result<()>>, name: &str, grace: Duration) {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(JOIN_POLL_INTERVAL);
    }

    if !handle.is_finished() {
        // Avoid hanging process exit on blocked stdio during teardown.
        warn!("{name} thread still active during shutdown; skipping join");
        return;
    }

    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("{name} thread returned error: {err}"),
        Err(err) => error!("{name} thread join failed: {err:?}"),
    }
}
