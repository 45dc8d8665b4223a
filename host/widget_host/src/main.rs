mod recording;
mod render;

use crate::recording::{RecordingObject, Widgets, mount_recording};
use crate::render::LogRenderer;
use anyhow::anyhow;
use log::{error, info};
use std::process;
use widgetsync_bridge_runtime::{DescriptorCache, HostSettings};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        error!("widget_host fatal error: {err:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let settings = HostSettings::from_env();
    let object = RecordingObject::from_env()?;

    let mut descriptors = DescriptorCache::default();
    let widgets = Widgets::load(&mut descriptors)?;

    info!(
        "starting widget host sid={} stop_timeout={:?}",
        settings.sid, settings.stop_timeout
    );

    widgetsync_bridge_runtime::run(settings, LogRenderer, |tree| {
        mount_recording(tree, &widgets, &object).map(|_| ())
    })
    .map_err(|err| anyhow!("{err}"))
}
