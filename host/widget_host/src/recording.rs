use anyhow::{Context, bail};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use widgetsync_bridge_runtime::{
    ChildSpec, ConfigDescriptor, ConfigError, DescriptorCache, TreeError, WidgetAddress,
    WidgetTree,
};

pub const RECORDING_ID: &str = "recording";
pub const TIMESERIES_CHILD_ID: &str = "timeseries";
pub const DOWNLOAD_FROM: &str = "spikeforest.public";

const RECORDING_CONFIG: &str = include_str!("../widgets/Recording.json");
const TIMESERIES_CONFIG: &str = include_str!("../widgets/TimeseriesView.json");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(
        default,
        rename = "sampleRateHz",
        skip_serializing_if = "Option::is_none"
    )]
    pub sample_rate_hz: Option<f64>,
}

impl RecordingObject {
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("WIDGETSYNC_RECORDING") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).context("WIDGETSYNC_RECORDING is not a recording object")
            }
            _ => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResource {
    pub path: String,
    pub download_from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samplerate: Option<f64>,
}

impl DataResource {
    pub fn for_recording(object: &RecordingObject) -> Option<Self> {
        let directory = object.directory.as_deref()?;

        Some(Self {
            path: format!("{}/raw.mda", directory.trim_end_matches('/')),
            download_from: DOWNLOAD_FROM.to_string(),
            samplerate: object.sample_rate_hz,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.path.is_empty() {
            bail!("data resource has no path");
        }

        if self.path.ends_with(".mda") && self.samplerate.is_none() {
            bail!("missing samplerate for {}", self.path);
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Widgets {
    pub recording: Arc<ConfigDescriptor>,
    pub timeseries: Arc<ConfigDescriptor>,
}

impl Widgets {
    pub fn load(cache: &mut DescriptorCache) -> Result<Self, ConfigError> {
        Ok(Self {
            recording: cache.load_str("Recording", RECORDING_CONFIG)?,
            timeseries: cache.load_str("TimeseriesView", TIMESERIES_CONFIG)?,
        })
    }
}

pub fn mount_recording(
    tree: &mut WidgetTree,
    widgets: &Widgets,
    object: &RecordingObject,
) -> Result<WidgetAddress, TreeError> {
    let root = tree.mount_root(ChildSpec::new(
        RECORDING_ID,
        widgets.recording.clone(),
        json!({ "object": object }),
    ))?;

    let Some(resource) = DataResource::for_recording(object) else {
        warn!("{root}: recording has no directory; timeseries view not mounted");
        return Ok(root);
    };

    if let Err(err) = resource.validate() {
        warn!("{root}: not mounting timeseries view: {err}");
        return Ok(root);
    }

    tree.mount_child(
        &root,
        ChildSpec::new(
            TIMESERIES_CHILD_ID,
            widgets.timeseries.clone(),
            json!({ "recording": resource }),
        ),
    )?;

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use widgetsync_bridge_runtime::{BridgePhase, HostEnvelope, Outbound};

    fn widgets() -> Widgets {
        Widgets::load(&mut DescriptorCache::default()).expect("embedded descriptors are valid")
    }

    fn object() -> RecordingObject {
        RecordingObject {
            directory: Some("sha1dir://abc.synth/001".to_string()),
            sample_rate_hz: Some(30_000.0),
        }
    }

    #[test]
    fn embedded_descriptors_partition_status_fields() {
        let widgets = widgets();
        assert!(widgets.recording.is_backend_owned("status"));
        assert!(widgets.recording.is_backend_owned("status_message"));
        assert!(widgets.timeseries.is_ui_owned("time_range"));
        assert_eq!(widgets.recording.inputs(), ["object"]);
    }

    #[test]
    fn resource_points_at_raw_mda() {
        let resource = DataResource::for_recording(&object()).expect("directory present");
        assert_eq!(resource.path, "sha1dir://abc.synth/001/raw.mda");
        assert_eq!(resource.download_from, "spikeforest.public");
        assert_eq!(resource.samplerate, Some(30_000.0));
        assert!(resource.validate().is_ok());
    }

    #[test]
    fn mda_resource_requires_samplerate() {
        let object = RecordingObject {
            sample_rate_hz: None,
            ..object()
        };
        let resource = DataResource::for_recording(&object).expect("directory present");
        assert!(resource.validate().is_err());
    }

    #[test]
    fn parses_camel_case_sample_rate() {
        let object: RecordingObject =
            serde_json::from_str(r#"{"directory":"d","sampleRateHz":20000}"#).expect("parse");
        assert_eq!(object.sample_rate_hz, Some(20_000.0));
    }

    #[test]
    fn mounts_timeseries_under_recording() {
        let (tx, rx) = mpsc::channel();
        let mut tree = WidgetTree::new(Outbound::new(tx, "S1"), Duration::from_millis(100));

        let root = mount_recording(&mut tree, &widgets(), &object()).expect("mount");

        let child = WidgetAddress::from_segments([RECORDING_ID, TIMESERIES_CHILD_ID]);
        let view = tree.view(&child).expect("timeseries mounted");
        assert_eq!(view.props["recording"]["path"], "sha1dir://abc.synth/001/raw.mda");
        assert_eq!(view.phase, BridgePhase::Starting);
        assert_eq!(
            tree.view(&root).expect("root view").props["object"]["sampleRateHz"],
            30_000.0
        );

        let registered: Vec<WidgetAddress> = rx
            .try_iter()
            .filter_map(|envelope| match envelope {
                HostEnvelope::Register { address, .. } => Some(address),
                _ => None,
            })
            .collect();
        assert_eq!(registered, vec![root, child]);
    }

    #[test]
    fn empty_object_mounts_only_the_recording() {
        let (tx, _rx) = mpsc::channel();
        let mut tree = WidgetTree::new(Outbound::new(tx, "S1"), Duration::from_millis(100));

        mount_recording(&mut tree, &widgets(), &RecordingObject::default()).expect("mount");

        assert_eq!(tree.len(), 1);
    }
}
