use crate::address::WidgetAddress;
use crate::descriptor::ConfigDescriptor;
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

pub const HOST_TO_BACKEND_CAP: usize = 65_536;
pub const BACKEND_TO_HOST_CAP: usize = 1_048_576;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t")]
pub enum HostEnvelope {
    #[serde(rename = "ready")]
    Ready { sid: String, capabilities: Value },
    #[serde(rename = "register")]
    Register {
        sid: String,
        token: u64,
        address: WidgetAddress,
        config: Arc<ConfigDescriptor>,
    },
    #[serde(rename = "deregister")]
    Deregister {
        sid: String,
        token: u64,
        address: WidgetAddress,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t")]
pub enum BackendEnvelope {
    #[serde(rename = "registered")]
    Registered { token: u64, address: WidgetAddress },

    #[serde(rename = "registration_failed")]
    RegistrationFailed {
        token: u64,
        address: WidgetAddress,
        reason: String,
    },

    #[serde(rename = "deregistered")]
    Deregistered { token: u64, address: WidgetAddress },

    #[serde(rename = "state")]
    State {
        address: WidgetAddress,
        fields: Map<String, Value>,
    },

    #[serde(rename = "snapshot")]
    Snapshot {
        address: WidgetAddress,
        fields: Map<String, Value>,
    },

    #[serde(rename = "patch")]
    Patch {
        address: WidgetAddress,
        ops: Vec<PatchOp>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        address: Option<WidgetAddress>,
        code: String,
        message: String,
    },
}

impl BackendEnvelope {
    pub fn address(&self) -> Option<&WidgetAddress> {
        match self {
            Self::Registered { address, .. }
            | Self::RegistrationFailed { address, .. }
            | Self::Deregistered { address, .. }
            | Self::State { address, .. }
            | Self::Snapshot { address, .. }
            | Self::Patch { address, .. } => Some(address),
            Self::Error { address, .. } => address.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op")]
pub enum PatchOp {
    #[serde(rename = "replace")]
    Replace { path: String, value: Value },
    #[serde(rename = "add")]
    Add { path: String, value: Value },
    #[serde(rename = "remove")]
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Replace { path, .. } | Self::Add { path, .. } | Self::Remove { path } => path,
        }
    }
}

pub fn ready_envelope(sid: String) -> HostEnvelope {
    HostEnvelope::Ready {
        sid,
        capabilities: serde_json::json!({
            "deltas": ["state", "snapshot", "patch"],
            "transport": "stdio-packet-4"
        }),
    }
}

pub fn writer_loop(rx: Receiver<HostEnvelope>, mut writer: impl Write) -> io::Result<()> {
    for envelope in rx {
        let payload = encode_host_envelope(&envelope)?;
        if let Err(err) = check_frame_len(payload.len(), HOST_TO_BACKEND_CAP) {
            error!("dropping host envelope: {err}");
            continue;
        }

        write_frame(&mut writer, &payload, HOST_TO_BACKEND_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

/// A frame that fails to decode is logged and skipped since the length prefix
/// keeps the stream aligned. An oversized frame cannot be skipped safely and
/// ends the loop with `InvalidData`.
pub fn reader_loop<F>(mut reader: impl Read, mut on_envelope: F) -> io::Result<()>
where
    F: FnMut(BackendEnvelope),
{
    loop {
        match read_frame(&mut reader, BACKEND_TO_HOST_CAP) {
            Ok(payload) => match decode_backend_envelope(&payload) {
                Ok(envelope) => on_envelope(envelope),
                Err(err) => error!("skipping undecodable backend frame: {err}"),
            },
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn encode_host_envelope(envelope: &HostEnvelope) -> io::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn decode_backend_envelope(payload: &[u8]) -> io::Result<BackendEnvelope> {
    serde_json::from_slice(payload).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn read_frame(reader: &mut impl Read, cap: usize) -> io::Result<Vec<u8>> {
    let mut prefix = [0_u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix)?;

    let len = u32::from_be_bytes(prefix) as usize;
    check_frame_len(len, cap)?;

    let mut payload = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut payload)?;
    if payload.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated after {} of {len} bytes", payload.len()),
        ));
    }
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], cap: usize) -> io::Result<()> {
    check_frame_len(payload.len(), cap)?;
    let prefix = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame length exceeds u32"))?;

    writer.write_all(&prefix.to_be_bytes())?;
    writer.write_all(payload)
}

fn check_frame_len(len: usize, cap: usize) -> io::Result<()> {
    if len > cap {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds cap of {cap}"),
        ));
    }
    Ok(())
}
