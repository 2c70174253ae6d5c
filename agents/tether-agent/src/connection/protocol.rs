//! Message Protocol
//!
//! Defines the message types exchanged between the agent and the supervisor.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::agent::redirect::RedirectTarget;
use crate::runtime::adapter::{Unit, UnitId};

/// zstd level used for artifact payloads
const ARTIFACT_COMPRESSION_LEVEL: i32 = 3;

/// Messages sent from the agent to the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentMessage {
    /// Agent registration/handshake
    Register(RegisterPayload),

    Heartbeat(HeartbeatPayload),

    /// Answer to a supervisor request
    Reply(ReplyPayload),

    /// One-way lifecycle notification
    Event(EventPayload),

    /// Captured output while console redirection is active
    Output(OutputPayload),

    /// Request artifact content by hash
    FetchArtifact(FetchArtifactPayload),

    /// Unit descriptions requested with ListUnits
    Units(UnitsPayload),
}

/// Messages sent from the supervisor to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlPlaneMessage {
    /// Welcome message after successful registration
    Welcome(WelcomePayload),

    /// Liveness check, answered with a reply
    Ping(PingPayload),

    /// Bring the unit set in line with the desired state
    Reconcile(ReconcilePayload),

    Install(InstallPayload),

    InstallFromUrl(InstallFromUrlPayload),

    Update(UpdatePayload),

    UpdateFromUrl(UpdateFromUrlPayload),

    Uninstall(UnitIdsPayload),

    Start(UnitIdsPayload),

    Stop(UnitIdsPayload),

    ListUnits(UnitIdsPayload),

    Redirect(RedirectPayload),

    /// Tear the agent down with the regular exit code
    Close(CloseRequestPayload),

    /// Tear the agent down with an explicit exit code
    Abort(AbortPayload),

    /// Answer to a FetchArtifact request
    Artifact(ArtifactPayload),

    /// Error from supervisor
    Error(ErrorPayload),
}

// Agent Message Payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub agent_id: String,
    pub agent_name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub runtime_type: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub unit_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub request_id: String,
    pub success: bool,
    /// Newline-joined batch report, absent on full success
    pub report: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Event kinds pushed to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Exit,
    HostEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub code: i32,
}

impl Event {
    pub fn exit(code: i32) -> Self {
        Self {
            kind: EventKind::Exit,
            code,
        }
    }

    pub fn host(code: i32) -> Self {
        Self {
            kind: EventKind::HostEvent,
            code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPayload {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchArtifactPayload {
    pub request_id: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsPayload {
    pub request_id: String,
    pub units: Vec<Unit>,
}

// Supervisor Message Payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub agent_id: String,
    pub session_id: String,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePayload {
    pub request_id: String,
    /// location -> content hash, in the supervisor's order. Absent means
    /// nothing should be installed.
    #[serde(default)]
    pub units: Option<IndexMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallUnit {
    pub location: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallPayload {
    pub request_id: String,
    pub units: Vec<InstallUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallFromUrlPayload {
    pub request_id: String,
    pub location: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUnit {
    pub id: UnitId,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub request_id: String,
    pub units: Vec<UpdateUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFromUrlPayload {
    pub request_id: String,
    pub id: UnitId,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitIdsPayload {
    pub request_id: String,
    #[serde(default)]
    pub ids: Vec<UnitId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectPayload {
    pub request_id: String,
    pub target: RedirectTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequestPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortPayload {
    pub request_id: String,
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub request_id: String,
    /// base64 of the zstd-compressed content, absent when the supervisor
    /// does not know the hash
    pub data: Option<String>,
}

impl ArtifactPayload {
    /// Build a payload carrying `content`
    pub fn encode(request_id: &str, content: &[u8]) -> Result<Self> {
        let compressed = zstd::encode_all(content, ARTIFACT_COMPRESSION_LEVEL)
            .context("Failed to compress artifact")?;
        Ok(Self {
            request_id: request_id.to_string(),
            data: Some(STANDARD.encode(compressed)),
        })
    }

    /// Decode the carried content, `None` when the supervisor had none
    pub fn decode(&self) -> Result<Option<Bytes>> {
        let Some(data) = &self.data else {
            return Ok(None);
        };

        let compressed = STANDARD
            .decode(data)
            .context("Artifact payload is not valid base64")?;
        let content = zstd::decode_all(compressed.as_slice())
            .context("Failed to decompress artifact")?;
        Ok(Some(Bytes::from(content)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    /// Create a new registration message
    pub fn register(agent_id: &str, agent_name: &str, runtime_type: &str) -> Self {
        AgentMessage::Register(RegisterPayload {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![
                "reconcile".to_string(),
                "redirect".to_string(),
                runtime_type.to_string(),
            ],
            runtime_type: runtime_type.to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            timestamp: Utc::now(),
        })
    }

    pub fn heartbeat(agent_id: &str, uptime_secs: u64, unit_count: u32) -> Self {
        AgentMessage::Heartbeat(HeartbeatPayload {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            uptime_secs,
            unit_count,
        })
    }

    /// Answer a request; `report` carries the failures of a partial batch
    pub fn reply(request_id: &str, report: Option<String>) -> Self {
        AgentMessage::Reply(ReplyPayload {
            request_id: request_id.to_string(),
            success: report.is_none(),
            report,
            error: None,
            timestamp: Utc::now(),
        })
    }

    pub fn reply_error(request_id: &str, error: String) -> Self {
        AgentMessage::Reply(ReplyPayload {
            request_id: request_id.to_string(),
            success: false,
            report: None,
            error: Some(error),
            timestamp: Utc::now(),
        })
    }

    pub fn event(event: Event) -> Self {
        AgentMessage::Event(EventPayload {
            event,
            timestamp: Utc::now(),
        })
    }

    pub fn output(text: &str) -> Self {
        AgentMessage::Output(OutputPayload {
            text: text.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl ControlPlaneMessage {
    /// Deserialize a message from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
