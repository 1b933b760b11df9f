//! Checkpoint contents and their on-disk encoding.
//!
//! A blob is the lowercase hex SHA-256 of the body, a newline, and the JSON
//! body. Blobs whose digest or schema version do not check out are invalid.

use crate::config::RunConfig;
use crate::dag::{PlanGraph, Resolver};
use crate::errors::CheckpointError;
use crate::plan::Plan;
use crate::recovery::RecoveryCounters;
use crate::state::{ExecutionState, StateCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// An immutable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub id: String,
    pub run_id: Uuid,
    /// Increases by one per checkpoint within a run, across resumes
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// Structural definition the graph is rebuilt from
    pub plan: Plan,
    pub state: ExecutionState,
    #[serde(default)]
    pub recovery: RecoveryCounters,
    pub config: RunConfig,
}

impl Checkpoint {
    pub fn new(
        run_id: Uuid,
        sequence: u64,
        plan: Plan,
        state: ExecutionState,
        recovery: RecoveryCounters,
        config: RunConfig,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            id: checkpoint_id(&created_at, &run_id, sequence),
            run_id,
            sequence,
            created_at,
            plan,
            state,
            recovery,
            config,
        }
    }

    /// Rebuild the dependency graph and check the state against it.
    pub fn resolve(&self) -> Result<PlanGraph, CheckpointError> {
        let graph = Resolver::resolve(&self.plan).map_err(|source| CheckpointError::InvalidPlan {
            key: self.id.clone(),
            source,
        })?;

        if !self.state.matches(&graph) {
            return Err(CheckpointError::Corrupt {
                key: self.id.clone(),
                reason: "unit state does not match the plan".to_string(),
            });
        }

        Ok(graph)
    }

    pub fn metadata(&self) -> CheckpointMeta {
        CheckpointMeta {
            id: self.id.clone(),
            run_id: self.run_id,
            sequence: self.sequence,
            created_at: self.created_at,
            plan_name: self.plan.name.clone(),
            counts: self.state.counts(),
            finished: self.state.is_finished(),
        }
    }
}

/// Summary of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: String,
    pub run_id: Uuid,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    pub counts: StateCounts,
    /// Every unit terminal
    pub finished: bool,
}

/// `<unix ms, 13 digits>-<first 8 hex of run id>-<sequence, 6 digits>`.
/// Lexicographic order of ids is chronological.
pub fn checkpoint_id(created_at: &DateTime<Utc>, run_id: &Uuid, sequence: u64) -> String {
    let run = run_id.simple().to_string();
    format!(
        "{:013}-{}-{:06}",
        created_at.timestamp_millis().max(0),
        &run[..8],
        sequence
    )
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Serialize a checkpoint into a blob.
pub fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, CheckpointError> {
    let body = serde_json::to_vec(checkpoint).map_err(CheckpointError::Encode)?;
    let digest = hex::encode(Sha256::digest(&body));

    let mut blob = Vec::with_capacity(digest.len() + 1 + body.len());
    blob.extend_from_slice(digest.as_bytes());
    blob.push(b'\n');
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Verify and parse a blob stored under `key`.
pub fn decode(key: &str, blob: &[u8]) -> Result<Checkpoint, CheckpointError> {
    let corrupt = |reason: &str| CheckpointError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let split = blob
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| corrupt("missing digest header"))?;
    let (header, body) = (&blob[..split], &blob[split + 1..]);

    let expected = std::str::from_utf8(header).map_err(|_| corrupt("digest is not UTF-8"))?;
    let actual = hex::encode(Sha256::digest(body));
    if expected.trim() != actual {
        return Err(corrupt("digest mismatch"));
    }

    let probe: VersionProbe = serde_json::from_slice(body)
        .map_err(|e| corrupt(&format!("unreadable body: {e}")))?;
    if probe.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            key: key.to_string(),
            version: probe.version,
        });
    }

    serde_json::from_slice(body).map_err(|e| corrupt(&format!("invalid body: {e}")))
}
