//! §4.3.10 / §6 Checkpointing — directory-tree persistence of a coherent
//! simulation snapshot.
//!
//! One file per agent keyed by `agentId`, plus one file for each marketplace
//! and one for the manager, all version-tagged so an incompatible checkpoint
//! is rejected deterministically rather than silently misread (§7 Fatal:
//! "checkpoint format mismatch at load"). `saveCheckpoint`/`loadCheckpoint`
//! themselves are driven by the agent dispatch loop (`agent::runtime`),
//! which is the only place that can read the controller's state alongside
//! the runtime's — this module only does the byte-level (de)serialization.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agent::AgentState;
use crate::error::CheckpointError;
use crate::types::AgentId;

/// Bumped whenever `AgentState`, a listing type, or this file layout changes
/// in a way that breaks backward compatibility.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    payload: T,
}

fn write_envelope<T: Serialize>(path: &Path, payload: &T) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let envelope = Envelope { version: CHECKPOINT_VERSION, payload };
    let text = serde_json::to_string_pretty(&envelope)?;
    std::fs::write(path, text).map_err(|source| CheckpointError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let text = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let envelope: Envelope<T> = serde_json::from_str(&text)?;
    if envelope.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::VersionMismatch {
            found: envelope.version,
            expected: CHECKPOINT_VERSION,
        });
    }
    Ok(envelope.payload)
}

/// Replace anything that isn't filesystem-safe so `agentId`s containing
/// punctuation still round-trip to a distinct, valid file name.
fn sanitize_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn agent_path(dir: &Path, id: &AgentId) -> PathBuf {
    dir.join("agents").join(format!("{}.json", sanitize_file_stem(&id.0)))
}

fn market_path(dir: &Path, name: &str) -> PathBuf {
    dir.join("markets").join(format!("{name}.json"))
}

fn manager_path(dir: &Path) -> PathBuf {
    dir.join("manager.json")
}

#[derive(Debug, Serialize, Deserialize)]
struct AgentCheckpoint {
    state: AgentState,
    /// Opaque controller blob, folded in verbatim (§4.6 `Controller::save_state`).
    controller: Vec<u8>,
}

pub fn save_agent(
    dir: &Path,
    id: &AgentId,
    state: &AgentState,
    controller_blob: &[u8],
) -> Result<(), CheckpointError> {
    write_envelope(
        &agent_path(dir, id),
        &AgentCheckpoint { state: state.clone(), controller: controller_blob.to_vec() },
    )
}

pub fn load_agent(dir: &Path, id: &AgentId) -> Result<(AgentState, Vec<u8>), CheckpointError> {
    let checkpoint: AgentCheckpoint = read_envelope(&agent_path(dir, id))?;
    Ok((checkpoint.state, checkpoint.controller))
}

pub fn save_market<V: Serialize>(dir: &Path, name: &str, listings: &[V]) -> Result<(), CheckpointError> {
    write_envelope(&market_path(dir, name), &listings.to_vec())
}

pub fn load_market<V: DeserializeOwned>(dir: &Path, name: &str) -> Result<Vec<V>, CheckpointError> {
    read_envelope(&market_path(dir, name))
}

#[derive(Debug, Serialize, Deserialize)]
struct ManagerCheckpoint {
    step: u64,
}

pub fn save_manager(dir: &Path, step: u64) -> Result<(), CheckpointError> {
    write_envelope(&manager_path(dir), &ManagerCheckpoint { step })
}

pub fn load_manager(dir: &Path) -> Result<u64, CheckpointError> {
    let checkpoint: ManagerCheckpoint = read_envelope(&manager_path(dir))?;
    Ok(checkpoint.step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_checkpoint_round_trips() {
        let dir = tempdir();
        let id = AgentId::new("farmer3");
        let mut state = AgentState::new(1000);
        state.credit_item("wheat", 12.0);

        save_agent(&dir, &id, &state, b"controller-blob").unwrap();
        let (loaded_state, blob) = load_agent(&dir, &id).unwrap();

        assert_eq!(loaded_state.balance, 1000);
        assert_eq!(loaded_state.item_quantity("wheat"), 12.0);
        assert_eq!(blob, b"controller-blob");
    }

    #[test]
    fn agent_id_with_punctuation_still_round_trips() {
        let dir = tempdir();
        let id = AgentId::new("farmer/weird:id");
        let state = AgentState::new(5);
        save_agent(&dir, &id, &state, &[]).unwrap();
        let (loaded, _) = load_agent(&dir, &id).unwrap();
        assert_eq!(loaded.balance, 5);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempdir();
        let path = manager_path(&dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"version": 999, "payload": {"step": 3}}"#).unwrap();
        let err = load_manager(&dir).unwrap_err();
        assert!(matches!(err, CheckpointError::VersionMismatch { found: 999, .. }));
    }

    #[test]
    fn manager_step_round_trips() {
        let dir = tempdir();
        save_manager(&dir, 42).unwrap();
        assert_eq!(load_manager(&dir).unwrap(), 42);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sim-core-checkpoint-test-{}-{}",
            std::process::id(),
            NEXT_TEST_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    static NEXT_TEST_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
}
