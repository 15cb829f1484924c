//! On-disk layout of a node's data directory.
//!
//! - `member.json` records which member owns the directory.
//! - `snapshot.bin` is the bincode image of the key space, rewritten on close.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use super::state::Snapshot;
use crate::error::NodeError;

const MEMBER_FILE: &str = "member.json";
const SNAPSHOT_FILE: &str = "snapshot.bin";

#[derive(Debug, Serialize, Deserialize)]
struct MemberRecord {
    id: String,
    token: String,
}

/// Creates `dir` if needed and claims it for `id`. A directory already
/// claimed by another member is refused.
pub async fn prepare_data_dir(dir: &Path, id: &str, token: &str) -> Result<(), NodeError> {
    fs::create_dir_all(dir).await.map_err(|source| data_dir_error(dir, source))?;

    let member_path = dir.join(MEMBER_FILE);
    match fs::read(&member_path).await {
        Ok(bytes) => {
            let record: MemberRecord =
                serde_json::from_slice(&bytes).map_err(|err| NodeError::Snapshot {
                    path: member_path.clone(),
                    reason: err.to_string(),
                })?;
            if record.id != id {
                return Err(NodeError::MemberMismatch {
                    path: dir.to_path_buf(),
                    expected: id.to_string(),
                    found: record.id,
                });
            }
            debug!(path = ?dir, member = %id, "reusing data directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let record = MemberRecord {
                id: id.to_string(),
                token: token.to_string(),
            };
            let bytes = serde_json::to_vec_pretty(&record).map_err(|err| NodeError::Snapshot {
                path: member_path.clone(),
                reason: err.to_string(),
            })?;
            write_atomically(&member_path, &bytes).await?;
            info!(path = ?dir, member = %id, "initialised data directory");
            Ok(())
        }
        Err(source) => Err(data_dir_error(&member_path, source)),
    }
}

pub async fn load_snapshot(dir: &Path) -> Result<Option<Snapshot>, NodeError> {
    let path = dir.join(SNAPSHOT_FILE);
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(data_dir_error(&path, source)),
    };

    bincode::deserialize(&bytes)
        .map(Some)
        .map_err(|err| NodeError::Snapshot {
            path,
            reason: err.to_string(),
        })
}

pub async fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<(), NodeError> {
    let path = dir.join(SNAPSHOT_FILE);
    let bytes = bincode::serialize(snapshot).map_err(|err| NodeError::Snapshot {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    write_atomically(&path, &bytes).await?;
    debug!(path = ?path, revision = snapshot.revision, "snapshot written");
    Ok(())
}

/// Writes through a temporary sibling and renames it over `path`, so a crash
/// mid-write never leaves a truncated file behind.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), NodeError> {
    let tmp = tmp_path(path);
    fs::write(&tmp, bytes)
        .await
        .map_err(|source| data_dir_error(&tmp, source))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| data_dir_error(path, source))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn data_dir_error(path: &Path, source: io::Error) -> NodeError {
    NodeError::DataDir {
        path: path.to_path_buf(),
        source,
    }
}
