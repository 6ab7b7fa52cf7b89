//! Starting transcode workers, in-process or as cell processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use cell_transcode::{WorkerConfig, WorkerRuntime};
use cell_transcode_proto::{RequestEnvelope, Response};
use cellwire::Connection;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SpawnError;

/// Name of the transcode cell executable
#[cfg(target_os = "windows")]
pub const CELL_BINARY: &str = "pxc-cell-transcode.exe";
#[cfg(not(target_os = "windows"))]
pub const CELL_BINARY: &str = "pxc-cell-transcode";

/// Caller side of a connection to one transcode worker
pub type TranscodeConnection = Connection<RequestEnvelope, Response>;

const CHANNEL_CAPACITY: usize = 64;

/// Start a worker on a dedicated thread of this process.
///
/// Must be called from within a tokio runtime. The worker stops once every
/// handle to the returned connection is dropped.
pub fn spawn_in_process(config: &WorkerConfig, name: &str) -> Result<TranscodeConnection, SpawnError> {
    let runtime = WorkerRuntime::new(config)?;
    let (conn, requests) = Connection::new(CHANNEL_CAPACITY);
    let (responses_tx, mut responses) = mpsc::channel::<Response>(CHANNEL_CAPACITY);

    runtime.spawn_thread(name, requests, responses_tx)?;

    let weak = conn.downgrade();
    let label = name.to_string();
    tokio::spawn(async move {
        while let Some(response) = responses.recv().await {
            let Some(conn) = weak.upgrade() else {
                break;
            };
            conn.handle_incoming(response);
        }
        debug!(worker = %label, "worker response channel closed");
        if let Some(conn) = weak.upgrade() {
            conn.close();
        }
    });

    Ok(conn)
}

/// Start the transcode cell binary at `path` and connect to it over stdio.
///
/// The child is killed if the host goes away; otherwise it exits on its own
/// when the last connection handle is dropped and its stdin closes.
pub fn spawn_cell_process(path: &Path, config: &WorkerConfig) -> Result<TranscodeConnection, SpawnError> {
    let mut cmd = Command::new(path);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .envs(config.to_env_vars())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;

    let conn = cellwire::socket::run(stdout, stdin);

    let label = path.display().to_string();
    let pid = child.id();
    info!(cell = %label, ?pid, "launched transcode cell");

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                if !status.success() {
                    warn!("{} cell exited with status: {}", label, status);
                } else {
                    debug!("{} cell exited", label);
                }
            }
            Err(e) => {
                warn!("{} cell wait error: {}", label, e);
            }
        }
    });

    Ok(conn)
}

/// Directories searched for the cell binary, in priority order:
///
/// 1. `cell_path` (from `PIXELCELL_CELL_PATH`)
/// 2. Next to the current executable
/// 3. In `cells/` next to the current executable
/// 4. In `target/debug` or `target/release`, matching this build
pub fn cell_search_paths(cell_path: Option<&Path>) -> Vec<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()));

    let cells_dir = exe_dir.as_ref().map(|p| p.join("cells"));

    #[cfg(debug_assertions)]
    let profile_dir = PathBuf::from("target/debug");
    #[cfg(not(debug_assertions))]
    let profile_dir = PathBuf::from("target/release");

    [cell_path.map(Path::to_path_buf), exe_dir, cells_dir, Some(profile_dir)]
        .into_iter()
        .flatten()
        .collect()
}

/// Locate the transcode cell binary.
pub fn find_cell_binary(cell_path: Option<&Path>) -> Result<PathBuf, SpawnError> {
    let searched = cell_search_paths(cell_path);
    find_in(&searched).ok_or(SpawnError::CellNotFound {
        binary: CELL_BINARY,
        searched,
    })
}

fn find_in(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().map(|dir| dir.join(CELL_BINARY)).find(|path| {
        let found = path.is_file();
        if !found {
            debug!("transcode cell not found: {}", path.display());
        }
        found
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_transcode_proto::Output;

    #[test]
    fn test_search_order_starts_with_configured_path() {
        let paths = cell_search_paths(Some(Path::new("/custom/cells")));
        assert_eq!(paths[0], PathBuf::from("/custom/cells"));
        assert!(paths.last().unwrap().starts_with("target"));
        assert!(cell_search_paths(None).len() < paths.len());
    }

    #[test]
    fn test_find_in_takes_first_match() {
        let empty = tempfile::tempdir().unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join(CELL_BINARY), b"").unwrap();
        std::fs::write(second.path().join(CELL_BINARY), b"").unwrap();

        let dirs = [
            empty.path().to_path_buf(),
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ];
        assert_eq!(find_in(&dirs), Some(first.path().join(CELL_BINARY)));
        assert_eq!(find_in(&dirs[..1]), None);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_io_error() {
        let result = spawn_cell_process(
            Path::new("/nonexistent/pxc-cell-transcode"),
            &WorkerConfig::default(),
        );
        assert!(matches!(result, Err(SpawnError::Io(_))));
    }

    #[tokio::test]
    async fn test_in_process_worker_round_trip() {
        let conn = spawn_in_process(&WorkerConfig::default(), "test-in-process").unwrap();
        let response = conn
            .request(RequestEnvelope::decode_binary(conn.next_id(), "AQID", None))
            .await
            .unwrap();
        assert!(matches!(response.result, Ok(Output::Decoded { ref binary }) if binary.as_bytes() == &[1, 2, 3]));
        assert_eq!(conn.in_flight(), 0);
    }
}
