//! JsonFileTaskStore - ファイルに永続化する TaskStore
//!
//! キュー全体を 1 つの JSON 配列として保存します。
//! 書き込みは一時ファイル + rename で、途中で落ちても前の内容が残ります。

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::ports::TaskStore;
use crate::queue::QueuedTask;

/// File name of the persisted queue inside the data directory.
pub const QUEUE_FILE: &str = "txqueue-v1.json";

#[derive(Debug, Clone)]
pub struct JsonFileTaskStore {
    path: PathBuf,
}

impl JsonFileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/txqueue-v1.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(QUEUE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Option<Vec<Value>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read send queue; starting empty");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(entries) => Some(entries),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "send queue file is corrupt; starting empty");
                None
            }
        }
    }
}

impl TaskStore for JsonFileTaskStore {
    fn load(&self) -> Vec<QueuedTask> {
        let Some(entries) = self.read_entries() else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<QueuedTask>(entry.clone()) {
                Ok(task) => Some(task),
                Err(err) => {
                    let kind = entry
                        .pointer("/task/kind")
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    warn!(kind, error = %err, "dropping unreadable queued task");
                    None
                }
            })
            .collect()
    }

    fn save(&self, tasks: &[QueuedTask]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let body = serde_json::to_vec(tasks)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
