//! TaskStore port - 送信キューの永続化
//!
//! 毎回キュー全体を書き込みます（差分保存はしない）。
//! エンジンは単一ワーカーなので、全体書き込みで整合性が保てます。

use crate::error::StoreError;
use crate::queue::QueuedTask;

pub trait TaskStore: Send + Sync {
    /// Persisted queue; empty when nothing is stored or the data is unreadable.
    fn load(&self) -> Vec<QueuedTask>;

    /// Replace the persisted queue with `tasks`.
    fn save(&self, tasks: &[QueuedTask]) -> Result<(), StoreError>;
}
