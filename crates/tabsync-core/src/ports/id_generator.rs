//! IdGenerator port - ID 生成の抽象化
//!
//! タスク ID とドラフトトークンはどちらも ULID（時刻 + 乱数）です。

use crate::domain::ids::{DraftToken, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_draft_token(&self) -> DraftToken;
}

/// UlidGenerator は Clock の時刻をタイムスタンプ部に使う
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_draft_token(&self) -> DraftToken {
        DraftToken::from(self.next_ulid())
    }
}
