//! KdsApi port - キッチンディスプレイのロングポーリング
//!
//! `long_poll_*` はサーバ側で最大 `wait` だけ保留されます。
//! 本文が空のレスポンスは「イベントなし・カーソル据え置き」として返します。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{PollBatch, Station, Ticket};
use crate::error::ApiError;

#[async_trait]
pub trait KdsApi: Send + Sync {
    /// NEW/ACK tickets currently routed to `station`.
    async fn list_tickets(&self, station: Station) -> Result<Vec<Ticket>, ApiError>;

    async fn long_poll_tickets(
        &self,
        station: Station,
        since_id: u64,
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError>;

    /// READY tickets waiting to be taken.
    async fn ready_list(&self) -> Result<Vec<Ticket>, ApiError>;

    async fn long_poll_ready(
        &self,
        since_id: u64,
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError>;
}
