//! LongPollClient - KDS のロングポーリング
//!
//! # フロー
//! 1. スナップショット取得（失敗時は空リスト・カーソル 0）
//! 2. カーソル付きでリクエスト（サーバ側で最大 wait 秒保留）
//! 3. 受け取ったチケットを id でマージし、カーソルを進める
//! 4. 0 件なら retryAfter だけ待つ / 失敗ならバックオフ（上限あり）
//!
//! stop() で進行中のリクエストごとキャンセルします。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LongPollSettings;
use crate::domain::{PollBatch, Station, Ticket};
use crate::error::ApiError;
use crate::ports::KdsApi;
use crate::queue::Backoff;

/// One pollable stream.
#[async_trait]
pub trait PollSource: Send + Sync {
    fn name(&self) -> String;

    async fn snapshot(&self) -> Result<Vec<Ticket>, ApiError>;

    async fn poll(&self, since_id: u64, wait: Duration) -> Result<PollBatch<Ticket>, ApiError>;
}

/// NEW/ACK tickets for one station.
pub struct TicketSource {
    api: Arc<dyn KdsApi>,
    station: Station,
}

impl TicketSource {
    pub fn new(api: Arc<dyn KdsApi>, station: Station) -> Self {
        Self { api, station }
    }
}

#[async_trait]
impl PollSource for TicketSource {
    fn name(&self) -> String {
        format!("tickets:{}", self.station)
    }

    async fn snapshot(&self) -> Result<Vec<Ticket>, ApiError> {
        self.api.list_tickets(self.station).await
    }

    async fn poll(&self, since_id: u64, wait: Duration) -> Result<PollBatch<Ticket>, ApiError> {
        self.api.long_poll_tickets(self.station, since_id, wait).await
    }
}

/// READY tickets waiting for pickup.
pub struct ReadySource {
    api: Arc<dyn KdsApi>,
}

impl ReadySource {
    pub fn new(api: Arc<dyn KdsApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PollSource for ReadySource {
    fn name(&self) -> String {
        "ready".to_string()
    }

    async fn snapshot(&self) -> Result<Vec<Ticket>, ApiError> {
        self.api.ready_list().await
    }

    async fn poll(&self, since_id: u64, wait: Duration) -> Result<PollBatch<Ticket>, ApiError> {
        self.api.long_poll_ready(since_id, wait).await
    }
}

/// How a batch is folded into the local list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Replace by id in place, prepend unknown ids.
    UpsertFront,
    /// Append ids never seen before; everything else is ignored.
    AppendUnseen,
}

#[derive(Debug, Clone)]
pub struct LongPollConfig {
    pub wait: Duration,
    pub client_timeout: Duration,
    pub default_retry_after: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self::from(&LongPollSettings::default())
    }
}

impl From<&LongPollSettings> for LongPollConfig {
    fn from(settings: &LongPollSettings) -> Self {
        Self {
            wait: settings.wait(),
            client_timeout: settings.client_timeout(),
            default_retry_after: settings.default_retry_after(),
            backoff_base: settings.backoff_base(),
            backoff_max: settings.backoff_max(),
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    items: Vec<Ticket>,
    seen: HashSet<u64>,
    cursor: u64,
}

impl StreamState {
    fn seed(&mut self, items: Vec<Ticket>) {
        self.cursor = items.iter().map(|t| t.id).max().unwrap_or(0);
        self.seen = items.iter().map(|t| t.id).collect();
        self.items = items;
    }

    fn merge(&mut self, policy: MergePolicy, batch: PollBatch<Ticket>) {
        if batch.items.is_empty() {
            return;
        }
        for ticket in batch.items {
            match policy {
                MergePolicy::UpsertFront => {
                    self.seen.insert(ticket.id);
                    match self.items.iter_mut().find(|t| t.id == ticket.id) {
                        Some(existing) => *existing = ticket,
                        None => self.items.insert(0, ticket),
                    }
                }
                MergePolicy::AppendUnseen => {
                    if self.seen.insert(ticket.id) {
                        self.items.push(ticket);
                    }
                }
            }
        }
        if let Some(cursor) = batch.cursor {
            self.cursor = self.cursor.max(cursor);
        }
    }
}

/// Long-poll loop for one stream plus the list it maintains.
pub struct LongPollClient {
    source: Arc<dyn PollSource>,
    policy: MergePolicy,
    config: LongPollConfig,
    state: Arc<Mutex<StreamState>>,
    control: Mutex<Option<CancellationToken>>,
}

impl LongPollClient {
    pub fn new(source: Arc<dyn PollSource>, policy: MergePolicy, config: LongPollConfig) -> Self {
        Self {
            source,
            policy,
            config,
            state: Arc::new(Mutex::new(StreamState::default())),
            control: Mutex::new(None),
        }
    }

    pub fn tickets(api: Arc<dyn KdsApi>, station: Station, config: LongPollConfig) -> Self {
        Self::new(
            Arc::new(TicketSource::new(api, station)),
            MergePolicy::UpsertFront,
            config,
        )
    }

    pub fn ready(api: Arc<dyn KdsApi>, config: LongPollConfig) -> Self {
        Self::new(
            Arc::new(ReadySource::new(api)),
            MergePolicy::AppendUnseen,
            config,
        )
    }

    /// Spawn the loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut control = lock(&self.control);
        if control.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let stream = PollLoop {
            source: Arc::clone(&self.source),
            policy: self.policy,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
        };
        tokio::spawn(stream.run());
        *control = Some(cancel);
        true
    }

    /// Cancel the in-flight request and end the loop.
    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.control).take() {
            cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).is_some()
    }

    pub fn items(&self) -> Vec<Ticket> {
        lock(&self.state).items.clone()
    }

    pub fn cursor(&self) -> u64 {
        lock(&self.state).cursor
    }

    /// Mark a ticket acknowledged locally. Returns false if it is not listed.
    pub fn ack_local(&self, id: u64) -> bool {
        let mut state = lock(&self.state);
        match state.items.iter_mut().find(|t| t.id == id) {
            Some(ticket) => {
                ticket.state = "ack".to_string();
                true
            }
            None => false,
        }
    }

    /// Drop a ticket from the list. The id stays seen.
    pub fn remove_local(&self, id: u64) -> bool {
        let mut state = lock(&self.state);
        let before = state.items.len();
        state.items.retain(|t| t.id != id);
        state.seen.insert(id);
        state.items.len() != before
    }
}

impl Drop for LongPollClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PollLoop {
    source: Arc<dyn PollSource>,
    policy: MergePolicy,
    config: LongPollConfig,
    state: Arc<Mutex<StreamState>>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        let stream = self.source.name();
        let Some(snapshot) = self.call(self.source.snapshot()).await else {
            return;
        };
        let seeded = match snapshot {
            Ok(items) => items,
            Err(err) => {
                warn!(%stream, error = %err, "snapshot failed; starting from cursor 0");
                Vec::new()
            }
        };
        lock(&self.state).seed(seeded);
        info!(%stream, cursor = lock(&self.state).cursor, "long poll started");

        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        loop {
            let since_id = lock(&self.state).cursor;
            let Some(result) = self
                .call(self.source.poll(since_id, self.config.wait))
                .await
            else {
                break;
            };

            match result {
                Ok(batch) => {
                    backoff.reset();
                    let retry_after = batch.retry_after;
                    let received = batch.items.len();
                    let cursor = {
                        let mut state = lock(&self.state);
                        state.merge(self.policy, batch);
                        state.cursor
                    };
                    if received == 0 {
                        let pause = retry_after.unwrap_or(self.config.default_retry_after);
                        if !self.pause(pause).await {
                            break;
                        }
                    } else {
                        info!(%stream, received, cursor, "merged events");
                    }
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let delay = backoff.next();
                    warn!(%stream, error = %err, retry_in = ?delay, "long poll failed");
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }
        info!(%stream, "long poll stopped");
    }

    /// Await `request` under the client timeout. None once cancelled.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ApiError>>,
    ) -> Option<Result<T, ApiError>> {
        let timeout = self.config.client_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, request) => {
                Some(result.unwrap_or(Err(ApiError::Timeout(timeout))))
            }
        }
    }

    /// Sleep unless cancelled first. Returns false when cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
