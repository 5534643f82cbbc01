//! AppBuilder - 送信キューと周辺コンポーネントのワイヤリング
//!
//! # Fail-fast 設計
//! - 必須コンポーネント（task_store, bill_api）が揃っていなければ build() が失敗する
//! - 時刻・ID 生成・ネットワーク判定は省略時に既定実装を使う

use std::sync::Arc;

use crate::cache::{BillCache, SharedBillCache};
use crate::config::Settings;
use crate::domain::Station;
use crate::error::ApiError;
use crate::impls::{HttpApi, JsonFileTaskStore};
use crate::ports::{
    AlwaysOnline, BillApi, Clock, Connectivity, IdGenerator, KdsApi, OnlineFlag, SystemClock,
    TaskStore, UlidGenerator,
};
use crate::queue::{EngineConfig, TaskRunner, TxQueue};

use super::bill_editor::BillEditor;
use super::long_poll::{LongPollClient, LongPollConfig};

/// AppBuilder は App を構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .task_store(Arc::new(JsonFileTaskStore::in_dir(".tabsync")))
///     .bill_api(api.clone())
///     .kds_api(api)
///     .build()?;
/// ```
pub struct AppBuilder {
    task_store: Option<Arc<dyn TaskStore>>,
    bill_api: Option<Arc<dyn BillApi>>,
    kds_api: Option<Arc<dyn KdsApi>>,
    cache: Option<SharedBillCache>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    connectivity: Arc<dyn Connectivity>,
    engine: EngineConfig,
    long_poll: LongPollConfig,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing components: {0:?}. These must be set before build().")]
    MissingComponents(Vec<&'static str>),

    #[error("HTTP client: {0}")]
    Http(#[from] ApiError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            task_store: None,
            bill_api: None,
            kds_api: None,
            cache: None,
            clock: Arc::new(SystemClock),
            ids: None,
            connectivity: Arc::new(AlwaysOnline),
            engine: EngineConfig::default(),
            long_poll: LongPollConfig::default(),
        }
    }

    /// HTTP API, file store and timings taken from `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self, BuildError> {
        let online = OnlineFlag::new();
        let api = Arc::new(HttpApi::new(&settings.api, online.clone())?);
        let engine = EngineConfig {
            idle_poll: settings.queue.idle_poll(),
            offline_pause: settings.queue.offline_pause(),
            retry: settings.queue.retry_policy(),
            autostart: true,
        };
        Ok(Self::new()
            .task_store(Arc::new(JsonFileTaskStore::in_dir(&settings.queue.data_dir)))
            .bill_api(api.clone())
            .kds_api(api)
            .connectivity(Arc::new(online))
            .engine(engine)
            .long_poll(LongPollConfig::from(&settings.long_poll)))
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn bill_api(mut self, api: Arc<dyn BillApi>) -> Self {
        self.bill_api = Some(api);
        self
    }

    pub fn kds_api(mut self, api: Arc<dyn KdsApi>) -> Self {
        self.kds_api = Some(api);
        self
    }

    pub fn cache(mut self, cache: SharedBillCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn long_poll(mut self, long_poll: LongPollConfig) -> Self {
        self.long_poll = long_poll;
        self
    }

    /// # 検証
    /// - task_store と bill_api が設定されているかチェック
    /// - 不足があれば BuildError::MissingComponents を返す
    pub fn build(self) -> Result<App, BuildError> {
        let mut missing = Vec::new();
        if self.task_store.is_none() {
            missing.push("task_store");
        }
        if self.bill_api.is_none() {
            missing.push("bill_api");
        }
        let (Some(store), Some(api)) = (self.task_store, self.bill_api) else {
            return Err(BuildError::MissingComponents(missing));
        };

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)));
        let cache = self.cache.unwrap_or_else(BillCache::shared);
        let queue = Arc::new(TxQueue::new(
            store,
            TaskRunner::new(api.clone()),
            cache,
            self.clock.clone(),
            ids.clone(),
            self.connectivity,
            self.engine,
        ));
        let editor = BillEditor::new(queue.clone(), api, ids, self.clock);

        Ok(App {
            queue,
            editor,
            kds_api: self.kds_api,
            long_poll: self.long_poll,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 構築済みのアプリケーション
pub struct App {
    pub queue: Arc<TxQueue>,
    pub editor: BillEditor,
    kds_api: Option<Arc<dyn KdsApi>>,
    long_poll: LongPollConfig,
}

impl App {
    pub fn cache(&self) -> &SharedBillCache {
        self.queue.cache()
    }

    /// Ticket stream for `station`; None when no KDS API was configured.
    pub fn ticket_stream(&self, station: Station) -> Option<LongPollClient> {
        let api = self.kds_api.clone()?;
        Some(LongPollClient::tickets(api, station, self.long_poll.clone()))
    }

    pub fn ready_stream(&self) -> Option<LongPollClient> {
        let api = self.kds_api.clone()?;
        Some(LongPollClient::ready(api, self.long_poll.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::testing::{FakeBillApi, FakeKdsApi};

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new()
            .task_store(Arc::new(InMemoryTaskStore::new()))
            .bill_api(Arc::new(FakeBillApi::new()))
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_components() {
        let app = AppBuilder::new().build();
        assert!(matches!(
            app,
            Err(BuildError::MissingComponents(missing)) if missing == vec!["task_store", "bill_api"]
        ));

        let app = AppBuilder::new()
            .bill_api(Arc::new(FakeBillApi::new()))
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingComponents(missing)) if missing == vec!["task_store"]
        ));
    }

    #[tokio::test]
    async fn test_streams_need_a_kds_api() {
        let without = AppBuilder::new()
            .task_store(Arc::new(InMemoryTaskStore::new()))
            .bill_api(Arc::new(FakeBillApi::new()))
            .build()
            .unwrap();
        assert!(without.ticket_stream(Station::Kitchen).is_none());

        let with = AppBuilder::new()
            .task_store(Arc::new(InMemoryTaskStore::new()))
            .bill_api(Arc::new(FakeBillApi::new()))
            .kds_api(Arc::new(FakeKdsApi::new(vec![])))
            .build()
            .unwrap();
        assert!(with.ready_stream().is_some());
    }

    #[test]
    fn test_from_settings_uses_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.queue.data_dir = dir.path().to_path_buf();

        let app = AppBuilder::from_settings(&settings).unwrap().build();

        assert!(app.is_ok());
    }
}
