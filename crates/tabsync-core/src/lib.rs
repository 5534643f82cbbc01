//! tabsync-core
//!
//! Offline-tolerant bill editing for the POS client.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, bill, task, ticket）
//! - **ports**: 抽象化レイヤー（BillApi, KdsApi, TaskStore, Clock, IdGenerator, Connectivity）
//! - **queue**: 送信キュー（QueuedTask, RetryPolicy, TaskRunner, TxQueue）
//! - **cache**: 楽観的に更新される伝票一覧
//! - **app**: アプリケーションロジック（builder, bill_editor, long_poll）
//! - **impls**: 実装（HttpApi, JsonFileTaskStore, InMemoryTaskStore）
//! - **config** / **error** / **observability**: 設定・エラー型・ログ

pub mod app;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

#[cfg(test)]
mod testing;
