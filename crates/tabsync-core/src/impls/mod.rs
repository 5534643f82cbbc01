//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **HttpApi**: reqwest による BillApi / KdsApi
//! - **JsonFileTaskStore**: 送信キューのファイル永続化
//! - **InMemoryTaskStore**: テスト・開発用の TaskStore

pub mod file_store;
pub mod http;
pub mod memory_store;

pub use self::file_store::JsonFileTaskStore;
pub use self::http::HttpApi;
pub use self::memory_store::InMemoryTaskStore;
