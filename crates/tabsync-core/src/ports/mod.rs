//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。
//! REST バックエンド、永続化、時刻、ネットワーク状態を trait で隠蔽し、
//! テストでは差し替えます。
//!
//! # 設計原則
//! - サーバが正本（source of truth）
//! - ローカルのキューは「まだ届いていない意図」だけを保持する

pub mod bill_api;
pub mod clock;
pub mod connectivity;
pub mod id_generator;
pub mod kds_api;
pub mod task_store;

pub use self::bill_api::BillApi;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::connectivity::{AlwaysOnline, Connectivity, OnlineFlag};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kds_api::KdsApi;
pub use self::task_store::TaskStore;
