//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 送信キュー・エディタ・KDS ストリームの構築とワイヤリング
//! - **BillEditor**: 伝票の楽観的編集（キャッシュ更新 + タスク投入）
//! - **LongPollClient**: KDS のロングポーリング

pub mod bill_editor;
pub mod builder;
pub mod long_poll;

// 主要な型を再エクスポート
pub use self::bill_editor::BillEditor;
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::long_poll::{LongPollClient, LongPollConfig, MergePolicy, PollSource};
