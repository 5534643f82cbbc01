//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! ローカルで採番する ID（キュー内タスク、未作成伝票のドラフトトークン）は
//! ULID を使います。時刻 + 乱数なので端末間で調整なしに一意になります。
//!
//! サーバが採番する伝票 ID は正の整数です。未作成の伝票は
//! [`BillId::Pending`] としてドラフトトークンを持ち、作成成功後に
//! [`BillId::Real`] へ差し替えられます（符号ビットでの判定はしない）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "draft-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData なので実行時のサイズは ULID と同じです。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Queued task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Not-yet-created bill marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Draft {}

impl IdMarker for Draft {
    fn prefix() -> &'static str {
        "draft-"
    }
}

/// Identifier of one queued mutation task.
pub type TaskId = Id<Task>;

/// Local stand-in for a bill the server has not created yet.
pub type DraftToken = Id<Draft>;

/// Identifier of a bill, either issued by the server or still pending creation.
///
/// Serialized untagged: a real id is a plain JSON number (what the server
/// sends), a pending id is its draft token string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BillId {
    Real(u64),
    Pending(DraftToken),
}

impl BillId {
    pub fn is_pending(&self) -> bool {
        matches!(self, BillId::Pending(_))
    }

    pub fn real(&self) -> Option<u64> {
        match self {
            BillId::Real(id) => Some(*id),
            BillId::Pending(_) => None,
        }
    }

    /// Rewrite `self` to `Real(real)` if it is `Pending(token)`.
    ///
    /// Returns true when a rewrite happened.
    pub fn resolve(&mut self, token: DraftToken, real: u64) -> bool {
        if *self == BillId::Pending(token) {
            *self = BillId::Real(real);
            true
        } else {
            false
        }
    }
}

impl From<u64> for BillId {
    fn from(id: u64) -> Self {
        BillId::Real(id)
    }
}

impl From<DraftToken> for BillId {
    fn from(token: DraftToken) -> Self {
        BillId::Pending(token)
    }
}

impl fmt::Display for BillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillId::Real(id) => write!(f, "{id}"),
            BillId::Pending(token) => token.fmt(f),
        }
    }
}
