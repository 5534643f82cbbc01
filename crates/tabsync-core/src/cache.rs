//! BillCache - 楽観的に更新される伝票一覧
//!
//! 編集は即座にここへ反映され、サーバ確定（remap / reconcile）で上書きされます。
//! どの更新経路でも「同じ id の伝票は最大 1 件」を保ちます。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::{Bill, BillId, DraftToken};

/// Cache handle shared by the editor, the queue engine and background refresh.
pub type SharedBillCache = Arc<Mutex<BillCache>>;

/// Ordered list of bills, newest first.
#[derive(Debug, Clone, Default)]
pub struct BillCache {
    bills: Vec<Bill>,
}

impl BillCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedBillCache {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn list(&self) -> &[Bill] {
        &self.bills
    }

    pub fn get(&self, id: BillId) -> Option<&Bill> {
        self.bills.iter().find(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.bills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bills.is_empty()
    }

    /// Mutate the entry for `id` in place. Returns false when it is absent.
    pub fn update(&mut self, id: BillId, f: impl FnOnce(&mut Bill)) -> bool {
        match self.bills.iter_mut().find(|b| b.id == id) {
            Some(bill) => {
                f(bill);
                true
            }
            None => false,
        }
    }

    /// Replace the entry with the same id, or prepend.
    pub fn upsert(&mut self, bill: Bill) {
        let id = bill.id;
        match self.bills.iter().position(|b| b.id == id) {
            Some(index) => {
                self.bills[index] = bill;
                self.drop_duplicates_after(index);
            }
            None => self.bills.insert(0, bill),
        }
    }

    pub fn remove(&mut self, id: BillId) -> Option<Bill> {
        let index = self.bills.iter().position(|b| b.id == id)?;
        let removed = self.bills.remove(index);
        self.bills.retain(|b| b.id != id);
        Some(removed)
    }

    /// Merge an authoritative list.
    ///
    /// Existing entries are updated field by field, new ones are prepended,
    /// and entries missing from `fresh` are pruned unless they are still
    /// pending creation.
    pub fn patch_in_place(&mut self, fresh: Vec<Bill>) {
        let fresh_ids: HashSet<BillId> = fresh.iter().map(|b| b.id).collect();
        self.bills
            .retain(|b| b.id.is_pending() || fresh_ids.contains(&b.id));

        let mut added = Vec::new();
        for bill in fresh {
            match self.bills.iter_mut().find(|b| b.id == bill.id) {
                Some(existing) => existing.merge_from(bill),
                None if added.iter().any(|b: &Bill| b.id == bill.id) => {}
                None => added.push(bill),
            }
        }
        added.append(&mut self.bills);
        self.bills = added;
        self.dedupe();
    }

    /// Give the draft behind `token` its server id.
    ///
    /// If an entry with the real id is already cached (a refresh won the
    /// race), the draft takes its place and the other copy is dropped.
    /// Returns true when the draft was found.
    pub fn remap(&mut self, token: DraftToken, real: u64) -> bool {
        let pending = BillId::Pending(token);
        let Some(index) = self.bills.iter().position(|b| b.id == pending) else {
            return false;
        };
        self.bills[index].id = BillId::Real(real);
        let real = BillId::Real(real);
        let mut position = 0;
        self.bills.retain(|b| {
            let keep = position == index || b.id != real;
            position += 1;
            keep
        });
        true
    }

    fn drop_duplicates_after(&mut self, index: usize) {
        let id = self.bills[index].id;
        let mut position = 0;
        self.bills.retain(|b| {
            let keep = position <= index || b.id != id;
            position += 1;
            keep
        });
    }

    fn dedupe(&mut self) {
        let mut seen = HashSet::new();
        self.bills.retain(|b| seen.insert(b.id));
    }
}
