//! BillTask - 送信キューに積む変更操作
//!
//! 種類ごとに型付きペイロードを持つ閉じた enum です。
//! 永続化形式は `{ "kind": "...", "payload": { ... } }`。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::bill::{CastSelection, NewBill, NewBillItem};
use super::ids::{BillId, DraftToken};

/// Partial bill update.
///
/// `bill_id` is a bill reference carried inside the patch body (e.g. a
/// merge target) and is remapped like every other bill reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bill_id: Option<BillId>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl BillPatch {
    pub fn fields(fields: Map<String, Value>) -> Self {
        Self {
            bill_id: None,
            fields,
        }
    }

    /// Request body, or the pending bill it still points at.
    pub fn to_wire(&self) -> Result<Map<String, Value>, BillId> {
        let mut body = self.fields.clone();
        if let Some(bill_id) = self.bill_id {
            let real = bill_id.real().ok_or(bill_id)?;
            body.insert("bill_id".to_string(), Value::from(real));
        }
        Ok(body)
    }
}

/// One queued mutation against the billing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum BillTask {
    CreateBill {
        #[serde(rename = "tempId")]
        temp_id: DraftToken,
        bill: NewBill,
    },
    PatchBill {
        id: BillId,
        payload: BillPatch,
    },
    UpdateBillCustomers {
        id: BillId,
        customer_ids: Vec<u64>,
    },
    UpdateBillCasts {
        #[serde(rename = "billId")]
        bill_id: BillId,
        casts: CastSelection,
    },
    AddBillItem {
        id: BillId,
        item: NewBillItem,
    },
    UpdateBillTable {
        id: BillId,
        table_id: Option<u64>,
    },
    DeleteBill {
        id: BillId,
    },
    CloseBill {
        id: BillId,
        #[serde(default)]
        settled_total: Option<i64>,
    },
    Reconcile {
        id: BillId,
    },
}

impl BillTask {
    pub fn kind(&self) -> &'static str {
        match self {
            BillTask::CreateBill { .. } => "createBill",
            BillTask::PatchBill { .. } => "patchBill",
            BillTask::UpdateBillCustomers { .. } => "updateBillCustomers",
            BillTask::UpdateBillCasts { .. } => "updateBillCasts",
            BillTask::AddBillItem { .. } => "addBillItem",
            BillTask::UpdateBillTable { .. } => "updateBillTable",
            BillTask::DeleteBill { .. } => "deleteBill",
            BillTask::CloseBill { .. } => "closeBill",
            BillTask::Reconcile { .. } => "reconcile",
        }
    }

    /// The bill this task acts on.
    pub fn target(&self) -> BillId {
        match self {
            BillTask::CreateBill { temp_id, .. } => BillId::Pending(*temp_id),
            BillTask::UpdateBillCasts { bill_id, .. } => *bill_id,
            BillTask::PatchBill { id, .. }
            | BillTask::UpdateBillCustomers { id, .. }
            | BillTask::AddBillItem { id, .. }
            | BillTask::UpdateBillTable { id, .. }
            | BillTask::DeleteBill { id }
            | BillTask::CloseBill { id, .. }
            | BillTask::Reconcile { id } => *id,
        }
    }

    /// Every bill reference in the payload (`id`, `billId`, `payload.bill_id`).
    fn bill_refs_mut(&mut self) -> Vec<&mut BillId> {
        match self {
            BillTask::CreateBill { .. } => Vec::new(),
            BillTask::PatchBill { id, payload } => {
                let mut refs = vec![id];
                if let Some(nested) = payload.bill_id.as_mut() {
                    refs.push(nested);
                }
                refs
            }
            BillTask::UpdateBillCasts { bill_id, .. } => vec![bill_id],
            BillTask::UpdateBillCustomers { id, .. }
            | BillTask::AddBillItem { id, .. }
            | BillTask::UpdateBillTable { id, .. }
            | BillTask::DeleteBill { id }
            | BillTask::CloseBill { id, .. }
            | BillTask::Reconcile { id } => vec![id],
        }
    }

    /// Rewrite references to `token` as `real`. Returns how many fields changed.
    pub fn remap(&mut self, token: DraftToken, real: u64) -> usize {
        self.bill_refs_mut()
            .into_iter()
            .map(|bill_id| bill_id.resolve(token, real))
            .filter(|changed| *changed)
            .count()
    }

    /// Rewrite every pending reference that `lookup` knows a server id for.
    pub fn resolve_with(&mut self, lookup: impl Fn(DraftToken) -> Option<u64>) -> usize {
        let mut changed = 0;
        for bill_id in self.bill_refs_mut() {
            if let BillId::Pending(token) = *bill_id
                && let Some(real) = lookup(token)
            {
                *bill_id = BillId::Real(real);
                changed += 1;
            }
        }
        changed
    }

    pub fn references(&self, bill: BillId) -> bool {
        match self {
            BillTask::CreateBill { .. } => false,
            BillTask::PatchBill { id, payload } => *id == bill || payload.bill_id == Some(bill),
            _ => self.target() == bill,
        }
    }

    pub fn is_reconcile_of(&self, bill: BillId) -> bool {
        matches!(self, BillTask::Reconcile { id } if *id == bill)
    }
}
