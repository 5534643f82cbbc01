//! Bill - 伝票（卓・顧客・キャスト配席・明細）
//!
//! サーバの伝票シリアライザが返す形をそのまま受けます。
//! 型で持っていないフィールドは `extra` に残し、書き戻し時も失いません。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{BillId, DraftToken};

/// Category a cast member is seated under on a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StayType {
    /// 本指名
    Nom,
    /// 場内指名
    In,
    /// フリー
    Free,
    /// 同伴
    Dohan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastRef {
    pub id: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CastRef {
    pub fn from_id(id: u64) -> Self {
        Self {
            id,
            extra: Map::new(),
        }
    }
}

/// One cast member's assignment to a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stay {
    pub cast: CastRef,
    pub stay_type: StayType,
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Stay {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub id: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Customers arrive either as bare ids or as nested objects depending on the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomerRef {
    Id(u64),
    Full {
        id: u64,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl CustomerRef {
    pub fn id(&self) -> u64 {
        match self {
            CustomerRef::Id(id) => *id,
            CustomerRef::Full { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillItem {
    /// None until the server has stored the line.
    #[serde(default)]
    pub id: Option<u64>,
    pub item_master: u64,
    pub qty: u32,
    #[serde(default)]
    pub served_by_cast_id: Option<u64>,
    #[serde(default)]
    pub customer_id: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Line item to add to a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBillItem {
    pub item_master: u64,
    pub qty: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by_cast_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<u64>,
}

impl From<&NewBillItem> for BillItem {
    fn from(item: &NewBillItem) -> Self {
        Self {
            id: None,
            item_master: item.item_master,
            qty: item.qty,
            served_by_cast_id: item.served_by_cast_id,
            customer_id: item.customer_id,
            extra: Map::new(),
        }
    }
}

/// One open tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    #[serde(default)]
    pub table: Option<TableRef>,
    #[serde(default)]
    pub customers: Vec<CustomerRef>,
    #[serde(default)]
    pub stays: Vec<Stay>,
    #[serde(default)]
    pub items: Vec<BillItem>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expected_out: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub memo: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Bill {
    /// Optimistic copy of a bill that exists only locally.
    pub fn draft(token: DraftToken, request: &NewBill) -> Self {
        Self {
            id: BillId::Pending(token),
            table: request.table_id.map(|id| TableRef {
                id,
                extra: Map::new(),
            }),
            customers: Vec::new(),
            stays: Vec::new(),
            items: Vec::new(),
            opened_at: request.opened_at,
            expected_out: request.expected_out,
            closed_at: None,
            memo: request.memo.clone(),
            extra: Map::new(),
        }
    }

    pub fn table_id(&self) -> Option<u64> {
        self.table.as_ref().map(|t| t.id)
    }

    pub fn set_table(&mut self, table_id: Option<u64>) {
        if self.table_id() == table_id {
            return;
        }
        self.table = table_id.map(|id| TableRef {
            id,
            extra: Map::new(),
        });
    }

    pub fn customer_ids(&self) -> Vec<u64> {
        self.customers.iter().map(CustomerRef::id).collect()
    }

    /// Field-by-field overwrite that keeps keys `other` does not carry.
    pub fn merge_from(&mut self, other: Bill) {
        let Bill {
            id,
            table,
            customers,
            stays,
            items,
            opened_at,
            expected_out,
            closed_at,
            memo,
            extra,
        } = other;
        self.id = id;
        self.table = table;
        self.customers = customers;
        self.stays = stays;
        self.items = items;
        self.opened_at = opened_at;
        self.expected_out = expected_out;
        self.closed_at = closed_at;
        self.memo = memo;
        self.extra.extend(extra);
    }

    /// Apply a partial update the way the server would (keys replace keys).
    pub fn apply_fields(&mut self, fields: &Map<String, Value>) -> Result<(), serde_json::Error> {
        let mut value = serde_json::to_value(&*self)?;
        if let Value::Object(object) = &mut value {
            for (key, field) in fields {
                if key == "id" {
                    continue;
                }
                object.insert(key.clone(), field.clone());
            }
        }
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    /// Current seating derived from active stays.
    pub fn cast_selection(&self) -> CastSelection {
        let mut selection = CastSelection::default();
        for stay in self.stays.iter().filter(|s| s.is_active()) {
            let id = stay.cast.id;
            match stay.stay_type {
                StayType::Nom => push_unique(&mut selection.nom_ids, id),
                StayType::In => {
                    push_unique(&mut selection.in_ids, id);
                    push_unique(&mut selection.free_ids, id);
                }
                StayType::Free => push_unique(&mut selection.free_ids, id),
                StayType::Dohan => push_unique(&mut selection.dohan_ids, id),
            }
        }
        selection
    }

    /// Rebuild the active stays from `selection`.
    ///
    /// A cast already seated under the same category keeps its stay record.
    /// Companion wins over nomination, nomination over in-house, in-house over free.
    pub fn apply_casts(&mut self, selection: &CastSelection, now: DateTime<Utc>) {
        let mut next: Vec<Stay> = self
            .stays
            .iter()
            .filter(|s| !s.is_active())
            .cloned()
            .collect();

        for (cast_id, stay_type) in selection.seating() {
            let kept = self
                .stays
                .iter()
                .find(|s| s.is_active() && s.cast.id == cast_id && s.stay_type == stay_type)
                .cloned();
            next.push(kept.unwrap_or_else(|| Stay {
                cast: CastRef::from_id(cast_id),
                stay_type,
                entered_at: Some(now),
                left_at: None,
                extra: Map::new(),
            }));
        }
        self.stays = next;
    }
}

/// Fields for creating a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBill {
    #[serde(default)]
    pub table_id: Option<u64>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expected_out: Option<DateTime<Utc>>,
    #[serde(default)]
    pub memo: String,
}

/// Cast ids per seating category, as the editor manipulates them.
///
/// `in_ids` is kept a subset of `free_ids`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSelection {
    #[serde(rename = "nomIds", default)]
    pub nom_ids: Vec<u64>,
    #[serde(rename = "inIds", default)]
    pub in_ids: Vec<u64>,
    #[serde(rename = "freeIds", default)]
    pub free_ids: Vec<u64>,
    #[serde(rename = "dohanIds", default)]
    pub dohan_ids: Vec<u64>,
}

impl CastSelection {
    pub fn set_main(&mut self, id: u64) {
        push_unique(&mut self.nom_ids, id);
        push_unique(&mut self.free_ids, id);
    }

    pub fn set_free(&mut self, id: u64) {
        push_unique(&mut self.free_ids, id);
        self.in_ids.retain(|x| *x != id);
    }

    pub fn set_inhouse(&mut self, id: u64) {
        push_unique(&mut self.free_ids, id);
        push_unique(&mut self.in_ids, id);
    }

    pub fn set_dohan(&mut self, id: u64) {
        self.nom_ids.retain(|x| *x != id);
        self.in_ids.retain(|x| *x != id);
        push_unique(&mut self.dohan_ids, id);
    }

    pub fn remove(&mut self, id: u64) {
        self.nom_ids.retain(|x| *x != id);
        self.free_ids.retain(|x| *x != id);
        self.in_ids.retain(|x| *x != id);
        self.dohan_ids.retain(|x| *x != id);
    }

    /// One category per cast, in display order: companion, nomination, then free/in-house.
    pub fn seating(&self) -> Vec<(u64, StayType)> {
        let mut seats: Vec<(u64, StayType)> = Vec::new();
        for id in &self.dohan_ids {
            seat(&mut seats, *id, StayType::Dohan);
        }
        for id in &self.nom_ids {
            seat(&mut seats, *id, StayType::Nom);
        }
        for id in &self.free_ids {
            let stay_type = if self.in_ids.contains(id) {
                StayType::In
            } else {
                StayType::Free
            };
            seat(&mut seats, *id, stay_type);
        }
        for id in &self.in_ids {
            seat(&mut seats, *id, StayType::In);
        }
        seats
    }
}

fn seat(seats: &mut Vec<(u64, StayType)>, id: u64, stay_type: StayType) {
    if !seats.iter().any(|(seated, _)| *seated == id) {
        seats.push((id, stay_type));
    }
}

fn push_unique(ids: &mut Vec<u64>, id: u64) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn bill_with_stays() -> Bill {
        serde_json::from_value(json!({
            "id": 7,
            "table": { "id": 5, "code": "A1" },
            "customers": [3, { "id": 4, "alias": "Ken" }],
            "stays": [
                { "cast": { "id": 1, "stage_name": "Mio" }, "stay_type": "nom" },
                { "cast": { "id": 2 }, "stay_type": "in" },
                { "cast": { "id": 9 }, "stay_type": "free", "left_at": "2024-01-01T03:00:00+09:00" }
            ],
            "grand_total": 12000
        }))
        .unwrap()
    }

    #[test]
    fn server_bill_keeps_unknown_fields() {
        let bill = bill_with_stays();

        assert_eq!(bill.id, BillId::Real(7));
        assert_eq!(bill.table_id(), Some(5));
        assert_eq!(bill.customer_ids(), vec![3, 4]);
        assert_eq!(bill.extra["grand_total"], json!(12000));
    }

    #[test]
    fn cast_selection_ignores_departed_stays() {
        let selection = bill_with_stays().cast_selection();

        assert_eq!(selection.nom_ids, vec![1]);
        assert_eq!(selection.in_ids, vec![2]);
        assert_eq!(selection.free_ids, vec![2]);
        assert!(selection.dohan_ids.is_empty());
    }

    #[test]
    fn inhouse_stays_a_subset_of_free() {
        let mut selection = CastSelection::default();
        selection.set_inhouse(4);
        assert_eq!(selection.free_ids, vec![4]);

        selection.set_free(4);
        assert_eq!(selection.free_ids, vec![4]);
        assert!(selection.in_ids.is_empty());
    }

    #[test]
    fn dohan_takes_the_cast_out_of_nomination() {
        let mut selection = CastSelection::default();
        selection.set_main(3);
        selection.set_dohan(3);

        assert!(selection.nom_ids.is_empty());
        assert_eq!(selection.dohan_ids, vec![3]);
        assert_eq!(selection.seating(), vec![(3, StayType::Dohan)]);
    }

    #[test]
    fn apply_casts_keeps_existing_stays_and_departed_history() {
        let mut bill = bill_with_stays();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let mut selection = bill.cast_selection();
        selection.remove(2);
        selection.set_free(8);
        bill.apply_casts(&selection, now);

        let active: Vec<(u64, StayType)> = bill
            .stays
            .iter()
            .filter(|s| s.is_active())
            .map(|s| (s.cast.id, s.stay_type))
            .collect();
        assert_eq!(active, vec![(1, StayType::Nom), (8, StayType::Free)]);

        let mio = bill.stays.iter().find(|s| s.cast.id == 1).unwrap();
        assert_eq!(mio.cast.extra["stage_name"], json!("Mio"));
        assert!(bill.stays.iter().any(|s| s.cast.id == 9 && !s.is_active()));
    }

    #[test]
    fn merge_from_overwrites_fields_but_keeps_extra_keys() {
        let mut bill = bill_with_stays();
        bill.extra.insert("local_note".into(), json!("x"));

        let mut fresh = bill_with_stays();
        fresh.memo = "VIP".into();
        fresh.extra = Map::new();
        fresh.extra.insert("grand_total".into(), json!(15000));
        bill.merge_from(fresh);

        assert_eq!(bill.memo, "VIP");
        assert_eq!(bill.extra["grand_total"], json!(15000));
        assert_eq!(bill.extra["local_note"], json!("x"));
    }

    #[test]
    fn apply_fields_updates_typed_and_extra_fields() {
        let mut bill = bill_with_stays();
        let fields = json!({ "memo": "birthday", "set_rounds": 2, "id": 99 });

        bill.apply_fields(fields.as_object().unwrap()).unwrap();

        assert_eq!(bill.memo, "birthday");
        assert_eq!(bill.extra["set_rounds"], json!(2));
        assert_eq!(bill.id, BillId::Real(7));
    }
}
