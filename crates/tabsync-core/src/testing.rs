//! In-crate fakes for the API ports (test builds only).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::domain::{
    Bill, CastSelection, CustomerRef, NewBill, NewBillItem, PollBatch, Station, TableRef,
    Ticket,
};
use crate::error::ApiError;
use crate::ports::{BillApi, KdsApi};

pub fn bill(id: u64) -> Bill {
    serde_json::from_value(json!({ "id": id })).expect("minimal bill")
}

pub fn ticket(id: u64, state: &str) -> Ticket {
    Ticket {
        id,
        state: state.to_string(),
        extra: Map::new(),
    }
}

pub fn unavailable() -> ApiError {
    ApiError::Status {
        status: 503,
        body: "unavailable".into(),
    }
}

/// Billing backend kept in memory, with per-operation failure injection.
pub struct FakeBillApi {
    bills: Mutex<BTreeMap<u64, Bill>>,
    next_id: AtomicU64,
    failures: Mutex<HashMap<&'static str, u32>>,
    calls: Mutex<Vec<String>>,
}

impl FakeBillApi {
    pub fn new() -> Self {
        Self::with_next_id(1)
    }

    pub fn with_next_id(next_id: u64) -> Self {
        Self {
            bills: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(next_id),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, id: u64) -> Bill {
        let bill = bill(id);
        self.bills.lock().unwrap().insert(id, bill.clone());
        bill
    }

    pub fn bill(&self, id: u64) -> Option<Bill> {
        self.bills.lock().unwrap().get(&id).cloned()
    }

    /// Make the next `times` calls of `op` fail with a 503.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(op, times);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn enter(&self, op: &'static str, id: Option<u64>) -> Result<(), ApiError> {
        let call = match id {
            Some(id) => format!("{op}:{id}"),
            None => op.to_string(),
        };
        self.calls.lock().unwrap().push(call);

        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(op)
            && *left > 0
        {
            *left -= 1;
            return Err(unavailable());
        }
        Ok(())
    }

    fn with_bill<T>(&self, id: u64, f: impl FnOnce(&mut Bill) -> T) -> Result<T, ApiError> {
        let mut bills = self.bills.lock().unwrap();
        let bill = bills.get_mut(&id).ok_or_else(|| ApiError::Status {
            status: 404,
            body: "not found".into(),
        })?;
        Ok(f(bill))
    }
}

#[async_trait]
impl BillApi for FakeBillApi {
    async fn create_bill(&self, new_bill: &NewBill) -> Result<u64, ApiError> {
        self.enter("create_bill", None)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut created = bill(id);
        created.set_table(new_bill.table_id);
        created.memo = new_bill.memo.clone();
        created.opened_at = new_bill.opened_at;
        created.expected_out = new_bill.expected_out;
        self.bills.lock().unwrap().insert(id, created);
        Ok(id)
    }

    async fn patch_bill(&self, id: u64, fields: &Map<String, Value>) -> Result<(), ApiError> {
        self.enter("patch_bill", Some(id))?;
        self.with_bill(id, |bill| bill.apply_fields(fields))?
            .map_err(ApiError::Decode)
    }

    async fn update_customers(&self, id: u64, customer_ids: &[u64]) -> Result<(), ApiError> {
        self.enter("update_customers", Some(id))?;
        self.with_bill(id, |bill| {
            bill.customers = customer_ids.iter().copied().map(CustomerRef::Id).collect();
        })
    }

    async fn update_casts(&self, id: u64, casts: &CastSelection) -> Result<Bill, ApiError> {
        self.enter("update_casts", Some(id))?;
        self.with_bill(id, |bill| {
            bill.apply_casts(casts, Utc::now());
            bill.clone()
        })
    }

    async fn add_item(&self, id: u64, item: &NewBillItem) -> Result<(), ApiError> {
        self.enter("add_item", Some(id))?;
        self.with_bill(id, |bill| {
            let mut line = crate::domain::BillItem::from(item);
            line.id = Some(bill.items.len() as u64 + 1);
            bill.items.push(line);
        })
    }

    async fn update_table(&self, id: u64, table_id: Option<u64>) -> Result<(), ApiError> {
        self.enter("update_table", Some(id))?;
        self.with_bill(id, |bill| {
            bill.table = table_id.map(|id| TableRef {
                id,
                extra: Map::new(),
            });
        })
    }

    async fn delete_bill(&self, id: u64) -> Result<(), ApiError> {
        self.enter("delete_bill", Some(id))?;
        self.bills.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn close_bill(&self, id: u64, settled_total: Option<i64>) -> Result<(), ApiError> {
        self.enter("close_bill", Some(id))?;
        self.with_bill(id, |bill| {
            bill.closed_at = Some(Utc::now());
            if let Some(total) = settled_total {
                bill.extra.insert("settled_total".into(), json!(total));
            }
        })
    }

    async fn fetch_bill(&self, id: u64) -> Result<Bill, ApiError> {
        self.enter("fetch_bill", Some(id))?;
        self.with_bill(id, |bill| bill.clone())
    }

    async fn fetch_bills(&self) -> Result<Vec<Bill>, ApiError> {
        self.enter("fetch_bills", None)?;
        Ok(self.bills.lock().unwrap().values().cloned().collect())
    }
}

/// One long-poll request as the fake saw it.
#[derive(Debug, Clone, Copy)]
pub struct PollRequest {
    pub at: tokio::time::Instant,
    pub since_id: u64,
    pub wait: Duration,
}

/// KDS backend that replays a script of poll results.
///
/// Once the script runs out, polls hang until cancelled.
pub struct FakeKdsApi {
    snapshot: Mutex<Vec<Ticket>>,
    snapshot_fails: AtomicBool,
    script: Mutex<VecDeque<Result<PollBatch<Ticket>, ApiError>>>,
    requests: Mutex<Vec<PollRequest>>,
}

impl FakeKdsApi {
    pub fn new(snapshot: Vec<Ticket>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            snapshot_fails: AtomicBool::new(false),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_snapshot(&self) {
        self.snapshot_fails.store(true, Ordering::SeqCst);
    }

    pub fn push(&self, result: Result<PollBatch<Ticket>, ApiError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn requests(&self) -> Vec<PollRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn take_snapshot(&self) -> Result<Vec<Ticket>, ApiError> {
        if self.snapshot_fails.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn next(&self, since_id: u64, wait: Duration) -> Result<PollBatch<Ticket>, ApiError> {
        self.requests.lock().unwrap().push(PollRequest {
            at: tokio::time::Instant::now(),
            since_id,
            wait,
        });
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl KdsApi for FakeKdsApi {
    async fn list_tickets(&self, _station: Station) -> Result<Vec<Ticket>, ApiError> {
        self.take_snapshot()
    }

    async fn long_poll_tickets(
        &self,
        _station: Station,
        since_id: u64,
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError> {
        self.next(since_id, wait).await
    }

    async fn ready_list(&self) -> Result<Vec<Ticket>, ApiError> {
        self.take_snapshot()
    }

    async fn long_poll_ready(
        &self,
        since_id: u64,
        wait: Duration,
    ) -> Result<PollBatch<Ticket>, ApiError> {
        self.next(since_id, wait).await
    }
}
