//! BillEditor - 伝票の楽観的編集
//!
//! 各操作はキャッシュを即座に書き換えてから、対応するタスクと
//! 末尾の reconcile を送信キューに積みます。

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::MutexGuard;
use tracing::info;

use crate::cache::{BillCache, SharedBillCache};
use crate::domain::{
    Bill, BillId, BillItem, BillPatch, BillTask, CastSelection, CustomerRef, NewBill, NewBillItem,
    TaskId,
};
use crate::error::EditError;
use crate::ports::{BillApi, Clock, IdGenerator};
use crate::queue::TxQueue;

pub struct BillEditor {
    queue: Arc<TxQueue>,
    api: Arc<dyn BillApi>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl BillEditor {
    pub fn new(
        queue: Arc<TxQueue>,
        api: Arc<dyn BillApi>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            api,
            ids,
            clock,
        }
    }

    fn cache(&self) -> &SharedBillCache {
        self.queue.cache()
    }

    /// Lock the cache and map a created draft's handle to its server id.
    ///
    /// The queue swaps draft ids while holding the cache, so the id returned
    /// here matches what the locked cache holds.
    async fn locked(&self, bill: BillId) -> (MutexGuard<'_, BillCache>, BillId) {
        let cache = self.cache().lock().await;
        let bill = self.queue.resolve(bill).await;
        (cache, bill)
    }

    /// Id the bill currently goes by; a draft handle stays valid after creation.
    pub async fn resolve(&self, bill: BillId) -> BillId {
        self.queue.resolve(bill).await
    }

    /// Show a draft bill right away and queue its creation.
    pub async fn open_new_bill(&self, request: NewBill) -> Result<BillId, EditError> {
        let token = self.ids.generate_draft_token();
        let bill_id = BillId::Pending(token);
        self.cache()
            .lock()
            .await
            .upsert(Bill::draft(token, &request));

        let queued = self
            .queue
            .enqueue_reconciled(BillTask::CreateBill {
                temp_id: token,
                bill: request,
            })
            .await;
        if let Err(err) = queued {
            self.cache().lock().await.remove(bill_id);
            return Err(err.into());
        }
        info!(%bill_id, "draft bill opened");
        Ok(bill_id)
    }

    /// Apply `edit` to the cached bill, then queue `task` plus a reconcile.
    async fn edit(
        &self,
        bill: BillId,
        edit: impl FnOnce(&mut Bill),
        task: BillTask,
    ) -> Result<TaskId, EditError> {
        {
            let (mut cache, current) = self.locked(bill).await;
            if !cache.update(current, edit) {
                return Err(EditError::UnknownBill(bill));
            }
        }
        Ok(self.queue.enqueue_reconciled(task).await?)
    }

    pub async fn set_customers(
        &self,
        bill: BillId,
        customer_ids: Vec<u64>,
    ) -> Result<TaskId, EditError> {
        let customers = customer_ids.iter().copied().map(CustomerRef::Id).collect();
        self.edit(
            bill,
            |b| b.customers = customers,
            BillTask::UpdateBillCustomers {
                id: bill,
                customer_ids,
            },
        )
        .await
    }

    pub async fn add_customer(&self, bill: BillId, customer_id: u64) -> Result<TaskId, EditError> {
        let mut customer_ids = self.current(bill, Bill::customer_ids).await?;
        if !customer_ids.contains(&customer_id) {
            customer_ids.push(customer_id);
        }
        self.set_customers(bill, customer_ids).await
    }

    pub async fn clear_customers(&self, bill: BillId) -> Result<TaskId, EditError> {
        self.set_customers(bill, Vec::new()).await
    }

    pub async fn set_table(&self, bill: BillId, table_id: Option<u64>) -> Result<TaskId, EditError> {
        self.edit(
            bill,
            |b| b.set_table(table_id),
            BillTask::UpdateBillTable { id: bill, table_id },
        )
        .await
    }

    pub async fn add_item(&self, bill: BillId, item: NewBillItem) -> Result<TaskId, EditError> {
        let line = BillItem::from(&item);
        self.edit(
            bill,
            |b| b.items.push(line),
            BillTask::AddBillItem { id: bill, item },
        )
        .await
    }

    /// Partial update; keys replace the cached fields one for one.
    pub async fn patch(
        &self,
        bill: BillId,
        fields: Map<String, Value>,
    ) -> Result<TaskId, EditError> {
        {
            let (mut cache, current) = self.locked(bill).await;
            let mut applied = Ok(());
            if !cache.update(current, |b| applied = b.apply_fields(&fields)) {
                return Err(EditError::UnknownBill(bill));
            }
            applied.map_err(|err| EditError::Patch(bill, err))?;
        }
        Ok(self
            .queue
            .enqueue_reconciled(BillTask::PatchBill {
                id: bill,
                payload: BillPatch::fields(fields),
            })
            .await?)
    }

    /// Seating derived from the cached bill's active stays.
    pub async fn casts(&self, bill: BillId) -> Result<CastSelection, EditError> {
        self.current(bill, Bill::cast_selection).await
    }

    /// Nominate a cast; nominated casts also sit as free.
    pub async fn set_main(&self, bill: BillId, cast_id: u64) -> Result<TaskId, EditError> {
        self.edit_casts(bill, |c| c.set_main(cast_id)).await
    }

    pub async fn set_free(&self, bill: BillId, cast_id: u64) -> Result<TaskId, EditError> {
        self.edit_casts(bill, |c| c.set_free(cast_id)).await
    }

    pub async fn set_inhouse(&self, bill: BillId, cast_id: u64) -> Result<TaskId, EditError> {
        self.edit_casts(bill, |c| c.set_inhouse(cast_id)).await
    }

    pub async fn set_dohan(&self, bill: BillId, cast_id: u64) -> Result<TaskId, EditError> {
        self.edit_casts(bill, |c| c.set_dohan(cast_id)).await
    }

    pub async fn remove_cast(&self, bill: BillId, cast_id: u64) -> Result<TaskId, EditError> {
        self.edit_casts(bill, |c| c.remove(cast_id)).await
    }

    async fn edit_casts(
        &self,
        bill: BillId,
        change: impl FnOnce(&mut CastSelection),
    ) -> Result<TaskId, EditError> {
        let now = self.clock.now();
        let casts = {
            let (mut cache, current) = self.locked(bill).await;
            let mut casts = None;
            cache.update(current, |b| {
                let mut selection = b.cast_selection();
                change(&mut selection);
                b.apply_casts(&selection, now);
                casts = Some(selection);
            });
            casts.ok_or(EditError::UnknownBill(bill))?
        };
        Ok(self
            .queue
            .enqueue_reconciled(BillTask::UpdateBillCasts {
                bill_id: bill,
                casts,
            })
            .await?)
    }

    pub async fn close(
        &self,
        bill: BillId,
        settled_total: Option<i64>,
    ) -> Result<TaskId, EditError> {
        let now = self.clock.now();
        self.edit(
            bill,
            |b| b.closed_at = Some(now),
            BillTask::CloseBill {
                id: bill,
                settled_total,
            },
        )
        .await
    }

    /// Remove the bill locally and queue its deletion.
    pub async fn delete(&self, bill: BillId) -> Result<TaskId, EditError> {
        {
            let (mut cache, current) = self.locked(bill).await;
            cache.remove(current);
        }
        Ok(self.queue.enqueue(BillTask::DeleteBill { id: bill }).await?)
    }

    /// Merge the server's bill list into the cache. Drafts are kept.
    pub async fn refresh(&self) -> Result<usize, EditError> {
        let bills = self.api.fetch_bills().await?;
        let count = bills.len();
        self.cache().lock().await.patch_in_place(bills);
        Ok(count)
    }

    async fn current<T>(&self, bill: BillId, read: impl FnOnce(&Bill) -> T) -> Result<T, EditError> {
        let (cache, current) = self.locked(bill).await;
        cache
            .get(current)
            .map(read)
            .ok_or(EditError::UnknownBill(bill))
    }
}
