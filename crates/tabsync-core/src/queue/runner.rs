//! Task runner: one REST call per queued task.
//!
//! Dispatch is an exhaustive match over [`BillTask`]; there is no way to
//! queue a kind that has no runner.

use std::sync::Arc;

use tracing::warn;

use crate::domain::{Bill, BillId, BillTask, DraftToken};
use crate::error::TaskError;
use crate::ports::BillApi;

/// What a successful run produced for the engine to apply locally.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The server created the bill behind `temp_id`.
    Created { temp_id: DraftToken, real_id: u64 },

    /// The server answered with the updated bill.
    Updated(Bill),

    /// Authoritative copy fetched by a reconcile task.
    Reconciled(Bill),

    /// Reconcile fetch failed; local state is left as is.
    ReconcileSkipped,

    Done,
}

pub struct TaskRunner {
    api: Arc<dyn BillApi>,
}

impl TaskRunner {
    pub fn new(api: Arc<dyn BillApi>) -> Self {
        Self { api }
    }

    /// Run one task against the API.
    ///
    /// Safe to repeat for everything but `CreateBill`, which the engine runs
    /// until its first success and then removes.
    pub async fn run(&self, task: &BillTask) -> Result<RunOutcome, TaskError> {
        match task {
            BillTask::CreateBill { temp_id, bill } => {
                let real_id = self.api.create_bill(bill).await?;
                Ok(RunOutcome::Created {
                    temp_id: *temp_id,
                    real_id,
                })
            }
            BillTask::PatchBill { id, payload } => {
                let id = resolved(*id)?;
                let body = payload.to_wire().map_err(TaskError::UnresolvedBill)?;
                self.api.patch_bill(id, &body).await?;
                Ok(RunOutcome::Done)
            }
            BillTask::UpdateBillCustomers { id, customer_ids } => {
                self.api
                    .update_customers(resolved(*id)?, customer_ids)
                    .await?;
                Ok(RunOutcome::Done)
            }
            BillTask::UpdateBillCasts { bill_id, casts } => {
                let bill = self.api.update_casts(resolved(*bill_id)?, casts).await?;
                Ok(RunOutcome::Updated(bill))
            }
            BillTask::AddBillItem { id, item } => {
                self.api.add_item(resolved(*id)?, item).await?;
                Ok(RunOutcome::Done)
            }
            BillTask::UpdateBillTable { id, table_id } => {
                self.api.update_table(resolved(*id)?, *table_id).await?;
                Ok(RunOutcome::Done)
            }
            BillTask::DeleteBill { id } => {
                self.api.delete_bill(resolved(*id)?).await?;
                Ok(RunOutcome::Done)
            }
            BillTask::CloseBill { id, settled_total } => {
                self.api.close_bill(resolved(*id)?, *settled_total).await?;
                Ok(RunOutcome::Done)
            }
            BillTask::Reconcile { id } => {
                let id = resolved(*id)?;
                match self.api.fetch_bill(id).await {
                    Ok(bill) => Ok(RunOutcome::Reconciled(bill)),
                    Err(err) => {
                        warn!(bill_id = id, error = %err, "reconcile fetch failed; keeping optimistic copy");
                        Ok(RunOutcome::ReconcileSkipped)
                    }
                }
            }
        }
    }
}

fn resolved(id: BillId) -> Result<u64, TaskError> {
    id.real().ok_or(TaskError::UnresolvedBill(id))
}
