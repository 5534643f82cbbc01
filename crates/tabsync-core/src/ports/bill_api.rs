//! BillApi port - 伝票 REST API
//!
//! 送信キューの各 runner はここを 1 回だけ呼びます。
//! 引数の伝票 ID は作成済み（サーバ採番）のものに限ります。

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{Bill, CastSelection, NewBill, NewBillItem};
use crate::error::ApiError;

#[async_trait]
pub trait BillApi: Send + Sync {
    /// POST /billing/bills/ -> the server-issued id.
    async fn create_bill(&self, bill: &NewBill) -> Result<u64, ApiError>;

    async fn patch_bill(&self, id: u64, fields: &Map<String, Value>) -> Result<(), ApiError>;

    async fn update_customers(&self, id: u64, customer_ids: &[u64]) -> Result<(), ApiError>;

    /// Returns the bill with its updated stays.
    async fn update_casts(&self, id: u64, casts: &CastSelection) -> Result<Bill, ApiError>;

    async fn add_item(&self, id: u64, item: &NewBillItem) -> Result<(), ApiError>;

    async fn update_table(&self, id: u64, table_id: Option<u64>) -> Result<(), ApiError>;

    async fn delete_bill(&self, id: u64) -> Result<(), ApiError>;

    async fn close_bill(&self, id: u64, settled_total: Option<i64>) -> Result<(), ApiError>;

    async fn fetch_bill(&self, id: u64) -> Result<Bill, ApiError>;

    async fn fetch_bills(&self) -> Result<Vec<Bill>, ApiError>;
}
