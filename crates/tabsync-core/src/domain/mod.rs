//! Domain model (ids, bills, queued tasks, KDS tickets).

pub mod bill;
pub mod ids;
pub mod task;
pub mod ticket;

pub use bill::{
    Bill, BillItem, CastRef, CastSelection, CustomerRef, NewBill, NewBillItem, Stay, StayType,
    TableRef,
};
pub use ids::{BillId, DraftToken, TaskId};
pub use task::{BillPatch, BillTask};
pub use ticket::{PollBatch, Station, Ticket};
