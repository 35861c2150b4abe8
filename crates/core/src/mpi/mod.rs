//! The multi-partition initiator: the single logical site through which
//! every transaction touching more than one partition is serialized,
//! dispatched into the execution pools, and completed.

mod backlog;
mod interlock;
pub mod site_pool;
pub mod task_queue;
pub mod tasker_queue;
pub mod txn_task;

pub use site_pool::SitePool;
pub use task_queue::{MpTransactionTaskQueue, SiteHandles};
pub use tasker_queue::{CatalogContext, RepairTask, SiteTask, SiteTaskSource, SiteTaskerQueue};
pub use txn_task::{MasterRouting, PartitionMasters, TransactionState, TxnTask};
