//! The work feed between the initiator and one execution site.

use crossbeam_channel::{Receiver, Sender, unbounded};
use meshdb_primitives::HSId;

use super::txn_task::{PartitionMasters, TxnTask};

/// Consuming end of a site's tasker queue.
pub type SiteTaskSource = Receiver<SiteTask>;

/// Everything a site consumes from its tasker queue.
#[derive(Clone, Debug)]
pub enum SiteTask {
    /// Execute (or continue) a transaction.
    Run(TxnTask),
    /// Cluster topology changed; re-point in-flight fragment work.
    Repair(RepairTask),
    UpdateCatalog {
        diff_cmds: String,
        context: CatalogContext,
    },
    UpdateSettings {
        context: CatalogContext,
    },
    /// Terminal: the site drains and exits.
    Shutdown,
}

/// Post-failover topology handed to sites during repair, built by the
/// promotion machinery upstream of the task queue.
#[derive(Clone, Debug)]
pub struct RepairTask {
    pub masters: Vec<HSId>,
    pub partition_masters: PartitionMasters,
}

/// Catalog/settings generation forwarded to sites on updates.
#[derive(Clone, Debug, Default)]
pub struct CatalogContext {
    pub catalog_version: u64,
}

/// Single-consumer queue feeding one execution site. The queue never blocks
/// the caller; all waiting happens on the site side.
pub struct SiteTaskerQueue {
    tx: Sender<SiteTask>,
}

impl SiteTaskerQueue {
    pub fn new() -> (Self, SiteTaskSource) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// Hand `task` to the site. Returns false if the site is gone.
    pub fn offer(&self, task: SiteTask) -> bool {
        self.tx.send(task).is_ok()
    }
}
