//! Transaction tasks as the initiator schedules them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

use meshdb_primitives::{HSId, PartitionId, TxnId};
use parking_lot::Mutex;

use crate::messages::FragmentResponse;

/// Partition leader map, keyed by partition id.
pub type PartitionMasters = nohash_hasher::IntMap<PartitionId, HSId>;

/// State object of a transaction in progress. Owned by the upstream
/// initiator machinery; the task queue only reads its identity and delivers
/// fragment responses into it.
pub trait TransactionState: Send + Sync {
    fn txn_id(&self) -> TxnId;
    fn is_read_only(&self) -> bool;
    /// Partitions an N-partition transaction touches. `None` for
    /// multi-partition transactions.
    fn involved_partitions(&self) -> Option<&[PartitionId]> {
        None
    }
    /// Hand the running procedure a fragment response. Implementations must
    /// accept calls from a repair thread while the transaction executes.
    fn offer_received_fragment_response(&self, response: FragmentResponse);
}

/// Where a task's fragments are sent: the master list plus the
/// partition-to-master map current when the task was created or last
/// repaired.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MasterRouting {
    pub masters: Vec<HSId>,
    pub partition_masters: PartitionMasters,
}

impl MasterRouting {
    pub fn new(masters: Vec<HSId>, partition_masters: PartitionMasters) -> Self {
        Self {
            masters,
            partition_masters,
        }
    }

    /// Restriction of `partition_masters` to `involved`, with the master
    /// list rebuilt from the surviving entries in partition order.
    fn trimmed(involved: &[PartitionId], partition_masters: &PartitionMasters) -> Self {
        let mut routing = Self::default();
        for p in involved {
            let Some(&master) = partition_masters.get(p) else {
                continue;
            };
            routing.partition_masters.insert(*p, master);
            if !routing.masters.contains(&master) {
                routing.masters.push(master);
            }
        }
        routing
    }
}

struct TaskInner {
    state: Arc<dyn TransactionState>,
    /// NP only: the partitions this transaction names. Fixed at creation.
    involved: Option<Box<[PartitionId]>>,
    /// Replaced wholesale under the lock, so a site reading a snapshot never
    /// observes a half-applied repair.
    routing: Mutex<Arc<MasterRouting>>,
    restart_generation: AtomicU32,
}

/// A transaction task: the unit the initiator's queue admits, backlogs and
/// dispatches. Cheap to clone; clones share the transaction state and the
/// routing metadata, which is what lets repair refresh a task that a pool is
/// already executing.
#[derive(Clone)]
pub enum TxnTask {
    MpWrite(TaskHandle),
    MpRead(TaskHandle),
    Np(TaskHandle),
    /// Broadcast work touching all partitions. The interlock treats it as an
    /// MP write; it exists apart so repair can refresh only its master list.
    EveryPartition(TaskHandle),
}

#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    fn new(
        state: Arc<dyn TransactionState>,
        involved: Option<Box<[PartitionId]>>,
        routing: MasterRouting,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                state,
                involved,
                routing: Mutex::new(Arc::new(routing)),
                restart_generation: AtomicU32::new(0),
            }),
        }
    }

    fn install_routing(&self, routing: MasterRouting) {
        *self.inner.routing.lock() = Arc::new(routing);
    }
}

impl TxnTask {
    /// Wrap a multi-partition transaction; the read-only flag of its state
    /// decides the class.
    pub fn multi_partition(state: Arc<dyn TransactionState>, routing: MasterRouting) -> Self {
        let handle = TaskHandle::new(state, None, routing);
        if handle.inner.state.is_read_only() {
            TxnTask::MpRead(handle)
        } else {
            TxnTask::MpWrite(handle)
        }
    }

    /// Wrap an N-partition transaction. The state must name at least one
    /// involved partition; the routing is trimmed to those partitions up
    /// front.
    pub fn n_partition(state: Arc<dyn TransactionState>, partition_masters: &PartitionMasters) -> Self {
        let involved: Box<[PartitionId]> = state
            .involved_partitions()
            .expect("an n-partition transaction must name its partitions")
            .into();
        assert!(
            !involved.is_empty(),
            "an n-partition transaction must involve at least one partition"
        );
        let routing = MasterRouting::trimmed(&involved, partition_masters);
        TxnTask::Np(TaskHandle::new(state, Some(involved), routing))
    }

    pub fn every_partition(state: Arc<dyn TransactionState>, masters: Vec<HSId>) -> Self {
        let routing = MasterRouting::new(masters, PartitionMasters::default());
        TxnTask::EveryPartition(TaskHandle::new(state, None, routing))
    }

    fn handle(&self) -> &TaskHandle {
        match self {
            TxnTask::MpWrite(h) | TxnTask::MpRead(h) | TxnTask::Np(h) | TxnTask::EveryPartition(h) => h,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.handle().inner.state.txn_id()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, TxnTask::MpRead(_))
    }

    pub fn involved_partitions(&self) -> Option<&[PartitionId]> {
        self.handle().inner.involved.as_deref()
    }

    /// Snapshot of the current routing metadata.
    pub fn routing(&self) -> Arc<MasterRouting> {
        self.handle().inner.routing.lock().clone()
    }

    /// How many times repair has restarted this task.
    pub fn restart_generation(&self) -> u32 {
        self.handle().inner.restart_generation.load(Relaxed)
    }

    /// Refresh routing after a topology change. NP tasks keep only their
    /// involved partitions; every-partition tasks take the master list alone.
    pub fn update_masters(&self, masters: &[HSId], partition_masters: &PartitionMasters) {
        let handle = self.handle();
        let routing = match self {
            TxnTask::MpWrite(_) | TxnTask::MpRead(_) => {
                MasterRouting::new(masters.to_vec(), partition_masters.clone())
            }
            TxnTask::Np(_) => {
                let involved = handle.inner.involved.as_deref().unwrap_or(&[]);
                MasterRouting::trimmed(involved, partition_masters)
            }
            TxnTask::EveryPartition(_) => {
                let partition_masters = handle.inner.routing.lock().partition_masters.clone();
                MasterRouting::new(masters.to_vec(), partition_masters)
            }
        };
        handle.install_routing(routing);
    }

    /// Refresh routing on an in-flight task and mark that the transaction is
    /// being restarted under it.
    pub fn do_restart(&self, masters: &[HSId], partition_masters: &PartitionMasters) {
        self.update_masters(masters, partition_masters);
        self.handle().inner.restart_generation.fetch_add(1, Relaxed);
    }

    pub fn offer_received_fragment_response(&self, response: FragmentResponse) {
        self.handle().inner.state.offer_received_fragment_response(response);
    }

    fn kind(&self) -> &'static str {
        match self {
            TxnTask::MpWrite(_) => "MpWrite",
            TxnTask::MpRead(_) => "MpRead",
            TxnTask::Np(_) => "Np",
            TxnTask::EveryPartition(_) => "EveryPartition",
        }
    }
}

impl fmt::Display for TxnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.txn_id())
    }
}

impl fmt::Debug for TxnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnTask::{}({})", self.kind(), self.txn_id())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use meshdb_primitives::MP_INIT_PID;
    use parking_lot::Mutex as TestMutex;

    pub(crate) struct TestTxn {
        txn_id: TxnId,
        read_only: bool,
        involved: Option<Vec<PartitionId>>,
        pub responses: TestMutex<Vec<FragmentResponse>>,
    }

    impl TestTxn {
        pub fn mp(sequence: u64, read_only: bool) -> Arc<Self> {
            Arc::new(Self {
                txn_id: TxnId::new(sequence, MP_INIT_PID),
                read_only,
                involved: None,
                responses: TestMutex::new(Vec::new()),
            })
        }

        pub fn np(sequence: u64, partitions: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                txn_id: TxnId::new(sequence, MP_INIT_PID),
                read_only: false,
                involved: Some(partitions.iter().copied().map(PartitionId).collect()),
                responses: TestMutex::new(Vec::new()),
            })
        }
    }

    impl TransactionState for TestTxn {
        fn txn_id(&self) -> TxnId {
            self.txn_id
        }

        fn is_read_only(&self) -> bool {
            self.read_only
        }

        fn involved_partitions(&self) -> Option<&[PartitionId]> {
            self.involved.as_deref()
        }

        fn offer_received_fragment_response(&self, response: FragmentResponse) {
            self.responses.lock().push(response);
        }
    }

    pub(crate) fn masters_of(entries: &[(u32, HSId)]) -> PartitionMasters {
        entries.iter().map(|&(p, m)| (PartitionId(p), m)).collect()
    }

    #[test]
    fn read_only_state_becomes_a_read_task() {
        let task = TxnTask::multi_partition(TestTxn::mp(1, true), MasterRouting::default());
        assert!(task.is_read_only());
        assert!(matches!(task, TxnTask::MpRead(_)));
    }

    #[test]
    fn np_routing_is_trimmed_at_creation() {
        let global = masters_of(&[
            (0, HSId::new(0, 4)),
            (1, HSId::new(1, 4)),
            (2, HSId::new(2, 4)),
        ]);
        let task = TxnTask::n_partition(TestTxn::np(2, &[0, 2]), &global);
        let routing = task.routing();
        assert_eq!(routing.partition_masters.len(), 2);
        assert!(routing.partition_masters.contains_key(&PartitionId(0)));
        assert!(!routing.partition_masters.contains_key(&PartitionId(1)));
        assert_eq!(routing.masters, vec![HSId::new(0, 4), HSId::new(2, 4)]);
    }

    #[test]
    fn np_update_masters_keeps_trimming() {
        let task = TxnTask::n_partition(TestTxn::np(3, &[1]), &masters_of(&[(1, HSId::new(0, 4))]));
        let new_global = masters_of(&[(0, HSId::new(5, 4)), (1, HSId::new(6, 4))]);
        task.update_masters(&[HSId::new(5, 4), HSId::new(6, 4)], &new_global);
        let routing = task.routing();
        assert_eq!(routing.partition_masters, masters_of(&[(1, HSId::new(6, 4))]));
        assert_eq!(routing.masters, vec![HSId::new(6, 4)]);
    }

    #[test]
    fn every_partition_takes_masters_only() {
        let task = TxnTask::every_partition(TestTxn::mp(4, false), vec![HSId::new(0, 4)]);
        task.update_masters(&[HSId::new(9, 4)], &masters_of(&[(0, HSId::new(9, 4))]));
        let routing = task.routing();
        assert_eq!(routing.masters, vec![HSId::new(9, 4)]);
        assert!(routing.partition_masters.is_empty());
    }

    #[test]
    fn do_restart_bumps_the_generation() {
        let task = TxnTask::multi_partition(TestTxn::mp(5, false), MasterRouting::default());
        assert_eq!(task.restart_generation(), 0);
        task.do_restart(&[HSId::new(1, 1)], &PartitionMasters::default());
        assert_eq!(task.restart_generation(), 1);
        assert_eq!(task.routing().masters, vec![HSId::new(1, 1)]);
    }

    #[test]
    #[should_panic(expected = "at least one partition")]
    fn np_task_requires_partitions() {
        let _ = TxnTask::n_partition(TestTxn::np(6, &[]), &PartitionMasters::default());
    }
}
