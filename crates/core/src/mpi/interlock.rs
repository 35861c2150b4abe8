//! In-flight bookkeeping and the class-exclusion rules between concurrent
//! multi-partition and N-partition transactions.

use meshdb_primitives::{PartitionId, TxnId};
use nohash_hasher::IntMap;
use smallvec::SmallVec;

use super::txn_task::TxnTask;

pub(crate) type NpPartitions = SmallVec<[PartitionId; 8]>;

/// Which in-flight structure a flushed transaction was found in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InFlightClass {
    MpWrite,
    MpRead,
    Np,
}

/// The in-flight maps. At most one MP write cluster-wide; reads and writes
/// never overlap; NP transactions exclude each other per partition and
/// exclude MP entirely.
#[derive(Default)]
pub(crate) struct Interlock {
    current_mp_writes: IntMap<TxnId, TxnTask>,
    current_mp_reads: IntMap<TxnId, TxnTask>,
    current_np_txn_partitions: IntMap<TxnId, NpPartitions>,
    current_np_by_partition: IntMap<PartitionId, IntMap<TxnId, TxnTask>>,
}

impl Interlock {
    pub fn writes_count(&self) -> usize {
        self.current_mp_writes.len()
    }

    pub fn reads_count(&self) -> usize {
        self.current_mp_reads.len()
    }

    pub fn np_count(&self) -> usize {
        self.current_np_txn_partitions.len()
    }

    pub fn mp_writes_empty(&self) -> bool {
        self.current_mp_writes.is_empty()
    }

    pub fn mp_reads_empty(&self) -> bool {
        self.current_mp_reads.is_empty()
    }

    pub fn np_empty(&self) -> bool {
        self.current_np_txn_partitions.is_empty()
    }

    /// True when no in-flight NP transaction involves `partition`.
    pub fn np_partition_free(&self, partition: PartitionId) -> bool {
        self.current_np_by_partition
            .get(&partition)
            .is_none_or(|txns| txns.is_empty())
    }

    pub fn writes(&self) -> impl Iterator<Item = (&TxnId, &TxnTask)> {
        self.current_mp_writes.iter()
    }

    pub fn reads(&self) -> impl Iterator<Item = (&TxnId, &TxnTask)> {
        self.current_mp_reads.iter()
    }

    pub fn np_txns(&self) -> impl Iterator<Item = (&TxnId, &TxnTask)> {
        self.current_np_txn_partitions.iter().map(|(txn_id, partitions)| {
            let task = self.current_np_by_partition[&partitions[0]]
                .get(txn_id)
                .expect("np partition index lost a tracked txn");
            (txn_id, task)
        })
    }

    pub fn np_partition_lists(&self) -> impl Iterator<Item = (&TxnId, &NpPartitions)> {
        self.current_np_txn_partitions.iter()
    }

    pub fn np_by_partition(&self) -> impl Iterator<Item = (&PartitionId, &IntMap<TxnId, TxnTask>)> {
        self.current_np_by_partition.iter()
    }

    pub fn track_write(&mut self, task: TxnTask) {
        debug_assert!(self.current_mp_writes.is_empty(), "two mp writes in flight");
        self.current_mp_writes.insert(task.txn_id(), task);
    }

    pub fn track_read(&mut self, task: TxnTask) {
        self.current_mp_reads.insert(task.txn_id(), task);
    }

    pub fn track_np(&mut self, task: TxnTask) {
        let txn_id = task.txn_id();
        let partitions: NpPartitions = task
            .involved_partitions()
            .expect("np task without partitions")
            .into();
        for &p in &partitions {
            self.current_np_by_partition
                .entry(p)
                .or_default()
                .insert(txn_id, task.clone());
        }
        self.current_np_txn_partitions.insert(txn_id, partitions);
    }

    /// Remove `txn_id` from whichever in-flight map holds it.
    pub fn untrack(&mut self, txn_id: TxnId) -> Option<InFlightClass> {
        if self.current_mp_writes.remove(&txn_id).is_some() {
            return Some(InFlightClass::MpWrite);
        }
        if self.current_mp_reads.remove(&txn_id).is_some() {
            return Some(InFlightClass::MpRead);
        }
        let partitions = self.current_np_txn_partitions.remove(&txn_id)?;
        for p in partitions {
            let txns = self
                .current_np_by_partition
                .get_mut(&p)
                .expect("np partition index lost a tracked partition");
            txns.remove(&txn_id);
            if txns.is_empty() {
                self.current_np_by_partition.remove(&p);
            }
        }
        Some(InFlightClass::Np)
    }

    /// In-flight txn ids across all classes, for cross-structure checks.
    pub fn in_flight_ids(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.current_mp_writes
            .keys()
            .chain(self.current_mp_reads.keys())
            .chain(self.current_np_txn_partitions.keys())
            .copied()
    }

    /// Asserts the class-exclusion invariants. Called after every queue
    /// operation in debug builds; a failure is a scheduler bug.
    pub fn check_consistency(&self, ro_capacity: usize, np_capacity: usize) {
        assert!(
            self.current_mp_writes.len() <= 1,
            "{} mp writes in flight",
            self.current_mp_writes.len()
        );
        assert!(
            self.current_mp_writes.is_empty() || self.current_mp_reads.is_empty(),
            "mp reads and writes in flight together"
        );
        if !self.current_np_txn_partitions.is_empty() {
            assert!(
                self.current_mp_writes.is_empty() && self.current_mp_reads.is_empty(),
                "np and mp transactions in flight together"
            );
        }
        assert!(
            self.current_mp_reads.len() <= ro_capacity,
            "more mp reads in flight than read sites"
        );
        assert!(
            self.current_np_txn_partitions.len() <= np_capacity,
            "more np txns in flight than np sites"
        );

        // Partition-scoped exclusion: one NP txn per partition, and the
        // inverse index agrees with the forward map.
        for (partition, txns) in &self.current_np_by_partition {
            assert!(
                txns.len() <= 1,
                "partition {partition} has {} np txns in flight",
                txns.len()
            );
            for txn_id in txns.keys() {
                let partitions = self
                    .current_np_txn_partitions
                    .get(txn_id)
                    .unwrap_or_else(|| panic!("untracked np txn {txn_id} on partition {partition}"));
                assert!(partitions.contains(partition));
            }
        }
        for (txn_id, partitions) in &self.current_np_txn_partitions {
            for p in partitions {
                assert!(
                    self.current_np_by_partition
                        .get(p)
                        .is_some_and(|txns| txns.contains_key(txn_id)),
                    "np txn {txn_id} missing from partition {p} index"
                );
            }
        }
    }
}
