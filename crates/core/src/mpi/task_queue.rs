//! The multi-partition transaction task queue: every transaction touching
//! more than one partition is serialized, dispatched and completed through
//! this structure.
//!
//! One coarse mutex guards all state. The critical section is bounded: a
//! scheduling pass examines at most the priority backlog plus
//! [`MAX_TASK_DEPTH`] normal entries, and site/pool calls only enqueue.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use meshdb_primitives::{HSId, TxnId};
use parking_lot::Mutex;

use crate::config::MpiConfig;
use crate::messages::{FragmentResponse, Mailbox};

use super::backlog::{Backlog, MAX_TASK_DEPTH};
use super::interlock::{InFlightClass, Interlock};
use super::site_pool::SitePool;
use super::tasker_queue::{CatalogContext, RepairTask, SiteTask, SiteTaskSource, SiteTaskerQueue};
use super::txn_task::{PartitionMasters, TxnTask};

/// Consuming ends of every site feed: one writer site, the read-only pool
/// sites and the NP pool sites. Handed out once at construction.
pub struct SiteHandles {
    pub write_site: SiteTaskSource,
    pub ro_sites: Vec<SiteTaskSource>,
    pub np_sites: Vec<SiteTaskSource>,
}

pub struct MpTransactionTaskQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    mailbox: Arc<dyn Mailbox>,
    /// Single-consumer feed of the one MP writer site.
    write_queue: SiteTaskerQueue,
    ro_pool: SitePool,
    np_pool: SitePool,
    backlog: Backlog,
    interlock: Interlock,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum DrainMode {
    /// Producer-triggered: drain as much as the interlock admits.
    Offer,
    /// Completer-triggered: admit at most one task from the priority
    /// backlog, so completers don't monopolize the lock.
    Flush,
}

impl MpTransactionTaskQueue {
    pub fn new(config: &MpiConfig, mailbox: Arc<dyn Mailbox>) -> (Self, SiteHandles) {
        let (write_queue, write_site) = SiteTaskerQueue::new();
        let (ro_pool, ro_sites) = SitePool::new("mp-ro", config.mp_ro_pool_size);
        let (np_pool, np_sites) = SitePool::new("np", config.np_pool_size);
        let queue = Self {
            inner: Mutex::new(Inner {
                mailbox,
                write_queue,
                ro_pool,
                np_pool,
                backlog: Backlog::default(),
                interlock: Interlock::default(),
            }),
        };
        let handles = SiteHandles {
            write_site,
            ro_sites,
            np_sites,
        };
        (queue, handles)
    }

    /// Accept a task. Never refuses; the task is backlogged and a scheduling
    /// pass runs while the lock is held.
    pub fn offer(&self, task: TxnTask) -> bool {
        let inner = &mut *self.inner.lock();
        log::debug!("offered {task}");
        inner.backlog.push(task);
        inner.drain(DrainMode::Offer);
        inner.maybe_check();
        true
    }

    /// A pool finished `txn_id`. Releases its in-flight entry, notifies the
    /// owning pool and drains. Returns how many tasks were newly dispatched.
    ///
    /// Flushing a txn id that is not in flight is a scheduler-contract
    /// violation and aborts.
    pub fn flush(&self, txn_id: TxnId) -> usize {
        let inner = &mut *self.inner.lock();
        inner.complete(txn_id);
        let dispatched = inner.drain(DrainMode::Flush);
        inner.maybe_check();
        dispatched
    }

    /// Re-submit every in-flight task to its pool, leaving the interlock
    /// untouched. No scheduling pass runs.
    pub fn restart(&self) {
        let inner = &mut *self.inner.lock();
        let Inner {
            write_queue,
            ro_pool,
            np_pool,
            interlock,
            ..
        } = inner;
        log::info!("restarting in-flight transactions");
        for (_, task) in interlock.writes() {
            if !write_queue.offer(SiteTask::Run(task.clone())) {
                log::warn!("write site is gone; dropping restart of {task}");
            }
        }
        for (&txn_id, task) in interlock.reads() {
            ro_pool.do_work(txn_id, task.clone());
        }
        for (&txn_id, task) in interlock.np_txns() {
            np_pool.do_work(txn_id, task.clone());
        }
        inner.maybe_check();
    }

    /// Cluster topology changed: unblock the in-flight MP generation and
    /// refresh routing on everything backlogged.
    ///
    /// The in-flight read or write set (at most one is non-empty) gets
    /// `do_restart` plus a poison fragment response, except that a pure
    /// leader migration (`balance_leader`) spares writes the poison. The
    /// repair task is pushed at the site(s) owning the in-flight work.
    pub fn repair(
        &self,
        repair_task: RepairTask,
        masters: &[HSId],
        partition_masters: &PartitionMasters,
        balance_leader: bool,
    ) {
        let inner = &mut *self.inner.lock();
        let Inner {
            mailbox,
            write_queue,
            ro_pool,
            backlog,
            interlock,
            ..
        } = inner;
        let src_hsid = mailbox.hsid();

        if interlock.reads_count() > 0 {
            log::info!("repairing {} in-flight mp reads", interlock.reads_count());
            for (&txn_id, task) in interlock.reads() {
                ro_pool.repair(txn_id, &repair_task);
                task.do_restart(masters, partition_masters);
                task.offer_received_fragment_response(FragmentResponse::poison(src_hsid, txn_id));
            }
        } else if interlock.writes_count() > 0 {
            log::info!("repairing in-flight mp write");
            if !write_queue.offer(SiteTask::Repair(repair_task.clone())) {
                log::warn!("write site is gone; dropping repair task");
            }
            for (&txn_id, task) in interlock.writes() {
                task.do_restart(masters, partition_masters);
                if !balance_leader {
                    task.offer_received_fragment_response(FragmentResponse::poison(src_hsid, txn_id));
                }
            }
        } else {
            log::info!("repair with no in-flight mp transactions");
        }

        for task in backlog.iter() {
            task.update_masters(masters, partition_masters);
        }
        inner.maybe_check();
    }

    /// Forwarded to both pools.
    pub fn update_catalog(&self, diff_cmds: &str, context: &CatalogContext) {
        let inner = self.inner.lock();
        inner.ro_pool.update_catalog(diff_cmds, context);
        inner.np_pool.update_catalog(diff_cmds, context);
    }

    /// Forwarded to both pools.
    pub fn update_settings(&self, context: &CatalogContext) {
        let inner = self.inner.lock();
        inner.ro_pool.update_settings(context);
        inner.np_pool.update_settings(context);
    }

    /// Forwarded to both pools.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.ro_pool.shutdown();
        inner.np_pool.shutdown();
    }

    /// Number of tasks waiting in the normal backlog.
    pub fn size(&self) -> usize {
        self.inner.lock().backlog.normal_len()
    }

    /// Number of previously refused tasks waiting for retry.
    pub fn priority_size(&self) -> usize {
        self.inner.lock().backlog.priority_len()
    }

    #[cfg(test)]
    pub(crate) fn backlog_ids(&self) -> (Vec<TxnId>, Vec<TxnId>) {
        self.inner.lock().backlog.ids()
    }
}

impl Inner {
    /// Whether the interlock and the destination pool let `task` run now.
    fn allow_to_run(&self, task: &TxnTask) -> bool {
        if !self.interlock.mp_writes_empty() {
            return false;
        }
        match task {
            TxnTask::MpRead(_) => self.interlock.np_empty() && self.ro_pool.can_accept_work(),
            TxnTask::MpWrite(_) | TxnTask::EveryPartition(_) => {
                self.interlock.np_empty() && self.interlock.mp_reads_empty()
            }
            TxnTask::Np(_) => {
                let partitions = task.involved_partitions().expect("np task without partitions");
                self.interlock.mp_reads_empty()
                    && partitions.iter().all(|&p| self.interlock.np_partition_free(p))
                    && self.np_pool.can_accept_work()
            }
        }
    }

    /// Move an admitted task into its in-flight map and hand it to its pool.
    fn dispatch(&mut self, task: TxnTask) {
        let txn_id = task.txn_id();
        log::debug!("dispatching {task}");
        match &task {
            TxnTask::MpWrite(_) | TxnTask::EveryPartition(_) => {
                self.interlock.track_write(task.clone());
                if !self.write_queue.offer(SiteTask::Run(task)) {
                    log::warn!("write site is gone; dropping {txn_id}");
                }
            }
            TxnTask::MpRead(_) => {
                self.interlock.track_read(task.clone());
                self.ro_pool.do_work(txn_id, task);
            }
            TxnTask::Np(_) => {
                self.interlock.track_np(task.clone());
                self.np_pool.do_work(txn_id, task);
            }
        }
    }

    /// One scheduling pass: drain the priority backlog, then up to
    /// [`MAX_TASK_DEPTH`] normal entries, rotating refused tasks between the
    /// FIFOs. Stops cold once an MP write is in flight.
    fn drain(&mut self, mode: DrainMode) -> usize {
        let mut dispatched = 0;
        if self.backlog.is_empty() {
            return dispatched;
        }

        let mut refused = Vec::new();
        let mut stop = false;
        for _ in 0..self.backlog.priority_len() {
            if !self.interlock.mp_writes_empty() {
                stop = true;
                break;
            }
            let task = self.backlog.pop_priority().expect("priority length was checked");
            if self.allow_to_run(&task) {
                self.dispatch(task);
                dispatched += 1;
                if mode == DrainMode::Flush {
                    stop = true;
                    break;
                }
            } else {
                refused.push(task);
            }
        }
        // Refused tasks go back to the head of the normal backlog in their
        // original order; the scan below re-examines them before newer work.
        for task in refused.into_iter().rev() {
            self.backlog.demote(task);
        }
        if stop {
            return dispatched;
        }

        for _ in 0..MAX_TASK_DEPTH {
            if !self.interlock.mp_writes_empty() {
                break;
            }
            let Some(task) = self.backlog.pop_normal() else {
                break;
            };
            if self.allow_to_run(&task) {
                self.dispatch(task);
                dispatched += 1;
            } else {
                self.backlog.promote(task);
            }
        }
        dispatched
    }

    /// Remove a completed transaction from its in-flight map and release its
    /// pool slot.
    fn complete(&mut self, txn_id: TxnId) {
        let class = self
            .interlock
            .untrack(txn_id)
            .unwrap_or_else(|| panic!("flush of unknown transaction {txn_id}"));
        log::debug!("flushed {txn_id} ({class:?})");
        match class {
            // The writer site is fed directly; nothing to release.
            InFlightClass::MpWrite => {}
            InFlightClass::MpRead => self.ro_pool.complete_work(txn_id),
            InFlightClass::Np => self.np_pool.complete_work(txn_id),
        }
    }

    fn maybe_check(&self) {
        if cfg!(debug_assertions) {
            self.check_invariants();
        }
    }

    /// Invariant sweep across the interlock and both backlogs.
    fn check_invariants(&self) {
        self.interlock
            .check_consistency(self.ro_pool.capacity(), self.np_pool.capacity());
        let mut seen = nohash_hasher::IntSet::<TxnId>::default();
        let in_flight = self.interlock.in_flight_ids();
        let backlogged = self.backlog.iter().map(TxnTask::txn_id);
        for txn_id in in_flight.chain(backlogged) {
            assert!(seen.insert(txn_id), "txn {txn_id} tracked in two structures");
        }
    }
}

impl fmt::Display for MpTransactionTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let head = |id: Option<TxnId>| id.map_or_else(|| "none".to_owned(), |id| id.to_string());
        writeln!(f, "MpTransactionTaskQueue:")?;
        writeln!(f, "  current mp reads: {}", inner.interlock.reads_count())?;
        writeln!(f, "  current mp writes: {}", inner.interlock.writes_count())?;
        writeln!(f, "  current np txns: {}", inner.interlock.np_count())?;
        for (txn_id, partitions) in inner
            .interlock
            .np_partition_lists()
            .sorted_by_key(|&(&txn_id, _)| txn_id)
        {
            writeln!(f, "    np txn {txn_id} -> partitions [{}]", partitions.iter().join(", "))?;
        }
        for (partition, txns) in inner
            .interlock
            .np_by_partition()
            .sorted_by_key(|&(&partition, _)| partition)
        {
            writeln!(
                f,
                "    partition {partition} -> np txns [{}]",
                txns.keys().sorted().join(", ")
            )?;
        }
        writeln!(
            f,
            "  priority backlog: {} entries, head {}",
            inner.backlog.priority_len(),
            head(inner.backlog.priority_head())
        )?;
        write!(
            f,
            "  backlog: {} entries, head {}",
            inner.backlog.normal_len(),
            head(inner.backlog.normal_head())
        )
    }
}
