//! Fixed-capacity pools of execution slots, one transaction per slot.
//!
//! The same pool shape serves the MP read-only sites and the NP sites: a
//! slot is one site fed through its own tasker queue, work for a transaction
//! is pinned to its slot until the transaction flushes, and admission
//! backpressure is simply "no idle slot left".

use meshdb_primitives::TxnId;
use nohash_hasher::IntMap;

use super::tasker_queue::{CatalogContext, RepairTask, SiteTask, SiteTaskSource, SiteTaskerQueue};
use super::txn_task::TxnTask;

pub struct SitePool {
    label: &'static str,
    slots: Vec<SiteTaskerQueue>,
    /// Stack of idle slot indexes.
    idle: Vec<usize>,
    busy: IntMap<TxnId, usize>,
    shut_down: bool,
}

impl SitePool {
    /// Build a pool of `capacity` slots, returning the consuming end of each
    /// slot's tasker queue for the embedder to run sites on.
    pub fn new(label: &'static str, capacity: usize) -> (Self, Vec<SiteTaskSource>) {
        assert!(capacity > 0, "{label} pool must have at least one site");
        let (slots, sources): (Vec<_>, Vec<_>) = (0..capacity).map(|_| SiteTaskerQueue::new()).unzip();
        let pool = Self {
            label,
            slots,
            idle: (0..capacity).rev().collect(),
            busy: IntMap::default(),
            shut_down: false,
        };
        (pool, sources)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.busy.len()
    }

    pub fn can_accept_work(&self) -> bool {
        !self.shut_down && !self.idle.is_empty()
    }

    /// Submit work for `txn_id`. Follow-up work for a transaction already in
    /// the pool goes to its pinned slot; fresh work takes an idle slot. The
    /// caller checks [`Self::can_accept_work`] first; running dry here is a
    /// scheduler bug.
    pub fn do_work(&mut self, txn_id: TxnId, task: TxnTask) {
        let slot = match self.busy.get(&txn_id).copied() {
            Some(slot) => slot,
            None => {
                let slot = self
                    .idle
                    .pop()
                    .unwrap_or_else(|| panic!("{} pool has no idle site for {txn_id}", self.label));
                self.busy.insert(txn_id, slot);
                slot
            }
        };
        if !self.slots[slot].offer(SiteTask::Run(task)) {
            log::warn!("{} site {slot} is gone; dropping work for {txn_id}", self.label);
        }
    }

    /// Release the slot pinned to a completed transaction.
    pub fn complete_work(&mut self, txn_id: TxnId) {
        let slot = self
            .busy
            .remove(&txn_id)
            .unwrap_or_else(|| panic!("{} pool completed unknown txn {txn_id}", self.label));
        self.idle.push(slot);
    }

    /// Interrupt the site running `txn_id` with a repair task. The slot stays
    /// pinned; the transaction still completes through `complete_work`.
    pub fn repair(&mut self, txn_id: TxnId, repair: &RepairTask) {
        let &slot = self
            .busy
            .get(&txn_id)
            .unwrap_or_else(|| panic!("{} pool repaired unknown txn {txn_id}", self.label));
        if !self.slots[slot].offer(SiteTask::Repair(repair.clone())) {
            log::warn!("{} site {slot} is gone; dropping repair for {txn_id}", self.label);
        }
    }

    pub fn update_catalog(&self, diff_cmds: &str, context: &CatalogContext) {
        self.broadcast(|| SiteTask::UpdateCatalog {
            diff_cmds: diff_cmds.to_owned(),
            context: context.clone(),
        });
    }

    pub fn update_settings(&self, context: &CatalogContext) {
        self.broadcast(|| SiteTask::UpdateSettings {
            context: context.clone(),
        });
    }

    /// Deliver a terminal task to every site and refuse further admissions.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.broadcast(|| SiteTask::Shutdown);
    }

    fn broadcast(&self, task: impl Fn() -> SiteTask) {
        for (slot, queue) in self.slots.iter().enumerate() {
            if !queue.offer(task()) {
                log::warn!("{} site {slot} is gone; dropping broadcast", self.label);
            }
        }
    }
}
