//! The two-FIFO backlog behind the initiator's task queue.

use std::collections::VecDeque;

use meshdb_primitives::TxnId;

use super::txn_task::TxnTask;

/// Upper bound on normal-backlog entries one scheduling pass may examine.
/// Keeps the work done under the queue's lock by `offer` and `flush` small.
pub(crate) const MAX_TASK_DEPTH: usize = 20;

/// Pending tasks, in two FIFOs. Everything arrives on the normal backlog;
/// a task the interlock refuses rotates into the priority backlog, which the
/// next pass tries first so a refused task is retried ahead of newer work.
#[derive(Default)]
pub(crate) struct Backlog {
    priority: VecDeque<TxnTask>,
    normal: VecDeque<TxnTask>,
}

impl Backlog {
    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    /// Append newly offered work.
    pub fn push(&mut self, task: TxnTask) {
        self.normal.push_back(task);
    }

    pub fn pop_priority(&mut self) -> Option<TxnTask> {
        self.priority.pop_front()
    }

    pub fn pop_normal(&mut self) -> Option<TxnTask> {
        self.normal.pop_front()
    }

    /// Rotate a task refused from the priority backlog back to the normal
    /// backlog. It goes to the head: the same pass's normal scan re-examines
    /// it in FIFO position, so it cannot fall behind younger work.
    pub fn demote(&mut self, task: TxnTask) {
        self.normal.push_front(task);
    }

    /// Rotate a task refused from the normal backlog to the priority tail.
    pub fn promote(&mut self, task: TxnTask) {
        self.priority.push_back(task);
    }

    pub fn priority_head(&self) -> Option<TxnId> {
        self.priority.front().map(TxnTask::txn_id)
    }

    pub fn normal_head(&self) -> Option<TxnId> {
        self.normal.front().map(TxnTask::txn_id)
    }

    /// All backlogged tasks, priority first, order preserved within each
    /// FIFO. Repair walks this to refresh routing.
    pub fn iter(&self) -> impl Iterator<Item = &TxnTask> {
        self.priority.iter().chain(self.normal.iter())
    }

    #[cfg(test)]
    pub fn ids(&self) -> (Vec<TxnId>, Vec<TxnId>) {
        (
            self.priority.iter().map(TxnTask::txn_id).collect(),
            self.normal.iter().map(TxnTask::txn_id).collect(),
        )
    }
}
