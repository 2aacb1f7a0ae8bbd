use crate::domain::command::{Command, Priority, SubmitRejection};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A command sitting in (or re-queued to) a priority sub-queue.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub cmd: Command,
    pub enqueued_at: Instant,
    /// Not eligible for dispatch before this instant (rate-limit defer or
    /// retry backoff).
    pub deferred_until: Option<Instant>,
    /// Execution attempts so far (0 = never dispatched)
    pub attempt: u32,
}

impl QueuedCommand {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            enqueued_at: Instant::now(),
            deferred_until: None,
            attempt: 0,
        }
    }

    fn ready_at(&self, now: Instant) -> bool {
        self.deferred_until.is_none_or(|t| t <= now)
    }
}

/// Admission decision for the head of a queue, made by the rate limiter.
pub enum Admission {
    Admit,
    Defer(Duration),
}

/// Four bounded FIFO sub-queues, one per priority. The dispatcher draws the
/// head of the highest non-empty priority whose head is ready; a sub-queue
/// whose head is deferred yields to lower priorities instead of starving
/// them.
pub struct CommandQueues {
    queues: [VecDeque<QueuedCommand>; Priority::COUNT],
    capacity: usize,
}

impl CommandQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: std::array::from_fn(|_| VecDeque::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    /// Enqueue at the tail of the command's priority.
    pub fn push(&mut self, queued: QueuedCommand) -> Result<(), SubmitRejection> {
        let queue = &mut self.queues[queued.cmd.priority.queue_index()];
        if queue.len() >= self.capacity {
            return Err(SubmitRejection::Backpressure);
        }
        queue.push_back(queued);
        Ok(())
    }

    /// Draw the next dispatchable command.
    ///
    /// `admit` is consulted for heads that do not bypass rate limiting; a
    /// deferred head is re-queued at the tail of its priority with a
    /// deferred-until timestamp and the scan falls through to the next
    /// priority.
    pub fn pop_ready(
        &mut self,
        now: Instant,
        mut admit: impl FnMut(&Command) -> Admission,
    ) -> Option<QueuedCommand> {
        for queue in self.queues.iter_mut() {
            let Some(head) = queue.front() else {
                continue;
            };
            if !head.ready_at(now) {
                // This priority's head is waiting out its deferral.
                continue;
            }
            if head.cmd.kind().bypasses_rate_limit() {
                return queue.pop_front();
            }
            match admit(&head.cmd) {
                Admission::Admit => return queue.pop_front(),
                Admission::Defer(wait) => {
                    let mut deferred = queue
                        .pop_front()
                        .expect("head verified to exist by front check");
                    deferred.deferred_until = Some(now + wait);
                    queue.push_back(deferred);
                }
            }
        }
        None
    }

    /// Remove a queued command by id (for `Cancel`).
    pub fn remove(&mut self, id: &str) -> Option<QueuedCommand> {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|qc| qc.cmd.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    /// Remove every queued command matching the predicate (kill-switch
    /// purge, expiry sweep, shutdown drain).
    pub fn drain_matching(
        &mut self,
        mut predicate: impl FnMut(&QueuedCommand) -> bool,
    ) -> Vec<QueuedCommand> {
        let mut drained = Vec::new();
        for queue in self.queues.iter_mut() {
            let mut keep = VecDeque::with_capacity(queue.len());
            while let Some(qc) = queue.pop_front() {
                if predicate(&qc) {
                    drained.push(qc);
                } else {
                    keep.push_back(qc);
                }
            }
            *queue = keep;
        }
        drained
    }

    /// Earliest instant at which a currently deferred head becomes ready.
    pub fn next_deferred_wakeup(&self, now: Instant) -> Option<Duration> {
        self.queues
            .iter()
            .filter_map(|q| q.front())
            .filter_map(|head| head.deferred_until)
            .filter(|t| *t > now)
            .min()
            .map(|t| t - now)
    }
}
