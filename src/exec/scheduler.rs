//! Latency scheduling
//!
//! A time-ordered queue of PENDING orders plus the background
//! dispatcher task that releases them. Ordering is stable FIFO: two
//! orders due at the same instant execute in submission order.

use crate::exec::engine::ExecutionEngine;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A scheduled execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledExecution {
    pub due_ms: i64,
    /// Submission sequence, the FIFO tiebreaker.
    pub seq: u64,
    pub order_id: i64,
    pub submitted_ms: i64,
}

impl ScheduledExecution {
    /// Progress view at a given instant. Clamped so a late dispatcher
    /// tick never reports more than 100%.
    pub fn progress_at(&self, now_ms: i64) -> PendingProgress {
        let total = (self.due_ms - self.submitted_ms).max(1);
        let elapsed = (now_ms - self.submitted_ms).clamp(0, total);
        PendingProgress {
            order_id: self.order_id,
            elapsed_ms: elapsed,
            remaining_ms: total - elapsed,
            progress_pct: elapsed as f64 / total as f64 * 100.0,
        }
    }
}

impl Ord for ScheduledExecution {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due_ms, self.seq).cmp(&(other.due_ms, other.seq))
    }
}

impl PartialOrd for ScheduledExecution {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dashboard-facing view of a waiting order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingProgress {
    pub order_id: i64,
    pub elapsed_ms: i64,
    pub remaining_ms: i64,
    pub progress_pct: f64,
}

/// Min-heap keyed on (due time, submission sequence).
#[derive(Debug, Default)]
pub struct LatencyQueue {
    heap: BinaryHeap<Reverse<ScheduledExecution>>,
    next_seq: u64,
}

impl LatencyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, order_id: i64, submitted_ms: i64, due_ms: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledExecution {
            due_ms,
            seq,
            order_id,
            submitted_ms,
        }));
    }

    /// Remove and return everything due at or before `now_ms`, in
    /// (due, submission) order.
    pub fn pop_due(&mut self, now_ms: i64) -> Vec<ScheduledExecution> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.due_ms > now_ms {
                break;
            }
            due.push(self.heap.pop().unwrap().0);
        }
        due
    }

    pub fn snapshot(&self) -> Vec<ScheduledExecution> {
        let mut entries: Vec<_> = self.heap.iter().map(|Reverse(e)| *e).collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Background dispatcher: ticks, releases due orders, exits on the
/// shutdown signal. Fatal engine errors stop the task and leave the
/// queue paused for an operator.
pub async fn run_dispatcher(
    engine: Arc<ExecutionEngine>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    info!("latency dispatcher started (tick {:?})", tick);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.dispatch_due().await {
                    Ok(0) => {}
                    Ok(n) => debug!("dispatcher released {n} orders"),
                    Err(err) => {
                        error!("dispatcher paused on fatal error: {err}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("latency dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_orders_by_time_then_seq() {
        let mut queue = LatencyQueue::new();
        queue.push(1, 0, 500);
        queue.push(2, 0, 300);
        queue.push(3, 0, 500); // same due as order 1, submitted later

        assert!(queue.pop_due(100).is_empty());

        let due = queue.pop_due(600);
        let ids: Vec<_> = due.iter().map(|e| e.order_id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_due_leaves_future_entries() {
        let mut queue = LatencyQueue::new();
        queue.push(1, 0, 100);
        queue.push(2, 0, 1000);
        let due = queue.pop_due(100);
        assert_eq!(due.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_progress_math() {
        let entry = ScheduledExecution {
            due_ms: 1500,
            seq: 0,
            order_id: 9,
            submitted_ms: 1000,
        };
        let p = entry.progress_at(1100);
        assert_eq!(p.elapsed_ms, 100);
        assert_eq!(p.remaining_ms, 400);
        approx::assert_relative_eq!(p.progress_pct, 20.0);

        // Clamped past the due time.
        let p = entry.progress_at(2000);
        assert_eq!(p.remaining_ms, 0);
        assert_eq!(p.progress_pct, 100.0);
    }
}
