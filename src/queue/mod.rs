//! # Priority Queue
//!
//! Bounded in-memory priority queue: FIFO within equal priority, lower
//! numeric priority dequeued first. Uses a query-state lifecycle plus a
//! take-then-release-then-dispatch scheduler shape, where the scheduler
//! never holds the queue's lock while launching execution.

use crate::common::{BoundedFifoMap, QueryId, TenantId, WorkflowMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Queued,
    Executing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: QueryId,
    pub raw_query: String,
    pub tenant_id: TenantId,
    pub workflow_mode: WorkflowMode,
    pub priority: u8,
    pub state: QueueState,
    pub submitted_at: Instant,
    pub dequeued_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub row_count: Option<u64>,
    pub error: Option<String>,
}

impl QueueItem {
    pub fn new(
        raw_query: String,
        tenant_id: TenantId,
        workflow_mode: WorkflowMode,
        priority: u8,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            raw_query,
            tenant_id,
            workflow_mode,
            priority: priority.min(9),
            state: QueueState::Queued,
            submitted_at: Instant::now(),
            dequeued_at: None,
            completed_at: None,
            row_count: None,
            error: None,
        }
    }
}

/// Heap entry ordered so that `BinaryHeap` (a max-heap) pops the
/// lowest-priority-number, earliest-submitted item first.
struct HeapEntry {
    priority: u8,
    submitted_at: Instant,
    item: QueueItem,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submitted_at == other.submitted_at
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse priority (lower number = higher urgency = "greater" in
        // the max-heap) and reverse submission time (earlier = "greater").
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub average_wait_ms: f64,
    pub average_execution_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EmergencyStopResult {
    pub cancelled_executing: usize,
    pub cancelled_queued: usize,
}

const ROLLING_WINDOW: usize = 50;
const MIN_ESTIMATED_WAIT_MS: u64 = 100;
const COMPLETED_CAPACITY: usize = 100;

pub struct PriorityQueue {
    max_queue_size: usize,
    max_concurrent: usize,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    executing: Mutex<HashMap<QueryId, QueueItem>>,
    completed: Mutex<BoundedFifoMap<QueryId, QueueItem>>,
    in_flight: AtomicUsize,
    wait_samples: Mutex<VecDeque<f64>>,
    exec_samples: Mutex<VecDeque<f64>>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new(max_queue_size: usize, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_queue_size,
            max_concurrent,
            heap: Mutex::new(BinaryHeap::new()),
            executing: Mutex::new(HashMap::new()),
            completed: Mutex::new(BoundedFifoMap::new(COMPLETED_CAPACITY)),
            in_flight: AtomicUsize::new(0),
            wait_samples: Mutex::new(VecDeque::new()),
            exec_samples: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub fn in_flight_counter(&self) -> &AtomicUsize {
        &self.in_flight
    }

    /// Returns `(queryId, estimatedWaitMs)` or `QueueFull`.
    pub fn enqueue(&self, item: QueueItem) -> Result<(QueryId, u64), ()> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.max_queue_size {
            return Err(());
        }
        let id = item.id;
        let position = heap.len();
        heap.push(HeapEntry {
            priority: item.priority,
            submitted_at: item.submitted_at,
            item,
        });
        drop(heap);
        self.notify.notify_waiters();
        Ok((id, self.estimate_wait_for_position(position)))
    }

    /// Blocks until an item is available AND `in_flight < max_concurrent`,
    /// then transitions it to `executing` and returns it. The caller
    /// dispatches the actual work after this returns; the queue's lock is
    /// never held across dispatch.
    pub async fn dequeue(&self) -> QueueItem {
        loop {
            if self.in_flight.load(Ordering::Acquire) < self.max_concurrent {
                let mut heap = self.heap.lock();
                if let Some(mut entry) = heap.pop() {
                    entry.item.state = QueueState::Executing;
                    entry.item.dequeued_at = Some(Instant::now());
                    let wait_ms = entry
                        .item
                        .dequeued_at
                        .unwrap()
                        .saturating_duration_since(entry.item.submitted_at)
                        .as_millis() as f64;
                    drop(heap);
                    self.record_wait(wait_ms);
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    self.executing.lock().insert(entry.item.id, entry.item.clone());
                    return entry.item;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Transitions an executing item to a terminal state.
    pub fn complete(&self, id: QueryId, state: QueueState, row_count: Option<u64>, error: Option<String>) {
        let mut item = match self.executing.lock().remove(&id) {
            Some(i) => i,
            None => return,
        };
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        item.state = state;
        item.completed_at = Some(Instant::now());
        item.row_count = row_count;
        item.error = error;

        if let (Some(dequeued), Some(completed)) = (item.dequeued_at, item.completed_at) {
            let exec_ms = completed.saturating_duration_since(dequeued).as_millis() as f64;
            self.record_exec(exec_ms);
        }

        self.completed.lock().insert(id, item);
        self.notify.notify_waiters();
    }

    /// Cancels a queued or executing item. Returns true if found.
    /// Cancelling an executing item only marks the intent here; the
    /// orchestrator is responsible for triggering the execution's
    /// cancellation token.
    pub fn cancel(&self, id: QueryId) -> bool {
        let mut heap = self.heap.lock();
        let original_len = heap.len();
        let remaining: Vec<HeapEntry> = heap.drain().filter(|e| e.item.id != id).collect();
        let found_in_heap = remaining.len() != original_len;
        *heap = remaining.into_iter().collect();
        drop(heap);

        if found_in_heap {
            let mut item = QueueItem::new(String::new(), String::new(), WorkflowMode::Audit, 0);
            item.id = id;
            item.state = QueueState::Cancelled;
            item.completed_at = Some(Instant::now());
            self.completed.lock().insert(id, item);
            return true;
        }
        if self.executing.lock().contains_key(&id) {
            return true;
        }
        false
    }

    pub fn estimate_wait(&self, id: QueryId) -> Option<u64> {
        let heap = self.heap.lock();
        let mut position = 0usize;
        for entry in heap.iter() {
            if entry.item.id == id {
                return Some(self.estimate_wait_for_position(position));
            }
            position += 1;
        }
        None
    }

    fn estimate_wait_for_position(&self, position: usize) -> u64 {
        let available_slots = self
            .max_concurrent
            .saturating_sub(self.in_flight.load(Ordering::Acquire));
        let effective_position = position.saturating_sub(available_slots);
        let avg_exec = self.average_execution_ms();
        let estimate = (effective_position as f64) * (avg_exec / self.max_concurrent as f64);
        (estimate as u64).max(MIN_ESTIMATED_WAIT_MS)
    }

    /// Blocks until `id` reaches a terminal state or `timeout` elapses,
    /// whichever comes first. Polls the
    /// completion notifier rather than the queue's internal lock so the
    /// scheduler is never blocked by an awaiter.
    pub async fn await_terminal(&self, id: QueryId, timeout: Duration) -> Option<QueueItem> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.completed.lock().get(&id).cloned() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.lookup(id);
            }
            let wait = remaining.min(Duration::from_millis(50));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    pub fn lookup(&self, id: QueryId) -> Option<QueueItem> {
        if let Some(item) = self.executing.lock().get(&id) {
            return Some(item.clone());
        }
        if let Some(item) = self.completed.lock().get(&id) {
            return Some(item.clone());
        }
        let heap = self.heap.lock();
        heap.iter().find(|e| e.item.id == id).map(|e| e.item.clone())
    }

    pub fn stats(&self) -> QueueStats {
        let heap = self.heap.lock();
        let executing = self.executing.lock();
        let completed = self.completed.lock();

        let mut stats = QueueStats {
            queued: heap.len(),
            executing: executing.len(),
            average_wait_ms: self.average_wait_ms(),
            average_execution_ms: self.average_execution_ms(),
            ..Default::default()
        };
        for item in completed.values() {
            match item.state {
                QueueState::Completed => stats.completed += 1,
                QueueState::Failed => stats.failed += 1,
                QueueState::Timeout => stats.timed_out += 1,
                QueueState::Cancelled => stats.cancelled += 1,
                _ => {}
            }
        }
        stats
    }

    /// Cancels all executing tokens (via the returned ids, left to the
    /// caller to trigger) and fails all queued items.
    pub fn emergency_stop(&self) -> (EmergencyStopResult, Vec<QueryId>) {
        let executing_ids: Vec<QueryId> = self.executing.lock().keys().copied().collect();
        let mut heap = self.heap.lock();
        let mut cancelled_queued = 0usize;
        while let Some(entry) = heap.pop() {
            let mut item = entry.item;
            item.state = QueueState::Failed;
            item.error = Some("system emergency stop".to_string());
            item.completed_at = Some(Instant::now());
            self.completed.lock().insert(item.id, item);
            cancelled_queued += 1;
        }
        (
            EmergencyStopResult {
                cancelled_executing: executing_ids.len(),
                cancelled_queued,
            },
            executing_ids,
        )
    }

    fn record_wait(&self, ms: f64) {
        let mut samples = self.wait_samples.lock();
        samples.push_back(ms);
        if samples.len() > ROLLING_WINDOW {
            samples.pop_front();
        }
    }

    fn record_exec(&self, ms: f64) {
        let mut samples = self.exec_samples.lock();
        samples.push_back(ms);
        if samples.len() > ROLLING_WINDOW {
            samples.pop_front();
        }
    }

    fn average_wait_ms(&self) -> f64 {
        mean(&self.wait_samples.lock())
    }

    fn average_execution_ms(&self) -> f64 {
        let avg = mean(&self.exec_samples.lock());
        if avg <= 0.0 {
            1.0
        } else {
            avg
        }
    }
}

fn mean(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn _queue_is_send_sync() {
    assert_send_sync::<PriorityQueue>();
}
