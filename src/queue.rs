use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::client::RequestClient;
use crate::error::QuillError;
use crate::request::{Request, Response};

pub const DEFAULT_PRIORITY: i32 = 5;

/// Snapshot of queue accounting. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub active: usize,
    pub pending: usize,
    pub completed: u64,
    pub failed: u64,
}

type Settled = Result<Response, QuillError>;

struct WaitingRequest {
    request: Request,
    priority: i32,
    /// Monotonic admission sequence; FIFO tie-break for equal priorities.
    seq: u64,
    tx: oneshot::Sender<Settled>,
}

struct ActiveEntry {
    tx: oneshot::Sender<Settled>,
    /// Abort handle created at admission time and handed to the client, so
    /// a cancel landing before the spawned task first polls still aborts
    /// the exchange instead of letting it run against a refilled slot.
    abort: CancellationToken,
}

struct QueueState {
    active: HashMap<String, ActiveEntry>,
    waiting: Vec<WaitingRequest>,
    completed: u64,
    failed: u64,
    max_concurrent: usize,
    next_seq: u64,
}

/// Bounded-concurrency admission in front of [`RequestClient`].
///
/// At most `max_concurrent` requests run simultaneously; overflow sits in a
/// priority-ordered waiting list (higher first, ties FIFO). Every enqueued
/// request settles exactly once: with the client's Response or a classified
/// error. The queue never retries — that is entirely the client's job.
#[derive(Clone)]
pub struct RequestQueue {
    client: Arc<RequestClient>,
    state: Arc<Mutex<QueueState>>,
}

impl RequestQueue {
    pub fn new(client: Arc<RequestClient>, max_concurrent: usize) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(QueueState {
                active: HashMap::new(),
                waiting: Vec::new(),
                completed: 0,
                failed: 0,
                max_concurrent: max_concurrent.max(1),
                next_seq: 0,
            })),
        }
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        &self.client
    }

    /// Enqueue at the default priority (5).
    pub async fn enqueue(&self, request: Request) -> Settled {
        self.enqueue_with_priority(request, DEFAULT_PRIORITY).await
    }

    /// Enqueue with an explicit priority (higher = served first). Admits
    /// immediately when a slot is free, otherwise waits in line.
    pub async fn enqueue_with_priority(&self, request: Request, priority: i32) -> Settled {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if state.active.len() < state.max_concurrent {
                self.admit(&mut state, request, tx);
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiting.push(WaitingRequest {
                    request,
                    priority,
                    seq,
                    tx,
                });
                state.waiting.sort_by(waiting_order);
            }
        }

        match rx.await {
            Ok(settled) => settled,
            // The sender is only ever dropped if the queue itself is torn
            // down mid-flight.
            Err(_) => Err(QuillError::Unknown {
                details: "queue dropped the request before it settled".to_string(),
            }),
        }
    }

    /// Cancel by id. Active: abort the transport, free the slot, admit the
    /// next waiter. Waiting: reject without ever touching the transport.
    /// Unknown ids are a no-op.
    pub fn cancel(&self, id: &str) {
        let mut state = lock(&self.state);
        if let Some(entry) = state.active.remove(id) {
            entry.abort.cancel();
            let _ = entry.tx.send(Err(QuillError::Cancelled));
            self.admit_waiting(&mut state);
        } else if let Some(pos) = state.waiting.iter().position(|w| w.request.id == id) {
            let waiting = state.waiting.remove(pos);
            let _ = waiting.tx.send(Err(QuillError::Cancelled));
        }
    }

    /// Cancel everything: abort every active transport, reject every waiter.
    /// Completed/failed counters are untouched.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        for (_, entry) in state.active.drain() {
            entry.abort.cancel();
            let _ = entry.tx.send(Err(QuillError::Cancelled));
        }
        for waiting in state.waiting.drain(..) {
            let _ = waiting.tx.send(Err(QuillError::Cancelled));
        }
    }

    /// Resize the concurrency limit, admitting waiters into any new slots.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut state = lock(&self.state);
        state.max_concurrent = max_concurrent.max(1);
        self.admit_waiting(&mut state);
    }

    pub fn status(&self) -> QueueStatus {
        let state = lock(&self.state);
        QueueStatus {
            active: state.active.len(),
            pending: state.waiting.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    fn admit(&self, state: &mut QueueState, request: Request, tx: oneshot::Sender<Settled>) {
        let id = request.id.clone();
        let abort = CancellationToken::new();
        state.active.insert(
            id.clone(),
            ActiveEntry {
                tx,
                abort: abort.clone(),
            },
        );

        let queue = self.clone();
        tokio::spawn(async move {
            let result = queue.client.send_request_with_abort(&request, abort).await;
            queue.settle(&id, result);
        });
    }

    /// Fill every free slot from the waiting list, highest priority first.
    /// One admission per vacated slot is not enough — a limit raise can open
    /// several at once.
    fn admit_waiting(&self, state: &mut QueueState) {
        while state.active.len() < state.max_concurrent && !state.waiting.is_empty() {
            let next = state.waiting.remove(0);
            self.admit(state, next.request, next.tx);
        }
    }

    fn settle(&self, id: &str, result: Settled) {
        let mut state = lock(&self.state);
        if let Some(entry) = state.active.remove(id) {
            match &result {
                Ok(_) => state.completed += 1,
                Err(_) => state.failed += 1,
            }
            let _ = entry.tx.send(result);
        }
        // Entry may be gone if cancel()/clear() already rejected the caller;
        // the freed slot still needs refilling either way.
        self.admit_waiting(&mut state);
    }
}

/// Priority descending, then admission order. `sort_by` keeps the list
/// strictly deterministic even across re-sorts.
fn waiting_order(a: &WaitingRequest, b: &WaitingRequest) -> Ordering {
    b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
