use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DroverError, Result};
use crate::eval::{EvalStatus, Evaluation};

/// Baseline dwell before a nacked evaluation re-enters the ready queue.
const NACK_BASELINE: Duration = Duration::from_millis(20);

/// Upper bound on the nack dwell.
const NACK_LIMIT: Duration = Duration::from_secs(1);

fn nack_dwell(delivery_count: u32) -> Duration {
    let exp = 1u32 << delivery_count.min(10);
    std::cmp::min(NACK_BASELINE * exp, NACK_LIMIT)
}

/// Leader-only evaluation broker.
///
/// Pending evaluations are queued per scheduler class, highest priority
/// first and FIFO within a priority. A dequeued evaluation is exclusive:
/// it stays unacked under a receipt token until the worker acks, nacks,
/// or the visibility timer fires. All state sits behind one mutex;
/// blocked dequeuers are woken through a watch channel.
#[derive(Clone)]
pub struct EvalBroker {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<BrokerInner>,
    wake: watch::Sender<u64>,
    visibility_timeout: Duration,
    delivery_limit: u32,
}

struct BrokerInner {
    enabled: bool,
    /// Bumped on every enable/disable. Timers from an older generation
    /// find their work already resolved and do nothing.
    generation: u64,
    seq: u64,
    ready: HashMap<String, BinaryHeap<PendingEval>>,
    ready_ids: HashSet<Uuid>,
    unacked: HashMap<Uuid, UnackedEval>,
    dwelling: HashMap<Uuid, DwellingEval>,
    deferred: HashMap<Uuid, Evaluation>,
    failed: Vec<Evaluation>,
}

struct UnackedEval {
    eval: Evaluation,
    receipt: Uuid,
    timer: AbortHandle,
}

struct DwellingEval {
    eval: Evaluation,
    timer: AbortHandle,
}

struct PendingEval {
    seq: u64,
    eval: Evaluation,
}

impl PartialEq for PendingEval {
    fn eq(&self, other: &Self) -> bool {
        self.eval.priority == other.eval.priority && self.seq == other.seq
    }
}

impl Eq for PendingEval {}

impl PartialOrd for PendingEval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEval {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, lower sequence breaks ties.
        self.eval
            .priority
            .cmp(&other.eval.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    pub total_ready: usize,
    pub total_unacked: usize,
    pub total_waiting: usize,
    pub by_class: HashMap<String, usize>,
}

impl EvalBroker {
    pub fn new(visibility_timeout: Duration, delivery_limit: u32) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(BrokerInner {
                    enabled: false,
                    generation: 0,
                    seq: 0,
                    ready: HashMap::new(),
                    ready_ids: HashSet::new(),
                    unacked: HashMap::new(),
                    dwelling: HashMap::new(),
                    deferred: HashMap::new(),
                    failed: Vec::new(),
                }),
                wake,
                visibility_timeout,
                delivery_limit,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.shared.inner.lock().unwrap().enabled
    }

    /// Gate the broker on leadership.
    ///
    /// Disabling is synchronous: before it returns, every unacked and
    /// dwelling evaluation is back in pending with its receipt and timer
    /// invalidated, and every blocked dequeuer has been woken to resolve
    /// with `None`. No evaluation is lost across a disable/enable cycle.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.enabled == enabled {
                return;
            }
            inner.enabled = enabled;
            inner.generation += 1;
            if !enabled {
                let unacked: Vec<UnackedEval> =
                    inner.unacked.drain().map(|(_, u)| u).collect();
                for u in unacked {
                    u.timer.abort();
                    let eval = Self::merge_deferred(&mut inner, u.eval);
                    Self::push_ready(&mut inner, eval);
                }
                let dwelling: Vec<DwellingEval> =
                    inner.dwelling.drain().map(|(_, d)| d).collect();
                for d in dwelling {
                    d.timer.abort();
                    let eval = Self::merge_deferred(&mut inner, d.eval);
                    Self::push_ready(&mut inner, eval);
                }
            }
        }
        self.wake_waiters();
    }

    /// Place an evaluation in the pending queue for its class.
    ///
    /// Idempotent by id: an evaluation already pending is a no-op, and a
    /// re-enqueue of an in-flight evaluation is deferred until that
    /// delivery resolves.
    pub fn enqueue(&self, eval: Evaluation) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.enabled {
                return Err(DroverError::EnqueueDisabled);
            }
            if inner.ready_ids.contains(&eval.id) {
                return Ok(());
            }
            if inner.unacked.contains_key(&eval.id) || inner.dwelling.contains_key(&eval.id) {
                inner.deferred.insert(eval.id, eval);
                return Ok(());
            }
            Self::push_ready(&mut inner, eval);
        }
        self.wake_waiters();
        Ok(())
    }

    /// Block up to `timeout` for a pending evaluation in any of the given
    /// classes. Across classes the head with the highest priority wins,
    /// ties going to the longest-waiting class. Returns the evaluation
    /// and the receipt required to ack or nack it.
    pub async fn dequeue(
        &self,
        classes: &[String],
        timeout: Duration,
    ) -> Result<Option<(Evaluation, Uuid)>> {
        let deadline = Instant::now() + timeout;
        let mut wake_rx = self.shared.wake.subscribe();
        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if !inner.enabled {
                    return Ok(None);
                }
                if let Some(delivery) = self.deliver(&mut inner, classes) {
                    return Ok(Some(delivery));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match tokio::time::timeout(deadline - now, wake_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Broker dropped or deadline reached.
                Ok(Err(_)) | Err(_) => return Ok(None),
            }
        }
    }

    /// Mark the evaluation complete and discard it, returning whether
    /// this call resolved the delivery. A receipt mismatch means a stale
    /// worker and is a no-op.
    pub fn ack(&self, eval_id: Uuid, receipt: Uuid) -> Result<bool> {
        let woke = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.enabled {
                return Err(DroverError::EnqueueDisabled);
            }
            if Self::take_unacked(&mut inner, eval_id, receipt).is_none() {
                return Ok(false);
            }
            tracing::debug!(eval_id = %eval_id, "Evaluation acked");
            if let Some(next) = inner.deferred.remove(&eval_id) {
                Self::push_ready(&mut inner, next);
                true
            } else {
                false
            }
        };
        if woke {
            self.wake_waiters();
        }
        Ok(true)
    }

    /// Return the evaluation to pending with an exponential dwell, or
    /// mark it failed above the delivery limit. A receipt mismatch is a
    /// no-op.
    pub fn nack(&self, eval_id: Uuid, receipt: Uuid) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.enabled {
            return Err(DroverError::EnqueueDisabled);
        }
        let Some(un) = Self::take_unacked(&mut inner, eval_id, receipt) else {
            return Ok(());
        };
        tracing::debug!(eval_id = %eval_id, deliveries = un.eval.delivery_count, "Evaluation nacked");
        let eval = Self::merge_deferred(&mut inner, un.eval);
        self.requeue(&mut inner, eval);
        Ok(())
    }

    pub fn stats(&self) -> BrokerStats {
        let inner = self.shared.inner.lock().unwrap();
        BrokerStats {
            total_ready: inner.ready_ids.len(),
            total_unacked: inner.unacked.len(),
            total_waiting: inner.dwelling.len(),
            by_class: inner
                .ready
                .iter()
                .map(|(class, heap)| (class.clone(), heap.len()))
                .collect(),
        }
    }

    /// Evaluations that exceeded the delivery limit, retained for
    /// out-of-band inspection.
    pub fn failed_evals(&self) -> Vec<Evaluation> {
        self.shared.inner.lock().unwrap().failed.clone()
    }

    fn wake_waiters(&self) {
        self.shared.wake.send_modify(|v| *v += 1);
    }

    /// The newest version wins when a re-enqueue was deferred behind
    /// this delivery; the in-flight delivery count is preserved.
    fn merge_deferred(inner: &mut BrokerInner, eval: Evaluation) -> Evaluation {
        match inner.deferred.remove(&eval.id) {
            Some(mut next) => {
                next.delivery_count = eval.delivery_count;
                next
            }
            None => eval,
        }
    }

    fn push_ready(inner: &mut BrokerInner, mut eval: Evaluation) {
        eval.status = EvalStatus::Pending;
        inner.seq += 1;
        let seq = inner.seq;
        inner.ready_ids.insert(eval.id);
        inner
            .ready
            .entry(eval.eval_type.clone())
            .or_default()
            .push(PendingEval { seq, eval });
    }

    fn take_unacked(
        inner: &mut BrokerInner,
        eval_id: Uuid,
        receipt: Uuid,
    ) -> Option<UnackedEval> {
        match inner.unacked.get(&eval_id) {
            Some(u) if u.receipt == receipt => {
                let u = inner.unacked.remove(&eval_id).unwrap();
                u.timer.abort();
                Some(u)
            }
            _ => None,
        }
    }

    fn deliver(
        &self,
        inner: &mut BrokerInner,
        classes: &[String],
    ) -> Option<(Evaluation, Uuid)> {
        let mut best: Option<(&String, i32, u64)> = None;
        for class in classes {
            let Some(head) = inner.ready.get(class).and_then(|h| h.peek()) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((_, priority, seq)) => {
                    head.eval.priority > priority
                        || (head.eval.priority == priority && head.seq < seq)
                }
            };
            if better {
                best = Some((class, head.eval.priority, head.seq));
            }
        }
        let class = best?.0.clone();
        let mut pending = inner.ready.get_mut(&class).unwrap().pop().unwrap();
        inner.ready_ids.remove(&pending.eval.id);

        pending.eval.delivery_count += 1;
        pending.eval.status = EvalStatus::Unacked;
        let receipt = Uuid::new_v4();
        let timer = self.spawn_visibility_timer(pending.eval.id, receipt);
        inner.unacked.insert(
            pending.eval.id,
            UnackedEval {
                eval: pending.eval.clone(),
                receipt,
                timer,
            },
        );
        Some((pending.eval, receipt))
    }

    fn spawn_visibility_timer(&self, eval_id: Uuid, receipt: Uuid) -> AbortHandle {
        let broker = self.clone();
        let timeout = self.shared.visibility_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!(eval_id = %eval_id, "Visibility timeout expired, nacking on worker's behalf");
            let _ = broker.nack(eval_id, receipt);
        })
        .abort_handle()
    }

    fn requeue(&self, inner: &mut BrokerInner, mut eval: Evaluation) {
        if eval.delivery_count >= self.shared.delivery_limit {
            eval.status = EvalStatus::Failed;
            tracing::warn!(
                eval_id = %eval.id,
                deliveries = eval.delivery_count,
                "Evaluation exceeded delivery limit, marking failed"
            );
            inner.failed.push(eval);
            return;
        }
        eval.status = EvalStatus::Pending;
        let dwell = nack_dwell(eval.delivery_count);
        let id = eval.id;
        let generation = inner.generation;
        let broker = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            broker.finish_dwell(id, generation);
        })
        .abort_handle();
        inner.dwelling.insert(id, DwellingEval { eval, timer });
    }

    fn finish_dwell(&self, eval_id: Uuid, generation: u64) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.generation != generation {
                return;
            }
            let Some(d) = inner.dwelling.remove(&eval_id) else {
                return;
            };
            let eval = Self::merge_deferred(&mut inner, d.eval);
            Self::push_ready(&mut inner, eval);
        }
        self.wake_waiters();
    }
}
