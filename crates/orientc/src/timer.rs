use crate::machine::{Event, TimerId};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Single-shot timer capability used by the stream actor.
///
/// A fired timer is reported back as [`Event::TimerFired`] with the id it was
/// armed under. Cancelling an unknown or already fired id is a no-op.
pub trait Scheduler: Send {
    /// Arms timer `id` to fire after `delay`.
    fn schedule(&mut self, id: TimerId, delay: Duration);
    /// Disarms timer `id`.
    fn cancel(&mut self, id: TimerId);
}

/// Scheduler backed by one sleeping tokio task per timer.
#[derive(Debug)]
pub struct TokioScheduler {
    events: mpsc::UnboundedSender<Event>,
    tasks: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    /// Creates a scheduler that posts fired timers to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            tasks: HashMap::new(),
        }
    }

    /// Number of timers that have not fired or been cancelled.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, id: TimerId, delay: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trace!(timer = id.0, "timer fired");
            let _ = events.send(Event::TimerFired(id));
        });
        if let Some(old) = self.tasks.insert(id, task) {
            old.abort();
        }
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// Scheduler driven by an explicit clock, for deterministic stepping.
///
/// Time only moves when [`VirtualScheduler::advance`] is called; the ids of
/// the timers that came due are returned in deadline order.
#[derive(Debug, Default)]
pub struct VirtualScheduler {
    now: Duration,
    pending: BTreeSet<(Duration, TimerId)>,
}

impl VirtualScheduler {
    /// Creates a scheduler at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    #[must_use]
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Armed timers as `(id, remaining delay)`, soonest first.
    #[must_use]
    pub fn pending(&self) -> Vec<(TimerId, Duration)> {
        self.pending
            .iter()
            .map(|(deadline, id)| (*id, deadline.saturating_sub(self.now)))
            .collect()
    }

    /// Moves the clock forward by `by` and returns the timers that fired.
    pub fn advance(&mut self, by: Duration) -> Vec<TimerId> {
        self.now += by;
        let now = self.now;
        let due: Vec<(Duration, TimerId)> = self
            .pending
            .range(..=(now, TimerId(u64::MAX)))
            .copied()
            .collect();
        for key in &due {
            self.pending.remove(key);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule(&mut self, id: TimerId, delay: Duration) {
        self.cancel(id);
        self.pending.insert((self.now + delay, id));
    }

    fn cancel(&mut self, id: TimerId) {
        self.pending.retain(|(_, armed)| *armed != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        let start = tokio::time::Instant::now();

        scheduler.schedule(TimerId(7), Duration::from_millis(1500));

        assert_eq!(rx.recv().await, Some(Event::TimerFired(TimerId(7))));
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert!(start.elapsed() < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);

        scheduler.schedule(TimerId(1), Duration::from_millis(100));
        scheduler.schedule(TimerId(2), Duration::from_millis(200));
        scheduler.cancel(TimerId(1));

        assert_eq!(rx.recv().await, Some(Event::TimerFired(TimerId(2))));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_drop_aborts_outstanding_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);
        scheduler.schedule(TimerId(1), Duration::from_millis(100));
        assert_eq!(scheduler.armed(), 1);
        drop(scheduler);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_virtual_fires_in_deadline_order() {
        let mut scheduler = VirtualScheduler::new();
        scheduler.schedule(TimerId(1), Duration::from_millis(300));
        scheduler.schedule(TimerId(2), Duration::from_millis(100));
        scheduler.schedule(TimerId(3), Duration::from_millis(200));

        assert!(scheduler.advance(Duration::from_millis(99)).is_empty());
        assert_eq!(
            scheduler.advance(Duration::from_millis(150)),
            vec![TimerId(2), TimerId(3)]
        );
        assert_eq!(scheduler.advance(Duration::from_millis(51)), vec![TimerId(1)]);
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn test_virtual_cancel_removes_timer() {
        let mut scheduler = VirtualScheduler::new();
        scheduler.schedule(TimerId(1), Duration::from_millis(100));
        scheduler.cancel(TimerId(1));
        scheduler.cancel(TimerId(9));
        assert!(scheduler.advance(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_virtual_pending_reports_remaining_delay() {
        let mut scheduler = VirtualScheduler::new();
        scheduler.schedule(TimerId(4), Duration::from_millis(1000));
        scheduler.advance(Duration::from_millis(400));
        assert_eq!(
            scheduler.pending(),
            vec![(TimerId(4), Duration::from_millis(600))]
        );
    }
}
