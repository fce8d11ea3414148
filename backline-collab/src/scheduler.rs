//! Debounce and throttle tasks.
//!
//! [`Debouncer`] and [`Throttle`] run as small tokio tasks driven by a
//! command channel. Everything here measures time with
//! [`tokio::time::Instant`], so it follows the monotonic clock (and
//! `tokio::time::pause()` in tests).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

enum DebounceCommand<T> {
    Schedule(T),
    Cancel,
    SetQuietPeriod(Duration),
    Flush,
    Shutdown,
}

/// Trailing-edge debouncer.
///
/// Every [`schedule`](Self::schedule) replaces the pending batch and
/// restarts the quiet period. When the quiet period elapses without a new
/// schedule, the latest batch is emitted exactly once on the output
/// receiver.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<DebounceCommand<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn spawn(quiet_period: Duration) -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_debounce(quiet_period, rx, out_tx));
        (Self { tx, task }, out_rx)
    }

    pub fn schedule(&self, batch: T) {
        let _ = self.tx.send(DebounceCommand::Schedule(batch));
    }

    /// Drop the pending batch, if any.
    pub fn cancel(&self) {
        let _ = self.tx.send(DebounceCommand::Cancel);
    }

    /// Applies to schedules issued after this call; an armed deadline keeps
    /// its expiry.
    pub fn set_quiet_period(&self, quiet_period: Duration) {
        let _ = self.tx.send(DebounceCommand::SetQuietPeriod(quiet_period));
    }

    /// Emit the pending batch now.
    pub fn flush(&self) {
        let _ = self.tx.send(DebounceCommand::Flush);
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(DebounceCommand::Shutdown);
        let _ = self.task.await;
    }
}

async fn run_debounce<T>(
    mut quiet_period: Duration,
    mut rx: mpsc::UnboundedReceiver<DebounceCommand<T>>,
    out: mpsc::UnboundedSender<T>,
) {
    let mut pending: Option<(T, Instant)> = None;

    loop {
        let deadline = pending.as_ref().map(|(_, at)| *at);

        tokio::select! {
            biased;

            cmd = rx.recv() => match cmd {
                Some(DebounceCommand::Schedule(batch)) => {
                    pending = Some((batch, Instant::now() + quiet_period));
                }
                Some(DebounceCommand::Cancel) => {
                    pending = None;
                }
                Some(DebounceCommand::SetQuietPeriod(period)) => {
                    quiet_period = period;
                }
                Some(DebounceCommand::Flush) => {
                    if let Some((batch, _)) = pending.take() {
                        if out.send(batch).is_err() {
                            break;
                        }
                    }
                }
                Some(DebounceCommand::Shutdown) | None => break,
            },

            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((batch, _)) = pending.take() {
                    if out.send(batch).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Leading-edge rate gate with trailing coalescing, without a task.
///
/// [`offer`](Self::offer) returns the value when it may go out now;
/// otherwise it becomes the pending value and [`due`](Self::due) releases
/// it once [`deadline`](Self::deadline) has passed. Owners that already
/// run a select loop drive it directly; [`Throttle`] wraps it in a task.
#[derive(Debug)]
pub struct TrailingGate<T> {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<T>,
}

impl<T> TrailingGate<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
        }
    }

    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        match self.last_sent {
            Some(at) if now < at + self.interval => {
                self.pending = Some(value);
                None
            }
            _ => {
                self.pending = None;
                self.last_sent = Some(now);
                Some(value)
            }
        }
    }

    /// When the pending value may be released, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.pending, self.last_sent) {
            (Some(_), Some(at)) => Some(at + self.interval),
            (Some(_), None) => Some(Instant::now()),
            _ => None,
        }
    }

    pub fn due(&mut self, now: Instant) -> Option<T> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.last_sent = Some(now);
        self.pending.take()
    }

    /// Record an out-of-band send and drop anything pending.
    pub fn sent_now(&mut self, now: Instant) {
        self.pending = None;
        self.last_sent = Some(now);
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

enum ThrottleCommand<T> {
    Send(T),
    Immediate(T),
    Shutdown,
}

/// [`TrailingGate`] running as a task.
///
/// The first value in an interval goes out at once; later values in the
/// same interval collapse into one, sent when the interval ends.
pub struct Throttle<T> {
    tx: mpsc::UnboundedSender<ThrottleCommand<T>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Throttle<T> {
    pub fn spawn(interval: Duration) -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_throttle(TrailingGate::new(interval), rx, out_tx));
        (Self { tx, task }, out_rx)
    }

    pub fn send(&self, value: T) {
        let _ = self.tx.send(ThrottleCommand::Send(value));
    }

    /// Emit `value` now and discard anything pending.
    pub fn send_now(&self, value: T) {
        let _ = self.tx.send(ThrottleCommand::Immediate(value));
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(ThrottleCommand::Shutdown);
        let _ = self.task.await;
    }
}

async fn run_throttle<T>(
    mut gate: TrailingGate<T>,
    mut rx: mpsc::UnboundedReceiver<ThrottleCommand<T>>,
    out: mpsc::UnboundedSender<T>,
) {
    loop {
        let deadline = gate.deadline();

        let ready = tokio::select! {
            biased;

            cmd = rx.recv() => match cmd {
                Some(ThrottleCommand::Send(value)) => gate.offer(value, Instant::now()),
                Some(ThrottleCommand::Immediate(value)) => {
                    gate.sent_now(Instant::now());
                    Some(value)
                }
                Some(ThrottleCommand::Shutdown) | None => break,
            },

            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                gate.due(Instant::now())
            }
        };

        if let Some(value) = ready {
            if out.send(value).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_debounce_emits_latest_once() {
        let (debouncer, mut out) = Debouncer::spawn(Duration::from_millis(1500));

        for i in 0..5 {
            debouncer.schedule(i);
            time::sleep(Duration::from_millis(200)).await;
        }
        time::sleep(Duration::from_millis(1400)).await;

        assert_eq!(out.recv().await, Some(4));
        time::sleep(Duration::from_secs(5)).await;
        assert!(out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_resets_on_schedule() {
        let (debouncer, mut out) = Debouncer::spawn(Duration::from_millis(100));
        debouncer.schedule("a");
        time::sleep(Duration::from_millis(90)).await;
        debouncer.schedule("b");
        time::sleep(Duration::from_millis(90)).await;
        assert!(out.try_recv().is_err());
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(out.recv().await, Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards() {
        let (debouncer, mut out) = Debouncer::spawn(Duration::from_millis(100));
        debouncer.schedule(1);
        debouncer.cancel();
        time::sleep(Duration::from_millis(500)).await;
        assert!(out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_change_keeps_armed_deadline() {
        let (debouncer, mut out) = Debouncer::spawn(Duration::from_millis(100));
        debouncer.schedule(1);
        debouncer.set_quiet_period(Duration::from_millis(1000));
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(out.try_recv().ok(), Some(1));

        debouncer.schedule(2);
        time::sleep(Duration::from_millis(500)).await;
        assert!(out.try_recv().is_err());
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(out.try_recv().ok(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_emits_immediately() {
        let (debouncer, mut out) = Debouncer::spawn(Duration::from_secs(60));
        debouncer.schedule("now");
        debouncer.flush();
        assert_eq!(out.recv().await, Some("now"));
        debouncer.flush();
        time::sleep(Duration::from_secs(120)).await;
        assert!(out.try_recv().is_err());
        debouncer.shutdown().await;
    }

    #[test]
    fn test_gate_releases_latest_after_interval() {
        let mut gate = TrailingGate::new(Duration::from_millis(100));
        let t0 = Instant::now();

        assert_eq!(gate.offer("a", t0), Some("a"));
        assert_eq!(gate.offer("b", t0 + Duration::from_millis(10)), None);
        assert_eq!(gate.offer("c", t0 + Duration::from_millis(20)), None);
        assert_eq!(gate.deadline(), Some(t0 + Duration::from_millis(100)));

        assert_eq!(gate.due(t0 + Duration::from_millis(50)), None);
        assert_eq!(gate.due(t0 + Duration::from_millis(100)), Some("c"));
        assert!(!gate.has_pending());
        assert_eq!(gate.deadline(), None);
    }

    #[test]
    fn test_gate_cancel_and_out_of_band() {
        let mut gate = TrailingGate::new(Duration::from_millis(100));
        let t0 = Instant::now();
        gate.offer(1, t0);
        gate.offer(2, t0);
        gate.cancel();
        assert_eq!(gate.due(t0 + Duration::from_secs(1)), None);

        gate.offer(3, t0 + Duration::from_secs(1));
        gate.sent_now(t0 + Duration::from_secs(1));
        assert!(!gate.has_pending());
        assert_eq!(gate.offer(4, t0 + Duration::from_millis(1050)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_leading_and_trailing() {
        let (throttle, mut out) = Throttle::spawn(Duration::from_millis(100));

        throttle.send(1);
        assert_eq!(out.recv().await, Some(1));

        throttle.send(2);
        throttle.send(3);
        throttle.send(4);
        time::sleep(Duration::from_millis(10)).await;
        assert!(out.try_recv().is_err());

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(out.try_recv().ok(), Some(4));
        assert!(out.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_send_now_bypasses() {
        let (throttle, mut out) = Throttle::spawn(Duration::from_millis(100));
        throttle.send(1);
        throttle.send(2);
        throttle.send_now(0);

        assert_eq!(out.recv().await, Some(1));
        assert_eq!(out.recv().await, Some(0));
        time::sleep(Duration::from_millis(300)).await;
        assert!(out.try_recv().is_err());
        throttle.shutdown().await;
    }
}
