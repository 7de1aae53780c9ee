use heapless::Vec;
use std::time::{Duration, Instant};

const MAX_DEFERRED_EVENTS: usize = 8;

/// An event to post once `due` has passed, valid only while the machine
/// is still in `armed_in`.
#[derive(Debug, Clone, Copy)]
pub struct DeferredEvent<S, E> {
    pub event: E,
    pub due: Instant,
    pub armed_in: S,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u32,
    pub total_fired: u32,
    pub total_cancelled: u32,
    pub currently_scheduled: u8,
}

/// Deferred events keyed to the state that armed them.
///
/// Replaces fire-and-forget timer threads: the owner polls
/// [`EventScheduler::take_due`] under the same lock that guards the state
/// machine, and leaving the arming state cancels the event, so a delayed
/// event can never land in a state it was not meant for.
#[derive(Debug)]
pub struct EventScheduler<S, E> {
    pending: Vec<DeferredEvent<S, E>, MAX_DEFERRED_EVENTS>,
    stats: SchedulerStats,
}

impl<S, E> EventScheduler<S, E>
where
    S: Copy + PartialEq,
    E: Copy + PartialEq,
{
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Arm `event` to fire at `due` while in `armed_in`. An identical
    /// pending (event, state) pair is re-armed rather than duplicated.
    pub fn schedule(&mut self, event: E, due: Instant, armed_in: S) -> Result<(), &'static str> {
        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|d| d.event == event && d.armed_in == armed_in)
        {
            existing.due = due;
            self.pending.sort_unstable_by_key(|d| d.due);
            return Ok(());
        }

        self.pending
            .push(DeferredEvent { event, due, armed_in })
            .map_err(|_| "Scheduler queue full")?;

        // Keep chronological order
        self.pending.sort_unstable_by_key(|d| d.due);

        self.stats.total_scheduled += 1;
        self.stats.currently_scheduled = self.pending.len() as u8;
        Ok(())
    }

    /// Drop everything armed in `state`. Returns how many were cancelled.
    pub fn cancel_armed_in(&mut self, state: S) -> usize {
        let before = self.pending.len();
        self.pending.retain(|d| d.armed_in != state);
        let cancelled = before - self.pending.len();

        self.stats.total_cancelled += cancelled as u32;
        self.stats.currently_scheduled = self.pending.len() as u8;
        cancelled
    }

    /// Remove and return the events due at `now`. Due events armed in a
    /// state other than `current` are discarded as cancelled.
    pub fn take_due(&mut self, now: Instant, current: S) -> Vec<E, MAX_DEFERRED_EVENTS> {
        let mut ready = Vec::new();
        let mut kept = Vec::<DeferredEvent<S, E>, MAX_DEFERRED_EVENTS>::new();

        for deferred in self.pending.iter().copied() {
            if deferred.due > now {
                let _ = kept.push(deferred);
            } else if deferred.armed_in == current {
                let _ = ready.push(deferred.event);
                self.stats.total_fired += 1;
            } else {
                self.stats.total_cancelled += 1;
            }
        }

        self.pending = kept;
        self.stats.currently_scheduled = self.pending.len() as u8;
        ready
    }

    pub fn pending(&self) -> &[DeferredEvent<S, E>] {
        &self.pending
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

impl<S, E> Default for EventScheduler<S, E>
where
    S: Copy + PartialEq,
    E: Copy + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute-deadline periodic schedule.
///
/// Each deadline is the previous deadline plus the period, never "now plus
/// period", so time spent between ticks does not accumulate as drift.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineTicker {
    start: Instant,
    next: Instant,
    period: Duration,
    ticks: u64,
}

impl DeadlineTicker {
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            next: start,
            period,
            ticks: 0,
        }
    }

    /// Advance to the next deadline and return it.
    pub fn advance(&mut self) -> Instant {
        self.ticks += 1;
        self.next += self.period;
        self.next
    }

    /// How long to wait from `now` until the current deadline, or `None` if
    /// the deadline has already passed.
    pub fn wait_from(&self, now: Instant) -> Option<Duration> {
        self.next.checked_duration_since(now).filter(|d| !d.is_zero())
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn start(&self) -> Instant {
        self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Priming,
        Running,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Ev {
        Primed,
        Check,
    }

    #[test]
    fn test_event_fires_only_when_due() {
        let mut scheduler = EventScheduler::new();
        let t0 = Instant::now();
        scheduler
            .schedule(Ev::Primed, t0 + Duration::from_secs(2), Mode::Priming)
            .unwrap();

        assert!(scheduler.take_due(t0, Mode::Priming).is_empty());
        assert_eq!(scheduler.pending().len(), 1);

        let ready = scheduler.take_due(t0 + Duration::from_secs(2), Mode::Priming);
        assert_eq!(ready.as_slice(), &[Ev::Primed]);
        assert!(scheduler.pending().is_empty());
        assert_eq!(scheduler.get_stats().total_fired, 1);
    }

    #[test]
    fn test_event_discarded_after_state_change() {
        let mut scheduler = EventScheduler::new();
        let t0 = Instant::now();
        scheduler
            .schedule(Ev::Primed, t0 + Duration::from_millis(10), Mode::Priming)
            .unwrap();

        let ready = scheduler.take_due(t0 + Duration::from_secs(1), Mode::Running);
        assert!(ready.is_empty());
        assert_eq!(scheduler.get_stats().total_cancelled, 1);
    }

    #[test]
    fn test_cancel_armed_in() {
        let mut scheduler = EventScheduler::new();
        let t0 = Instant::now();
        scheduler.schedule(Ev::Primed, t0, Mode::Priming).unwrap();
        scheduler.schedule(Ev::Check, t0, Mode::Running).unwrap();

        assert_eq!(scheduler.cancel_armed_in(Mode::Priming), 1);
        assert_eq!(scheduler.take_due(t0, Mode::Running).as_slice(), &[Ev::Check]);
    }

    #[test]
    fn test_rescheduling_same_event_rearms() {
        let mut scheduler = EventScheduler::new();
        let t0 = Instant::now();
        scheduler.schedule(Ev::Primed, t0, Mode::Priming).unwrap();
        scheduler
            .schedule(Ev::Primed, t0 + Duration::from_secs(5), Mode::Priming)
            .unwrap();

        assert_eq!(scheduler.pending().len(), 1);
        assert!(scheduler.take_due(t0, Mode::Priming).is_empty());
        assert_eq!(scheduler.pending()[0].due, t0 + Duration::from_secs(5));
    }

    #[test]
    fn test_ticker_has_no_drift() {
        let t0 = Instant::now();
        let period = Duration::from_millis(100);
        let mut ticker = DeadlineTicker::new(t0, period);

        for _ in 0..50 {
            ticker.advance();
        }

        assert_eq!(ticker.deadline(), t0 + period * 50);
        assert_eq!(ticker.ticks(), 50);
    }

    #[test]
    fn test_ticker_reports_overrun() {
        let t0 = Instant::now();
        let mut ticker = DeadlineTicker::new(t0, Duration::from_millis(100));
        ticker.advance();

        assert_eq!(ticker.wait_from(t0), Some(Duration::from_millis(100)));
        assert_eq!(ticker.wait_from(t0 + Duration::from_millis(150)), None);
    }
}
