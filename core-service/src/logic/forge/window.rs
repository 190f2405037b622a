//! Forge Window
//!
//! Bounded buffer of (event, verdict) pairs. Events arrive from ingest,
//! verdicts from the evaluation workers; the two are joined on the event
//! sequence number.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::logic::engine::Verdict;
use crate::logic::telemetry::TelemetryEvent;

/// What the pipeline offers the forge queue
#[derive(Debug, Clone)]
pub enum ForgeObservation {
    Event(TelemetryEvent),
    Verdict(Verdict),
}

#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub event: TelemetryEvent,
    pub verdict: Option<Verdict>,
}

#[derive(Debug)]
pub struct ForgeWindow {
    entries: Vec<WindowEntry>,
    by_seq: HashMap<u64, usize>,
    paired: usize,
    /// Verdicts whose event was dropped before reaching the window
    orphaned: u64,
    /// Observations refused because the window was at its hard bound
    overflowed: u64,
    max_events: usize,
    max_age: Duration,
    opened_at: Instant,
}

impl ForgeWindow {
    pub fn new(max_events: usize, max_age: Duration) -> Self {
        Self {
            entries: Vec::new(),
            by_seq: HashMap::new(),
            paired: 0,
            orphaned: 0,
            overflowed: 0,
            max_events: max_events.max(1),
            max_age,
            opened_at: Instant::now(),
        }
    }

    /// Empty window with the same limits
    pub fn fresh(&self) -> Self {
        Self::new(self.max_events, self.max_age)
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn observe(&mut self, observation: ForgeObservation) {
        match observation {
            ForgeObservation::Event(event) => {
                if self.entries.len() >= self.hard_bound() {
                    self.overflowed += 1;
                    return;
                }
                if self.entries.is_empty() {
                    self.opened_at = Instant::now();
                }
                self.by_seq.insert(event.seq, self.entries.len());
                self.entries.push(WindowEntry { event, verdict: None });
            }
            ForgeObservation::Verdict(verdict) => match self.by_seq.get(&verdict.event_seq) {
                Some(&idx) => {
                    let entry = &mut self.entries[idx];
                    if entry.verdict.is_none() {
                        self.paired += 1;
                    }
                    entry.verdict = Some(verdict);
                }
                None => self.orphaned += 1,
            },
        }
    }

    /// Count threshold reached, or the oldest entry is past `max_age`
    pub fn is_ready(&self, now: Instant) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.paired >= self.max_events
            || self.entries.len() >= self.hard_bound()
            || now.saturating_duration_since(self.opened_at) >= self.max_age
    }

    /// Entries whose verdict has arrived, in arrival order
    pub fn pairs(&self) -> impl Iterator<Item = (&TelemetryEvent, &Verdict)> {
        self.entries
            .iter()
            .filter_map(|e| e.verdict.as_ref().map(|v| (&e.event, v)))
    }

    pub fn entries(&self) -> &[WindowEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paired(&self) -> usize {
        self.paired
    }

    pub fn orphaned(&self) -> u64 {
        self.orphaned
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    // late verdicts need room to land
    fn hard_bound(&self) -> usize {
        self.max_events.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::engine::Decision;

    fn event(seq: u64) -> ForgeObservation {
        ForgeObservation::Event(TelemetryEvent::new(seq, "p", "open", "/x", 0))
    }

    fn verdict(seq: u64) -> ForgeObservation {
        let mut v = Verdict::allow(seq, 0);
        v.decision = Decision::Block;
        ForgeObservation::Verdict(v)
    }

    #[test]
    fn test_pairs_join_on_sequence() {
        let mut w = ForgeWindow::new(10, Duration::from_secs(60));
        w.observe(event(1));
        w.observe(event(2));
        w.observe(verdict(2));
        w.observe(verdict(9));

        let pairs: Vec<_> = w.pairs().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.seq, 2);
        assert_eq!(w.paired(), 1);
        assert_eq!(w.orphaned(), 1);
    }

    #[test]
    fn test_ready_on_count() {
        let mut w = ForgeWindow::new(3, Duration::from_secs(3600));
        for seq in 1..=3 {
            w.observe(event(seq));
        }
        assert!(!w.is_ready(Instant::now()));
        for seq in 1..=3 {
            w.observe(verdict(seq));
        }
        assert!(w.is_ready(Instant::now()));
    }

    #[test]
    fn test_ready_on_age_only_when_non_empty() {
        let mut w = ForgeWindow::new(100, Duration::from_millis(10));
        let later = Instant::now() + Duration::from_secs(1);
        assert!(!w.is_ready(later));
        w.observe(event(1));
        assert!(w.is_ready(later));
    }

    #[test]
    fn test_hard_bound_refuses_events() {
        let mut w = ForgeWindow::new(2, Duration::from_secs(60));
        for seq in 1..=6 {
            w.observe(event(seq));
        }
        assert_eq!(w.len(), 4);
        assert_eq!(w.overflowed(), 2);
        assert!(w.is_ready(Instant::now()));
        assert!(w.fresh().is_empty());
    }
}
