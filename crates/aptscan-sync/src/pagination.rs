//! Drives a search session until it stops producing new candidates or hits a bound.

use std::collections::HashSet;
use std::time::Duration;

use aptscan_adapters::SearchSession;
use aptscan_core::ScrapedListing;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollLimits {
    pub max_candidates: usize,
    pub max_load_actions: usize,
    pub max_consecutive_empty: usize,
    pub load_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// `max_consecutive_empty` load actions in a row revealed nothing new.
    Exhausted,
    CandidateLimit,
    LoadLimit,
}

impl Termination {
    pub fn is_natural(self) -> bool {
        self == Termination::Exhausted
    }
}

#[derive(Debug, Clone)]
pub struct ScrollOutcome {
    /// Deduplicated by external id, in first-seen order.
    pub candidates: Vec<ScrapedListing>,
    pub termination: Termination,
    pub load_actions: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollDriver {
    limits: ScrollLimits,
}

impl ScrollDriver {
    pub fn new(limits: ScrollLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ScrollLimits {
        self.limits
    }

    /// Reads what the freshly opened view shows, then alternates load action and
    /// read. A failed or timed-out load is not fatal: the next read decides whether
    /// anything new appeared, and the next iteration tries again.
    pub async fn collect(&self, session: &mut dyn SearchSession) -> ScrollOutcome {
        let limits = self.limits;
        let max_empty = limits.max_consecutive_empty.max(1);
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut load_actions = 0usize;
        let mut empty_streak = 0usize;

        self.absorb_visible(session, &mut seen, &mut candidates).await;

        let termination = loop {
            if candidates.len() >= limits.max_candidates {
                break Termination::CandidateLimit;
            }
            if empty_streak >= max_empty {
                break Termination::Exhausted;
            }
            if load_actions >= limits.max_load_actions {
                break Termination::LoadLimit;
            }

            load_actions += 1;
            match tokio::time::timeout(limits.load_timeout, session.load_next()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(load_actions, error = %err, "load action failed"),
                Err(_) => warn!(load_actions, timeout = ?limits.load_timeout, "load action timed out"),
            }

            let fresh = self.absorb_visible(session, &mut seen, &mut candidates).await;
            if fresh == 0 {
                empty_streak += 1;
                debug!(load_actions, empty_streak, max_empty, "no new candidates");
            } else {
                empty_streak = 0;
                debug!(load_actions, fresh, total = candidates.len(), "new candidates");
            }
        };

        info!(
            candidates = candidates.len(),
            load_actions,
            ?termination,
            "search collection finished"
        );
        ScrollOutcome {
            candidates,
            termination,
            load_actions,
        }
    }

    /// Returns how many previously unseen candidates were added. Stops adding
    /// at `max_candidates`.
    async fn absorb_visible(
        &self,
        session: &mut dyn SearchSession,
        seen: &mut HashSet<String>,
        candidates: &mut Vec<ScrapedListing>,
    ) -> usize {
        let visible = match session.visible_candidates().await {
            Ok(visible) => visible,
            Err(err) => {
                warn!(error = %err, "reading visible candidates failed");
                return 0;
            }
        };

        let mut fresh = 0;
        for candidate in visible {
            if candidates.len() >= self.limits.max_candidates {
                break;
            }
            if seen.insert(candidate.external_id.clone()) {
                candidates.push(candidate);
                fresh += 1;
            }
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptscan_adapters::AdapterError;
    use aptscan_core::Source;
    use async_trait::async_trait;

    /// Infinite-scroll stand-in: after `loads` load actions the page shows every
    /// batch up to and including `batches[loads]`, clamped to the last batch.
    struct ScriptedSession {
        batches: Vec<Vec<&'static str>>,
        loads: usize,
        load_delay: Option<Duration>,
        failing_reads: HashSet<usize>,
    }

    impl ScriptedSession {
        fn new(batches: Vec<Vec<&'static str>>) -> Self {
            Self {
                batches,
                loads: 0,
                load_delay: None,
                failing_reads: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl SearchSession for ScriptedSession {
        async fn load_next(&mut self) -> Result<(), AdapterError> {
            self.loads += 1;
            if let Some(delay) = self.load_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn visible_candidates(&mut self) -> Result<Vec<ScrapedListing>, AdapterError> {
            if self.failing_reads.contains(&self.loads) {
                return Err(AdapterError::Message("selector timed out".into()));
            }
            let upto = self.loads.min(self.batches.len() - 1);
            Ok(self.batches[..=upto]
                .iter()
                .flatten()
                .map(|id| ScrapedListing::new(Source::Craigslist, *id, format!("https://x/{id}")))
                .collect())
        }
    }

    fn limits(max_consecutive_empty: usize) -> ScrollLimits {
        ScrollLimits {
            max_candidates: 1000,
            max_load_actions: 200,
            max_consecutive_empty,
            load_timeout: Duration::from_secs(5),
        }
    }

    fn ids(outcome: &ScrollOutcome) -> Vec<&str> {
        outcome
            .candidates
            .iter()
            .map(|c| c.external_id.as_str())
            .collect()
    }

    #[tokio::test]
    async fn stops_three_loads_after_the_source_dries_up() {
        // Loads #1..#4 each reveal one new id; nothing new after load #4.
        let mut session = ScriptedSession::new(vec![
            vec!["a"],
            vec!["b"],
            vec!["c"],
            vec!["d"],
            vec!["e"],
        ]);
        let outcome = ScrollDriver::new(limits(3)).collect(&mut session).await;

        assert_eq!(outcome.termination, Termination::Exhausted);
        assert!(outcome.termination.is_natural());
        assert_eq!(outcome.load_actions, 7);
        assert_eq!(ids(&outcome), vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn repeated_rows_are_deduplicated() {
        let mut session = ScriptedSession::new(vec![vec!["a", "b", "a"], vec!["b", "c"]]);
        let outcome = ScrollDriver::new(limits(2)).collect(&mut session).await;
        assert_eq!(ids(&outcome), vec!["a", "b", "c"]);
        assert_eq!(outcome.load_actions, 3);
    }

    #[tokio::test]
    async fn candidate_limit_truncates_exactly() {
        let mut session = ScriptedSession::new(vec![vec!["a", "b", "c"], vec!["d", "e", "f"]]);
        let outcome = ScrollDriver::new(ScrollLimits {
            max_candidates: 4,
            ..limits(3)
        })
        .collect(&mut session)
        .await;
        assert_eq!(outcome.termination, Termination::CandidateLimit);
        assert_eq!(ids(&outcome), vec!["a", "b", "c", "d"]);
        assert_eq!(outcome.load_actions, 1);
    }

    #[tokio::test]
    async fn load_limit_bounds_an_endless_source() {
        let batches = (0..100)
            .map(|i| vec![Box::leak(format!("id-{i}").into_boxed_str()) as &'static str])
            .collect();
        let mut session = ScriptedSession::new(batches);
        let outcome = ScrollDriver::new(ScrollLimits {
            max_load_actions: 10,
            ..limits(3)
        })
        .collect(&mut session)
        .await;
        assert_eq!(outcome.termination, Termination::LoadLimit);
        assert!(!outcome.termination.is_natural());
        assert_eq!(outcome.load_actions, 10);
        assert_eq!(outcome.candidates.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_loads_do_not_abort_collection() {
        let mut session = ScriptedSession::new(vec![vec!["a"], vec!["b"]]);
        session.load_delay = Some(Duration::from_secs(60));
        let outcome = ScrollDriver::new(limits(2)).collect(&mut session).await;

        // The load counter still advances inside the fake before the timeout fires,
        // so "b" shows up on the first read after load #1.
        assert_eq!(ids(&outcome), vec!["a", "b"]);
        assert_eq!(outcome.termination, Termination::Exhausted);
        assert_eq!(outcome.load_actions, 3);
    }

    #[tokio::test]
    async fn failed_reads_count_as_empty_cycles() {
        let mut session = ScriptedSession::new(vec![vec!["a"], vec!["b"], vec!["c"]]);
        session.failing_reads = [1, 2].into_iter().collect();
        let outcome = ScrollDriver::new(limits(2)).collect(&mut session).await;
        assert_eq!(outcome.termination, Termination::Exhausted);
        assert_eq!(ids(&outcome), vec!["a"]);
        assert_eq!(outcome.load_actions, 2);
    }
}
