//! Phase tables and state machines driving card animations.

use std::{future::Future, time::Duration};

use thiserror::Error;

use crate::clock::Clock;

/// One row of a phase table: run `phase`, hold for `hold`, continue with `next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseStep<P> {
    /// Phase to run.
    pub phase: P,
    /// Time to wait after the phase before the next one.
    pub hold: Duration,
    /// Following phase, `None` on the last row.
    pub next: Option<P>,
}

/// Steps of the first reveal of a discovered card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevealPhase {
    /// Build the replacement nodes, fully transparent.
    Render,
    /// Fade the media container in.
    ContainerFadeIn,
    /// Fade the spinner in.
    SpinnerFadeIn,
    /// Fade the new visual in.
    VisualFadeIn,
    /// Remove the placeholder and hide the loading affordance.
    Finalize,
}

impl RevealPhase {
    /// CSS transition applied by this phase.
    pub fn transition(self) -> Option<Duration> {
        match self {
            RevealPhase::ContainerFadeIn | RevealPhase::SpinnerFadeIn => Some(Duration::from_secs(1)),
            RevealPhase::VisualFadeIn => Some(Duration::from_secs(2)),
            RevealPhase::Render | RevealPhase::Finalize => None,
        }
    }
}

/// Reveal choreography: render, container, spinner, visual, then finalize.
pub const REVEAL_PHASES: &[PhaseStep<RevealPhase>] = &[
    PhaseStep {
        phase: RevealPhase::Render,
        hold: Duration::from_secs(1),
        next: Some(RevealPhase::ContainerFadeIn),
    },
    PhaseStep {
        phase: RevealPhase::ContainerFadeIn,
        hold: Duration::from_secs(1),
        next: Some(RevealPhase::SpinnerFadeIn),
    },
    PhaseStep {
        phase: RevealPhase::SpinnerFadeIn,
        hold: Duration::from_secs(2),
        next: Some(RevealPhase::VisualFadeIn),
    },
    PhaseStep {
        phase: RevealPhase::VisualFadeIn,
        hold: Duration::from_secs(2),
        next: Some(RevealPhase::Finalize),
    },
    PhaseStep {
        phase: RevealPhase::Finalize,
        hold: Duration::ZERO,
        next: None,
    },
];

/// Steps of an in-place update of a rendered card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdatePhase {
    /// Snapshot the current poster and show container and spinner.
    Prepare,
    /// Fade the current visual out.
    FadeOut,
    /// Instant blur as the loading cue.
    Blur,
    /// Assign the new source and poster.
    Load,
    /// Fade the spinner out.
    SpinnerFadeOut,
    /// Fade the visual back in and remove the blur.
    Settle,
    /// Clear the loading flag and hide the loading affordance.
    Cleanup,
}

impl UpdatePhase {
    /// CSS transition applied by this phase.
    pub fn transition(self) -> Option<Duration> {
        match self {
            UpdatePhase::Prepare | UpdatePhase::FadeOut | UpdatePhase::SpinnerFadeOut => {
                Some(Duration::from_secs(1))
            }
            UpdatePhase::Settle => Some(Duration::from_secs(2)),
            UpdatePhase::Blur | UpdatePhase::Load | UpdatePhase::Cleanup => None,
        }
    }
}

/// Update choreography for a card that is already on screen.
pub const UPDATE_PHASES: &[PhaseStep<UpdatePhase>] = &[
    PhaseStep {
        phase: UpdatePhase::Prepare,
        hold: Duration::from_secs(1),
        next: Some(UpdatePhase::FadeOut),
    },
    PhaseStep {
        phase: UpdatePhase::FadeOut,
        hold: Duration::from_secs(1),
        next: Some(UpdatePhase::Blur),
    },
    PhaseStep {
        phase: UpdatePhase::Blur,
        hold: Duration::ZERO,
        next: Some(UpdatePhase::Load),
    },
    PhaseStep {
        phase: UpdatePhase::Load,
        hold: Duration::ZERO,
        next: Some(UpdatePhase::SpinnerFadeOut),
    },
    PhaseStep {
        phase: UpdatePhase::SpinnerFadeOut,
        hold: Duration::from_secs(1),
        next: Some(UpdatePhase::Settle),
    },
    PhaseStep {
        phase: UpdatePhase::Settle,
        hold: Duration::from_secs(2),
        next: Some(UpdatePhase::Cleanup),
    },
    PhaseStep {
        phase: UpdatePhase::Cleanup,
        hold: Duration::ZERO,
        next: None,
    },
];

/// Sum of all holds in `table`.
pub fn total_hold<P>(table: &[PhaseStep<P>]) -> Duration {
    table.iter().map(|step| step.hold).sum()
}

/// Walk `table` from its first row, running each phase then holding on `clock`.
///
/// Zero holds schedule no timer. The walk always runs to the end of the table.
pub async fn drive<P, F, Fut>(clock: &dyn Clock, table: &'static [PhaseStep<P>], mut run: F)
where
    P: Copy + PartialEq,
    F: FnMut(P) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut current = table.first();
    while let Some(step) = current {
        run(step.phase).await;
        if !step.hold.is_zero() {
            clock.sleep(step.hold).await;
        }
        current = step
            .next
            .and_then(|next| table.iter().find(|candidate| candidate.phase == next));
    }
}

/// Progress of a card from discovery to its first reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPhase {
    /// Found on the page, waiting briefly for data.
    Waiting,
    /// Data is late; the loading affordance is shown.
    Spinner,
    /// Reveal choreography running.
    Transition,
    /// Revealed and accepting interaction.
    Complete,
}

/// Inputs to the discovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Backend data for the card arrived.
    DataArrived,
    /// The initial wait ran out.
    WaitElapsed,
    /// The spinner wait ran out.
    SpinnerTimedOut,
    /// The reveal choreography finished.
    RevealFinished,
}

/// Event that the current discovery phase does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid discovery transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidDiscoveryTransition {
    /// Phase the event was applied to.
    pub from: DiscoveryPhase,
    /// Rejected event.
    pub event: DiscoveryEvent,
}

impl DiscoveryPhase {
    /// Phase reached by applying `event`.
    pub fn next(self, event: DiscoveryEvent) -> Result<DiscoveryPhase, InvalidDiscoveryTransition> {
        let next = match (self, event) {
            (DiscoveryPhase::Waiting, DiscoveryEvent::DataArrived) => DiscoveryPhase::Transition,
            (DiscoveryPhase::Waiting, DiscoveryEvent::WaitElapsed) => DiscoveryPhase::Spinner,
            (DiscoveryPhase::Spinner, DiscoveryEvent::DataArrived) => DiscoveryPhase::Transition,
            // The bounded wait gave up; stay ready for late data.
            (DiscoveryPhase::Spinner, DiscoveryEvent::SpinnerTimedOut) => DiscoveryPhase::Spinner,
            (DiscoveryPhase::Transition, DiscoveryEvent::RevealFinished) => DiscoveryPhase::Complete,
            (from, event) => return Err(InvalidDiscoveryTransition { from, event }),
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use time::macros::datetime;

    use super::*;
    use crate::clock::VirtualClock;

    #[test]
    fn tables_are_linked_in_order() {
        fn assert_chain<P: Copy + PartialEq + std::fmt::Debug>(table: &[PhaseStep<P>]) {
            for pair in table.windows(2) {
                assert_eq!(pair[0].next, Some(pair[1].phase));
            }
            assert_eq!(table.last().unwrap().next, None);
        }
        assert_chain(REVEAL_PHASES);
        assert_chain(UPDATE_PHASES);
    }

    #[test]
    fn hold_totals_match_choreography() {
        assert_eq!(total_hold(REVEAL_PHASES), Duration::from_secs(6));
        assert_eq!(total_hold(UPDATE_PHASES), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn drive_runs_every_phase_and_skips_zero_holds() {
        let clock = VirtualClock::new(datetime!(2024-01-05 12:00 UTC));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();

        let log = seen.clone();
        drive(clock.as_ref(), UPDATE_PHASES, |phase| {
            let log = log.clone();
            async move { log.lock().unwrap().push(phase) }
        })
        .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                UpdatePhase::Prepare,
                UpdatePhase::FadeOut,
                UpdatePhase::Blur,
                UpdatePhase::Load,
                UpdatePhase::SpinnerFadeOut,
                UpdatePhase::Settle,
                UpdatePhase::Cleanup,
            ]
        );
        assert_eq!(clock.scheduled_sleeps(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn discovery_transitions() {
        use DiscoveryEvent::*;
        use DiscoveryPhase::*;

        assert_eq!(Waiting.next(DataArrived), Ok(Transition));
        assert_eq!(Waiting.next(WaitElapsed), Ok(Spinner));
        assert_eq!(Spinner.next(SpinnerTimedOut), Ok(Spinner));
        assert_eq!(Spinner.next(DataArrived), Ok(Transition));
        assert_eq!(Transition.next(RevealFinished), Ok(Complete));
        assert_eq!(
            Complete.next(DataArrived),
            Err(InvalidDiscoveryTransition {
                from: Complete,
                event: DataArrived
            })
        );
    }
}
