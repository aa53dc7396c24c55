//! Finite state machine for the cluster lifecycle
//!
//! ```text
//! Provisioning -> Running <-> Failing
//! Running -> Paused            (delete with Pause policy)
//! Paused -> Provisioning       (recreate)
//! *  -> Terminating            (delete with Delete/WipeOut)
//! ```
//!
//! Only transitions in the table are taken; anything else leaves the phase alone.

use std::fmt;

use crate::crd::{ClusterPhase, TerminationPolicy};

/// Events that trigger state transitions in the cluster lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// An initialized primary is behind the write endpoint
    PrimaryAccepting,
    /// No primary accepts writes
    PrimaryLost,
    /// Initialization hit an irrecoverable error
    InitializationFailed,
    /// Members are still being created or are catching up
    MembersPending,
    /// Deleted with the Pause policy
    PauseRequested,
    /// Deleted with the Delete or WipeOut policy
    TerminationRequested,
    /// Recreated while a dormant record exists
    ResumeRequested,
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::PrimaryAccepting => write!(f, "PrimaryAccepting"),
            ClusterEvent::PrimaryLost => write!(f, "PrimaryLost"),
            ClusterEvent::InitializationFailed => write!(f, "InitializationFailed"),
            ClusterEvent::MembersPending => write!(f, "MembersPending"),
            ClusterEvent::PauseRequested => write!(f, "PauseRequested"),
            ClusterEvent::TerminationRequested => write!(f, "TerminationRequested"),
            ClusterEvent::ResumeRequested => write!(f, "ResumeRequested"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub ready_members: i32,
    pub desired_members: i32,
    /// A confirmed primary is Ready on the recorded timeline
    pub primary_available: bool,
    pub initialized: bool,
    /// Irrecoverable error from this pass
    pub error_message: Option<String>,
}

impl TransitionContext {
    pub fn new(ready_members: i32, desired_members: i32) -> Self {
        Self {
            ready_members,
            desired_members,
            ..Default::default()
        }
    }

    pub fn with_primary(mut self, available: bool) -> Self {
        self.primary_available = available;
        self
    }

    pub fn initialized(mut self, initialized: bool) -> Self {
        self.initialized = initialized;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn all_members_ready(&self) -> bool {
        self.ready_members >= self.desired_members
    }

    pub fn is_degraded(&self) -> bool {
        self.ready_members > 0 && self.ready_members < self.desired_members
    }
}

/// A state transition definition with optional guard
#[derive(Debug)]
pub struct Transition {
    pub from: ClusterPhase,
    pub to: ClusterPhase,
    pub event: ClusterEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: ClusterPhase,
        event: ClusterEvent,
    },
    GuardFailed {
        from: ClusterPhase,
        to: ClusterPhase,
        event: ClusterEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after applying this result to `current`
    pub fn phase_or(&self, current: ClusterPhase) -> ClusterPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

/// Formal state machine for the cluster lifecycle
pub struct ClusterStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ClusterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStateMachine {
    pub fn new() -> Self {
        use ClusterEvent::*;
        use ClusterPhase::*;

        Self {
            transitions: vec![
                // === Provisioning ===
                Transition::new(
                    Provisioning,
                    Running,
                    PrimaryAccepting,
                    "Primary initialized and accepting writes",
                ),
                Transition::new(
                    Provisioning,
                    Failing,
                    InitializationFailed,
                    "Initialization failed",
                ),
                Transition::new(
                    Provisioning,
                    Paused,
                    PauseRequested,
                    "Paused before provisioning completed",
                ),
                Transition::new(
                    Provisioning,
                    Terminating,
                    TerminationRequested,
                    "Deleted during provisioning",
                ),
                // === Running ===
                Transition::new(Running, Failing, PrimaryLost, "Primary stopped accepting writes"),
                Transition::new(Running, Paused, PauseRequested, "Paused; data retained"),
                Transition::new(
                    Running,
                    Terminating,
                    TerminationRequested,
                    "Cluster deletion requested",
                ),
                // === Failing ===
                Transition::new(
                    Failing,
                    Running,
                    PrimaryAccepting,
                    "Primary restored, accepting writes",
                ),
                Transition::new(Failing, Paused, PauseRequested, "Paused while failing"),
                Transition::new(
                    Failing,
                    Terminating,
                    TerminationRequested,
                    "Deleted while failing",
                ),
                // === Paused ===
                Transition::new(
                    Paused,
                    Provisioning,
                    ResumeRequested,
                    "Recreated; resuming from retained data",
                ),
                Transition::new(
                    Paused,
                    Terminating,
                    TerminationRequested,
                    "Retained data wiped",
                ),
                // Terminating is terminal
            ],
        }
    }

    pub fn transition(
        &self,
        current: &ClusterPhase,
        event: ClusterEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    pub fn can_transition(&self, from: &ClusterPhase, event: &ClusterEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    pub fn valid_events(&self, state: &ClusterPhase) -> Vec<&ClusterEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.to, &transition.event) {
            (ClusterPhase::Running, ClusterEvent::PrimaryAccepting) => {
                if !ctx.primary_available {
                    Some("No primary is accepting writes".to_string())
                } else if !ctx.initialized {
                    Some("Initialization has not completed".to_string())
                } else {
                    None
                }
            }
            (ClusterPhase::Failing, ClusterEvent::PrimaryLost) => ctx
                .primary_available
                .then(|| "Primary is still available".to_string()),
            _ => None,
        }
    }
}

/// Determine the appropriate event based on context
pub fn determine_event(
    current_phase: &ClusterPhase,
    ctx: &TransitionContext,
    deletion: Option<TerminationPolicy>,
) -> ClusterEvent {
    // Deletion always takes priority
    match deletion {
        Some(TerminationPolicy::Pause) => return ClusterEvent::PauseRequested,
        Some(TerminationPolicy::Delete | TerminationPolicy::WipeOut) => {
            return ClusterEvent::TerminationRequested;
        }
        Some(TerminationPolicy::DoNotTerminate) | None => {}
    }

    if *current_phase == ClusterPhase::Paused {
        return ClusterEvent::ResumeRequested;
    }

    if ctx.primary_available && ctx.initialized {
        ClusterEvent::PrimaryAccepting
    } else if ctx.error_message.is_some() && *current_phase == ClusterPhase::Provisioning {
        ClusterEvent::InitializationFailed
    } else if !ctx.primary_available && *current_phase == ClusterPhase::Running {
        ClusterEvent::PrimaryLost
    } else {
        ClusterEvent::MembersPending
    }
}

/// Phase that follows `current` given the pass outcome
pub fn next_phase(
    sm: &ClusterStateMachine,
    current: ClusterPhase,
    ctx: &TransitionContext,
    deletion: Option<TerminationPolicy>,
) -> ClusterPhase {
    let event = determine_event(&current, ctx, deletion);
    sm.transition(&current, event, ctx).phase_or(current)
}
