//! Session lifecycle phase machine.
//!
//! [`transition`] is a pure function from (phase, event, context) to the new
//! phase and an ordered list of actions. [`apply_transition`] commits the new
//! phase to the session state and runs the actions, delegating the ones with
//! git side effects to an [`ActionHandler`].

use std::fmt;

use chrono::Utc;

use crate::error::EntireResult;
use crate::session::{Phase, SessionState};

/// Hook events that drive the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    TurnStart,
    TurnEnd,
    GitCommit,
    SessionStart,
    SessionStop,
}

impl Event {
    pub const ALL: [Event; 5] = [
        Event::TurnStart,
        Event::TurnEnd,
        Event::GitCommit,
        Event::SessionStart,
        Event::SessionStop,
    ];
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::TurnStart => "turn_start",
            Event::TurnEnd => "turn_end",
            Event::GitCommit => "git_commit",
            Event::SessionStart => "session_start",
            Event::SessionStop => "session_stop",
        };
        f.write_str(s)
    }
}

/// Facts about the repository the transition depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    pub is_rebase_in_progress: bool,
    pub has_files_touched: bool,
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Condense,
    CondenseIfFilesTouched,
    DiscardIfNoFiles,
    MigrateShadowBranch,
    WarnStaleSession,
    ClearEndedAt,
    UpdateLastInteraction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub new_phase: Phase,
    pub actions: Vec<Action>,
}

impl TransitionResult {
    fn to(new_phase: Phase, actions: &[Action]) -> Self {
        Self {
            new_phase,
            actions: actions.to_vec(),
        }
    }
}

/// Compute the next phase and the actions to run.
pub fn transition(phase: Phase, event: Event, ctx: TransitionContext) -> TransitionResult {
    use Action::*;

    if event == Event::GitCommit && ctx.is_rebase_in_progress {
        return TransitionResult::to(phase, &[]);
    }

    let to = TransitionResult::to;
    match (phase, event) {
        (Phase::Idle, Event::TurnStart) => to(Phase::Active, &[UpdateLastInteraction]),
        (Phase::Idle, Event::GitCommit) => to(Phase::Idle, &[Condense, UpdateLastInteraction]),
        (Phase::Idle, Event::SessionStop) => to(Phase::Ended, &[UpdateLastInteraction]),
        (Phase::Idle, Event::SessionStart | Event::TurnEnd) => to(Phase::Idle, &[]),

        (Phase::Active, Event::TurnStart) => to(Phase::Active, &[UpdateLastInteraction]),
        (Phase::Active, Event::TurnEnd) => to(Phase::Idle, &[UpdateLastInteraction]),
        (Phase::Active, Event::GitCommit) => {
            to(Phase::ActiveCommitted, &[MigrateShadowBranch, UpdateLastInteraction])
        }
        (Phase::Active, Event::SessionStop) => to(Phase::Ended, &[UpdateLastInteraction]),
        (Phase::Active, Event::SessionStart) => to(Phase::Active, &[WarnStaleSession]),

        (Phase::ActiveCommitted, Event::TurnEnd) => {
            to(Phase::Idle, &[Condense, UpdateLastInteraction])
        }
        (Phase::ActiveCommitted, Event::GitCommit) => {
            to(Phase::ActiveCommitted, &[MigrateShadowBranch, UpdateLastInteraction])
        }
        (Phase::ActiveCommitted, Event::TurnStart) => to(Phase::Active, &[UpdateLastInteraction]),
        (Phase::ActiveCommitted, Event::SessionStop) => to(Phase::Ended, &[UpdateLastInteraction]),
        (Phase::ActiveCommitted, Event::SessionStart) => {
            to(Phase::ActiveCommitted, &[WarnStaleSession])
        }

        (Phase::Ended, Event::TurnStart) => {
            to(Phase::Active, &[ClearEndedAt, UpdateLastInteraction])
        }
        (Phase::Ended, Event::GitCommit) if ctx.has_files_touched => {
            to(Phase::Ended, &[CondenseIfFilesTouched, UpdateLastInteraction])
        }
        (Phase::Ended, Event::GitCommit) => {
            to(Phase::Ended, &[DiscardIfNoFiles, UpdateLastInteraction])
        }
        (Phase::Ended, Event::SessionStart) => to(Phase::Idle, &[ClearEndedAt]),
        (Phase::Ended, Event::TurnEnd | Event::SessionStop) => to(Phase::Ended, &[]),
    }
}

/// Executes the actions that touch git or the checkpoint stores.
pub trait ActionHandler {
    fn handle_condense(&mut self, state: &mut SessionState) -> EntireResult<()>;
    fn handle_condense_if_files_touched(&mut self, state: &mut SessionState) -> EntireResult<()>;
    fn handle_discard_if_no_files(&mut self, state: &mut SessionState) -> EntireResult<()>;
    fn handle_migrate_shadow_branch(&mut self, state: &mut SessionState) -> EntireResult<()>;
    fn handle_warn_stale_session(&mut self, state: &mut SessionState) -> EntireResult<()>;
}

/// Handler that does nothing; for callers that only track phases.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ActionHandler for NoopHandler {
    fn handle_condense(&mut self, _state: &mut SessionState) -> EntireResult<()> {
        Ok(())
    }
    fn handle_condense_if_files_touched(&mut self, _state: &mut SessionState) -> EntireResult<()> {
        Ok(())
    }
    fn handle_discard_if_no_files(&mut self, _state: &mut SessionState) -> EntireResult<()> {
        Ok(())
    }
    fn handle_migrate_shadow_branch(&mut self, _state: &mut SessionState) -> EntireResult<()> {
        Ok(())
    }
    fn handle_warn_stale_session(&mut self, _state: &mut SessionState) -> EntireResult<()> {
        Ok(())
    }
}

/// Commit `result` to `state` and run its actions in order.
///
/// The phase is assigned before any action runs. The first failing action
/// stops the rest and its error is returned; the state keeps the new phase.
pub fn apply_transition(
    state: &mut SessionState,
    result: &TransitionResult,
    handler: &mut dyn ActionHandler,
) -> EntireResult<()> {
    if state.phase != result.new_phase {
        tracing::debug!(
            session = %state.session_id,
            from = %state.phase,
            to = %result.new_phase,
            "phase change"
        );
    }
    state.phase = result.new_phase;

    for action in &result.actions {
        match action {
            Action::UpdateLastInteraction => state.last_interaction_time = Some(Utc::now()),
            Action::ClearEndedAt => state.ended_at = None,
            Action::Condense => handler.handle_condense(state)?,
            Action::CondenseIfFilesTouched => handler.handle_condense_if_files_touched(state)?,
            Action::DiscardIfNoFiles => handler.handle_discard_if_no_files(state)?,
            Action::MigrateShadowBranch => handler.handle_migrate_shadow_branch(state)?,
            Action::WarnStaleSession => handler.handle_warn_stale_session(state)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EntireError;
    use std::path::Path;

    const NORMAL: TransitionContext = TransitionContext {
        is_rebase_in_progress: false,
        has_files_touched: false,
    };

    fn state(phase: Phase) -> SessionState {
        let mut s = SessionState::new("s1", &"a".repeat(40), Path::new("/w"), "");
        s.phase = phase;
        s
    }

    #[test]
    fn test_table_closure() {
        for phase in Phase::ALL {
            for event in Event::ALL {
                for files in [false, true] {
                    let ctx = TransitionContext { has_files_touched: files, ..NORMAL };
                    let r = transition(phase, event, ctx);
                    assert!(Phase::ALL.contains(&r.new_phase));
                    let last = r.actions.iter().position(|a| *a == Action::UpdateLastInteraction);
                    if let Some(pos) = last {
                        assert_eq!(pos, r.actions.len() - 1, "{phase} {event}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_rebase_makes_commit_a_noop() {
        let ctx = TransitionContext {
            is_rebase_in_progress: true,
            has_files_touched: true,
        };
        for phase in Phase::ALL {
            let r = transition(phase, Event::GitCommit, ctx);
            assert_eq!(r.new_phase, phase);
            assert!(r.actions.is_empty());
        }
    }

    #[test]
    fn test_selected_rows() {
        use Action::*;
        let files = TransitionContext { has_files_touched: true, ..NORMAL };
        assert_eq!(
            transition(Phase::Idle, Event::GitCommit, NORMAL),
            TransitionResult::to(Phase::Idle, &[Condense, UpdateLastInteraction])
        );
        assert_eq!(
            transition(Phase::Active, Event::GitCommit, NORMAL),
            TransitionResult::to(
                Phase::ActiveCommitted,
                &[MigrateShadowBranch, UpdateLastInteraction]
            )
        );
        assert_eq!(
            transition(Phase::ActiveCommitted, Event::TurnEnd, NORMAL),
            TransitionResult::to(Phase::Idle, &[Condense, UpdateLastInteraction])
        );
        assert_eq!(
            transition(Phase::Ended, Event::GitCommit, files).actions,
            vec![CondenseIfFilesTouched, UpdateLastInteraction]
        );
        assert_eq!(
            transition(Phase::Ended, Event::GitCommit, NORMAL).actions,
            vec![DiscardIfNoFiles, UpdateLastInteraction]
        );
        assert_eq!(
            transition(Phase::Ended, Event::TurnStart, NORMAL),
            TransitionResult::to(Phase::Active, &[ClearEndedAt, UpdateLastInteraction])
        );
        assert_eq!(
            transition(Phase::Ended, Event::SessionStart, NORMAL),
            TransitionResult::to(Phase::Idle, &[ClearEndedAt])
        );
        let stale = transition(Phase::Active, Event::SessionStart, NORMAL);
        assert_eq!(stale.actions, vec![WarnStaleSession]);
        assert!(transition(Phase::Ended, Event::SessionStop, NORMAL).actions.is_empty());
    }

    struct Recorder {
        calls: Vec<&'static str>,
        fail_condense: bool,
    }

    impl ActionHandler for Recorder {
        fn handle_condense(&mut self, state: &mut SessionState) -> EntireResult<()> {
            assert_eq!(state.phase, Phase::Idle);
            self.calls.push("condense");
            if self.fail_condense {
                return Err(EntireError::Corrupt("shadow branch points at garbage".into()));
            }
            Ok(())
        }
        fn handle_condense_if_files_touched(&mut self, _: &mut SessionState) -> EntireResult<()> {
            self.calls.push("condense_if_files");
            Ok(())
        }
        fn handle_discard_if_no_files(&mut self, _state: &mut SessionState) -> EntireResult<()> {
            self.calls.push("discard");
            Ok(())
        }
        fn handle_migrate_shadow_branch(&mut self, _state: &mut SessionState) -> EntireResult<()> {
            self.calls.push("migrate");
            Ok(())
        }
        fn handle_warn_stale_session(&mut self, _state: &mut SessionState) -> EntireResult<()> {
            self.calls.push("warn");
            Ok(())
        }
    }

    #[test]
    fn test_apply_stops_on_first_error_with_new_phase() {
        let mut s = state(Phase::ActiveCommitted);
        let mut handler = Recorder {
            calls: vec![],
            fail_condense: true,
        };
        let result = transition(Phase::ActiveCommitted, Event::TurnEnd, NORMAL);
        let err = apply_transition(&mut s, &result, &mut handler).unwrap_err();
        assert!(matches!(err, EntireError::Corrupt(_)));
        assert_eq!(s.phase, Phase::Idle);
        assert_eq!(handler.calls, vec!["condense"]);
        assert!(s.last_interaction_time.is_none());
    }

    #[test]
    fn test_apply_runs_inline_actions() {
        let mut s = state(Phase::Ended);
        s.ended_at = Some(Utc::now());
        let result = transition(Phase::Ended, Event::TurnStart, NORMAL);
        apply_transition(&mut s, &result, &mut NoopHandler).unwrap();
        assert_eq!(s.phase, Phase::Active);
        assert!(s.ended_at.is_none());
        assert!(s.last_interaction_time.is_some());
    }
}
