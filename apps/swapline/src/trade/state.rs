use std::fmt;

use serde::{Deserialize, Serialize};

/// Where one trade stands. The happy path is strictly linear; `Failed` and
/// `Cancelled` are the only side exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeExecutionState {
    Initialized,
    CreatingPsbt,
    PsbtCreated,
    SigningPsbt,
    PsbtSigned,
    SendingToCounterparty,
    WaitingForCounterparty,
    CounterpartySigned,
    Broadcasting,
    Completed,
    Failed,
    Cancelled,
}

impl TradeExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeExecutionState::Completed | TradeExecutionState::Failed | TradeExecutionState::Cancelled
        )
    }

    /// Next step on the happy path, if any.
    pub fn next(self) -> Option<TradeExecutionState> {
        use TradeExecutionState::*;
        Some(match self {
            Initialized => CreatingPsbt,
            CreatingPsbt => PsbtCreated,
            PsbtCreated => SigningPsbt,
            SigningPsbt => PsbtSigned,
            PsbtSigned => SendingToCounterparty,
            SendingToCounterparty => WaitingForCounterparty,
            WaitingForCounterparty => CounterpartySigned,
            CounterpartySigned => Broadcasting,
            Broadcasting => Completed,
            Completed | Failed | Cancelled => return None,
        })
    }

    pub fn can_transition_to(self, target: TradeExecutionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            TradeExecutionState::Failed | TradeExecutionState::Cancelled => true,
            other => self.next() == Some(other),
        }
    }

    /// Rough completion figure for progress reporting.
    pub fn percent(self) -> u8 {
        use TradeExecutionState::*;
        match self {
            Initialized => 0,
            CreatingPsbt => 10,
            PsbtCreated => 20,
            SigningPsbt => 30,
            PsbtSigned => 40,
            SendingToCounterparty => 50,
            WaitingForCounterparty => 60,
            CounterpartySigned => 80,
            Broadcasting => 90,
            Completed => 100,
            Failed | Cancelled => 0,
        }
    }

    pub fn describe(self) -> &'static str {
        use TradeExecutionState::*;
        match self {
            Initialized => "ready",
            CreatingPsbt => "building transaction",
            PsbtCreated => "transaction built",
            SigningPsbt => "waiting for wallet signature",
            PsbtSigned => "signed locally",
            SendingToCounterparty => "sending to counterparty",
            WaitingForCounterparty => "waiting for counterparty signature",
            CounterpartySigned => "counterparty signed",
            Broadcasting => "broadcasting",
            Completed => "completed",
            Failed => "failed",
            Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TradeExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::TradeExecutionState::*;
    use super::*;

    #[test]
    fn happy_path_is_linear() {
        let mut state = Initialized;
        let mut steps = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            steps.push(state);
        }
        assert_eq!(steps.len(), 10);
        assert_eq!(state, Completed);
        assert!(!Initialized.can_transition_to(PsbtSigned));
        assert!(!WaitingForCounterparty.can_transition_to(SigningPsbt));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [Completed, Failed, Cancelled] {
            assert!(!terminal.can_transition_to(Failed));
            assert!(!terminal.can_transition_to(Cancelled));
            assert!(!terminal.can_transition_to(Initialized));
        }
    }

    #[test]
    fn any_live_state_can_fail_or_cancel() {
        for live in [Initialized, SigningPsbt, WaitingForCounterparty, CounterpartySigned, Broadcasting] {
            assert!(live.can_transition_to(Failed));
            assert!(live.can_transition_to(Cancelled));
        }
    }
}
