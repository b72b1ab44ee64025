//! Session state machine. States and their legal transitions
//! mirror OCPP 1.6 connector status reporting, with two extra states
//! (`Disconnected`, `Connecting`) that only exist on the simulator side
//! of the wire — a real charge point doesn't report "I have no
//! transport" to anyone.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Booting,
    Available,
    Preparing,
    Charging,
    SuspendedEvse,
    SuspendedEv,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition. Transport loss can
    /// interrupt any state and always lands in `Disconnected`; `Faulted`
    /// can likewise be entered from any state a physical fault could
    /// occur in. `Unavailable` gets the same treatment so a `Reset` CALL
    /// can drive any connected state through `UNAVAILABLE -> DISCONNECTED
    /// -> BOOTING` per the transition table, not just `Booting`/`Available`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Disconnected {
            return self != Disconnected;
        }
        if next == Faulted || next == Unavailable {
            return !matches!(self, Disconnected | Connecting);
        }

        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Booting) => true,
            (Connecting, Disconnected) => true,
            (Booting, Available) => true,
            (Available, Preparing) => true,
            (Available, Reserved) => true,
            (Preparing, Charging) => true,
            (Preparing, Available) => true,
            (Preparing, SuspendedEvse) => true,
            (Charging, SuspendedEvse) => true,
            (Charging, SuspendedEv) => true,
            (Charging, Finishing) => true,
            (SuspendedEvse, Charging) => true,
            (SuspendedEvse, Finishing) => true,
            (SuspendedEv, Charging) => true,
            (SuspendedEv, Finishing) => true,
            (Finishing, Available) => true,
            (Finishing, Preparing) => true,
            (Reserved, Preparing) => true,
            (Reserved, Available) => true,
            (Unavailable, Available) => true,
            (Faulted, Available) => true,
            _ => false,
        }
    }

    pub fn is_transacting(self) -> bool {
        matches!(
            self,
            SessionState::Charging | SessionState::SuspendedEvse | SessionState::SuspendedEv
        )
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Connecting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn boot_sequence_is_legal() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Booting));
        assert!(Booting.can_transition_to(Available));
    }

    #[test]
    fn transport_loss_is_legal_from_any_connected_state() {
        for state in [
            Booting,
            Available,
            Preparing,
            Charging,
            SuspendedEvse,
            SuspendedEv,
            Finishing,
            Reserved,
            Unavailable,
            Faulted,
        ] {
            assert!(state.can_transition_to(Disconnected), "{state:?}");
        }
    }

    #[test]
    fn cannot_charge_without_preparing() {
        assert!(!Available.can_transition_to(Charging));
    }

    #[test]
    fn cannot_skip_boot() {
        assert!(!Connecting.can_transition_to(Available));
    }
}
