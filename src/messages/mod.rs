//! OCPP 1.6 payload types and the closed set of actions the session
//! engine dispatches on.
//!
//! Payloads are grouped the way the wire protocol groups them: `core`
//! holds the messages a charge point originates (boot, heartbeat,
//! authorize, transactions, meter values, status), `commands` holds the
//! messages a central system originates, and `charging_profile` is
//! shared between `commands` and the smart-charging resolver.

pub mod charging_profile;
pub mod commands;
pub mod core;
pub mod enums;

use serde::{Deserialize, Serialize};

/// The closed set of actions a central system may send to a charge
/// point. Unknown actions never reach this enum — the dispatcher
/// rejects them at the frame layer with `NotImplemented` before a
/// variant is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboundAction {
    ChangeConfiguration,
    GetConfiguration,
    ClearCache,
    Reset,
    RemoteStartTransaction,
    RemoteStopTransaction,
    UnlockConnector,
    ChangeAvailability,
    DataTransfer,
    TriggerMessage,
    ReserveNow,
    CancelReservation,
    SetChargingProfile,
    ClearChargingProfile,
    GetCompositeSchedule,
    SendLocalList,
    GetLocalListVersion,
    UpdateFirmware,
    GetDiagnostics,
}

impl InboundAction {
    pub fn from_wire(action: &str) -> Option<Self> {
        Some(match action {
            "ChangeConfiguration" => Self::ChangeConfiguration,
            "GetConfiguration" => Self::GetConfiguration,
            "ClearCache" => Self::ClearCache,
            "Reset" => Self::Reset,
            "RemoteStartTransaction" => Self::RemoteStartTransaction,
            "RemoteStopTransaction" => Self::RemoteStopTransaction,
            "UnlockConnector" => Self::UnlockConnector,
            "ChangeAvailability" => Self::ChangeAvailability,
            "DataTransfer" => Self::DataTransfer,
            "TriggerMessage" => Self::TriggerMessage,
            "ReserveNow" => Self::ReserveNow,
            "CancelReservation" => Self::CancelReservation,
            "SetChargingProfile" => Self::SetChargingProfile,
            "ClearChargingProfile" => Self::ClearChargingProfile,
            "GetCompositeSchedule" => Self::GetCompositeSchedule,
            "SendLocalList" => Self::SendLocalList,
            "GetLocalListVersion" => Self::GetLocalListVersion,
            "UpdateFirmware" => Self::UpdateFirmware,
            "GetDiagnostics" => Self::GetDiagnostics,
            _ => return None,
        })
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Self::ChangeConfiguration => "ChangeConfiguration",
            Self::GetConfiguration => "GetConfiguration",
            Self::ClearCache => "ClearCache",
            Self::Reset => "Reset",
            Self::RemoteStartTransaction => "RemoteStartTransaction",
            Self::RemoteStopTransaction => "RemoteStopTransaction",
            Self::UnlockConnector => "UnlockConnector",
            Self::ChangeAvailability => "ChangeAvailability",
            Self::DataTransfer => "DataTransfer",
            Self::TriggerMessage => "TriggerMessage",
            Self::ReserveNow => "ReserveNow",
            Self::CancelReservation => "CancelReservation",
            Self::SetChargingProfile => "SetChargingProfile",
            Self::ClearChargingProfile => "ClearChargingProfile",
            Self::GetCompositeSchedule => "GetCompositeSchedule",
            Self::SendLocalList => "SendLocalList",
            Self::GetLocalListVersion => "GetLocalListVersion",
            Self::UpdateFirmware => "UpdateFirmware",
            Self::GetDiagnostics => "GetDiagnostics",
        }
    }
}

/// The closed set of actions a charge point originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundAction {
    BootNotification,
    Heartbeat,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,
    StatusNotification,
}

impl OutboundAction {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::BootNotification => "BootNotification",
            Self::Heartbeat => "Heartbeat",
            Self::Authorize => "Authorize",
            Self::StartTransaction => "StartTransaction",
            Self::StopTransaction => "StopTransaction",
            Self::MeterValues => "MeterValues",
            Self::StatusNotification => "StatusNotification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_rejected() {
        assert!(InboundAction::from_wire("FooBar").is_none());
    }

    #[test]
    fn known_action_roundtrips() {
        let action = InboundAction::from_wire("RemoteStartTransaction").unwrap();
        assert_eq!(action.as_wire(), "RemoteStartTransaction");
    }
}
