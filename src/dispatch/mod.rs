//! Inbound CSMS-command dispatcher: decodes a CALL's JSON payload
//! into the typed request for its action, runs the handler, and
//! re-encodes the typed response. Payload shape errors surface as
//! `SimError::Validation` so the actor turns them into a CALLERROR
//! instead of panicking.

pub mod handlers;

use serde_json::Value;

use crate::errors::{SimError, SimResult};
use crate::messages::commands::*;
use crate::messages::InboundAction;
use crate::session::model::Session;

macro_rules! dispatch_action {
    ($session:expr, $payload:expr, $request_ty:ty, $handler:expr) => {{
        let request: $request_ty = serde_json::from_value($payload)
            .map_err(|e| SimError::Validation(format!("malformed payload: {e}")))?;
        let response = $handler($session, request);
        serde_json::to_value(response).map_err(|e| SimError::Protocol(e.to_string()))
    }};
}

pub fn handle(session: &mut Session, action: InboundAction, payload: Value) -> SimResult<Value> {
    match action {
        InboundAction::ChangeConfiguration => {
            dispatch_action!(session, payload, ChangeConfigurationRequest, handlers::change_configuration)
        }
        InboundAction::GetConfiguration => {
            dispatch_action!(&*session, payload, GetConfigurationRequest, handlers::get_configuration)
        }
        InboundAction::ClearCache => {
            dispatch_action!(session, payload, ClearCacheRequest, handlers::clear_cache)
        }
        InboundAction::Reset => {
            dispatch_action!(session, payload, ResetRequest, handlers::reset)
        }
        InboundAction::RemoteStartTransaction => {
            dispatch_action!(
                session,
                payload,
                RemoteStartTransactionRequest,
                handlers::remote_start_transaction
            )
        }
        InboundAction::RemoteStopTransaction => {
            dispatch_action!(
                session,
                payload,
                RemoteStopTransactionRequest,
                handlers::remote_stop_transaction
            )
        }
        InboundAction::UnlockConnector => {
            dispatch_action!(session, payload, UnlockConnectorRequest, handlers::unlock_connector)
        }
        InboundAction::ChangeAvailability => {
            dispatch_action!(
                session,
                payload,
                ChangeAvailabilityRequest,
                handlers::change_availability
            )
        }
        InboundAction::DataTransfer => {
            dispatch_action!(session, payload, DataTransferRequest, handlers::data_transfer)
        }
        InboundAction::TriggerMessage => {
            dispatch_action!(&*session, payload, TriggerMessageRequest, handlers::trigger_message)
        }
        InboundAction::ReserveNow => {
            dispatch_action!(session, payload, ReserveNowRequest, handlers::reserve_now)
        }
        InboundAction::CancelReservation => {
            dispatch_action!(session, payload, CancelReservationRequest, handlers::cancel_reservation)
        }
        InboundAction::SetChargingProfile => {
            dispatch_action!(
                session,
                payload,
                SetChargingProfileRequest,
                handlers::set_charging_profile
            )
        }
        InboundAction::ClearChargingProfile => {
            dispatch_action!(
                session,
                payload,
                ClearChargingProfileRequest,
                handlers::clear_charging_profile
            )
        }
        InboundAction::GetCompositeSchedule => {
            dispatch_action!(
                &*session,
                payload,
                GetCompositeScheduleRequest,
                handlers::get_composite_schedule
            )
        }
        InboundAction::SendLocalList => {
            dispatch_action!(session, payload, SendLocalListRequest, handlers::send_local_list)
        }
        InboundAction::GetLocalListVersion => {
            let response = handlers::get_local_list_version(session);
            serde_json::to_value(response).map_err(|e| SimError::Protocol(e.to_string()))
        }
        InboundAction::UpdateFirmware => {
            dispatch_action!(session, payload, UpdateFirmwareRequest, handlers::update_firmware)
        }
        InboundAction::GetDiagnostics => {
            dispatch_action!(session, payload, GetDiagnosticsRequest, handlers::get_diagnostics)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::SessionIdentity;
    use serde_json::json;

    fn new_session() -> Session {
        let identity = SessionIdentity {
            charge_point_id: "CP-1".into(),
            vendor: "Acme".into(),
            model: "X1".into(),
            serial_number: None,
            firmware_version: None,
        };
        Session::new(identity, 1)
    }

    #[test]
    fn clear_cache_always_accepted() {
        let mut session = new_session();
        let response = handle(&mut session, InboundAction::ClearCache, json!({})).unwrap();
        assert_eq!(response["status"], "Accepted");
    }

    #[test]
    fn malformed_payload_is_validation_error() {
        let mut session = new_session();
        let result = handle(&mut session, InboundAction::ChangeConfiguration, json!({}));
        assert!(matches!(result, Err(SimError::Validation(_))));
    }

    #[test]
    fn remote_start_accepted_when_available_and_connector_free() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Available;
        let payload = json!({"connectorId": 1, "idTag": "TAG1"});
        let response = handle(&mut session, InboundAction::RemoteStartTransaction, payload).unwrap();
        assert_eq!(response["status"], "Accepted");
        // Eligibility only: the handler itself never fabricates a
        // transaction, the actor does after a real Authorize/StartTransaction
        // round trip.
        assert!(session.connector(1).unwrap().transaction.is_none());
    }

    #[test]
    fn remote_start_rejected_when_not_available_or_preparing() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Charging;
        let payload = json!({"connectorId": 1, "idTag": "TAG1"});
        let response = handle(&mut session, InboundAction::RemoteStartTransaction, payload).unwrap();
        assert_eq!(response["status"], "Rejected");
    }

    fn reserve_now_payload(reservation_id: i32) -> serde_json::Value {
        json!({
            "connectorId": 1,
            "expiryDate": "2030-01-01T00:00:00.000Z",
            "idTag": "TAG1",
            "reservationId": reservation_id,
        })
    }

    #[test]
    fn reserve_now_accepted_when_available() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Available;
        let response = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(1)).unwrap();
        assert_eq!(response["status"], "Accepted");
    }

    #[test]
    fn reserve_now_rejected_when_not_available() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Preparing;
        let response = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(1)).unwrap();
        assert_eq!(response["status"], "Rejected");
    }

    #[test]
    fn reserve_now_occupied_when_charging() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Charging;
        let response = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(1)).unwrap();
        assert_eq!(response["status"], "Occupied");
    }

    #[test]
    fn reserve_now_rejected_when_already_reserved_with_different_id() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Available;
        let first = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(1)).unwrap();
        assert_eq!(first["status"], "Accepted");

        session.state = crate::session::state::SessionState::Reserved;
        let second = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(2)).unwrap();
        assert_eq!(second["status"], "Rejected");
    }

    #[test]
    fn reserve_now_accepted_when_reaffirming_same_reservation_id() {
        let mut session = new_session();
        session.state = crate::session::state::SessionState::Available;
        let first = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(7)).unwrap();
        assert_eq!(first["status"], "Accepted");

        session.state = crate::session::state::SessionState::Reserved;
        let second = handle(&mut session, InboundAction::ReserveNow, reserve_now_payload(7)).unwrap();
        assert_eq!(second["status"], "Accepted");
    }
}
