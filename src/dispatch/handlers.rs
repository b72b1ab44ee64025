//! Per-action handlers for CS→CP commands. Each handler takes
//! the already-typed request, mutates the session, and returns the
//! typed response — `dispatch::handle` owns the (de)serialization at
//! the payload boundary.

use chrono::Utc;

use crate::messages::charging_profile::ChargingProfilePurpose;
use crate::messages::commands::*;
use crate::messages::enums::{AvailabilityStatus, ChargePointStatus, GenericStatus, UnlockStatus};
use crate::session::model::{Connector, Session};
use crate::session::state::SessionState;

const READONLY_KEYS: [&str; 6] = [
    "NumberOfConnectors",
    "ChargePointVendor",
    "ChargePointModel",
    "ChargePointSerialNumber",
    "FirmwareVersion",
    "SupportedFeatureProfiles",
];

const WRITABLE_NUMERIC_KEYS: [&str; 4] = [
    "MeterValueSampleInterval",
    "ConnectionTimeOut",
    "ClockAlignedDataInterval",
    // HeartbeatInterval handled separately below; listed here only for
    // the membership check.
    "HeartbeatInterval",
];

/// Accepted but has no effect on which measurands get emitted. Stored purely so
/// `GetConfiguration` echoes back whatever the CSMS last set.
const METER_VALUES_SAMPLED_DATA_KEY: &str = "MeterValuesSampledData";

pub fn change_configuration(
    session: &mut Session,
    request: ChangeConfigurationRequest,
) -> ChangeConfigurationResponse {
    use crate::messages::enums::ConfigurationStatus;

    if READONLY_KEYS.contains(&request.key.as_str()) {
        return ChangeConfigurationResponse {
            status: ConfigurationStatus::Rejected,
        };
    }

    if request.key == METER_VALUES_SAMPLED_DATA_KEY {
        session.configuration.insert(request.key, request.value);
        return ChangeConfigurationResponse {
            status: ConfigurationStatus::Accepted,
        };
    }

    if !WRITABLE_NUMERIC_KEYS.contains(&request.key.as_str()) {
        return ChangeConfigurationResponse {
            status: ConfigurationStatus::NotSupported,
        };
    }

    let secs: u32 = match request.value.parse() {
        Ok(secs) => secs,
        Err(_) => {
            return ChangeConfigurationResponse {
                status: ConfigurationStatus::Rejected,
            }
        }
    };

    match request.key.as_str() {
        "HeartbeatInterval" => session.heartbeat_interval_secs = secs,
        "MeterValueSampleInterval" => session.meter_value_sample_interval_secs = secs,
        "ClockAlignedDataInterval" => session.set_clock_aligned_interval(secs),
        // ConnectionTimeOut is accepted and stored but the simulator has
        // no inbound connection-idle timer to apply it to.
        _ => {}
    }
    session.configuration.insert(request.key, request.value);
    ChangeConfigurationResponse {
        status: ConfigurationStatus::Accepted,
    }
}

pub fn get_configuration(session: &Session, request: GetConfigurationRequest) -> GetConfigurationResponse {
    match request.key {
        None => {
            let configuration_key = session
                .configuration
                .iter()
                .map(|(k, v)| KeyValue {
                    key: k.clone(),
                    readonly: false,
                    value: Some(v.clone()),
                })
                .collect();
            GetConfigurationResponse {
                configuration_key: Some(configuration_key),
                unknown_key: None,
            }
        }
        Some(keys) => {
            let mut found = Vec::new();
            let mut unknown = Vec::new();
            for key in keys {
                match session.configuration.get(&key) {
                    Some(value) => found.push(KeyValue {
                        key: key.clone(),
                        readonly: false,
                        value: Some(value.clone()),
                    }),
                    None => unknown.push(key),
                }
            }
            GetConfigurationResponse {
                configuration_key: Some(found),
                unknown_key: Some(unknown),
            }
        }
    }
}

pub fn clear_cache(_session: &mut Session, _request: ClearCacheRequest) -> ClearCacheResponse {
    ClearCacheResponse {
        status: GenericStatus::Accepted,
    }
}

pub fn reset(_session: &mut Session, _request: ResetRequest) -> ResetResponse {
    // A real charge point would tear down its process here. The
    // simulator has nothing further to do beyond acknowledging —
    // session teardown is driven by the registry, not by this handler.
    ResetResponse {
        status: GenericStatus::Accepted,
    }
}

/// Eligibility check only: accept if the session is AVAILABLE or
/// PREPARING and the connector is free. No transaction is created here —
/// on `Accepted` the actor runs the real `Authorize -> StartTransaction`
/// CALL sequence against the CSMS once this CALLRESULT is on the wire
/// (see `SessionActor::handle_inbound_call`), so the transaction id
/// actually comes from the CSMS's `StartTransaction` response rather
/// than being fabricated locally.
pub fn remote_start_transaction(
    session: &mut Session,
    request: RemoteStartTransactionRequest,
) -> RemoteStartTransactionResponse {
    use crate::session::state::SessionState;

    if !matches!(session.state, SessionState::Available | SessionState::Preparing) {
        return RemoteStartTransactionResponse {
            status: GenericStatus::Rejected,
        };
    }

    let connector_id = match request.connector_id {
        Some(id) => id,
        None => match session.connectors.iter().find(|c| c.transaction.is_none()) {
            Some(c) => c.connector_id,
            None => {
                return RemoteStartTransactionResponse {
                    status: GenericStatus::Rejected,
                }
            }
        },
    };

    match session.connector(connector_id) {
        Some(connector) if connector.transaction.is_none() => {}
        _ => {
            return RemoteStartTransactionResponse {
                status: GenericStatus::Rejected,
            }
        }
    }

    if let Some(profile) = request.charging_profile.clone() {
        session.profiles.install(connector_id, profile);
    }

    RemoteStartTransactionResponse {
        status: GenericStatus::Accepted,
    }
}

/// Eligibility check only: accept if `transactionId` matches the
/// active transaction. The actor schedules the real `StopTransaction`
/// CALL once this CALLRESULT is on the wire; no connector state is
/// mutated here.
pub fn remote_stop_transaction(
    session: &mut Session,
    request: RemoteStopTransactionRequest,
) -> RemoteStopTransactionResponse {
    let matches = session
        .connectors
        .iter()
        .any(|c| c.transaction.as_ref().map(|t| t.transaction_id) == Some(request.transaction_id));

    if matches {
        RemoteStopTransactionResponse {
            status: GenericStatus::Accepted,
        }
    } else {
        RemoteStopTransactionResponse {
            status: GenericStatus::Rejected,
        }
    }
}

pub fn unlock_connector(session: &mut Session, request: UnlockConnectorRequest) -> UnlockConnectorResponse {
    match session.connector(request.connector_id) {
        Some(connector) if connector.transaction.is_none() => UnlockConnectorResponse {
            status: UnlockStatus::Unlocked,
        },
        Some(_) => UnlockConnectorResponse {
            status: UnlockStatus::UnlockFailed,
        },
        None => UnlockConnectorResponse {
            status: UnlockStatus::NotSupported,
        },
    }
}

pub fn change_availability(
    session: &mut Session,
    request: ChangeAvailabilityRequest,
) -> ChangeAvailabilityResponse {
    let target_status = match request.kind {
        AvailabilityType::Operative => ChargePointStatus::Available,
        AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
    };

    let connectors: Vec<&mut Connector> = if request.connector_id == 0 {
        session.connectors.iter_mut().collect()
    } else {
        session
            .connector_mut(request.connector_id)
            .into_iter()
            .collect()
    };

    if connectors.is_empty() {
        return ChangeAvailabilityResponse {
            status: AvailabilityStatus::Rejected,
        };
    }

    let has_active_transaction = connectors.iter().any(|c| c.transaction.is_some());
    if has_active_transaction && request.kind == AvailabilityType::Inoperative {
        return ChangeAvailabilityResponse {
            status: AvailabilityStatus::Scheduled,
        };
    }

    for connector in connectors {
        connector.status = target_status;
    }
    ChangeAvailabilityResponse {
        status: AvailabilityStatus::Accepted,
    }
}

pub fn data_transfer(_session: &mut Session, _request: DataTransferRequest) -> DataTransferResponse {
    DataTransferResponse {
        status: crate::messages::enums::DataTransferStatus::UnknownVendorId,
        data: None,
    }
}

pub fn trigger_message(session: &Session, request: TriggerMessageRequest) -> TriggerMessageResponse {
    use crate::messages::enums::MessageTrigger;
    let supported = matches!(
        request.requested_message,
        MessageTrigger::Heartbeat
            | MessageTrigger::StatusNotification
            | MessageTrigger::MeterValues
            | MessageTrigger::BootNotification
    );
    if !supported {
        return TriggerMessageResponse {
            status: crate::messages::enums::TriggerMessageStatus::NotImplemented,
        };
    }
    if let Some(connector_id) = request.connector_id {
        if session.connector(connector_id).is_none() {
            return TriggerMessageResponse {
                status: crate::messages::enums::TriggerMessageStatus::Rejected,
            };
        }
    }
    TriggerMessageResponse {
        status: crate::messages::enums::TriggerMessageStatus::Accepted,
    }
}

pub fn reserve_now(session: &mut Session, request: ReserveNowRequest) -> ReserveNowResponse {
    let session_state = session.state;
    let Some(connector) = session.connector_mut(request.connector_id) else {
        return ReserveNowResponse {
            status: crate::messages::enums::ReservationStatus::Rejected,
        };
    };
    if connector.transaction.is_some() || session_state == SessionState::Charging {
        return ReserveNowResponse {
            status: crate::messages::enums::ReservationStatus::Occupied,
        };
    }
    match &connector.reservation {
        Some(existing) if existing.reservation_id != request.reservation_id => {
            return ReserveNowResponse {
                status: crate::messages::enums::ReservationStatus::Rejected,
            };
        }
        None if session_state != SessionState::Available => {
            return ReserveNowResponse {
                status: crate::messages::enums::ReservationStatus::Rejected,
            };
        }
        _ => {}
    }
    connector.reservation = Some(crate::session::model::Reservation {
        reservation_id: request.reservation_id,
        id_tag: request.id_tag,
        parent_id_tag: request.parent_id_tag,
        expiry_date: request.expiry_date,
    });
    connector.status = ChargePointStatus::Reserved;
    ReserveNowResponse {
        status: crate::messages::enums::ReservationStatus::Accepted,
    }
}

pub fn cancel_reservation(
    session: &mut Session,
    request: CancelReservationRequest,
) -> CancelReservationResponse {
    let connector = session
        .connectors
        .iter_mut()
        .find(|c| c.reservation.as_ref().map(|r| r.reservation_id) == Some(request.reservation_id));

    match connector {
        Some(connector) => {
            connector.reservation = None;
            connector.status = ChargePointStatus::Available;
            CancelReservationResponse {
                status: crate::messages::enums::CancelReservationStatus::Accepted,
            }
        }
        None => CancelReservationResponse {
            status: crate::messages::enums::CancelReservationStatus::Rejected,
        },
    }
}

pub fn set_charging_profile(
    session: &mut Session,
    request: SetChargingProfileRequest,
) -> SetChargingProfileResponse {
    if !request.cs_charging_profiles.has_ordered_periods() {
        return SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        };
    }
    if request.cs_charging_profiles.charging_profile_purpose == ChargingProfilePurpose::TxProfile
        && request.cs_charging_profiles.transaction_id.is_none()
    {
        return SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        };
    }
    session
        .profiles
        .install(request.connector_id, request.cs_charging_profiles);
    SetChargingProfileResponse {
        status: ChargingProfileStatus::Accepted,
    }
}

pub fn clear_charging_profile(
    session: &mut Session,
    request: ClearChargingProfileRequest,
) -> ClearChargingProfileResponse {
    let removed = session.profiles.clear_matching(
        request.id,
        request.connector_id,
        request.charging_profile_purpose,
        request.stack_level,
    );
    ClearChargingProfileResponse {
        status: if removed {
            ClearChargingProfileStatus::Accepted
        } else {
            ClearChargingProfileStatus::Unknown
        },
    }
}

pub fn get_composite_schedule(
    session: &Session,
    request: GetCompositeScheduleRequest,
) -> GetCompositeScheduleResponse {
    if session.connector(request.connector_id).is_none() {
        return GetCompositeScheduleResponse {
            status: CompositeScheduleStatus::Rejected,
            connector_id: None,
            schedule_start: None,
            charging_schedule: None,
        };
    }
    let profile = session
        .profiles
        .for_connector(request.connector_id)
        .max_by_key(|(seq, p)| {
            (
                p.charging_profile_purpose == ChargingProfilePurpose::TxProfile,
                p.stack_level,
                *seq,
            )
        })
        .map(|(_, profile)| profile);

    match profile {
        Some(profile) => GetCompositeScheduleResponse {
            status: CompositeScheduleStatus::Accepted,
            connector_id: Some(request.connector_id),
            schedule_start: Some(Utc::now()),
            charging_schedule: Some(profile.charging_schedule.clone()),
        },
        None => GetCompositeScheduleResponse {
            status: CompositeScheduleStatus::Rejected,
            connector_id: Some(request.connector_id),
            schedule_start: None,
            charging_schedule: None,
        },
    }
}

pub fn send_local_list(_session: &mut Session, _request: SendLocalListRequest) -> SendLocalListResponse {
    SendLocalListResponse {
        status: UpdateStatus::Accepted,
    }
}

pub fn get_local_list_version(_session: &Session) -> GetLocalListVersionResponse {
    GetLocalListVersionResponse { list_version: 0 }
}

pub fn update_firmware(_session: &mut Session, _request: UpdateFirmwareRequest) -> UpdateFirmwareResponse {
    UpdateFirmwareResponse {}
}

pub fn get_diagnostics(_session: &mut Session, _request: GetDiagnosticsRequest) -> GetDiagnosticsResponse {
    GetDiagnosticsResponse { file_name: None }
}
