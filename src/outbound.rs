//! Outbound message orchestration: building the CP→CS payloads a
//! session originates — boot, heartbeat, authorize, transaction
//! lifecycle, meter values, status — and running the per-tick physics
//! step that feeds MeterValues.

use chrono::Utc;
use serde_json::Value;

use crate::messages::core::{
    AuthorizeRequest, BootNotificationRequest, HeartbeatRequest, MeterValue, MeterValuesRequest,
    SampledValue, StartTransactionRequest, StatusNotificationRequest, StopTransactionRequest,
};
use crate::messages::enums::{ChargePointErrorCode, ChargePointStatus, Measurand, ReadingContext, UnitOfMeasure};
use crate::messages::OutboundAction;
use crate::physics::{self, charger::ChargerCeiling};
use crate::session::model::Session;
use crate::smart_charging;

pub type OutboundEvent = (OutboundAction, Value);

pub fn boot_notification(session: &Session) -> OutboundEvent {
    let request = BootNotificationRequest {
        charge_point_vendor: session.identity.vendor.clone(),
        charge_point_model: session.identity.model.clone(),
        charge_point_serial_number: session.identity.serial_number.clone(),
        charge_box_serial_number: None,
        firmware_version: session.identity.firmware_version.clone(),
        iccid: None,
        imsi: None,
        meter_type: None,
        meter_serial_number: None,
    };
    (
        OutboundAction::BootNotification,
        serde_json::to_value(request).expect("BootNotificationRequest always serializes"),
    )
}

pub fn status_notification(connector_id: u32, status: ChargePointStatus) -> OutboundEvent {
    let request = StatusNotificationRequest {
        connector_id,
        error_code: ChargePointErrorCode::NoError,
        info: None,
        status,
        timestamp: Utc::now(),
        vendor_id: None,
        vendor_error_code: None,
    };
    (
        OutboundAction::StatusNotification,
        serde_json::to_value(request).expect("StatusNotificationRequest always serializes"),
    )
}

pub fn authorize(id_tag: &str) -> OutboundEvent {
    let request = AuthorizeRequest {
        id_tag: id_tag.to_string(),
    };
    (
        OutboundAction::Authorize,
        serde_json::to_value(request).expect("AuthorizeRequest always serializes"),
    )
}

pub fn start_transaction(connector_id: u32, id_tag: &str, meter_start_wh: i64) -> OutboundEvent {
    let request = StartTransactionRequest {
        connector_id,
        id_tag: id_tag.to_string(),
        meter_start: meter_start_wh,
        reservation_id: None,
        timestamp: Utc::now(),
    };
    (
        OutboundAction::StartTransaction,
        serde_json::to_value(request).expect("StartTransactionRequest always serializes"),
    )
}

pub fn stop_transaction(
    id_tag: Option<String>,
    meter_stop_wh: i64,
    transaction_id: i32,
    reason: crate::messages::enums::StopTransactionReason,
) -> OutboundEvent {
    let request = StopTransactionRequest {
        id_tag,
        meter_stop: meter_stop_wh,
        timestamp: Utc::now(),
        transaction_id,
        reason: Some(reason),
        transaction_data: None,
    };
    (
        OutboundAction::StopTransaction,
        serde_json::to_value(request).expect("StopTransactionRequest always serializes"),
    )
}

/// Builds one MeterValue for `connector`. `context` distinguishes a
/// regular periodic sample from a clock-aligned one; both
/// carry the same measurand set.
fn meter_value_for(
    connector: &crate::session::model::Connector,
    context: ReadingContext,
    charger: &ChargerCeiling,
) -> MeterValue {
    let mut sampled = vec![SampledValue {
        value: connector.meter_wh.to_string(),
        context: Some(context),
        format: None,
        measurand: Some(Measurand::EnergyActiveImportRegister),
        phase: None,
        location: None,
        unit: Some(UnitOfMeasure::Wh),
    }];
    if let Some(vehicle) = &connector.vehicle {
        sampled.push(SampledValue {
            value: format!("{:.1}", vehicle.soc * 100.0),
            context: Some(context),
            format: None,
            measurand: Some(Measurand::SoC),
            phase: None,
            location: None,
            unit: Some(UnitOfMeasure::Percent),
        });
        sampled.push(SampledValue {
            value: format!("{:.0}", vehicle.last_power_w),
            context: Some(context),
            format: None,
            measurand: Some(Measurand::PowerActiveImport),
            phase: None,
            location: None,
            unit: Some(UnitOfMeasure::W),
        });
        if let crate::physics::charger::SupplyKind::Ac { voltage_v, phases, .. } = charger.supply {
            sampled.push(SampledValue {
                value: format!("{:.1}", voltage_v),
                context: Some(context),
                format: None,
                measurand: Some(Measurand::Voltage),
                phase: None,
                location: None,
                unit: Some(UnitOfMeasure::V),
            });
            let current_a = vehicle.last_power_w / voltage_v / phases as f64;
            sampled.push(SampledValue {
                value: format!("{:.1}", current_a),
                context: Some(context),
                format: None,
                measurand: Some(Measurand::CurrentImport),
                phase: None,
                location: None,
                unit: Some(UnitOfMeasure::A),
            });
        }
    }
    MeterValue {
        timestamp: Utc::now(),
        sampled_value: sampled,
    }
}

/// Run one scheduler tick: advance heartbeat/meter-value countdowns,
/// step charging physics for every connector with an active
/// transaction, and collect the outbound calls this tick produced.
pub fn tick(session: &mut Session, elapsed_secs: f64) -> Vec<OutboundEvent> {
    let mut events = Vec::new();

    session.heartbeat_due_in_secs -= elapsed_secs;
    if session.heartbeat_due_in_secs <= 0.0 {
        session.heartbeat_due_in_secs += session.heartbeat_interval_secs as f64;
        events.push((
            OutboundAction::Heartbeat,
            serde_json::to_value(HeartbeatRequest {}).expect("HeartbeatRequest always serializes"),
        ));
    }

    session.meter_value_due_in_secs -= elapsed_secs;
    let meter_due = session.meter_value_due_in_secs <= 0.0;
    if meter_due {
        session.meter_value_due_in_secs += session.meter_value_sample_interval_secs as f64;
    }

    let clock_aligned_due = if session.clock_aligned_data_interval_secs > 0 {
        session.clock_aligned_due_in_secs -= elapsed_secs;
        let due = session.clock_aligned_due_in_secs <= 0.0;
        if due {
            session.clock_aligned_due_in_secs += session.clock_aligned_data_interval_secs as f64;
        }
        due
    } else {
        false
    };

    let charger = session.charger_type.to_ceiling();
    let now = Utc::now();
    let profiles = &session.profiles;

    let mut stopped_connectors = Vec::new();

    for connector in session.connectors.iter_mut() {
        if let Some(reservation) = &connector.reservation {
            if reservation.expiry_date <= now {
                connector.reservation = None;
                if connector.status == crate::messages::enums::ChargePointStatus::Reserved {
                    connector.status = crate::messages::enums::ChargePointStatus::Available;
                }
            }
        }

        let transaction_id = connector.transaction.as_ref().map(|t| t.transaction_id);
        let transaction_start = connector.transaction.as_ref().map(|t| t.started_at);
        let Some(vehicle) = connector.vehicle.as_mut() else {
            continue;
        };
        if transaction_id.is_none() {
            continue;
        }

        let limit_w = smart_charging::resolve_limit_w(
            profiles.for_connector(connector.connector_id),
            now,
            transaction_id,
            transaction_start,
            connector.connector_id,
            &charger,
        );
        let outcome = physics::step(vehicle, &charger, limit_w, elapsed_secs, 0.03);
        connector.meter_wh += outcome.energy_added_wh.round() as i64;

        if meter_due {
            let meter_value = meter_value_for(connector, ReadingContext::SamplePeriodic, &charger);
            let request = MeterValuesRequest {
                connector_id: connector.connector_id,
                transaction_id,
                meter_value: vec![meter_value],
            };
            events.push((
                OutboundAction::MeterValues,
                serde_json::to_value(request).expect("MeterValuesRequest always serializes"),
            ));
        }

        if clock_aligned_due {
            let meter_value = meter_value_for(connector, ReadingContext::SampleClock, &charger);
            let request = MeterValuesRequest {
                connector_id: connector.connector_id,
                transaction_id,
                meter_value: vec![meter_value],
            };
            events.push((
                OutboundAction::MeterValues,
                serde_json::to_value(request).expect("MeterValuesRequest always serializes"),
            ));
        }

        if outcome.target_reached {
            stopped_connectors.push(connector.connector_id);
        }
    }

    for connector_id in stopped_connectors {
        if let Some(event) = stop_transaction_for_target_reached(session, connector_id) {
            events.push(event);
        }
    }

    events
}

fn stop_transaction_for_target_reached(session: &mut Session, connector_id: u32) -> Option<OutboundEvent> {
    let connector = session.connector_mut(connector_id)?;
    let transaction = connector.transaction.take()?;
    connector.vehicle = None;
    connector.status = ChargePointStatus::Finishing;

    Some(stop_transaction(
        Some(transaction.id_tag.clone()),
        connector.meter_wh,
        transaction.transaction_id,
        crate::messages::enums::StopTransactionReason::Other,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::SessionIdentity;

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
    fn tick_emits_heartbeat_once_interval_elapses() {
        let mut session = new_session();
        session.heartbeat_interval_secs = 10;
        session.heartbeat_due_in_secs = 10.0;
        let events = tick(&mut session, 11.0);
        assert!(events.iter().any(|(a, _)| *a == OutboundAction::Heartbeat));
    }

    #[test]
    fn tick_without_transaction_never_steps_physics() {
        let mut session = new_session();
        let events = tick(&mut session, 60.0);
        assert!(!events.iter().any(|(a, _)| *a == OutboundAction::MeterValues));
    }

    #[test]
    fn tick_stops_transaction_once_target_soc_reached() {
        let mut session = new_session();
        session.meter_value_due_in_secs = 1.0;
        let connector = session.connector_mut(1).unwrap();
        connector.transaction = Some(crate::session::model::Transaction {
            transaction_id: 7,
            connector_id: 1,
            id_tag: "TAG1".into(),
            meter_start_wh: 0,
            started_at: Utc::now(),
            reservation_id: None,
        });
        connector.vehicle = Some(crate::physics::vehicle::VehicleState::new(
            1_000.0, 0.79, 0.8, 50_000.0,
        ));
        let events = tick(&mut session, 60.0);
        assert!(events.iter().any(|(a, _)| *a == OutboundAction::StopTransaction));
        assert!(session.connector(1).unwrap().transaction.is_none());
    }
}
