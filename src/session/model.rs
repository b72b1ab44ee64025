//! Session and connector data model.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::messages::charging_profile::ChargingProfile;
use crate::messages::enums::{ChargePointErrorCode, ChargePointStatus};
use crate::physics::vehicle::VehicleState;
use crate::session::state::SessionState;

/// Static identity and boot parameters for one simulated charge point.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub charge_point_id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: i32,
    pub id_tag: String,
    pub parent_id_tag: Option<String>,
    pub expiry_date: DateTime<Utc>,
}

/// An active or just-finished transaction on a connector.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: i32,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start_wh: i64,
    pub started_at: DateTime<Utc>,
    pub reservation_id: Option<i32>,
}

/// One physical connector on the charge point. Owns its own vehicle
/// physics state, status, and optional active transaction/reservation.
#[derive(Debug, Clone)]
pub struct Connector {
    pub connector_id: u32,
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
    pub last_status_change: DateTime<Utc>,
    pub transaction: Option<Transaction>,
    pub reservation: Option<Reservation>,
    pub vehicle: Option<VehicleState>,
    pub meter_wh: i64,
}

impl Connector {
    pub fn new(connector_id: u32) -> Self {
        Self {
            connector_id,
            status: ChargePointStatus::Available,
            error_code: ChargePointErrorCode::NoError,
            last_status_change: Utc::now(),
            transaction: None,
            reservation: None,
            vehicle: None,
            meter_wh: 0,
        }
    }
}

/// Charging profiles installed on this session, keyed by
/// `(connectorId, purpose, stackLevel)`: inserting a profile for an
/// existing triple replaces it. `connectorId == 0`
/// means the profile applies to every connector (station-wide).
///
/// Each entry carries the monotonic sequence number it was installed
/// under, so a same-purpose/same-`stackLevel` tie between two
/// profiles (e.g. one station-wide, one connector-specific) can be
/// broken by "most recently inserted" rather than hash-map order.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: HashMap<
        (u32, crate::messages::charging_profile::ChargingProfilePurpose, u32),
        (u64, ChargingProfile),
    >,
    next_seq: u64,
}

impl ProfileStore {
    pub fn install(&mut self, connector_id: u32, profile: ChargingProfile) {
        let (purpose, stack_level) = profile.key();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.profiles
            .insert((connector_id, purpose, stack_level), (seq, profile));
    }

    pub fn clear_all(&mut self) {
        self.profiles.clear();
    }

    pub fn remove_by_id(&mut self, id: u32) -> bool {
        let before = self.profiles.len();
        self.profiles.retain(|_, (_, p)| p.charging_profile_id != id);
        self.profiles.len() != before
    }

    /// Remove profiles matching the (all-optional) filters from
    /// `ClearChargingProfile`. Returns whether anything was removed.
    pub fn clear_matching(
        &mut self,
        id: Option<u32>,
        connector_id: Option<u32>,
        purpose: Option<crate::messages::charging_profile::ChargingProfilePurpose>,
        stack_level: Option<u32>,
    ) -> bool {
        let before = self.profiles.len();
        self.profiles.retain(|(cid, p, level), (_, profile)| {
            let matches = id.map_or(true, |v| v == profile.charging_profile_id)
                && connector_id.map_or(true, |v| v == *cid)
                && purpose.map_or(true, |v| v == *p)
                && stack_level.map_or(true, |v| v == *level);
            !matches
        });
        self.profiles.len() != before
    }

    /// All profiles applicable to `connector_id`: station-wide
    /// (`connectorId == 0`) profiles plus connector-specific ones.
    /// Yields each profile alongside its insertion sequence number.
    pub fn for_connector(
        &self,
        connector_id: u32,
    ) -> impl Iterator<Item = (u64, &ChargingProfile)> {
        self.profiles
            .iter()
            .filter(move |((cid, _, _), _)| *cid == 0 || *cid == connector_id)
            .map(|(_, (seq, profile))| (*seq, profile))
    }

    pub fn all(&self) -> impl Iterator<Item = (u64, &ChargingProfile)> {
        self.profiles.values().map(|(seq, profile)| (*seq, profile))
    }
}

/// The full mutable state of one simulated session, owned exclusively
/// by its actor task (see [`crate::session::actor`]).
pub struct Session {
    pub identity: SessionIdentity,
    pub state: SessionState,
    pub connectors: Vec<Connector>,
    pub profiles: ProfileStore,
    pub configuration: HashMap<String, String>,
    pub charger_type: crate::physics::charger::ChargerType,
    pub heartbeat_interval_secs: u32,
    pub meter_value_sample_interval_secs: u32,
    /// 0 disables clock-aligned sampling entirely.
    pub clock_aligned_data_interval_secs: u32,
    pub next_transaction_id: i32,
    /// Countdown, in seconds, to the next scheduled Heartbeat/MeterValues
    /// send. Decremented by the scheduler each tick; reset to the
    /// configured interval once a message fires.
    pub heartbeat_due_in_secs: f64,
    pub meter_value_due_in_secs: f64,
    /// Countdown to the next clock-aligned sample. Initialized so the
    /// first fire lands on a wall-clock boundary; every
    /// subsequent fire is exactly `clock_aligned_data_interval_secs`
    /// later.
    pub clock_aligned_due_in_secs: f64,
}

impl Session {
    pub fn new(identity: SessionIdentity, connector_count: u32) -> Self {
        let connectors = (1..=connector_count).map(Connector::new).collect();
        Self {
            identity,
            state: SessionState::Disconnected,
            connectors,
            profiles: ProfileStore::default(),
            configuration: default_configuration(),
            charger_type: crate::physics::charger::ChargerType::AcTri,
            heartbeat_interval_secs: 300,
            meter_value_sample_interval_secs: 60,
            clock_aligned_data_interval_secs: 0,
            next_transaction_id: 1,
            heartbeat_due_in_secs: 300.0,
            meter_value_due_in_secs: 60.0,
            clock_aligned_due_in_secs: 0.0,
        }
    }

    /// Enables clock-aligned sampling on interval `secs`, arming the
    /// countdown to fire on the next wall-clock boundary rather than
    /// `secs` from now. `secs == 0` disables it.
    pub fn set_clock_aligned_interval(&mut self, secs: u32) {
        self.clock_aligned_data_interval_secs = secs;
        self.clock_aligned_due_in_secs = if secs == 0 {
            0.0
        } else {
            let elapsed_in_period = (Utc::now().timestamp() as u64) % secs as u64;
            (secs as u64 - elapsed_in_period) as f64
        };
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Option<&mut Connector> {
        self.connectors
            .iter_mut()
            .find(|c| c.connector_id == connector_id)
    }

    pub fn connector(&self, connector_id: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.connector_id == connector_id)
    }

    pub fn allocate_transaction_id(&mut self) -> i32 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        id
    }
}

fn default_configuration() -> HashMap<String, String> {
    let mut config = HashMap::new();
    config.insert("HeartbeatInterval".into(), "300".into());
    config.insert("MeterValueSampleInterval".into(), "60".into());
    config.insert("ConnectionTimeOut".into(), "60".into());
    config.insert("NumberOfConnectors".into(), "1".into());
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_requested_connectors() {
        let identity = SessionIdentity {
            charge_point_id: "CP-1".into(),
            vendor: "Acme".into(),
            model: "X1".into(),
            serial_number: None,
            firmware_version: None,
        };
        let session = Session::new(identity, 2);
        assert_eq!(session.connectors.len(), 2);
        assert!(session.connector(1).is_some());
        assert!(session.connector(2).is_some());
        assert!(session.connector(3).is_none());
    }

    #[test]
    fn transaction_ids_increase() {
        let identity = SessionIdentity {
            charge_point_id: "CP-1".into(),
            vendor: "Acme".into(),
            model: "X1".into(),
            serial_number: None,
            firmware_version: None,
        };
        let mut session = Session::new(identity, 1);
        let a = session.allocate_transaction_id();
        let b = session.allocate_transaction_id();
        assert!(b > a);
    }
}
