//! Smart-charging profile resolver: a pure function from the set
//! of installed profiles plus the current instant to a power ceiling
//! in watts for one connector's active (or about-to-start) transaction.
//!
//! Resolution order, highest priority first:
//! `TxProfile` (if it matches the live `transaction_id`) >
//! `TxDefaultProfile` > a hard ceiling from `ChargePointMaxProfile`.
//! Within a purpose, the profile with the highest `stackLevel` wins;
//! profiles scoped to connector 0 apply to every connector unless a
//! connector-specific profile of the same purpose/level exists.

use chrono::{DateTime, Utc};

use crate::messages::charging_profile::{
    ChargingProfile, ChargingProfileKindType, ChargingProfilePurpose, ChargingRateUnitType,
    ChargingSchedule,
};
use crate::physics::charger::ChargerCeiling;

/// Resolve the effective power ceiling, in watts, for `connector_id` at
/// instant `now`. Returns `f64::INFINITY` when no profile constrains
/// the connector — callers combine this with the vehicle/EVSE ceiling
/// via `min`, so infinity is the correct "no limit" identity.
pub fn resolve_limit_w<'a>(
    profiles: impl Iterator<Item = (u64, &'a ChargingProfile)>,
    now: DateTime<Utc>,
    transaction_id: Option<i32>,
    transaction_start: Option<DateTime<Utc>>,
    connector_id: u32,
    charger: &ChargerCeiling,
) -> f64 {
    let profiles: Vec<(u64, &ChargingProfile)> = profiles.collect();

    let applicable = |purpose: ChargingProfilePurpose, profile: &ChargingProfile| -> bool {
        if profile.charging_profile_purpose != purpose {
            return false;
        }
        if let Some(valid_from) = profile.valid_from {
            if now < valid_from {
                return false;
            }
        }
        if let Some(valid_to) = profile.valid_to {
            if now > valid_to {
                return false;
            }
        }
        match purpose {
            ChargingProfilePurpose::TxProfile => {
                transaction_id.is_some() && profile.transaction_id == transaction_id
            }
            _ => true,
        }
    };

    // Same-purpose/same-stackLevel ties resolve to the most recently
    // installed profile, so `seq` breaks ties after `stack_level`.
    let best_for_purpose = |purpose: ChargingProfilePurpose| -> Option<f64> {
        profiles
            .iter()
            .copied()
            .filter(|(_, p)| applicable(purpose, p))
            .max_by_key(|(seq, p)| (p.stack_level, *seq))
            .and_then(|(_, p)| active_period_limit_w(p, now, transaction_start, charger))
    };

    let tx_limit = best_for_purpose(ChargingProfilePurpose::TxProfile);
    let tx_default_limit = best_for_purpose(ChargingProfilePurpose::TxDefaultProfile);
    let max_limit = best_for_purpose(ChargingProfilePurpose::ChargePointMaxProfile);

    let session_limit = tx_limit.or(tx_default_limit).unwrap_or(f64::INFINITY);
    let _ = connector_id; // profile scoping is handled by the caller passing only applicable profiles

    match max_limit {
        Some(ceiling) => session_limit.min(ceiling),
        None => session_limit,
    }
}

/// Find the schedule period active at `now` for `profile`, if any, and
/// convert its limit to watts.
fn active_period_limit_w(
    profile: &ChargingProfile,
    now: DateTime<Utc>,
    transaction_start: Option<DateTime<Utc>>,
    charger: &ChargerCeiling,
) -> Option<f64> {
    let schedule = &profile.charging_schedule;
    let elapsed_secs = elapsed_since_schedule_start(profile, schedule, now, transaction_start)?;

    let period = schedule
        .charging_schedule_period
        .iter()
        .filter(|p| (p.start_period as i64) <= elapsed_secs)
        .max_by_key(|p| p.start_period)?;

    if let Some(duration) = schedule.duration {
        if elapsed_secs >= duration as i64 {
            return None;
        }
    }

    let limit_w = match schedule.charging_rate_unit {
        ChargingRateUnitType::W => period.limit,
        ChargingRateUnitType::A => charger.amps_to_watts(period.limit, period.number_phases),
    };
    Some(limit_w)
}

fn elapsed_since_schedule_start(
    profile: &ChargingProfile,
    schedule: &ChargingSchedule,
    now: DateTime<Utc>,
    transaction_start: Option<DateTime<Utc>>,
) -> Option<i64> {
    match profile.charging_profile_kind {
        ChargingProfileKindType::Absolute => {
            let start = schedule.start_schedule?;
            Some((now - start).num_seconds())
        }
        ChargingProfileKindType::Relative => {
            let start = transaction_start?;
            Some((now - start).num_seconds().max(0))
        }
        ChargingProfileKindType::Recurring => {
            let start = schedule.start_schedule.unwrap_or(now);
            let period_len = match profile.recurrency_kind {
                Some(crate::messages::charging_profile::RecurrencyKindType::Daily) => 86_400,
                Some(crate::messages::charging_profile::RecurrencyKindType::Weekly) => 604_800,
                None => 86_400,
            };
            let since_start = (now - start).num_seconds();
            if since_start < 0 {
                return None;
            }
            Some(since_start % period_len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::charging_profile::{ChargingSchedulePeriod, RecurrencyKindType};

    /// Pairs each profile with its index as an insertion-order stand-in,
    /// mirroring how `ProfileStore` numbers profiles as they're installed.
    fn seq<'a>(
        profiles: impl Iterator<Item = &'a ChargingProfile>,
    ) -> impl Iterator<Item = (u64, &'a ChargingProfile)> {
        profiles.enumerate().map(|(i, p)| (i as u64, p))
    }

    fn absolute_profile(
        purpose: ChargingProfilePurpose,
        stack_level: u32,
        limit_w: f64,
        transaction_id: Option<i32>,
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: 1,
            transaction_id,
            stack_level,
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKindType::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: None,
                start_schedule: Some(Utc::now() - chrono::Duration::seconds(10)),
                charging_rate_unit: ChargingRateUnitType::W,
                charging_schedule_period: vec![ChargingSchedulePeriod {
                    start_period: 0,
                    limit: limit_w,
                    number_phases: None,
                }],
                min_charging_rate: None,
            },
        }
    }

    #[test]
    fn tx_profile_takes_priority_over_tx_default() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let profiles = vec![
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 11_000.0, None),
            absolute_profile(ChargingProfilePurpose::TxProfile, 0, 3_700.0, Some(42)),
        ];
        let limit = resolve_limit_w(seq(profiles.iter()), now, Some(42), None, 1, &charger);
        assert!((limit - 3_700.0).abs() < 1.0);
    }

    #[test]
    fn charge_point_max_clamps_session_limit() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let profiles = vec![
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 22_000.0, None),
            absolute_profile(ChargingProfilePurpose::ChargePointMaxProfile, 0, 7_000.0, None),
        ];
        let limit = resolve_limit_w(seq(profiles.iter()), now, None, None, 1, &charger);
        assert!((limit - 7_000.0).abs() < 1.0);
    }

    #[test]
    fn no_profiles_means_no_limit() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let limit = resolve_limit_w(std::iter::empty(), now, None, None, 1, &charger);
        assert_eq!(limit, f64::INFINITY);
    }

    #[test]
    fn recurring_daily_profile_wraps() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let mut profile =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 5_000.0, None);
        profile.charging_profile_kind = ChargingProfileKindType::Recurring;
        profile.recurrency_kind = Some(RecurrencyKindType::Daily);
        profile.charging_schedule.start_schedule = Some(now - chrono::Duration::days(2));
        let limit = resolve_limit_w(seq(std::iter::once(&profile)), now, None, None, 1, &charger);
        assert!((limit - 5_000.0).abs() < 1.0);
    }

    #[test]
    fn relative_profile_anchors_to_transaction_start_and_advances_periods() {
        let now = Utc::now();
        let tx_start = now - chrono::Duration::seconds(120);
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let mut profile =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 11_000.0, None);
        profile.charging_profile_kind = ChargingProfileKindType::Relative;
        profile.charging_schedule.start_schedule = None;
        profile.charging_schedule.charging_schedule_period = vec![
            ChargingSchedulePeriod {
                start_period: 0,
                limit: 11_000.0,
                number_phases: None,
            },
            ChargingSchedulePeriod {
                start_period: 60,
                limit: 3_700.0,
                number_phases: None,
            },
        ];
        let limit = resolve_limit_w(
            seq(std::iter::once(&profile)),
            now,
            None,
            Some(tx_start),
            1,
            &charger,
        );
        assert!((limit - 3_700.0).abs() < 1.0);
    }

    #[test]
    fn profile_outside_valid_window_is_ignored() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let mut profile =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 11_000.0, None);
        profile.valid_to = Some(now - chrono::Duration::seconds(1));
        let limit = resolve_limit_w(seq(std::iter::once(&profile)), now, None, None, 1, &charger);
        assert_eq!(limit, f64::INFINITY);
    }

    #[test]
    fn profile_not_yet_valid_is_ignored() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let mut profile =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 11_000.0, None);
        profile.valid_from = Some(now + chrono::Duration::seconds(60));
        let limit = resolve_limit_w(seq(std::iter::once(&profile)), now, None, None, 1, &charger);
        assert_eq!(limit, f64::INFINITY);
    }

    #[test]
    fn relative_profile_without_transaction_start_does_not_apply() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let mut profile =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 11_000.0, None);
        profile.charging_profile_kind = ChargingProfileKindType::Relative;
        profile.charging_schedule.start_schedule = None;
        let limit = resolve_limit_w(seq(std::iter::once(&profile)), now, None, None, 1, &charger);
        assert_eq!(limit, f64::INFINITY);
    }

    #[test]
    fn tie_on_purpose_and_stack_level_resolves_to_most_recently_inserted() {
        let now = Utc::now();
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let station_wide =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 11_000.0, None);
        let connector_specific =
            absolute_profile(ChargingProfilePurpose::TxDefaultProfile, 0, 3_700.0, None);
        // Same purpose, same stackLevel: index 1 (connector_specific) was
        // installed after index 0, so it must win the tie.
        let profiles = vec![station_wide, connector_specific];
        let limit = resolve_limit_w(seq(profiles.iter()), now, None, None, 1, &charger);
        assert!((limit - 3_700.0).abs() < 1.0);
    }
}
