//! Charging physics simulation.
//!
//! Each tick runs the same eight-step reconciliation: vehicle ceiling,
//! EVSE ceiling, smart-charging limit, take the minimum, ramp-limit
//! toward it, add measurement noise, integrate energy/SoC, then check
//! the target-SoC stop condition.

pub mod charger;
pub mod vehicle;

use rand::Rng;

use charger::ChargerCeiling;
use vehicle::VehicleState;

/// Result of one physics tick for a single connector.
#[derive(Debug, Clone, Copy)]
pub struct TickOutcome {
    pub delivered_power_w: f64,
    pub energy_added_wh: f64,
    pub soc_after: f64,
    pub target_reached: bool,
}

/// Step one connector's vehicle state forward by `elapsed_secs`.
/// `smart_charging_limit_w` is the minimum allowed by installed
/// charging profiles for this connector right now, or `f64::INFINITY`
/// if none applies.
pub fn step(
    vehicle: &mut VehicleState,
    charger: &ChargerCeiling,
    smart_charging_limit_w: f64,
    elapsed_secs: f64,
    noise_fraction: f64,
) -> TickOutcome {
    // 1. vehicle ceiling
    let vehicle_ceiling = vehicle.vehicle_power_ceiling();
    // 2. EVSE ceiling, reconciled against the vehicle's own AC limits
    let evse_ceiling = charger.rated_power_w_for_vehicle(vehicle);
    // 3 + 4. take the minimum across vehicle, EVSE and smart-charging limits
    let target = vehicle_ceiling.min(evse_ceiling).min(smart_charging_limit_w).max(0.0);
    // 5. ramp-limit toward the target from last tick's delivered power
    let ramped = charger.ramp_limited(vehicle.last_power_w, target, elapsed_secs);
    // 6. measurement noise
    let delivered = apply_noise(ramped, noise_fraction);
    // 7. integrate energy (raw, for the meter) and SoC (efficiency-derated)
    let energy_added_wh = vehicle.energy_wh_for(delivered, elapsed_secs);
    let soc_after = (vehicle.soc + vehicle.soc_delta_for(energy_added_wh)).min(1.0);

    vehicle.last_power_w = ramped;
    vehicle.soc = soc_after;

    // 8. target-SoC stop trigger
    let target_reached = vehicle.has_reached_target();

    TickOutcome {
        delivered_power_w: delivered,
        energy_added_wh,
        soc_after,
        target_reached,
    }
}

fn apply_noise(value: f64, fraction: f64) -> f64 {
    if fraction <= 0.0 || value <= 0.0 {
        return value.max(0.0);
    }
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(1.0 - fraction..=1.0 + fraction);
    (value * factor).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_adds_energy_and_raises_soc() {
        let mut vehicle = VehicleState::new(60_000.0, 0.5, 0.8, 11_000.0);
        let charger = ChargerCeiling::ac(230.0, 16.0, 3);
        let before = vehicle.soc;
        let outcome = step(&mut vehicle, &charger, f64::INFINITY, 3600.0, 0.0);
        assert!(outcome.soc_after > before);
        assert!(outcome.energy_added_wh > 0.0);
    }

    #[test]
    fn smart_charging_limit_caps_delivered_power() {
        let mut vehicle = VehicleState::new(60_000.0, 0.2, 0.8, 50_000.0);
        let charger = ChargerCeiling::dc(150_000.0);
        // A huge ramp rate so the limit, not ramping, is under test.
        let mut fast_charger = charger;
        fast_charger.ramp_up_w_per_sec = 1_000_000.0;
        let outcome = step(&mut vehicle, &fast_charger, 5_000.0, 10.0, 0.0);
        assert!(outcome.delivered_power_w <= 5_000.0 + 1.0);
    }

    #[test]
    fn target_reached_flag_set_once_soc_crosses_target() {
        let mut vehicle = VehicleState::new(1_000.0, 0.79, 0.8, 50_000.0);
        let charger = ChargerCeiling::ac(230.0, 32.0, 3);
        let outcome = step(&mut vehicle, &charger, f64::INFINITY, 60.0, 0.0);
        assert!(outcome.target_reached);
    }
}
