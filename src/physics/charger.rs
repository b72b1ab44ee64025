//! EVSE-side charging physics: the power ceiling the charger hardware
//! itself imposes, independent of what the vehicle or a smart-charging
//! profile would allow.

use super::vehicle::VehicleState;

/// The charger hardware families. AC variants differ only in how many
/// phases are wired; DC variants differ only in rated power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargerType {
    AcMono,
    AcBi,
    AcTri,
    Dc50,
    Dc150,
    Dc350,
}

impl ChargerType {
    pub fn to_ceiling(self) -> ChargerCeiling {
        match self {
            ChargerType::AcMono => ChargerCeiling::ac(230.0, 32.0, 1),
            ChargerType::AcBi => ChargerCeiling::ac(230.0, 32.0, 2),
            ChargerType::AcTri => ChargerCeiling::ac(230.0, 32.0, 3),
            ChargerType::Dc50 => ChargerCeiling::dc(50_000.0),
            ChargerType::Dc150 => ChargerCeiling::dc(150_000.0),
            ChargerType::Dc350 => ChargerCeiling::dc(350_000.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SupplyKind {
    Ac { voltage_v: f64, max_current_a: f64, phases: u8 },
    Dc { max_power_w: f64 },
}

/// The `k` multiplier in `P = V·I·k`: 1 for a single phase, 2 for
/// split-phase ("bi"), `√3` for three-phase. Anything else
/// falls back to the raw phase count rather than panicking.
fn phase_factor(phases: u32) -> f64 {
    match phases {
        1 => 1.0,
        2 => 2.0,
        3 => 3_f64.sqrt(),
        other => other as f64,
    }
}

/// Fixed hardware ceiling for one connector's supply.
#[derive(Debug, Clone, Copy)]
pub struct ChargerCeiling {
    pub supply: SupplyKind,
    /// Max rise in output power, in watts per second, toward a higher
    /// target.
    pub ramp_up_w_per_sec: f64,
    /// Max fall in output power, in watts per second, toward a lower
    /// target.
    pub ramp_down_w_per_sec: f64,
}

/// Default rise rate from the charging envelope: 5 kW/s up.
pub const DEFAULT_RAMP_UP_W_PER_SEC: f64 = 5_000.0;
/// Default fall rate from the charging envelope: 3 kW/s down.
pub const DEFAULT_RAMP_DOWN_W_PER_SEC: f64 = 3_000.0;

impl ChargerCeiling {
    pub fn ac(voltage_v: f64, max_current_a: f64, phases: u8) -> Self {
        Self {
            supply: SupplyKind::Ac {
                voltage_v,
                max_current_a,
                phases,
            },
            ramp_up_w_per_sec: DEFAULT_RAMP_UP_W_PER_SEC,
            ramp_down_w_per_sec: DEFAULT_RAMP_DOWN_W_PER_SEC,
        }
    }

    pub fn dc(max_power_w: f64) -> Self {
        Self {
            supply: SupplyKind::Dc { max_power_w },
            ramp_up_w_per_sec: DEFAULT_RAMP_UP_W_PER_SEC,
            ramp_down_w_per_sec: DEFAULT_RAMP_DOWN_W_PER_SEC,
        }
    }

    pub fn rated_power_w(&self) -> f64 {
        match self.supply {
            SupplyKind::Ac {
                voltage_v,
                max_current_a,
                phases,
            } => voltage_v * max_current_a * phase_factor(phases as u32),
            SupplyKind::Dc { max_power_w } => max_power_w,
        }
    }

    /// The EVSE ceiling reconciled against the vehicle's own AC import
    /// limits, by taking the minimum of phases and per-phase amps. DC
    /// supplies aren't phase-reconciled — their ceiling is `rated_power_w()`.
    pub fn rated_power_w_for_vehicle(&self, vehicle: &VehicleState) -> f64 {
        match self.supply {
            SupplyKind::Ac {
                voltage_v,
                max_current_a,
                phases,
            } => {
                let current = max_current_a.min(vehicle.max_ac_current_a);
                let effective_phases = phases.min(vehicle.phases);
                voltage_v * current * phase_factor(effective_phases as u32)
            }
            SupplyKind::Dc { max_power_w } => max_power_w,
        }
    }

    /// Convert a candidate current-amp limit (as used by smart charging
    /// in `A` units) to a power ceiling in watts for this supply.
    /// `override_phases` is the schedule period's own `numberPhases`
    /// when given; absent, it falls back to this connector's own phase
    /// count.
    pub fn amps_to_watts(&self, amps: f64, override_phases: Option<u32>) -> f64 {
        match self.supply {
            SupplyKind::Ac {
                voltage_v, phases, ..
            } => {
                let phases = override_phases.unwrap_or(phases as u32);
                voltage_v * amps * phase_factor(phases)
            }
            SupplyKind::Dc { .. } => amps,
        }
    }

    /// Apply ramp-rate limiting: output power can rise at most
    /// `ramp_up_w_per_sec` and fall at most `ramp_down_w_per_sec`
    /// watts per second toward `target_w`, starting from `current_w`.
    pub fn ramp_limited(&self, current_w: f64, target_w: f64, elapsed_secs: f64) -> f64 {
        if target_w > current_w {
            let max_delta = self.ramp_up_w_per_sec * elapsed_secs;
            (current_w + max_delta).min(target_w)
        } else {
            let max_delta = self.ramp_down_w_per_sec * elapsed_secs;
            (current_w - max_delta).max(target_w)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ac_rated_power_uses_sqrt3_for_three_phase() {
        let ceiling = ChargerCeiling::ac(230.0, 32.0, 3);
        let expected = 230.0 * 32.0 * 3_f64.sqrt();
        assert!((ceiling.rated_power_w() - expected).abs() < 1e-6);
    }

    #[test]
    fn ac_rated_power_is_voltage_times_current_for_mono() {
        let ceiling = ChargerCeiling::ac(230.0, 32.0, 1);
        assert!((ceiling.rated_power_w() - 7_360.0).abs() < 1e-6);
    }

    #[test]
    fn vehicle_reconciliation_takes_the_minimum() {
        let ceiling = ChargerCeiling::ac(230.0, 32.0, 3);
        let mut vehicle = VehicleState::new(60_000.0, 0.5, 0.8, 11_000.0);
        vehicle.max_ac_current_a = 16.0;
        vehicle.phases = 1;
        let expected = 230.0 * 16.0 * phase_factor(1);
        assert!((ceiling.rated_power_w_for_vehicle(&vehicle) - expected).abs() < 1e-6);
    }

    #[test]
    fn ramp_limits_large_upward_jump() {
        let ceiling = ChargerCeiling::ac(230.0, 32.0, 1);
        let next = ceiling.ramp_limited(0.0, 7_360.0, 1.0);
        assert!(next < 7_360.0);
        assert!(next > 0.0);
    }

    #[test]
    fn ramp_allows_small_step() {
        let ceiling = ChargerCeiling::ac(230.0, 32.0, 1);
        let rated = ceiling.rated_power_w();
        let next = ceiling.ramp_limited(rated * 0.5, rated * 0.5 + 1.0, 1.0);
        assert!((next - (rated * 0.5 + 1.0)).abs() < 1e-6);
    }
}
