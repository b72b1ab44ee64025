//! Vehicle-side charging physics: battery state and the power ceiling
//! the vehicle itself imposes as a function of state of charge.

/// A piecewise-linear SoC→power ceiling curve, e.g. a typical EV
/// tapering from full rate to near-zero above 80% SoC. `points` must be
/// sorted by `soc` ascending; values are clamped to the first/last
/// point outside the covered range.
#[derive(Debug, Clone)]
pub struct PowerCurve {
    points: Vec<(f64, f64)>,
}

impl PowerCurve {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        debug_assert!(
            points.windows(2).all(|w| w[0].0 <= w[1].0),
            "power curve points must be sorted by soc"
        );
        Self { points }
    }

    /// The default SoC→power-fraction envelope used when a vehicle
    /// profile doesn't specify a curve of its own: a step table of
    /// fractions of `max_power_w` by 10-point SoC band, floored at
    /// 3 kW so low-SoC sessions never simulate near-zero power.
    pub fn default_envelope(max_power_w: f64) -> Self {
        const BANDS: [(f64, f64); 16] = [
            (0.0, 0.80),
            (0.10, 0.80),
            (0.10, 0.95),
            (0.20, 0.95),
            (0.20, 1.00),
            (0.50, 1.00),
            (0.50, 0.90),
            (0.60, 0.90),
            (0.60, 0.75),
            (0.70, 0.75),
            (0.70, 0.55),
            (0.80, 0.55),
            (0.80, 0.30),
            (0.90, 0.30),
            (0.90, 0.15),
            (1.00, 0.15),
        ];
        const FLOOR_W: f64 = 3_000.0;
        let points = BANDS
            .iter()
            .map(|(soc, fraction)| (*soc, (max_power_w * fraction).max(FLOOR_W)))
            .collect();
        Self::new(points)
    }

    pub fn power_at(&self, soc: f64) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        if soc <= self.points[0].0 {
            return self.points[0].1;
        }
        if soc >= self.points[self.points.len() - 1].0 {
            return self.points[self.points.len() - 1].1;
        }
        for w in self.points.windows(2) {
            let (s0, p0) = w[0];
            let (s1, p1) = w[1];
            if soc >= s0 && soc <= s1 {
                if (s1 - s0).abs() < f64::EPSILON {
                    return p0;
                }
                let t = (soc - s0) / (s1 - s0);
                return p0 + t * (p1 - p0);
            }
        }
        self.points[self.points.len() - 1].1
    }
}

/// Mutable per-connector vehicle state, stepped once per physics tick.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub battery_capacity_wh: f64,
    pub soc: f64,
    pub target_soc: f64,
    pub curve: PowerCurve,
    pub max_ac_current_a: f64,
    pub phases: u8,
    pub efficiency: f64,
    pub last_power_w: f64,
}

impl VehicleState {
    pub fn new(battery_capacity_wh: f64, initial_soc: f64, target_soc: f64, max_power_w: f64) -> Self {
        Self {
            battery_capacity_wh,
            soc: initial_soc.clamp(0.0, 1.0),
            target_soc: target_soc.clamp(0.0, 1.0),
            curve: PowerCurve::default_envelope(max_power_w),
            max_ac_current_a: 32.0,
            phases: 3,
            efficiency: 0.92,
            last_power_w: 0.0,
        }
    }

    pub fn has_reached_target(&self) -> bool {
        self.soc >= self.target_soc
    }

    pub fn vehicle_power_ceiling(&self) -> f64 {
        self.curve.power_at(self.soc)
    }

    /// Raw energy delivered (what the meter counts), with no efficiency
    /// loss applied — this is energy imported from the grid, not energy
    /// stored in the battery.
    pub fn energy_wh_for(&self, power_w: f64, elapsed_secs: f64) -> f64 {
        power_w * elapsed_secs / 3600.0
    }

    /// Fraction of a percentage point of SoC that `delivered_energy_wh`
    /// of grid-imported energy adds to the battery, after conversion
    /// losses (`efficiency`).
    pub fn soc_delta_for(&self, delivered_energy_wh: f64) -> f64 {
        delivered_energy_wh * self.efficiency / self.battery_capacity_wh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_clamps_outside_range() {
        let curve = PowerCurve::new(vec![(0.2, 11000.0), (0.8, 11000.0), (1.0, 1100.0)]);
        assert_eq!(curve.power_at(0.0), 11000.0);
        assert_eq!(curve.power_at(1.0), 1100.0);
    }

    #[test]
    fn curve_interpolates_linearly() {
        let curve = PowerCurve::new(vec![(0.8, 10000.0), (1.0, 0.0)]);
        assert_eq!(curve.power_at(0.9), 5000.0);
    }

    #[test]
    fn reaches_target_soc() {
        let vehicle = VehicleState::new(60_000.0, 0.95, 0.9, 11_000.0);
        assert!(vehicle.has_reached_target());
    }
}
