//! Stateful weather/climate simulator for the virtual sensor node.
//!
//! Models plausible sensor behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Diurnal (day/night) temperature and light cycles
//! - Per-reading electronic noise
//! - Episodic rain with a decaying intensity
//! - Slow battery discharge

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild day, light breeze, no rain. The default.
    Calm,
    /// Gusty wind, occasional light showers.
    Breezy,
    /// Sustained wind, frequent rain episodes with real intensity. Exercises
    /// the gateway's rain accumulation and rollover paths.
    Stormy,
    /// Stable indoor climate with a CO2 daily rhythm; wind and rain stay
    /// zero.
    Indoor,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "breezy" => Self::Breezy,
            "stormy" | "storm" => Self::Stormy,
            "indoor" => Self::Indoor,
            _ => Self::Calm,
        }
    }

    fn wind_mean(self) -> f64 {
        match self {
            Self::Calm => 1.5,
            Self::Breezy => 5.0,
            Self::Stormy => 12.0,
            Self::Indoor => 0.0,
        }
    }

    fn rain_start_chance(self) -> f64 {
        match self {
            Self::Calm | Self::Indoor => 0.0,
            Self::Breezy => 0.03,
            Self::Stormy => 0.12,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator state
// ---------------------------------------------------------------------------

/// One synthesized reading, in physical units. Each node kind picks the
/// fields it transmits.
#[derive(Debug, Clone, Copy)]
pub struct SimReading {
    pub temp_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
    pub wind_speed_ms: f32,
    pub wind_direction_deg: u16,
    pub rain_mm: f32,
    pub rain_rate_mmh: f32,
    pub co2_ppm: u16,
    pub lux: f32,
    pub battery_mv: u16,
}

pub struct Simulator {
    scenario: Scenario,
    temp_c: f64,
    humidity: f64,
    pressure: f64,
    wind: f64,
    direction: f64,
    co2: f64,
    battery_v: f64,
    /// Remaining rain episode intensity in mm/h; decays toward zero.
    rain_intensity: f64,
}

impl Simulator {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            temp_c: if scenario == Scenario::Indoor { 22.0 } else { 14.0 },
            humidity: if scenario == Scenario::Indoor { 45.0 } else { 70.0 },
            pressure: 1013.0,
            wind: scenario.wind_mean(),
            direction: fastrand::f64() * 360.0,
            co2: 500.0,
            battery_v: 3.95,
            rain_intensity: 0.0,
        }
    }

    /// Advance one transmit interval and return the resulting reading.
    /// `hour_of_day` drives the diurnal cycles; `interval_s` scales the rain
    /// accumulated since the previous packet.
    pub fn step(&mut self, hour_of_day: f64, interval_s: f64) -> SimReading {
        let daylight = ((hour_of_day - 6.0) / 12.0 * std::f64::consts::PI)
            .sin()
            .max(0.0);

        // Temperature: mean-reverting walk around a diurnal baseline.
        let temp_target = if self.scenario == Scenario::Indoor {
            22.0
        } else {
            10.0 + 8.0 * daylight
        };
        self.temp_c += 0.1 * (temp_target - self.temp_c) + gaussian(0.0, 0.15);

        // Humidity drifts against temperature, rises while raining.
        let hum_target = if self.rain_intensity > 0.0 { 95.0 } else { 85.0 - 25.0 * daylight };
        self.humidity = (self.humidity + 0.05 * (hum_target - self.humidity) + gaussian(0.0, 0.8))
            .clamp(5.0, 100.0);

        // Pressure: slow synoptic drift.
        self.pressure = (self.pressure + gaussian(0.0, 0.2)).clamp(960.0, 1045.0);

        // Wind: gusty mean reversion, direction meanders.
        self.wind = (self.wind + 0.2 * (self.scenario.wind_mean() - self.wind)
            + gaussian(0.0, 0.6))
        .max(0.0);
        self.direction = (self.direction + gaussian(0.0, 12.0)).rem_euclid(360.0);

        // Rain episodes start at random and decay away.
        if self.rain_intensity <= 0.0 && fastrand::f64() < self.scenario.rain_start_chance() {
            self.rain_intensity = gaussian(4.0, 2.0).clamp(0.5, 15.0);
        }
        let rain_rate = self.rain_intensity.max(0.0);
        let rain_mm = rain_rate * interval_s / 3600.0;
        self.rain_intensity = (self.rain_intensity - 0.3 + gaussian(0.0, 0.2)).max(0.0);

        // CO2 follows occupancy indoors, stays near ambient outside.
        let co2_target = if self.scenario == Scenario::Indoor {
            600.0 + 500.0 * (1.0 - daylight)
        } else {
            420.0
        };
        self.co2 = (self.co2 + 0.1 * (co2_target - self.co2) + gaussian(0.0, 8.0)).max(400.0);

        // Battery creeps down a fraction of a millivolt per packet.
        self.battery_v = (self.battery_v - 0.00002 + gaussian(0.0, 0.0005)).clamp(2.7, 4.1);

        SimReading {
            temp_c: self.temp_c as f32,
            humidity_pct: self.humidity as f32,
            pressure_hpa: self.pressure as f32,
            wind_speed_ms: self.wind as f32,
            wind_direction_deg: self.direction as u16 % 360,
            rain_mm: rain_mm as f32,
            rain_rate_mmh: rain_rate as f32,
            co2_ppm: self.co2 as u16,
            lux: (daylight * 40_000.0 + gaussian(0.0, 200.0)).max(0.0) as f32,
            battery_mv: (self.battery_v * 1000.0) as u16,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
