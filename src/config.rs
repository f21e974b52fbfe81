use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''))
            {
                value = &value[1..value.len() - 1];
            }

            // Only set if not already set (env vars take precedence)
            if std::env::var(key).is_err() {
                // SAFETY: We're single-threaded at this point (called before any async runtime)
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub matter: MatterConfig,
    pub sensor: SensorConfig,
    pub guard: GuardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatterConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_name: String,
    pub discriminator: u16,
    pub passcode: u32,
}

/// Soil probe calibration and sampling cadence.
///
/// The millivolt bounds come from the probe's characterization: a dry probe
/// reads high, a saturated one reads low.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Probe output when fully dry (maps to 0%)
    pub dry_millivolts: i32,
    /// Probe output when fully wet (maps to 100%)
    pub wet_millivolts: i32,
    /// Seconds between samples
    pub sample_period_secs: u64,
}

impl SensorConfig {
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sample_period_secs)
    }
}

/// Fabric capacity guard tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Maximum number of commissioned fabrics
    pub max_fabrics: usize,
    /// Grace period before a scheduled eviction fires
    pub eviction_grace_secs: u64,
    /// Retry delay when an eviction re-validation fails
    pub eviction_retry_secs: u64,
}

impl GuardConfig {
    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }

    pub fn eviction_retry(&self) -> Duration {
        Duration::from_secs(self.eviction_retry_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            matter: MatterConfig {
                vendor_id: 0xFFF1,
                product_id: 0x8002,
                device_name: "Soil Moisture Sensor".to_string(),
                discriminator: 3840,
                passcode: 20202021,
            },
            sensor: SensorConfig {
                dry_millivolts: 3000,
                wet_millivolts: 1800,
                sample_period_secs: 5,
            },
            guard: GuardConfig {
                max_fabrics: 5,
                eviction_grace_secs: 60,
                eviction_retry_secs: 10,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("DEVICE_NAME") {
            config.matter.device_name = name;
        }
        if let Ok(discriminator) = std::env::var("MATTER_DISCRIMINATOR")
            && let Ok(d) = discriminator.parse()
        {
            config.matter.discriminator = d;
        }
        if let Ok(passcode) = std::env::var("MATTER_PASSCODE")
            && let Ok(p) = passcode.parse()
        {
            config.matter.passcode = p;
        }

        // Probe calibration
        if let Ok(dry) = std::env::var("SOIL_DRY_MILLIVOLTS")
            && let Ok(mv) = dry.parse()
        {
            config.sensor.dry_millivolts = mv;
        }
        if let Ok(wet) = std::env::var("SOIL_WET_MILLIVOLTS")
            && let Ok(mv) = wet.parse()
        {
            config.sensor.wet_millivolts = mv;
        }
        if let Ok(period) = std::env::var("SOIL_SAMPLE_PERIOD_SECS")
            && let Ok(secs) = period.parse()
        {
            config.sensor.sample_period_secs = secs;
        }

        // Fabric capacity guard
        if let Ok(max) = std::env::var("MATTER_MAX_FABRICS")
            && let Ok(n) = max.parse()
        {
            config.guard.max_fabrics = n;
        }
        if let Ok(grace) = std::env::var("EVICTION_GRACE_SECS")
            && let Ok(secs) = grace.parse()
        {
            config.guard.eviction_grace_secs = secs;
        }
        if let Ok(retry) = std::env::var("EVICTION_RETRY_SECS")
            && let Ok(secs) = retry.parse()
        {
            config.guard.eviction_retry_secs = secs;
        }

        config
    }
}
