//! Konfiguration
//!
//! Alle festen Zeiten und Audio-Parameter an einer Stelle.
//! Standardwerte entsprechen dem Verhalten der Chat-Oberfläche:
//! 1s bis "Ringing", 3s bis "Connected", 500ms Exit-Animation.
//!
//! Kann optional aus einer JSON-Datei geladen werden
//! (Pfad in `PULSE_CALL_CONFIG`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Umgebungsvariable mit dem Pfad zur JSON-Konfiguration
pub const CONFIG_ENV_VAR: &str = "PULSE_CALL_CONFIG";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// CALL TIMINGS
// ============================================================================

/// Feste Verzögerungen des simulierten Verbindungsaufbaus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallTimings {
    /// Connecting → Ringing, ab Session-Start
    pub ringing_after_ms: u64,
    /// Ringing → Connected, ab Session-Start
    pub connected_after_ms: u64,
    /// Takt der Gesprächsdauer
    pub duration_tick_ms: u64,
    /// Wartezeit nach Ended bis die Session als geschlossen gilt
    pub close_grace_ms: u64,
}

impl CallTimings {
    pub fn ringing_after(&self) -> Duration {
        Duration::from_millis(self.ringing_after_ms)
    }

    pub fn connected_after(&self) -> Duration {
        Duration::from_millis(self.connected_after_ms)
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Default for CallTimings {
    fn default() -> Self {
        Self {
            ringing_after_ms: 1000,
            connected_after_ms: 3000,
            duration_tick_ms: 1000,
            close_grace_ms: 500,
        }
    }
}

// ============================================================================
// LEVEL MONITOR
// ============================================================================

/// Parameter der Pegelanzeige (Analyser-Defaults)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelMonitorConfig {
    /// Abtastintervall (ca. ein Display-Frame)
    pub interval_ms: u64,
    /// FFT-Größe, Zweierpotenz
    pub fft_size: usize,
    pub min_decibels: f32,
    pub max_decibels: f32,
    /// Zeitliche Glättung zwischen zwei Snapshots (0.0 - 1.0)
    pub smoothing: f32,
}

impl LevelMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for LevelMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 16,
            fft_size: 256,
            min_decibels: -100.0,
            max_decibels: -30.0,
            smoothing: 0.8,
        }
    }
}

// ============================================================================
// RINGTONE
// ============================================================================

/// Zwei-Ton-Klingelmuster
///
/// Pro Puls: Primärton sofort, nach `switch_after_ms` Sekundärton,
/// nach `tone_length_ms` Stille. `pulses_per_ring` Pulse im Abstand
/// von `pulse_gap_ms`, das Ganze alle `ring_period_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingtonePattern {
    pub primary_hz: f32,
    pub secondary_hz: f32,
    pub gain: f32,
    pub switch_after_ms: u64,
    pub tone_length_ms: u64,
    pub pulse_gap_ms: u64,
    pub pulses_per_ring: u32,
    pub ring_period_ms: u64,
}

impl RingtonePattern {
    pub fn switch_after(&self) -> Duration {
        Duration::from_millis(self.switch_after_ms)
    }

    /// Restdauer des Sekundärtons
    pub fn secondary_length(&self) -> Duration {
        Duration::from_millis(self.tone_length_ms.saturating_sub(self.switch_after_ms))
    }

    pub fn pulse_gap(&self) -> Duration {
        Duration::from_millis(self.pulse_gap_ms)
    }

    pub fn ring_period(&self) -> Duration {
        Duration::from_millis(self.ring_period_ms)
    }

    /// Gesamtdauer aller Pulse eines Klingelns
    pub fn burst_length_ms(&self) -> u64 {
        let pulses = u64::from(self.pulses_per_ring);
        pulses * self.tone_length_ms + pulses.saturating_sub(1) * self.pulse_gap_ms
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_period_ms == 0 || self.pulses_per_ring == 0 {
            return Err(ConfigError::Invalid(
                "ringtone needs a non-zero period and at least one pulse".into(),
            ));
        }
        if self.switch_after_ms > self.tone_length_ms {
            return Err(ConfigError::Invalid(
                "ringtone.switch_after_ms must not exceed tone_length_ms".into(),
            ));
        }
        if self.burst_length_ms() > self.ring_period_ms {
            return Err(ConfigError::Invalid(format!(
                "ringtone burst ({}ms) is longer than ring_period_ms ({})",
                self.burst_length_ms(),
                self.ring_period_ms
            )));
        }

        Ok(())
    }
}

impl Default for RingtonePattern {
    fn default() -> Self {
        Self {
            primary_hz: 440.0,
            secondary_hz: 480.0,
            gain: 0.3,
            switch_after_ms: 200,
            tone_length_ms: 400,
            pulse_gap_ms: 200,
            pulses_per_ring: 2,
            ring_period_ms: 2000,
        }
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub timings: CallTimings,
    pub level_monitor: LevelMonitorConfig,
    pub ringtone: RingtonePattern,
}

impl CallConfig {
    /// Parst und validiert eine JSON-Konfiguration
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Lädt die Konfiguration aus einer Datei
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!("Loading call config from {:?}", path);
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Lädt die Datei aus `PULSE_CALL_CONFIG` oder nimmt die Standardwerte
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::load(path.trim()),
            _ => {
                tracing::debug!("{} not set, using default call config", CONFIG_ENV_VAR);
                Ok(Self::default())
            }
        }
    }

    /// Prüft die Werte auf Konsistenz
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timings;
        if t.connected_after_ms <= t.ringing_after_ms {
            return Err(ConfigError::Invalid(format!(
                "connected_after_ms ({}) must be greater than ringing_after_ms ({})",
                t.connected_after_ms, t.ringing_after_ms
            )));
        }
        if t.duration_tick_ms == 0 {
            return Err(ConfigError::Invalid("duration_tick_ms must not be 0".into()));
        }

        let l = &self.level_monitor;
        if l.interval_ms == 0 {
            return Err(ConfigError::Invalid("level_monitor.interval_ms must not be 0".into()));
        }
        if !l.fft_size.is_power_of_two() || l.fft_size < 32 {
            return Err(ConfigError::Invalid(format!(
                "level_monitor.fft_size must be a power of two >= 32, got {}",
                l.fft_size
            )));
        }
        if l.min_decibels >= l.max_decibels {
            return Err(ConfigError::Invalid(
                "level_monitor.min_decibels must be below max_decibels".into(),
            ));
        }
        if !(0.0..=1.0).contains(&l.smoothing) {
            return Err(ConfigError::Invalid(
                "level_monitor.smoothing must be within 0.0..=1.0".into(),
            ));
        }

        self.ringtone.validate()?;

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
