//! Audio Level Monitor
//!
//! Pegelanzeige für laufende Calls. Tastet den Audio-Puffer eines
//! [`MediaResourceHandle`] in festem Takt ab und liefert normalisierte
//! Werte (0.0 - 1.0) für die Visualisierung.
//!
//! Die Berechnung folgt einem klassischen Frequenz-Analyser:
//! Blackman-Fenster, FFT, zeitliche Glättung, Umrechnung in dB und
//! Abbildung des dB-Bereichs auf 0..255. Der Pegel ist der Mittelwert
//! aller Bins geteilt durch 255.
//!
//! Das Monitoring liest nur, der Stream selbst wird nie verändert.

use super::error::AudioError;
use crate::config::LevelMonitorConfig;
use crate::media::{MediaResourceHandle, SampleBuffer};
use futures::Stream;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// ANALYSER
// ============================================================================

/// Reine Pegelberechnung ohne Timer
pub struct LevelAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Geglättete Magnituden aus dem letzten Snapshot
    smoothed: Vec<f32>,
    samples: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    min_decibels: f32,
    max_decibels: f32,
    smoothing: f32,
}

impl LevelAnalyser {
    pub fn new(config: &LevelMonitorConfig) -> Result<Self, AudioError> {
        let size = config.fft_size;
        if size < 32 || !size.is_power_of_two() {
            return Err(AudioError::InvalidConfig(format!(
                "fft_size must be a power of two >= 32, got {}",
                size
            )));
        }
        if config.min_decibels >= config.max_decibels {
            return Err(AudioError::InvalidConfig(
                "min_decibels must be below max_decibels".into(),
            ));
        }

        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);

        Ok(Self {
            fft,
            window: blackman_window(size),
            smoothed: vec![0.0; size / 2],
            samples: vec![0.0; size],
            scratch: vec![Complex::new(0.0, 0.0); size],
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            smoothing: config.smoothing.clamp(0.0, 1.0),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Liest die neuesten Samples aus dem Puffer und berechnet den Pegel
    pub fn sample(&mut self, buffer: &SampleBuffer) -> f32 {
        let mut samples = std::mem::take(&mut self.samples);
        buffer.latest(&mut samples);
        let level = self.analyse(&samples);
        self.samples = samples;
        level
    }

    /// Berechnet den Pegel eines Zeitfensters
    ///
    /// Kürzere Eingaben werden mit Stille aufgefüllt.
    pub fn analyse(&mut self, samples: &[f32]) -> f32 {
        let size = self.fft_size();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = samples.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let scale = 255.0 / (self.max_decibels - self.min_decibels);
        let mut total = 0.0f32;

        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[bin].norm() / size as f32;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;

            if *smoothed > 0.0 {
                let db = 20.0 * smoothed.log10();
                total += (scale * (db - self.min_decibels)).floor().clamp(0.0, 255.0);
            }
        }

        let bins = self.smoothed.len() as f32;
        (total / bins / 255.0).clamp(0.0, 1.0)
    }

    /// Setzt die Glättung zurück
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }
}

impl std::fmt::Debug for LevelAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelAnalyser")
            .field("fft_size", &self.fft_size())
            .field("min_decibels", &self.min_decibels)
            .field("max_decibels", &self.max_decibels)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    let n = size as f32;

    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            a0 - a1 * (2.0 * std::f32::consts::PI * x).cos()
                + a2 * (4.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}

// ============================================================================
// MONITOR
// ============================================================================

pub struct AudioLevelMonitor;

impl AudioLevelMonitor {
    /// Startet das Monitoring auf dem Audio-Track des Handles
    pub fn start(
        handle: &MediaResourceHandle,
        config: &LevelMonitorConfig,
    ) -> Result<LevelSubscription, AudioError> {
        let tap = handle.audio_tap().ok_or(AudioError::NoAudioTrack)?;
        tracing::debug!("Level monitor attached to media handle {}", handle.id());
        Self::start_with_tap(tap, config)
    }

    /// Startet das Monitoring direkt auf einem Puffer
    pub fn start_with_tap(
        tap: SampleBuffer,
        config: &LevelMonitorConfig,
    ) -> Result<LevelSubscription, AudioError> {
        let mut analyser = LevelAnalyser::new(config)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AudioError::AudioInitFailed(e.to_string()))?;

        if config.interval_ms == 0 {
            return Err(AudioError::InvalidConfig("interval_ms must not be 0".into()));
        }
        let period = config.interval();

        let (tx, rx) = watch::channel(0.0f32);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let level = analyser.sample(&tap);
                if tx.send(level).is_err() {
                    // Alle Receiver weg
                    break;
                }
            }
        });

        tracing::info!("Audio level monitor started ({}ms cadence)", config.interval_ms);

        Ok(LevelSubscription {
            rx,
            task: Some(task),
        })
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Laufende Pegel-Abtastung
///
/// Einmal gestoppt, liefert die Subscription keine Werte mehr und kann
/// nicht neu gestartet werden. Drop stoppt die Abtastung.
pub struct LevelSubscription {
    rx: watch::Receiver<f32>,
    task: Option<JoinHandle<()>>,
}

impl LevelSubscription {
    /// Letzter gemessener Pegel
    pub fn current(&self) -> f32 {
        *self.rx.borrow()
    }

    /// Wartet auf den nächsten Wert (`None` nach `stop()`)
    pub async fn next(&mut self) -> Option<f32> {
        if self.task.is_none() {
            return None;
        }
        match self.rx.changed().await {
            Ok(()) => Some(*self.rx.borrow_and_update()),
            Err(_) => None,
        }
    }

    /// Eigener Receiver, z.B. für einen Forwarder-Task
    pub fn receiver(&self) -> watch::Receiver<f32> {
        self.rx.clone()
    }

    /// Stoppt die Abtastung. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Audio level monitor stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_none()
    }

    /// Adapter auf einen `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = f32> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|level| (level, subscription))
        })
    }
}

impl Drop for LevelSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LevelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelSubscription")
            .field("current", &self.current())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{sine_wave, MediaDevices, MediaKind, SimulatedDevices, TrackKind};
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = LevelAnalyser::new(&LevelMonitorConfig::default()).unwrap();
        assert_eq!(analyser.analyse(&[0.0; 256]), 0.0);
        assert_eq!(analyser.analyse(&[]), 0.0);
    }

    #[test]
    fn test_tone_produces_level_in_range() {
        let mut analyser = LevelAnalyser::new(&LevelMonitorConfig::default()).unwrap();
        let tone = sine_wave(440.0, 0.8, 256);

        let mut level = 0.0;
        for _ in 0..20 {
            level = analyser.analyse(&tone);
        }
        assert!(level > 0.0, "level was {}", level);
        assert!(level <= 1.0);
    }

    #[test]
    fn test_louder_tone_is_higher() {
        let config = LevelMonitorConfig {
            smoothing: 0.0,
            ..Default::default()
        };
        let mut quiet = LevelAnalyser::new(&config).unwrap();
        let mut loud = LevelAnalyser::new(&config).unwrap();

        let quiet_level = quiet.analyse(&sine_wave(440.0, 0.01, 256));
        let loud_level = loud.analyse(&sine_wave(440.0, 0.9, 256));
        assert!(loud_level > quiet_level);
    }

    #[test]
    fn test_smoothing_decays_after_tone() {
        let mut analyser = LevelAnalyser::new(&LevelMonitorConfig::default()).unwrap();
        let tone = sine_wave(440.0, 0.8, 256);
        for _ in 0..20 {
            analyser.analyse(&tone);
        }
        let peak = analyser.analyse(&tone);
        let after = analyser.analyse(&[0.0; 256]);
        assert!(after < peak);
        assert!(after > 0.0);

        analyser.reset();
        assert_eq!(analyser.analyse(&[0.0; 256]), 0.0);
    }

    #[test]
    fn test_rejects_invalid_fft_size() {
        let config = LevelMonitorConfig {
            fft_size: 300,
            ..Default::default()
        };
        assert!(matches!(
            LevelAnalyser::new(&config),
            Err(AudioError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_requires_audio_track() {
        let devices = SimulatedDevices::new();
        let screen = devices.acquire(MediaKind::ScreenCapture).await.unwrap();
        let result = AudioLevelMonitor::start(&screen, &LevelMonitorConfig::default());
        assert!(matches!(result, Err(AudioError::NoAudioTrack)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_samples_on_cadence() {
        let devices = SimulatedDevices::new();
        let handle = devices.acquire(MediaKind::Audio).await.unwrap();
        devices.feed_tone(440.0, 0.8, 1024);

        let mut subscription =
            AudioLevelMonitor::start(&handle, &LevelMonitorConfig::default()).unwrap();

        let first = subscription.next().await.unwrap();
        assert!(first > 0.0);
        assert!(subscription.next().await.is_some());
        assert!(subscription.current() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_track_drops_to_silence() {
        let devices = SimulatedDevices::new();
        let mut handle = devices.acquire(MediaKind::Audio).await.unwrap();
        handle.set_track_enabled(TrackKind::Audio, false).unwrap();
        devices.feed_tone(440.0, 0.8, 1024);

        let mut subscription =
            AudioLevelMonitor::start(&handle, &LevelMonitorConfig::default()).unwrap();
        assert_eq!(subscription.next().await, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_sequence() {
        let tap = SampleBuffer::default();
        let mut subscription =
            AudioLevelMonitor::start_with_tap(tap, &LevelMonitorConfig::default()).unwrap();
        assert!(subscription.next().await.is_some());

        subscription.stop();
        subscription.stop();
        assert!(subscription.is_stopped());
        assert_eq!(subscription.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_into_stream() {
        let tap = SampleBuffer::default();
        tap.push_samples(&sine_wave(440.0, 0.5, 512));
        let subscription =
            AudioLevelMonitor::start_with_tap(tap, &LevelMonitorConfig::default()).unwrap();

        let levels: Vec<f32> = subscription.into_stream().take(3).collect().await;
        assert_eq!(levels.len(), 3);
        assert!(levels.iter().all(|l| (0.0..=1.0).contains(l)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_sampling() {
        let tap = SampleBuffer::default();
        let subscription =
            AudioLevelMonitor::start_with_tap(tap, &LevelMonitorConfig::default()).unwrap();
        let rx = subscription.receiver();
        drop(subscription);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Task abgebrochen, Sender geschlossen
        assert!(rx.has_changed().is_err());
    }
}
