//! Simulierte Host-Umgebung
//!
//! In-Memory-Geräte für Demo und Tests:
//! - Berechtigungen verweigern / Hardware fehlt
//! - Verzögerte Berechtigungsabfrage (Suspension-Point)
//! - Exklusive Geräte (belegt bis zur Freigabe)
//! - Zähler für "Tracks gestoppt"
//! - Aufnahme von außen beenden (System-UI)

use super::buffer::SampleBuffer;
use super::device::{CaptureStream, DeviceClass, MediaDevices, MediaError, MediaKind, TrackKind};
use super::handle::MediaResourceHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Sample-Rate der simulierten Mikrofone
pub const SIMULATED_SAMPLE_RATE: u32 = 48000;

// ============================================================================
// STATE
// ============================================================================

struct LiveStream {
    kind: MediaKind,
    enabled: HashMap<TrackKind, bool>,
    ended_tx: watch::Sender<bool>,
    tap: Option<SampleBuffer>,
}

#[derive(Default)]
struct SimState {
    denied: HashSet<DeviceClass>,
    unavailable: HashSet<DeviceClass>,
    in_use: HashMap<DeviceClass, Uuid>,
    permission_delay: Duration,
    live: HashMap<Uuid, LiveStream>,
    /// Reihenfolge der Acquire-Anfragen (auch fehlgeschlagene)
    requests: Vec<MediaKind>,
    stop_effects: HashMap<Uuid, usize>,
}

// ============================================================================
// SIMULATED DEVICES
// ============================================================================

/// Simulierte Mikrofone, Kameras und Bildschirmaufnahme
#[derive(Clone, Default)]
pub struct SimulatedDevices {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Benutzer verweigert den Zugriff auf dieses Gerät
    pub fn deny(&self, class: DeviceClass) {
        self.state.lock().denied.insert(class);
    }

    /// Benutzer erlaubt den Zugriff wieder
    pub fn allow(&self, class: DeviceClass) {
        self.state.lock().denied.remove(&class);
    }

    /// Gerät ist nicht vorhanden
    pub fn make_unavailable(&self, class: DeviceClass) {
        self.state.lock().unavailable.insert(class);
    }

    /// Wie lange die Berechtigungsabfrage "dauert"
    pub fn set_permission_delay(&self, delay: Duration) {
        self.state.lock().permission_delay = delay;
    }

    /// Simuliert "Freigabe beenden" im System-UI für einen laufenden Stream dieser Art
    ///
    /// Gibt `false` zurück, wenn kein passender Stream läuft.
    pub fn end_capture_externally(&self, kind: MediaKind) -> bool {
        let state = self.state.lock();
        match state.live.iter().find(|(_, s)| s.kind == kind) {
            Some((id, stream)) => {
                tracing::info!("Simulated platform ended capture {}", id);
                stream.ended_tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Schreibt Samples in alle laufenden Mikrofon-Streams
    ///
    /// Deaktivierte Audio-Tracks liefern Stille.
    pub fn feed_microphone(&self, samples: &[f32]) {
        let state = self.state.lock();
        for stream in state.live.values() {
            let Some(tap) = &stream.tap else { continue };
            if stream.enabled.get(&TrackKind::Audio).copied().unwrap_or(false) {
                tap.push_samples(samples);
            } else {
                tap.push_silence(samples.len());
            }
        }
    }

    /// Schreibt einen Sinuston in alle laufenden Mikrofon-Streams
    pub fn feed_tone(&self, frequency_hz: f32, amplitude: f32, len: usize) {
        let samples = sine_wave(frequency_hz, amplitude, len);
        self.feed_microphone(&samples);
    }

    /// Wie oft die Tracks des Streams gestoppt wurden
    pub fn stop_count(&self, handle_id: Uuid) -> usize {
        self.state
            .lock()
            .stop_effects
            .get(&handle_id)
            .copied()
            .unwrap_or(0)
    }

    /// Summe aller Stop-Effekte
    pub fn total_stop_count(&self) -> usize {
        self.state.lock().stop_effects.values().sum()
    }

    /// Anzahl noch nicht gestoppter Streams
    pub fn live_streams(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Anzahl noch nicht gestoppter Streams einer Art
    pub fn live_streams_of(&self, kind: MediaKind) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|s| s.kind == kind)
            .count()
    }

    pub fn is_in_use(&self, class: DeviceClass) -> bool {
        self.state.lock().in_use.contains_key(&class)
    }

    /// Alle bisherigen Acquire-Anfragen in Reihenfolge
    pub fn requests(&self) -> Vec<MediaKind> {
        self.state.lock().requests.clone()
    }

    /// Wie oft eine bestimmte Art angefordert wurde
    pub fn request_count(&self, kind: MediaKind) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|&&k| k == kind)
            .count()
    }

    /// Ist der Track im laufenden Stream aktiv?
    pub fn is_track_enabled(&self, handle_id: Uuid, track: TrackKind) -> Option<bool> {
        self.state
            .lock()
            .live
            .get(&handle_id)
            .and_then(|s| s.enabled.get(&track).copied())
    }

    fn open_stream(
        state: &mut SimState,
        kind: MediaKind,
    ) -> Result<(Uuid, watch::Receiver<bool>, Option<SampleBuffer>), MediaError> {
        for class in kind.device_classes() {
            if state.unavailable.contains(class) {
                return Err(MediaError::DeviceUnavailable(format!("no {} present", class)));
            }
            if state.denied.contains(class) {
                return Err(MediaError::PermissionDenied(*class));
            }
            if state.in_use.contains_key(class) {
                return Err(MediaError::DeviceUnavailable(format!("{} is busy", class)));
            }
        }

        let id = Uuid::new_v4();
        for class in kind.device_classes() {
            state.in_use.insert(*class, id);
        }

        let tap = kind
            .track_kinds()
            .contains(&TrackKind::Audio)
            .then(SampleBuffer::default);
        let (ended_tx, ended_rx) = watch::channel(false);

        state.live.insert(
            id,
            LiveStream {
                kind,
                enabled: kind.track_kinds().iter().map(|&t| (t, true)).collect(),
                ended_tx,
                tap: tap.clone(),
            },
        );

        Ok((id, ended_rx, tap))
    }
}

#[async_trait]
impl MediaDevices for SimulatedDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaResourceHandle, MediaError> {
        let delay = self.state.lock().permission_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (id, ended_rx, tap) = {
            let mut state = self.state.lock();
            state.requests.push(kind);
            Self::open_stream(&mut state, kind)?
        };

        tracing::info!("Simulated {:?} capture started ({})", kind, id);

        let stream = SimulatedStream {
            id,
            state: Arc::clone(&self.state),
            tap,
        };
        Ok(MediaResourceHandle::new(
            id,
            kind,
            kind.track_kinds(),
            Box::new(stream),
            ended_rx,
        ))
    }
}

impl std::fmt::Debug for SimulatedDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedDevices")
            .field("live", &state.live.len())
            .field("denied", &state.denied)
            .field("unavailable", &state.unavailable)
            .finish()
    }
}

// ============================================================================
// SIMULATED STREAM
// ============================================================================

struct SimulatedStream {
    id: Uuid,
    state: Arc<Mutex<SimState>>,
    tap: Option<SampleBuffer>,
}

impl CaptureStream for SimulatedStream {
    fn set_track_enabled(&self, track: TrackKind, enabled: bool) {
        if let Some(stream) = self.state.lock().live.get_mut(&self.id) {
            stream.enabled.insert(track, enabled);
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        *state.stop_effects.entry(self.id).or_insert(0) += 1;

        if let Some(stream) = state.live.remove(&self.id) {
            for class in stream.kind.device_classes() {
                if state.in_use.get(class) == Some(&self.id) {
                    state.in_use.remove(class);
                }
            }
        }
    }

    fn audio_tap(&self) -> Option<SampleBuffer> {
        self.tap.clone()
    }
}

/// Erzeugt einen Sinuston mit der simulierten Sample-Rate
pub fn sine_wave(frequency_hz: f32, amplitude: f32, len: usize) -> Vec<f32> {
    let step = 2.0 * std::f32::consts::PI * frequency_hz / SIMULATED_SAMPLE_RATE as f32;
    (0..len).map(|i| amplitude * (step * i as f32).sin()).collect()
}

// ============================================================================
// TESTS
// ============================================================================
