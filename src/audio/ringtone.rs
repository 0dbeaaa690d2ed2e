//! Ringtone Synthesizer
//!
//! Erzeugt den Klingelton für eingehende Anrufe ohne Audio-Datei:
//! zwei kurze Pulse aus 440Hz → 480Hz, alle zwei Sekunden wiederholt.
//!
//! Audio-Kontext und Zeitplan gehören zusammen. Sie werden immer
//! gemeinsam erstellt und gemeinsam abgebaut, es bleibt nie ein
//! Oszillator ohne Zeitplan (oder umgekehrt) übrig.

use super::error::AudioError;
use crate::config::RingtonePattern;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Geöffneter Audio-Ausgabekontext mit (höchstens) einem Oszillator
pub trait ToneContext: Send {
    /// Startet einen Oszillator mit der Frequenz
    fn start_tone(&mut self, frequency_hz: f32);

    /// Ändert die Frequenz des laufenden Oszillators
    fn set_frequency(&mut self, frequency_hz: f32);

    /// Stoppt den laufenden Oszillator (No-op wenn keiner läuft)
    fn stop_tone(&mut self);

    /// Schließt den Kontext
    fn close(&mut self);
}

/// Erzeugt Audio-Ausgabekontexte
pub trait ToneBackend: Send + Sync {
    fn open(&self, gain: f32) -> Result<Box<dyn ToneContext>, AudioError>;
}

// ============================================================================
// SYNTHESIZER
// ============================================================================

struct ToneSlot {
    context: Box<dyn ToneContext>,
    closed: bool,
}

struct RingingState {
    slot: Arc<Mutex<ToneSlot>>,
    schedule: JoinHandle<()>,
}

pub struct RingtoneSynthesizer {
    backend: Arc<dyn ToneBackend>,
    pattern: RingtonePattern,
    state: Mutex<Option<RingingState>>,
}

impl RingtoneSynthesizer {
    pub fn new(backend: Arc<dyn ToneBackend>, pattern: RingtonePattern) -> Self {
        Self {
            backend,
            pattern,
            state: Mutex::new(None),
        }
    }

    /// Startet das Klingeln. Läuft es bereits, passiert nichts.
    pub fn start(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        if state.is_some() {
            tracing::debug!("Ringtone already playing");
            return Ok(());
        }

        self.pattern
            .validate()
            .map_err(|e| AudioError::InvalidConfig(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AudioError::AudioInitFailed(e.to_string()))?;

        let context = self.backend.open(self.pattern.gain)?;
        let slot = Arc::new(Mutex::new(ToneSlot {
            context,
            closed: false,
        }));

        let schedule = runtime.spawn(ring_schedule(Arc::clone(&slot), self.pattern.clone()));

        *state = Some(RingingState { slot, schedule });
        tracing::info!(
            "Ringtone started ({} Hz / {} Hz every {}ms)",
            self.pattern.primary_hz,
            self.pattern.secondary_hz,
            self.pattern.ring_period_ms
        );
        Ok(())
    }

    /// Stoppt Zeitplan und Audio-Kontext. Idempotent.
    pub fn stop(&self) {
        let Some(ringing) = self.state.lock().take() else {
            return;
        };

        ringing.schedule.abort();

        let mut slot = ringing.slot.lock();
        slot.context.stop_tone();
        slot.context.close();
        slot.closed = true;

        tracing::info!("Ringtone stopped");
    }

    pub fn is_ringing(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn pattern(&self) -> &RingtonePattern {
        &self.pattern
    }
}

impl Drop for RingtoneSynthesizer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RingtoneSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingtoneSynthesizer")
            .field("ringing", &self.is_ringing())
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Wiederholt das Klingelmuster bis der Task abgebrochen wird
async fn ring_schedule(slot: Arc<Mutex<ToneSlot>>, pattern: RingtonePattern) {
    let mut ticker = tokio::time::interval(pattern.ring_period());

    loop {
        ticker.tick().await;

        for pulse in 0..pattern.pulses_per_ring {
            if pulse > 0 {
                tokio::time::sleep(pattern.pulse_gap()).await;
            }
            if !play_pulse(&slot, &pattern).await {
                return;
            }
        }
    }
}

/// Ein Puls: Primärton, Wechsel auf Sekundärton, Stille.
/// Gibt `false` zurück, wenn der Kontext inzwischen geschlossen wurde.
async fn play_pulse(slot: &Mutex<ToneSlot>, pattern: &RingtonePattern) -> bool {
    {
        let mut slot = slot.lock();
        if slot.closed {
            return false;
        }
        slot.context.start_tone(pattern.primary_hz);
    }

    tokio::time::sleep(pattern.switch_after()).await;

    {
        let mut slot = slot.lock();
        if slot.closed {
            return false;
        }
        slot.context.set_frequency(pattern.secondary_hz);
    }

    tokio::time::sleep(pattern.secondary_length()).await;

    let mut slot = slot.lock();
    if slot.closed {
        return false;
    }
    slot.context.stop_tone();
    true
}

// ============================================================================
// SIMULATED TONES
// ============================================================================

#[derive(Debug, Default)]
struct ToneStats {
    contexts_opened: usize,
    contexts_closed: usize,
    active_oscillators: usize,
    max_concurrent_oscillators: usize,
    tones_started: usize,
    frequencies: Vec<f32>,
    fail_init: bool,
}

/// Audio-Ausgabe ohne Gerät, zählt nur mit
#[derive(Clone, Default)]
pub struct SimulatedTones {
    stats: Arc<Mutex<ToneStats>>,
}

impl SimulatedTones {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lässt `open` fehlschlagen (kein Audio-Ausgang)
    pub fn set_fail_init(&self, fail: bool) {
        self.stats.lock().fail_init = fail;
    }

    /// Geöffnete, noch nicht geschlossene Kontexte
    pub fn open_contexts(&self) -> usize {
        let stats = self.stats.lock();
        stats.contexts_opened - stats.contexts_closed
    }

    pub fn contexts_opened(&self) -> usize {
        self.stats.lock().contexts_opened
    }

    pub fn active_oscillators(&self) -> usize {
        self.stats.lock().active_oscillators
    }

    pub fn max_concurrent_oscillators(&self) -> usize {
        self.stats.lock().max_concurrent_oscillators
    }

    pub fn tones_started(&self) -> usize {
        self.stats.lock().tones_started
    }

    /// Alle gespielten Frequenzen in Reihenfolge
    pub fn frequencies(&self) -> Vec<f32> {
        self.stats.lock().frequencies.clone()
    }
}

impl ToneBackend for SimulatedTones {
    fn open(&self, gain: f32) -> Result<Box<dyn ToneContext>, AudioError> {
        let mut stats = self.stats.lock();
        if stats.fail_init {
            return Err(AudioError::AudioInitFailed(
                "no simulated audio output".into(),
            ));
        }
        stats.contexts_opened += 1;
        tracing::debug!("Simulated tone context opened (gain {})", gain);

        Ok(Box::new(SimulatedToneContext {
            stats: Arc::clone(&self.stats),
            oscillator: false,
            closed: false,
        }))
    }
}

impl std::fmt::Debug for SimulatedTones {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedTones")
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

struct SimulatedToneContext {
    stats: Arc<Mutex<ToneStats>>,
    oscillator: bool,
    closed: bool,
}

impl ToneContext for SimulatedToneContext {
    fn start_tone(&mut self, frequency_hz: f32) {
        if self.closed {
            return;
        }
        let mut stats = self.stats.lock();
        if !self.oscillator {
            self.oscillator = true;
            stats.active_oscillators += 1;
            stats.max_concurrent_oscillators =
                stats.max_concurrent_oscillators.max(stats.active_oscillators);
        }
        stats.tones_started += 1;
        stats.frequencies.push(frequency_hz);
    }

    fn set_frequency(&mut self, frequency_hz: f32) {
        if self.oscillator {
            self.stats.lock().frequencies.push(frequency_hz);
        }
    }

    fn stop_tone(&mut self) {
        if self.oscillator {
            self.oscillator = false;
            self.stats.lock().active_oscillators -= 1;
        }
    }

    fn close(&mut self) {
        self.stop_tone();
        if !self.closed {
            self.closed = true;
            self.stats.lock().contexts_closed += 1;
        }
    }
}

impl Drop for SimulatedToneContext {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn synth() -> (RingtoneSynthesizer, SimulatedTones) {
        let tones = SimulatedTones::new();
        let synth = RingtoneSynthesizer::new(Arc::new(tones.clone()), RingtonePattern::default());
        (synth, tones)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_yields_one_pair() {
        let (synth, tones) = synth();

        synth.start().unwrap();
        synth.start().unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(synth.is_ringing());
        assert_eq!(tones.contexts_opened(), 1);
        assert_eq!(tones.open_contexts(), 1);
        assert_eq!(tones.active_oscillators(), 1);

        sleep(Duration::from_millis(5000)).await;
        assert_eq!(tones.max_concurrent_oscillators(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_timing() {
        let (synth, tones) = synth();
        synth.start().unwrap();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(tones.frequencies(), vec![440.0]);

        sleep(Duration::from_millis(240)).await; // 250ms
        assert_eq!(tones.frequencies(), vec![440.0, 480.0]);
        assert_eq!(tones.active_oscillators(), 1);

        sleep(Duration::from_millis(200)).await; // 450ms
        assert_eq!(tones.active_oscillators(), 0);

        sleep(Duration::from_millis(200)).await; // 650ms, zweiter Puls
        assert_eq!(tones.active_oscillators(), 1);
        assert_eq!(tones.tones_started(), 2);

        sleep(Duration::from_millis(400)).await; // 1050ms
        assert_eq!(tones.active_oscillators(), 0);

        sleep(Duration::from_millis(1000)).await; // 2050ms, nächstes Klingeln
        assert_eq!(tones.tones_started(), 3);
        assert_eq!(tones.active_oscillators(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_down_context_and_schedule() {
        let (synth, tones) = synth();
        synth.start().unwrap();
        sleep(Duration::from_millis(100)).await;

        synth.stop();
        synth.stop();

        assert!(!synth.is_ringing());
        assert_eq!(tones.open_contexts(), 0);
        assert_eq!(tones.active_oscillators(), 0);

        let started = tones.tones_started();
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(tones.tones_started(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let (synth, tones) = synth();
        synth.start().unwrap();
        synth.stop();
        synth.start().unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(tones.contexts_opened(), 2);
        assert_eq!(tones.open_contexts(), 1);
        assert_eq!(tones.active_oscillators(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure() {
        let (synth, tones) = synth();
        tones.set_fail_init(true);

        assert!(matches!(synth.start(), Err(AudioError::AudioInitFailed(_))));
        assert!(!synth.is_ringing());
        assert_eq!(tones.open_contexts(), 0);
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected() {
        let tones = SimulatedTones::new();
        let pattern = RingtonePattern {
            ring_period_ms: 0,
            ..RingtonePattern::default()
        };
        let synth = RingtoneSynthesizer::new(Arc::new(tones.clone()), pattern);

        assert!(matches!(synth.start(), Err(AudioError::InvalidConfig(_))));
        assert!(!synth.is_ringing());
        assert_eq!(tones.contexts_opened(), 0);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (synth, tones) = synth();
        assert!(matches!(synth.start(), Err(AudioError::AudioInitFailed(_))));
        assert_eq!(tones.contexts_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_ringing() {
        let (synth, tones) = synth();
        synth.start().unwrap();
        sleep(Duration::from_millis(10)).await;

        drop(synth);
        assert_eq!(tones.open_contexts(), 0);
        assert_eq!(tones.active_oscillators(), 0);
    }
}
