//! Klingelton-Ausgabe über cpal
//!
//! Ein Output-Stream pro Kontext, der einen einfachen Sinus-Oszillator
//! abspielt. Ohne laufenden Ton wird Stille geschrieben.

use super::error::AudioError;
use super::ringtone::{ToneBackend, ToneContext};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};

// ============================================================================
// OSCILLATOR
// ============================================================================

struct Oscillator {
    frequency_hz: Option<f32>,
    phase: f32,
    gain: f32,
    sample_rate: f32,
}

impl Oscillator {
    fn next_sample(&mut self) -> f32 {
        let Some(frequency) = self.frequency_hz else {
            return 0.0;
        };
        let sample = self.gain * (2.0 * std::f32::consts::PI * self.phase).sin();
        self.phase = (self.phase + frequency / self.sample_rate).fract();
        sample
    }
}

// ============================================================================
// CPAL TONES
// ============================================================================

/// Klingelton über das Standard-Ausgabegerät
#[derive(Debug, Default)]
pub struct CpalTones;

impl CpalTones {
    pub fn new() -> Self {
        Self
    }
}

impl ToneBackend for CpalTones {
    /// Der Output-Stream wird auf einem eigenen Thread gebaut und dort
    /// auch gedroppt (cpal::Stream ist nicht Send)
    fn open(&self, gain: f32) -> Result<Box<dyn ToneContext>, AudioError> {
        let oscillator = Arc::new(Mutex::new(Oscillator {
            frequency_hz: None,
            phase: 0.0,
            gain,
            sample_rate: 48000.0,
        }));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        {
            let oscillator = Arc::clone(&oscillator);
            std::thread::Builder::new()
                .name("pulse-ringtone".into())
                .spawn(move || {
                    let stream = match build_output_stream(oscillator) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if ready_tx.send(Ok(())).is_err() {
                        return;
                    }
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("Ringtone output closed");
                })
                .map_err(|e| AudioError::AudioInitFailed(e.to_string()))?;
        }

        ready_rx
            .recv()
            .map_err(|_| AudioError::AudioInitFailed("ringtone thread exited".into()))??;

        Ok(Box::new(CpalToneContext {
            stop_tx: Some(stop_tx),
            oscillator,
        }))
    }
}

/// Öffnet das Standard-Ausgabegerät mit dem Oszillator als Quelle
fn build_output_stream(oscillator: Arc<Mutex<Oscillator>>) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::AudioInitFailed("No audio output device found".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::AudioInitFailed(e.to_string()))?;

    if supported.sample_format() != SampleFormat::F32 {
        return Err(AudioError::AudioInitFailed(format!(
            "Unsupported output sample format: {:?}",
            supported.sample_format()
        )));
    }

    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    oscillator.lock().sample_rate = config.sample_rate.0 as f32;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut osc = oscillator.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = osc.next_sample();
                    for slot in frame.iter_mut() {
                        *slot = sample;
                    }
                }
            },
            |err| tracing::error!("Ringtone output error: {}", err),
            None,
        )
        .map_err(|e| AudioError::AudioInitFailed(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::AudioInitFailed(e.to_string()))?;

    tracing::info!(
        "Ringtone output opened: {} Hz, {} channels",
        config.sample_rate.0,
        channels
    );
    Ok(stream)
}

struct CpalToneContext {
    // Droppen des Senders beendet den Ausgabe-Thread
    stop_tx: Option<mpsc::Sender<()>>,
    oscillator: Arc<Mutex<Oscillator>>,
}

impl ToneContext for CpalToneContext {
    fn start_tone(&mut self, frequency_hz: f32) {
        let mut osc = self.oscillator.lock();
        osc.phase = 0.0;
        osc.frequency_hz = Some(frequency_hz);
    }

    fn set_frequency(&mut self, frequency_hz: f32) {
        let mut osc = self.oscillator.lock();
        if osc.frequency_hz.is_some() {
            osc.frequency_hz = Some(frequency_hz);
        }
    }

    fn stop_tone(&mut self) {
        self.oscillator.lock().frequency_hz = None;
    }

    fn close(&mut self) {
        self.stop_tone();
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for CpalToneContext {
    fn drop(&mut self) {
        self.close();
    }
}
