//! Native Geräte über cpal
//!
//! Verwendet cpal für Cross-Platform Mikrofon-Capture.
//! Kamera und Bildschirmaufnahme bietet cpal nicht an, diese
//! Anfragen melden `DeviceUnavailable` (Video-Calls laufen dann nur mit Audio).

use super::buffer::SampleBuffer;
use super::device::{CaptureStream, DeviceClass, MediaDevices, MediaError, MediaKind, TrackKind};
use super::handle::MediaResourceHandle;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte Sample Rate (48kHz)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// DEVICE LISTING
// ============================================================================

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

// ============================================================================
// CPAL DEVICES
// ============================================================================

/// Host-Umgebung auf Basis des Standard-cpal-Hosts
#[derive(Debug, Default)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }

    /// Gibt alle verfügbaren Eingabegeräte zurück
    pub fn input_devices() -> Result<Vec<AudioDevice>, MediaError> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default_input.as_ref(),
                    name,
                })
            })
            .collect();

        Ok(devices)
    }

    /// Startet Audio Capture (Mikrofon)
    ///
    /// Der cpal-Stream lebt auf einem eigenen Thread und wird dort auch
    /// wieder gedroppt. cpal::Stream ist nicht Send, und einige Backends
    /// (WASAPI, AAudio) vertragen das Schließen auf einem fremden Thread nicht.
    async fn open_microphone() -> Result<MediaResourceHandle, MediaError> {
        let tap = SampleBuffer::default();
        let enabled = Arc::new(AtomicBool::new(true));
        let (ended_tx, ended_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        {
            let tap = tap.clone();
            let enabled = Arc::clone(&enabled);
            std::thread::Builder::new()
                .name("pulse-mic".into())
                .spawn(move || {
                    let stream = match build_microphone_stream(tap, enabled, ended_tx) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if ready_tx.send(Ok(())).is_err() {
                        // Anfrage wurde abgebrochen
                        return;
                    }
                    // Blockiert bis stop() oder bis der Sender gedroppt wird
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::info!("Audio capture stopped");
                })
                .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
        }

        ready_rx
            .await
            .map_err(|_| MediaError::DeviceUnavailable("capture thread exited".into()))??;

        let capture = CpalCaptureStream {
            stop_tx: Mutex::new(Some(stop_tx)),
            enabled,
            tap,
        };

        Ok(MediaResourceHandle::new(
            Uuid::new_v4(),
            MediaKind::Audio,
            MediaKind::Audio.track_kinds(),
            Box::new(capture),
            ended_rx,
        ))
    }
}

/// Öffnet das Standard-Mikrofon und startet den Stream
fn build_microphone_stream(
    tap: SampleBuffer,
    enabled: Arc<AtomicBool>,
    ended_tx: watch::Sender<bool>,
) -> Result<Stream, MediaError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        MediaError::DeviceUnavailable(format!("no {} found", DeviceClass::Microphone))
    })?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels.max(1) as usize;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Nur den ersten Kanal verwenden (Mono für Voice)
                let frames = data.len() / channels;
                if !enabled.load(Ordering::Relaxed) {
                    tap.push_silence(frames);
                    return;
                }
                let mono: Vec<f32> = data.iter().step_by(channels).copied().collect();
                tap.push_samples(&mono);
            },
            move |err| {
                tracing::error!("Audio capture error: {}", err);
                ended_tx.send_replace(true);
            },
            None,
        )
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaResourceHandle, MediaError> {
        match kind {
            MediaKind::Audio => Self::open_microphone().await,
            MediaKind::Video | MediaKind::AudioVideo => Err(MediaError::DeviceUnavailable(
                format!("{} capture is not supported by the cpal host", DeviceClass::Camera),
            )),
            MediaKind::ScreenCapture => Err(MediaError::DeviceUnavailable(format!(
                "{} capture is not supported by the cpal host",
                DeviceClass::Display
            ))),
        }
    }
}

// ============================================================================
// CAPTURE STREAM
// ============================================================================

/// Laufender cpal Input-Stream (der Stream selbst gehört dem Capture-Thread)
struct CpalCaptureStream {
    // Droppen des Senders beendet den Capture-Thread
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    enabled: Arc<AtomicBool>,
    tap: SampleBuffer,
}

impl CaptureStream for CpalCaptureStream {
    fn set_track_enabled(&self, track: TrackKind, enabled: bool) {
        if track == TrackKind::Audio {
            self.enabled.store(enabled, Ordering::Relaxed);
            tracing::debug!("Audio muted: {}", !enabled);
        }
    }

    fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
    }

    fn audio_tap(&self) -> Option<SampleBuffer> {
        Some(self.tap.clone())
    }
}

// ============================================================================
// CONFIG SELECTION
// ============================================================================

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    // Priorität: 48kHz > höchste verfügbare Rate, nur F32
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.sample_format() == SampleFormat::F32
            && config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    Err(MediaError::DeviceUnavailable(
        "No f32 input configuration found".to_string(),
    ))
}
