//! Pulse Calls - Call-Sessions für die Pulse Chat-Oberfläche
//!
//! Lokale Orchestrierung von Anrufen ohne Signaling-Server:
//! - Exklusive Geräte-Handles (Mikrofon, Kamera, Bildschirm)
//! - Zustandsmaschine Connecting → Ringing → Connected → Ended
//! - Pegelanzeige per FFT für Voice-Calls
//! - Synthetischer Klingelton für eingehende Anrufe
//! - Surface-Adapter für Benachrichtigung und Call-Fenster

pub mod audio;
pub mod call;
pub mod config;
pub mod media;
pub mod surface;

pub use audio::{AudioError, AudioLevelMonitor, LevelSubscription, RingtoneSynthesizer};
pub use call::{CallError, CallEvent, CallKind, CallSession, CallSnapshot, CallStatus};
pub use config::{CallConfig, ConfigError};
pub use media::{MediaDevices, MediaError, MediaKind, MediaResourceHandle, SimulatedDevices};
pub use surface::{CallSurface, Contact, IncomingCall};

use anyhow::Context;
use audio::ToneBackend;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Standard-Filter, falls `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "call_session_lib=debug,pulse_calls=info";

static TRACING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        // Schlägt fehl, wenn schon ein globaler Subscriber existiert
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

// ============================================================================
// DEMO
// ============================================================================

#[cfg(feature = "native-audio")]
fn tone_backend() -> Arc<dyn ToneBackend> {
    Arc::new(audio::CpalTones::new())
}

#[cfg(not(feature = "native-audio"))]
fn tone_backend() -> Arc<dyn ToneBackend> {
    Arc::new(audio::SimulatedTones::new())
}

/// Spielt einen kompletten Ablauf mit simulierten Geräten durch
///
/// Eingehender Video-Call, Annehmen, Stummschalten, Bildschirmfreigabe
/// (vom System beendet), Auflegen, danach ein ausgehender Voice-Call.
pub fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = CallConfig::from_env().context("Failed to load call config")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(demo(config))
}

async fn demo(config: CallConfig) -> anyhow::Result<()> {
    tracing::info!("Starting call demo...");

    #[cfg(feature = "native-audio")]
    match media::CpalDevices::input_devices() {
        Ok(inputs) => {
            for input in inputs {
                tracing::info!("Input device: {} (default: {})", input.name, input.is_default);
            }
        }
        Err(e) => tracing::warn!("Failed to list input devices: {}", e),
    }

    let devices = SimulatedDevices::new();
    devices.set_permission_delay(Duration::from_millis(300));

    let connected_after = config.timings.connected_after();
    let surface = CallSurface::new(Arc::new(devices.clone()), tone_backend(), config)?;

    // Events als JSON ausgeben, wie sie eine UI bekommen würde
    let mut events = surface.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::AudioLevel { level, .. }) => {
                    tracing::trace!("audio level {:.3}", level);
                }
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!("event: {}", json),
                    Err(e) => tracing::error!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event printer lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Eingehender Video-Call
    let ada = Contact::new("ada", "Ada Lovelace");
    tracing::info!("Caller monogram: {} / initials: {}", ada.monogram(), ada.initials());
    surface.present_incoming(CallKind::Video, ada);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let video = surface.accept()?;
    tokio::time::sleep(connected_after + Duration::from_millis(500)).await;

    surface.toggle_mute()?;
    surface.toggle_screen_share().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Benutzer beendet die Freigabe über das System-UI
    devices.end_capture_externally(MediaKind::ScreenCapture);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = video.snapshot();
    tracing::info!(
        "Video call {}: {} ({:?})",
        snapshot.id,
        snapshot.status_label(),
        snapshot.media
    );

    surface.end_call()?;
    video.closed().await;

    // Ausgehender Voice-Call mit Pegelanzeige
    let voice = surface.start_voice_call(Contact::new("grace", "Grace Hopper"))?;
    tokio::time::sleep(connected_after).await;

    for step in 0..50u32 {
        let amplitude = 0.2 + 0.6 * ((step % 10) as f32 / 10.0);
        devices.feed_tone(440.0, amplitude, 960);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snapshot = voice.snapshot();
    tracing::info!(
        "Voice call {}: {} (level {:.2})",
        snapshot.id,
        snapshot.status_label(),
        snapshot.audio_level
    );

    surface.end_call()?;
    voice.closed().await;

    drop(surface);
    // Letzte Events noch ausgeben lassen
    tokio::time::sleep(Duration::from_millis(10)).await;
    printer.abort();

    tracing::info!(
        "Demo finished: {} streams still open, {} stop effects",
        devices.live_streams(),
        devices.total_stop_count()
    );
    Ok(())
}
