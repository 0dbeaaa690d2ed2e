//! Media Module - Lokale Geräte-Ressourcen
//!
//! Dieses Modul verwaltet:
//! - Anfordern von Mikrofon/Kamera/Bildschirm über einen Host
//! - Exklusive Handles mit garantierter Freigabe
//! - Capture-Puffer für die Pegelanzeige
//! - Simulierte Geräte für Demo und Tests

mod buffer;
mod device;
mod handle;
#[cfg(feature = "native-audio")]
mod native;
mod simulated;

pub use buffer::{SampleBuffer, CAPTURE_BUFFER_SIZE};
pub use device::{CaptureStream, DeviceClass, MediaDevices, MediaError, MediaKind, TrackKind};
pub use handle::{MediaResourceHandle, MediaTrack};
#[cfg(feature = "native-audio")]
pub use native::{AudioDevice, CpalDevices};
pub use simulated::{sine_wave, SimulatedDevices, SIMULATED_SAMPLE_RATE};
