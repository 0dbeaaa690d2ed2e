//! Media Devices - Abstraktion über lokale Capture-Geräte
//!
//! Ein Host (Betriebssystem, Browser, Simulator) muss liefern:
//! - Anfordern von Mikrofon-, Kamera- und Bildschirm-Streams
//! - Aktivieren/Deaktivieren einzelner Tracks ohne Neuverhandlung
//! - Stoppen aller Tracks eines Streams

use super::buffer::SampleBuffer;
use super::handle::MediaResourceHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied for {0}")]
    PermissionDenied(DeviceClass),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Media handle already released")]
    HandleReleased,

    #[error("Stream has no {0} track")]
    NoSuchTrack(TrackKind),
}

// ============================================================================
// MEDIA KINDS
// ============================================================================

/// Art der angeforderten Capture-Fähigkeit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    AudioVideo,
    ScreenCapture,
}

impl MediaKind {
    /// Physische Geräte, die für diese Anforderung gebraucht werden
    pub fn device_classes(self) -> &'static [DeviceClass] {
        match self {
            MediaKind::Audio => &[DeviceClass::Microphone],
            MediaKind::Video => &[DeviceClass::Camera],
            MediaKind::AudioVideo => &[DeviceClass::Microphone, DeviceClass::Camera],
            MediaKind::ScreenCapture => &[DeviceClass::Display],
        }
    }

    /// Tracks, die ein Stream dieser Art enthält
    pub fn track_kinds(self) -> &'static [TrackKind] {
        match self {
            MediaKind::Audio => &[TrackKind::Audio],
            MediaKind::Video | MediaKind::ScreenCapture => &[TrackKind::Video],
            MediaKind::AudioVideo => &[TrackKind::Audio, TrackKind::Video],
        }
    }
}

/// Einzelner Track innerhalb eines Streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Physisches Gerät hinter einem Track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Microphone,
    Camera,
    Display,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Microphone => write!(f, "microphone"),
            DeviceClass::Camera => write!(f, "camera"),
            DeviceClass::Display => write!(f, "display"),
        }
    }
}

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// Steuerung eines laufenden Geräte-Streams
///
/// Wird exklusiv von einem [`MediaResourceHandle`] besessen.
pub trait CaptureStream: Send + Sync {
    /// Schaltet einen Track an/aus, das Gerät läuft weiter
    fn set_track_enabled(&self, track: TrackKind, enabled: bool);

    /// Stoppt alle Tracks und gibt das Gerät frei
    fn stop(&self);

    /// Puffer mit den zuletzt aufgenommenen Samples (nur Audio-Streams)
    fn audio_tap(&self) -> Option<SampleBuffer> {
        None
    }
}

/// Host-Umgebung, die Geräte-Streams herausgibt
///
/// `acquire` ist der einzige Suspension-Point: hier wartet der Aufrufer
/// auf die Berechtigungsabfrage des Benutzers bzw. des Betriebssystems.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaResourceHandle, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_video_needs_both_devices() {
        assert_eq!(
            MediaKind::AudioVideo.device_classes(),
            &[DeviceClass::Microphone, DeviceClass::Camera]
        );
        assert_eq!(
            MediaKind::AudioVideo.track_kinds(),
            &[TrackKind::Audio, TrackKind::Video]
        );
    }

    #[test]
    fn test_screen_capture_is_video_only() {
        assert_eq!(MediaKind::ScreenCapture.track_kinds(), &[TrackKind::Video]);
        assert_eq!(
            MediaKind::ScreenCapture.device_classes(),
            &[DeviceClass::Display]
        );
    }

    #[test]
    fn test_error_messages() {
        let err = MediaError::PermissionDenied(DeviceClass::Camera);
        assert_eq!(err.to_string(), "Permission denied for camera");
    }
}
