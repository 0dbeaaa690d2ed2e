//! Media Resource Handle
//!
//! Exklusiver Besitzer eines Geräte-Streams. Garantiert:
//! - Tracks lassen sich an/aus schalten ohne das Gerät neu anzufordern
//! - `release()` stoppt alle Tracks genau einmal, weitere Aufrufe sind No-ops
//! - Ein freigegebener Handle wird nie wiederverwendet
//! - Drop gibt den Stream frei, falls das noch nicht passiert ist

use super::buffer::SampleBuffer;
use super::device::{CaptureStream, MediaError, MediaKind, TrackKind};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

// ============================================================================
// MEDIA TRACK
// ============================================================================

/// Zustand eines einzelnen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaTrack {
    pub kind: TrackKind,
    pub enabled: bool,
}

// ============================================================================
// HANDLE
// ============================================================================

pub struct MediaResourceHandle {
    id: Uuid,
    kind: MediaKind,
    tracks: Vec<MediaTrack>,
    stream: Box<dyn CaptureStream>,
    ended: watch::Receiver<bool>,
    released: bool,
}

impl MediaResourceHandle {
    /// Verpackt einen frisch angeforderten Stream
    ///
    /// `ended` wird vom Host auf `true` gesetzt, wenn die Aufnahme
    /// außerhalb der App beendet wird (z.B. "Freigabe beenden" im System-UI).
    pub fn new(
        id: Uuid,
        kind: MediaKind,
        tracks: &[TrackKind],
        stream: Box<dyn CaptureStream>,
        ended: watch::Receiver<bool>,
    ) -> Self {
        tracing::debug!("Media handle {} acquired ({:?})", id, kind);

        Self {
            id,
            kind,
            tracks: tracks
                .iter()
                .map(|&kind| MediaTrack {
                    kind,
                    enabled: true,
                })
                .collect(),
            stream,
            ended,
            released: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Gibt zurück ob der Track aktiv ist (`None` falls nicht vorhanden)
    pub fn is_track_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.tracks.iter().find(|t| t.kind == kind).map(|t| t.enabled)
    }

    /// Schaltet einen Track an/aus, ohne den Stream neu zu starten
    pub fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<(), MediaError> {
        if self.released {
            return Err(MediaError::HandleReleased);
        }

        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.kind == kind)
            .ok_or(MediaError::NoSuchTrack(kind))?;

        if track.enabled != enabled {
            track.enabled = enabled;
            self.stream.set_track_enabled(kind, enabled);
            tracing::debug!("Media handle {}: {} track enabled={}", self.id, kind, enabled);
        }
        Ok(())
    }

    /// Puffer für die Pegelanzeige (nur solange der Handle lebt)
    pub fn audio_tap(&self) -> Option<SampleBuffer> {
        if self.released || !self.has_track(TrackKind::Audio) {
            return None;
        }
        self.stream.audio_tap()
    }

    /// Receiver, der `true` meldet sobald der Host die Aufnahme beendet
    pub fn ended_signal(&self) -> watch::Receiver<bool> {
        self.ended.clone()
    }

    /// Prüft ob der Host die Aufnahme bereits beendet hat
    pub fn has_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Stoppt alle Tracks. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stream.stop();
        tracing::debug!("Media handle {} released ({:?})", self.id, self.kind);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for MediaResourceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaResourceHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tracks", &self.tracks)
            .field("released", &self.released)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
