//! Call State - Zustände, Snapshots und Events einer Call-Session
//!
//! Alles hier ist reine Daten und serialisierbar, damit eine UI die
//! Events direkt als JSON konsumieren kann.

use crate::media::MediaKind;
use crate::surface::Contact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// CALL KIND / STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    /// Medien, die beim Öffnen der Session angefordert werden
    pub fn primary_media(self) -> MediaKind {
        match self {
            CallKind::Voice => MediaKind::Audio,
            CallKind::Video => MediaKind::AudioVideo,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CallKind::Voice => "Voice",
            CallKind::Video => "Video",
        }
    }
}

/// Lebenszyklus einer Session, nur vorwärts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Connecting,
    Ringing,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        self == CallStatus::Ended
    }

    /// Statuszeile, wie sie im Call-Fenster steht
    pub fn label(self, duration_seconds: u64) -> String {
        match self {
            CallStatus::Connecting => "Connecting...".to_string(),
            CallStatus::Ringing => "Ringing...".to_string(),
            CallStatus::Connected => format_duration(duration_seconds),
            CallStatus::Ended => "Call ended".to_string(),
        }
    }
}

/// Formatiert Sekunden als `mm:ss`
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// SESSION ID
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// MEDIA STATE
// ============================================================================

/// Quelle der lokalen Vorschau
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewSource {
    #[default]
    None,
    Camera,
    Screen,
}

/// Toggle-Zustand, wie ihn die Bedienleiste anzeigt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaState {
    pub muted: bool,
    pub video_off: bool,
    pub screen_sharing: bool,
    pub preview: PreviewSource,
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Momentaufnahme einer Session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub id: SessionId,
    pub kind: CallKind,
    pub status: CallStatus,
    /// Zeitpunkt des Übergangs nach Connected
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub media: MediaState,
    pub has_primary_media: bool,
    pub level_monitor_active: bool,
    pub audio_level: f32,
}

impl CallSnapshot {
    pub fn status_label(&self) -> String {
        self.status.label(self.duration_seconds)
    }
}

// ============================================================================
// NOTICES
// ============================================================================

/// Fehlerklassen, die der UI als Hinweis angezeigt werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    PermissionDenied,
    DeviceUnavailable,
    AudioInitFailed,
    NotReady,
}

/// Nicht-blockierender Hinweis, beendet nie die Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallNotice {
    pub kind: NoticeKind,
    pub message: String,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events an die UI (broadcast)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged {
        session_id: SessionId,
        status: CallStatus,
    },
    DurationTick {
        session_id: SessionId,
        seconds: u64,
    },
    AudioLevel {
        session_id: SessionId,
        level: f32,
    },
    MediaChanged {
        session_id: SessionId,
        media: MediaState,
    },
    /// Exit-Animation vorbei, die Session ist geschlossen
    SessionClosed {
        session_id: SessionId,
        duration_seconds: u64,
    },
    Notice {
        session_id: Option<SessionId>,
        notice: CallNotice,
    },
    IncomingCall {
        kind: CallKind,
        caller: Contact,
    },
    IncomingDismissed {
        accepted: bool,
    },
    RingtoneChanged {
        ringing: bool,
    },
}

impl CallEvent {
    /// Session, auf die sich das Event bezieht
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            CallEvent::StateChanged { session_id, .. }
            | CallEvent::DurationTick { session_id, .. }
            | CallEvent::AudioLevel { session_id, .. }
            | CallEvent::MediaChanged { session_id, .. }
            | CallEvent::SessionClosed { session_id, .. } => Some(*session_id),
            CallEvent::Notice { session_id, .. } => *session_id,
            CallEvent::IncomingCall { .. }
            | CallEvent::IncomingDismissed { .. }
            | CallEvent::RingtoneChanged { .. } => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00");
        assert_eq!(format_duration(65), "01:05");
        assert_eq!(format_duration(3600), "60:00");
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(CallStatus::Connecting.label(0), "Connecting...");
        assert_eq!(CallStatus::Ringing.label(0), "Ringing...");
        assert_eq!(CallStatus::Connected.label(42), "00:42");
        assert_eq!(CallStatus::Ended.label(42), "Call ended");
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(CallStatus::Connecting < CallStatus::Ringing);
        assert!(CallStatus::Ringing < CallStatus::Connected);
        assert!(CallStatus::Connected < CallStatus::Ended);
        assert!(CallStatus::Ended.is_terminal());
    }

    #[test]
    fn test_primary_media() {
        assert_eq!(CallKind::Voice.primary_media(), MediaKind::Audio);
        assert_eq!(CallKind::Video.primary_media(), MediaKind::AudioVideo);
    }

    #[test]
    fn test_event_json_shape() {
        let id = SessionId::new();
        let event = CallEvent::StateChanged {
            session_id: id,
            status: CallStatus::Ringing,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["status"], "ringing");
        assert_eq!(json["session_id"], id.to_string());
        assert_eq!(event.session_id(), Some(id));
    }
}
