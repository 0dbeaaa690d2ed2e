//! Call Module - Lebenszyklus eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Zustandsmaschine Connecting → Ringing → Connected → Ended
//! - Gesprächsdauer und Pegelanzeige
//! - Mute, Kamera aus, Bildschirmfreigabe
//! - Events und Hinweise an die UI

mod session;
mod state;

pub use session::{CallError, CallSession};
pub use state::{
    format_duration, CallEvent, CallKind, CallNotice, CallSnapshot, CallStatus, MediaState,
    NoticeKind, PreviewSource, SessionId,
};
