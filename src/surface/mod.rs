//! Surface Module - Benachrichtigung und aktives Call-Fenster
//!
//! Verbindet Benutzeraktionen (annehmen, ablehnen, anrufen, auflegen)
//! mit Sessions, Geräten und Klingelton. Das Layout selbst ist Sache der UI.

mod adapter;
mod contact;

pub use adapter::{ActiveCall, CallSurface, IncomingCall, EVENT_CHANNEL_CAPACITY};
pub use contact::Contact;
