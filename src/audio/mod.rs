//! Audio Module - Pegelanzeige und Klingelton
//!
//! - Pegel-Monitoring eines laufenden Audio-Tracks (FFT)
//! - Synthetischer Zwei-Ton-Klingelton
//! - cpal-Ausgabe hinter dem Feature `native-audio`

mod error;
mod level;
#[cfg(feature = "native-audio")]
mod native;
mod ringtone;

pub use error::AudioError;
pub use level::{AudioLevelMonitor, LevelAnalyser, LevelSubscription};
#[cfg(feature = "native-audio")]
pub use native::CpalTones;
pub use ringtone::{RingtoneSynthesizer, SimulatedTones, ToneBackend, ToneContext};
