//! Capture-Puffer für Audio-Samples
//!
//! Ring-Buffer, in den die Capture-Seite schreibt und aus dem die
//! Pegelanzeige die jeweils letzten Samples liest.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Standardgröße (mehr als genug für ein FFT-Fenster)
pub const CAPTURE_BUFFER_SIZE: usize = 4096;

/// Geteilter Ring-Buffer mit Overwrite-Semantik
///
/// Klonen teilt den Puffer, es wird nichts kopiert.
#[derive(Clone)]
pub struct SampleBuffer {
    inner: Arc<Mutex<HeapRb<f32>>>,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeapRb::new(capacity.max(1)))),
        }
    }

    /// Schreibt Samples, älteste Werte werden bei Bedarf überschrieben
    pub fn push_samples(&self, samples: &[f32]) {
        self.inner.lock().push_slice_overwrite(samples);
    }

    /// Schreibt `len` Samples Stille
    pub fn push_silence(&self, len: usize) {
        let mut buffer = self.inner.lock();
        for _ in 0..len {
            buffer.push_overwrite(0.0);
        }
    }

    /// Kopiert die neuesten Samples nach `out` (älteste zuerst)
    ///
    /// Fehlende Werte am Ende werden mit 0.0 aufgefüllt. Gibt die Anzahl
    /// echter Samples zurück.
    pub fn latest(&self, out: &mut [f32]) -> usize {
        let buffer = self.inner.lock();
        let available = buffer.occupied_len();
        let take = available.min(out.len());

        for (slot, sample) in out.iter_mut().zip(buffer.iter().skip(available - take)) {
            *slot = *sample;
        }
        for slot in out.iter_mut().skip(take) {
            *slot = 0.0;
        }
        take
    }

    pub fn len(&self) -> usize {
        self.inner.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(CAPTURE_BUFFER_SIZE)
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
