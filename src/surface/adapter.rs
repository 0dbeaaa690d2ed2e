//! Call Surface - Bindeglied zwischen UI und Call-Sessions
//!
//! Verwaltet genau zwei Dinge:
//! - die Benachrichtigung über einen eingehenden Anruf (mit Klingelton)
//! - die aktive Session (höchstens eine)
//!
//! Fehler aus Benutzeraktionen gehen als `CallEvent::Notice` an die UI
//! und werden zusätzlich zurückgegeben.

use super::contact::Contact;
use crate::audio::{RingtoneSynthesizer, ToneBackend};
use crate::call::{CallError, CallEvent, CallKind, CallSession, CallStatus};
use crate::config::{CallConfig, ConfigError};
use crate::media::MediaDevices;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Kapazität des Event-Kanals
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// INCOMING CALL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingCall {
    pub kind: CallKind,
    pub caller: Contact,
}

impl IncomingCall {
    pub fn headline(&self) -> String {
        format!("Incoming {} Call", self.kind.label())
    }

    pub fn hint(&self) -> String {
        format!("Accept to start {} call", self.kind.label().to_lowercase())
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub contact: Contact,
    pub session: Arc<CallSession>,
}

#[derive(Default)]
struct SurfaceState {
    incoming: Option<IncomingCall>,
    active: Option<ActiveCall>,
}

// ============================================================================
// CALL SURFACE
// ============================================================================

pub struct CallSurface {
    devices: Arc<dyn MediaDevices>,
    config: CallConfig,
    ringtone: RingtoneSynthesizer,
    event_tx: broadcast::Sender<CallEvent>,
    state: Arc<Mutex<SurfaceState>>,
}

impl CallSurface {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        tones: Arc<dyn ToneBackend>,
        config: CallConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ringtone = RingtoneSynthesizer::new(tones, config.ringtone.clone());

        Ok(Self {
            devices,
            config,
            ringtone,
            event_tx,
            state: Arc::new(Mutex::new(SurfaceState::default())),
        })
    }

    /// Abonniert alle Events (Sessions, Benachrichtigung, Klingelton)
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    /// Zeigt die Benachrichtigung an und startet den Klingelton
    ///
    /// Eine bereits sichtbare Benachrichtigung wird ersetzt, der
    /// Klingelton läuft dabei einfach weiter.
    pub fn present_incoming(&self, kind: CallKind, caller: Contact) {
        let incoming = IncomingCall { kind, caller };
        tracing::info!("{} from {}", incoming.headline(), incoming.caller.name);

        self.state.lock().incoming = Some(incoming.clone());
        self.emit(CallEvent::IncomingCall {
            kind: incoming.kind,
            caller: incoming.caller,
        });

        let was_ringing = self.ringtone.is_ringing();
        match self.ringtone.start() {
            Ok(()) if !was_ringing => self.emit(CallEvent::RingtoneChanged { ringing: true }),
            Ok(()) => {}
            Err(e) => self.notify(None, &CallError::from(e)),
        }
    }

    /// Nimmt den eingehenden Anruf an und öffnet die Session
    pub fn accept(&self) -> Result<Arc<CallSession>, CallError> {
        let incoming = {
            let mut state = self.state.lock();
            let incoming = state.incoming.clone().ok_or(CallError::NoIncomingCall)?;
            if has_live_call(&state) {
                drop(state);
                let err = CallError::AlreadyInCall;
                self.notify(None, &err);
                return Err(err);
            }
            state.incoming = None;
            incoming
        };

        self.dismiss_incoming(true);
        tracing::info!("Accepted call from {}", incoming.caller.name);
        self.open(incoming.kind, incoming.caller)
    }

    /// Lehnt den eingehenden Anruf ab. Ohne Benachrichtigung ein No-op.
    pub fn decline(&self) {
        let declined = self.state.lock().incoming.take();
        if let Some(incoming) = declined {
            tracing::info!("Declined call from {}", incoming.caller.name);
            self.dismiss_incoming(false);
        }
    }

    fn dismiss_incoming(&self, accepted: bool) {
        self.emit(CallEvent::IncomingDismissed { accepted });
        if self.ringtone.is_ringing() {
            self.ringtone.stop();
            self.emit(CallEvent::RingtoneChanged { ringing: false });
        }
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Öffnet eine neue Session
    ///
    /// Eine beendete Session in der Schließ-Phase wird ersetzt, ihre
    /// Geräte sind bereits freigegeben.
    pub fn open(&self, kind: CallKind, contact: Contact) -> Result<Arc<CallSession>, CallError> {
        let mut state = self.state.lock();
        if has_live_call(&state) {
            drop(state);
            let err = CallError::AlreadyInCall;
            self.notify(None, &err);
            return Err(err);
        }

        let session = match CallSession::start(
            kind,
            Arc::clone(&self.devices),
            &self.config,
            self.event_tx.clone(),
        ) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                drop(state);
                self.notify(None, &err);
                return Err(err);
            }
        };

        tracing::info!(
            "Opened {:?} call {} with {}",
            kind,
            session.id(),
            contact.name
        );
        state.active = Some(ActiveCall {
            contact,
            session: Arc::clone(&session),
        });
        Ok(session)
    }

    pub fn start_voice_call(&self, contact: Contact) -> Result<Arc<CallSession>, CallError> {
        self.open(CallKind::Voice, contact)
    }

    pub fn start_video_call(&self, contact: Contact) -> Result<Arc<CallSession>, CallError> {
        self.open(CallKind::Video, contact)
    }

    /// Beendet die aktive Session
    ///
    /// Der Slot wird nach der Schließ-Phase freigegeben.
    pub fn end_call(&self) -> Result<(), CallError> {
        let Some(active) = self.state.lock().active.clone() else {
            return Err(CallError::NoActiveCall);
        };

        active.session.end_call();

        let session = active.session;
        let state = Arc::clone(&self.state);
        let cleanup = async move {
            session.closed().await;
            let mut state = state.lock();
            if state
                .active
                .as_ref()
                .is_some_and(|a| a.session.id() == session.id())
            {
                state.active = None;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(cleanup);
            }
            Err(_) => self.state.lock().active = None,
        }
        Ok(())
    }

    /// Schließt alles sofort: Benachrichtigung und aktive Session
    ///
    /// Sicher auch wenn nichts offen ist oder noch kein Gerät angefordert wurde.
    pub fn close(&self) {
        self.decline();
        let active = self.state.lock().active.take();
        if let Some(active) = active {
            tracing::info!("Closing call {}", active.session.id());
            active.session.end_call();
        }
    }

    // ========================================================================
    // TOGGLES
    // ========================================================================

    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let session = self.active_session()?;
        session
            .toggle_mute()
            .inspect_err(|err| self.notify(Some(&*session), err))
    }

    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let session = self.active_session()?;
        session
            .toggle_video()
            .inspect_err(|err| self.notify(Some(&*session), err))
    }

    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        let session = self.active_session()?;
        session
            .toggle_screen_share()
            .await
            .inspect_err(|err| self.notify(Some(&*session), err))
    }

    // ========================================================================
    // GETTERS
    // ========================================================================

    pub fn incoming_call(&self) -> Option<IncomingCall> {
        self.state.lock().incoming.clone()
    }

    pub fn active_call(&self) -> Option<ActiveCall> {
        self.state.lock().active.clone()
    }

    pub fn is_ringing(&self) -> bool {
        self.ringtone.is_ringing()
    }

    fn active_session(&self) -> Result<Arc<CallSession>, CallError> {
        let result = self
            .state
            .lock()
            .active
            .as_ref()
            .map(|a| Arc::clone(&a.session))
            .ok_or(CallError::NoActiveCall);
        result.inspect_err(|err| self.notify(None, err))
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notify(&self, session: Option<&CallSession>, err: &CallError) {
        tracing::warn!("Call surface: {}", err);
        self.emit(CallEvent::Notice {
            session_id: session.map(|s| s.id()),
            notice: err.notice(),
        });
    }
}

fn has_live_call(state: &SurfaceState) -> bool {
    state
        .active
        .as_ref()
        .is_some_and(|a| a.session.status() != CallStatus::Ended)
}

impl std::fmt::Debug for CallSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallSurface")
            .field("incoming", &state.incoming)
            .field("active", &state.active.as_ref().map(|a| a.session.id()))
            .field("ringing", &self.ringtone.is_ringing())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
