//! Call Session - Zustandsmaschine eines einzelnen Anrufs
//!
//! Ablauf:
//! 1. `start()` → Connecting, Geräte werden im Hintergrund angefordert
//! 2. nach `ringing_after` → Ringing
//! 3. nach `connected_after` → Connected, Dauer-Timer läuft,
//!    bei Voice-Calls zusätzlich die Pegelanzeige
//! 4. `end_call()` → Ended, alle Timer gestoppt, alle Handles freigegeben,
//!    nach `close_grace` gilt die Session als geschlossen
//!
//! Hintergrund-Tasks halten nur eine `Weak`-Referenz auf die Session und
//! werden bei Ended bzw. Drop abgebrochen.

use super::state::{
    CallEvent, CallKind, CallNotice, CallSnapshot, CallStatus, MediaState, NoticeKind,
    PreviewSource, SessionId,
};
use crate::audio::{AudioError, AudioLevelMonitor, LevelSubscription};
use crate::config::{CallConfig, CallTimings, LevelMonitorConfig};
use crate::media::{MediaDevices, MediaError, MediaKind, MediaResourceHandle, TrackKind};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Media is not ready yet")]
    NotReady,

    #[error("Only available in video calls")]
    VideoOnly,

    #[error("Call session already ended")]
    SessionEnded,

    #[error("Another call is already active")]
    AlreadyInCall,

    #[error("No incoming call to accept")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("No async runtime available: {0}")]
    NoRuntime(String),

    #[error("Invalid call config: {0}")]
    InvalidConfig(String),
}

impl CallError {
    /// Einordnung für die Hinweis-Anzeige
    pub fn notice_kind(&self) -> NoticeKind {
        match self {
            CallError::Media(MediaError::PermissionDenied(_)) => NoticeKind::PermissionDenied,
            CallError::Media(MediaError::DeviceUnavailable(_))
            | CallError::Media(MediaError::HandleReleased)
            | CallError::Audio(AudioError::NoAudioTrack)
            | CallError::AlreadyInCall => NoticeKind::DeviceUnavailable,
            CallError::Audio(AudioError::AudioInitFailed(_))
            | CallError::Audio(AudioError::InvalidConfig(_))
            | CallError::NoRuntime(_)
            | CallError::InvalidConfig(_) => NoticeKind::AudioInitFailed,
            CallError::Media(MediaError::NoSuchTrack(_))
            | CallError::NotReady
            | CallError::VideoOnly
            | CallError::SessionEnded
            | CallError::NoIncomingCall
            | CallError::NoActiveCall => NoticeKind::NotReady,
        }
    }

    pub fn notice(&self) -> CallNotice {
        CallNotice {
            kind: self.notice_kind(),
            message: self.to_string(),
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Default)]
struct SessionTasks {
    lifecycle: Option<JoinHandle<()>>,
    acquire: Option<JoinHandle<()>>,
    duration: Option<JoinHandle<()>>,
    level_forwarder: Option<JoinHandle<()>>,
    screen_watch: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_all(&mut self) {
        for task in [
            self.lifecycle.take(),
            self.acquire.take(),
            self.duration.take(),
            self.level_forwarder.take(),
            self.screen_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct SessionInner {
    status: CallStatus,
    started_at: Option<DateTime<Utc>>,
    duration_seconds: u64,
    muted: bool,
    video_off: bool,
    screen_sharing: bool,
    /// Bildschirmfreigabe wird gerade angefordert
    screen_pending: bool,
    preview: PreviewSource,
    primary: Option<MediaResourceHandle>,
    screen: Option<MediaResourceHandle>,
    level: Option<LevelSubscription>,
    audio_level: f32,
    tasks: SessionTasks,
}

impl SessionInner {
    fn media_state(&self) -> MediaState {
        MediaState {
            muted: self.muted,
            video_off: self.video_off,
            screen_sharing: self.screen_sharing,
            preview: self.preview,
        }
    }

    /// Vorschau ohne Bildschirmfreigabe
    fn camera_preview(&self) -> PreviewSource {
        match &self.primary {
            Some(handle) if handle.has_track(TrackKind::Video) => PreviewSource::Camera,
            _ => PreviewSource::None,
        }
    }

    fn stop_level_monitor(&mut self) {
        if let Some(task) = self.tasks.level_forwarder.take() {
            task.abort();
        }
        if let Some(mut level) = self.level.take() {
            level.stop();
        }
        self.audio_level = 0.0;
    }
}

struct SessionCore {
    id: SessionId,
    kind: CallKind,
    devices: Arc<dyn MediaDevices>,
    timings: CallTimings,
    level_config: LevelMonitorConfig,
    event_tx: broadcast::Sender<CallEvent>,
    closed_tx: watch::Sender<bool>,
    inner: Mutex<SessionInner>,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein laufender Anruf
///
/// Drop beendet die Session sofort (ohne Wartezeit) und gibt alle
/// Geräte frei.
pub struct CallSession {
    core: Arc<SessionCore>,
}

impl CallSession {
    /// Öffnet eine neue Session im Zustand Connecting
    pub fn start(
        kind: CallKind,
        devices: Arc<dyn MediaDevices>,
        config: &CallConfig,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> Result<Self, CallError> {
        config
            .validate()
            .map_err(|e| CallError::InvalidConfig(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CallError::NoRuntime(e.to_string()))?;

        let (closed_tx, _) = watch::channel(false);
        let core = Arc::new(SessionCore {
            id: SessionId::new(),
            kind,
            devices,
            timings: config.timings.clone(),
            level_config: config.level_monitor.clone(),
            event_tx,
            closed_tx,
            inner: Mutex::new(SessionInner {
                status: CallStatus::Connecting,
                started_at: None,
                duration_seconds: 0,
                muted: false,
                video_off: false,
                screen_sharing: false,
                screen_pending: false,
                preview: PreviewSource::None,
                primary: None,
                screen: None,
                level: None,
                audio_level: 0.0,
                tasks: SessionTasks::default(),
            }),
        });

        tracing::info!("Call session {} started ({:?})", core.id, kind);
        core.emit(CallEvent::StateChanged {
            session_id: core.id,
            status: CallStatus::Connecting,
        });

        let opened_at = Instant::now();
        let lifecycle = runtime.spawn(run_lifecycle(Arc::downgrade(&core), opened_at));
        let acquire = runtime.spawn(acquire_primary(Arc::downgrade(&core)));

        {
            let mut inner = core.inner.lock();
            inner.tasks.lifecycle = Some(lifecycle);
            inner.tasks.acquire = Some(acquire);
        }

        Ok(Self { core })
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn kind(&self) -> CallKind {
        self.core.kind
    }

    pub fn status(&self) -> CallStatus {
        self.core.inner.lock().status
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let inner = self.core.inner.lock();
        CallSnapshot {
            id: self.core.id,
            kind: self.core.kind,
            status: inner.status,
            started_at: inner.started_at,
            duration_seconds: inner.duration_seconds,
            media: inner.media_state(),
            has_primary_media: inner.primary.is_some(),
            level_monitor_active: inner.level.as_ref().is_some_and(|l| !l.is_stopped()),
            audio_level: inner.audio_level,
        }
    }

    pub fn media_state(&self) -> MediaState {
        self.core.inner.lock().media_state()
    }

    /// Letzter Wert der Pegelanzeige (0.0 ohne Monitoring)
    pub fn audio_level(&self) -> f32 {
        self.core.inner.lock().audio_level
    }

    pub fn local_preview(&self) -> PreviewSource {
        self.core.inner.lock().preview
    }

    pub fn primary_handle_id(&self) -> Option<Uuid> {
        self.core.inner.lock().primary.as_ref().map(|h| h.id())
    }

    pub fn screen_handle_id(&self) -> Option<Uuid> {
        self.core.inner.lock().screen.as_ref().map(|h| h.id())
    }

    pub fn is_closed(&self) -> bool {
        *self.core.closed_tx.borrow()
    }

    /// Wartet bis die Session nach Ended geschlossen ist
    pub async fn closed(&self) {
        let mut rx = self.core.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Beendet den Anruf aus jedem Zustand. Auf einer beendeten Session ein No-op.
    pub fn end_call(&self) {
        self.core.end(true);
    }

    /// Schaltet das Mikrofon stumm / wieder an
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let media = {
            let mut guard = self.core.inner.lock();
            let inner = &mut *guard;
            if inner.status.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            let primary = inner.primary.as_mut().ok_or(CallError::NotReady)?;

            let muted = !inner.muted;
            primary.set_track_enabled(TrackKind::Audio, !muted)?;
            inner.muted = muted;
            inner.media_state()
        };

        tracing::info!("Call {}: muted={}", self.core.id, media.muted);
        self.core.emit_media(media);
        Ok(media.muted)
    }

    /// Schaltet die Kamera ab / wieder an (nur Video-Calls)
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let media = {
            let mut guard = self.core.inner.lock();
            let inner = &mut *guard;
            if inner.status.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            if self.core.kind != CallKind::Video {
                return Err(CallError::VideoOnly);
            }
            let primary = match inner.primary.as_mut() {
                Some(handle) if handle.has_track(TrackKind::Video) => handle,
                _ => return Err(CallError::NotReady),
            };

            let video_off = !inner.video_off;
            primary.set_track_enabled(TrackKind::Video, !video_off)?;
            inner.video_off = video_off;
            inner.media_state()
        };

        tracing::info!("Call {}: video_off={}", self.core.id, media.video_off);
        self.core.emit_media(media);
        Ok(media.video_off)
    }

    /// Startet oder beendet die Bildschirmfreigabe (nur Video-Calls)
    ///
    /// Beim Einschalten wird der Bildschirm angefordert und ersetzt die
    /// Kamera als Vorschau. Die Kamera läuft weiter und wird beim
    /// Ausschalten ohne neue Berechtigungsabfrage wieder angezeigt.
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        let turned_off = {
            let mut inner = self.core.inner.lock();
            if inner.status.is_terminal() {
                return Err(CallError::SessionEnded);
            }
            if self.core.kind != CallKind::Video {
                return Err(CallError::VideoOnly);
            }
            if inner.primary.is_none() || inner.screen_pending {
                return Err(CallError::NotReady);
            }

            if inner.screen_sharing {
                if let Some(task) = inner.tasks.screen_watch.take() {
                    task.abort();
                }
                if let Some(mut screen) = inner.screen.take() {
                    screen.release();
                }
                inner.screen_sharing = false;
                inner.preview = inner.camera_preview();
                Some(inner.media_state())
            } else {
                inner.screen_pending = true;
                None
            }
        };

        if let Some(media) = turned_off {
            tracing::info!("Call {}: screen share stopped", self.core.id);
            self.core.emit_media(media);
            return Ok(false);
        }

        let pending = ScreenRequest {
            core: Arc::downgrade(&self.core),
        };
        let result = self.core.devices.acquire(MediaKind::ScreenCapture).await;
        drop(pending);

        let media = {
            let mut inner = self.core.inner.lock();

            // Ein fertiger Handle wird beim Verlassen des Blocks freigegeben
            let handle = result?;
            if inner.status.is_terminal() {
                tracing::debug!(
                    "Call {} ended during screen capture request, releasing",
                    self.core.id
                );
                return Err(CallError::SessionEnded);
            }

            let watch = spawn_task(watch_screen_end(
                Arc::downgrade(&self.core),
                handle.id(),
                handle.ended_signal(),
            ));
            inner.tasks.screen_watch = watch;
            inner.screen = Some(handle);
            inner.screen_sharing = true;
            inner.preview = PreviewSource::Screen;
            inner.media_state()
        };

        tracing::info!("Call {}: screen share started", self.core.id);
        self.core.emit_media(media);
        Ok(true)
    }
}

/// Laufende Bildschirm-Anfrage
///
/// Setzt `screen_pending` beim Drop zurück, auch wenn der Aufrufer das
/// Future vor dem Ende der Anfrage verwirft.
struct ScreenRequest {
    core: Weak<SessionCore>,
}

impl Drop for ScreenRequest {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.inner.lock().screen_pending = false;
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.core.end(false);
        self.core.mark_closed();
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.inner.lock();
        f.debug_struct("CallSession")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("status", &inner.status)
            .field("duration_seconds", &inner.duration_seconds)
            .field("media", &inner.media_state())
            .finish()
    }
}

// ============================================================================
// CORE
// ============================================================================

impl SessionCore {
    fn emit(&self, event: CallEvent) {
        // Kein Empfänger ist kein Fehler
        let _ = self.event_tx.send(event);
    }

    fn emit_media(&self, media: MediaState) {
        self.emit(CallEvent::MediaChanged {
            session_id: self.id,
            media,
        });
    }

    /// Meldet einen nicht-fatalen Fehler an die UI
    fn report(&self, err: &CallError) {
        tracing::warn!("Call {}: {}", self.id, err);
        self.emit(CallEvent::Notice {
            session_id: Some(self.id),
            notice: err.notice(),
        });
    }

    fn enter_ringing(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.status != CallStatus::Connecting {
                return;
            }
            inner.status = CallStatus::Ringing;
        }

        tracing::info!("Call {}: ringing", self.id);
        self.emit(CallEvent::StateChanged {
            session_id: self.id,
            status: CallStatus::Ringing,
        });
    }

    fn enter_connected(self: &Arc<Self>) {
        let monitor_result = {
            let mut inner = self.inner.lock();
            if inner.status != CallStatus::Ringing {
                return;
            }
            inner.status = CallStatus::Connected;
            inner.started_at = Some(Utc::now());
            inner.duration_seconds = 0;
            inner.tasks.duration = spawn_task(tick_duration(
                Arc::downgrade(self),
                self.timings.duration_tick(),
            ));

            if self.kind == CallKind::Voice {
                self.start_level_monitor(&mut inner)
            } else {
                Ok(())
            }
        };

        tracing::info!("Call {}: connected", self.id);
        self.emit(CallEvent::StateChanged {
            session_id: self.id,
            status: CallStatus::Connected,
        });

        if let Err(err) = monitor_result {
            self.report(&err);
        }
    }

    /// Hängt die Pegelanzeige an den Audio-Track
    ///
    /// Ohne Handle passiert nichts, das Monitoring startet dann bei der
    /// Übernahme des Handles.
    fn start_level_monitor(self: &Arc<Self>, inner: &mut SessionInner) -> Result<(), CallError> {
        let Some(primary) = inner.primary.as_ref() else {
            return Ok(());
        };
        if inner.level.is_some() {
            return Ok(());
        }

        let subscription = AudioLevelMonitor::start(primary, &self.level_config)?;
        let rx = subscription.receiver();
        inner.level = Some(subscription);
        inner.tasks.level_forwarder = spawn_task(forward_levels(Arc::downgrade(self), rx));
        Ok(())
    }

    /// Übernimmt den primären Handle nach erfolgreicher Anforderung
    fn install_primary(self: &Arc<Self>, handle: MediaResourceHandle) {
        let (media, monitor_result) = {
            let mut inner = self.inner.lock();
            inner.tasks.acquire = None;

            if inner.status.is_terminal() {
                drop(inner);
                tracing::debug!("Call {} already ended, releasing new media handle", self.id);
                drop(handle);
                return;
            }

            let has_video = handle.has_track(TrackKind::Video);
            if self.kind == CallKind::Video && !has_video {
                inner.video_off = true;
            }
            inner.primary = Some(handle);
            inner.preview = inner.camera_preview();

            let monitor_result =
                if self.kind == CallKind::Voice && inner.status == CallStatus::Connected {
                    self.start_level_monitor(&mut inner)
                } else {
                    Ok(())
                };
            (inner.media_state(), monitor_result)
        };

        tracing::info!("Call {}: primary media ready", self.id);
        self.emit_media(media);

        if let Err(err) = monitor_result {
            self.report(&err);
        }
    }

    fn add_duration_tick(&self) {
        let seconds = {
            let mut inner = self.inner.lock();
            if inner.status != CallStatus::Connected {
                return;
            }
            inner.duration_seconds += 1;
            inner.duration_seconds
        };

        self.emit(CallEvent::DurationTick {
            session_id: self.id,
            seconds,
        });
    }

    fn update_level(&self, level: f32) {
        let changed = {
            let mut inner = self.inner.lock();
            if inner.status != CallStatus::Connected {
                return;
            }
            let changed = (inner.audio_level - level).abs() > f32::EPSILON;
            inner.audio_level = level;
            changed
        };

        if changed {
            self.emit(CallEvent::AudioLevel {
                session_id: self.id,
                level,
            });
        }
    }

    /// Plattform hat die Bildschirmaufnahme beendet
    fn screen_capture_ended(&self, handle_id: Uuid) {
        let media = {
            let mut inner = self.inner.lock();
            if inner.screen.as_ref().map(|h| h.id()) != Some(handle_id) {
                return;
            }
            inner.tasks.screen_watch = None;
            if let Some(mut screen) = inner.screen.take() {
                screen.release();
            }
            inner.screen_sharing = false;
            inner.preview = inner.camera_preview();
            inner.media_state()
        };

        tracing::info!("Call {}: screen capture ended by platform", self.id);
        self.emit_media(media);
    }

    /// Übergang nach Ended
    ///
    /// Reihenfolge: Timer stoppen, Pegelanzeige stoppen, Handles freigeben,
    /// Event senden, nach der Wartezeit als geschlossen markieren.
    fn end(self: &Arc<Self>, grace: bool) {
        let duration_seconds = {
            let mut inner = self.inner.lock();
            if inner.status.is_terminal() {
                return;
            }
            let previous = inner.status;
            inner.status = CallStatus::Ended;

            inner.tasks.abort_all();
            inner.stop_level_monitor();

            if let Some(mut screen) = inner.screen.take() {
                screen.release();
            }
            if let Some(mut primary) = inner.primary.take() {
                primary.release();
            }
            inner.screen_sharing = false;
            inner.screen_pending = false;
            inner.preview = PreviewSource::None;

            tracing::info!(
                "Call {} ended from {:?} after {}s",
                self.id,
                previous,
                inner.duration_seconds
            );
            inner.duration_seconds
        };

        self.emit(CallEvent::StateChanged {
            session_id: self.id,
            status: CallStatus::Ended,
        });

        if !grace {
            self.mark_closed();
            return;
        }

        let weak = Arc::downgrade(self);
        let delay = self.timings.close_grace();
        let closer = spawn_task(async move {
            tokio::time::sleep(delay).await;
            if let Some(core) = weak.upgrade() {
                core.mark_closed();
            }
        });
        if closer.is_none() {
            self.mark_closed();
        }

        tracing::debug!(
            "Call {} closing in {}ms (duration {}s)",
            self.id,
            delay.as_millis(),
            duration_seconds
        );
    }

    fn mark_closed(&self) {
        let changed = self.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !changed {
            return;
        }

        let duration_seconds = self.inner.lock().duration_seconds;
        tracing::debug!("Call {} closed", self.id);
        self.emit(CallEvent::SessionClosed {
            session_id: self.id,
            duration_seconds,
        });
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

fn spawn_task<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Some(runtime.spawn(future)),
        Err(e) => {
            tracing::error!("Failed to spawn call task: {}", e);
            None
        }
    }
}

/// Connecting → Ringing → Connected, beide Zeiten ab Session-Start
async fn run_lifecycle(core: Weak<SessionCore>, opened_at: Instant) {
    let Some(timings) = core.upgrade().map(|c| c.timings.clone()) else {
        return;
    };

    tokio::time::sleep_until(opened_at + timings.ringing_after()).await;
    match core.upgrade() {
        Some(core) => core.enter_ringing(),
        None => return,
    }

    tokio::time::sleep_until(opened_at + timings.connected_after()).await;
    if let Some(core) = core.upgrade() {
        core.enter_connected();
    }
}

/// Fordert die primären Medien an
///
/// Scheitert Kamera+Mikrofon, läuft ein Video-Call nur mit Mikrofon
/// weiter. Der Fehler wird genau einmal gemeldet.
async fn acquire_primary(core: Weak<SessionCore>) {
    let Some((devices, kind)) = core.upgrade().map(|c| (Arc::clone(&c.devices), c.kind)) else {
        return;
    };

    let handle = match devices.acquire(kind.primary_media()).await {
        Ok(handle) => handle,
        Err(err) => {
            let first = CallError::from(err);
            match core.upgrade() {
                Some(core) => core.report(&first),
                None => return,
            }
            if kind != CallKind::Video {
                return;
            }

            tracing::info!("Video unavailable, continuing with audio only");
            match devices.acquire(MediaKind::Audio).await {
                Ok(handle) => handle,
                Err(err) => {
                    let second = CallError::from(err);
                    if second != first {
                        if let Some(core) = core.upgrade() {
                            core.report(&second);
                        }
                    }
                    return;
                }
            }
        }
    };

    match core.upgrade() {
        Some(core) => core.install_primary(handle),
        None => drop(handle),
    }
}

async fn tick_duration(core: Weak<SessionCore>, tick: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    loop {
        ticker.tick().await;
        match core.upgrade() {
            Some(core) => core.add_duration_tick(),
            None => break,
        }
    }
}

async fn forward_levels(core: Weak<SessionCore>, mut rx: watch::Receiver<f32>) {
    while rx.changed().await.is_ok() {
        let level = *rx.borrow_and_update();
        match core.upgrade() {
            Some(core) => core.update_level(level),
            None => break,
        }
    }
}

async fn watch_screen_end(core: Weak<SessionCore>, handle_id: Uuid, mut ended: watch::Receiver<bool>) {
    // Err: Stream wurde von uns gestoppt
    if ended.wait_for(|ended| *ended).await.is_err() {
        return;
    }
    if let Some(core) = core.upgrade() {
        core.screen_capture_ended(handle_id);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DeviceClass, SimulatedDevices};
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    fn setup() -> (SimulatedDevices, broadcast::Sender<CallEvent>, broadcast::Receiver<CallEvent>) {
        let (tx, rx) = broadcast::channel(1024);
        (SimulatedDevices::new(), tx, rx)
    }

    fn open(
        kind: CallKind,
        devices: &SimulatedDevices,
        tx: &broadcast::Sender<CallEvent>,
    ) -> CallSession {
        CallSession::start(
            kind,
            Arc::new(devices.clone()),
            &CallConfig::default(),
            tx.clone(),
        )
        .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    fn notices(events: &[CallEvent]) -> Vec<NoticeKind> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::Notice { notice, .. } => Some(notice.kind),
                _ => None,
            })
            .collect()
    }

    fn statuses(events: &[CallEvent]) -> Vec<CallStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_call_timeline() {
        let (devices, tx, mut rx) = setup();
        let session = open(CallKind::Voice, &devices, &tx);
        assert_eq!(session.status(), CallStatus::Connecting);

        sleep(Duration::from_millis(1010)).await;
        assert_eq!(session.status(), CallStatus::Ringing);

        sleep(Duration::from_millis(2000)).await; // 3010ms
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::Connected);
        assert_eq!(snapshot.duration_seconds, 0);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.level_monitor_active);

        sleep(Duration::from_millis(1000)).await; // 4010ms
        assert_eq!(session.snapshot().duration_seconds, 1);

        sleep(Duration::from_millis(2000)).await; // 6010ms
        assert_eq!(session.snapshot().duration_seconds, 3);
        assert_eq!(session.snapshot().status_label(), "00:03");

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![
                CallStatus::Connecting,
                CallStatus::Ringing,
                CallStatus::Connected
            ]
        );
        assert!(notices(&events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_call_with_denied_camera() {
        let (devices, tx, mut rx) = setup();
        devices.deny(DeviceClass::Camera);

        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::Connected);
        assert!(snapshot.has_primary_media);
        assert!(snapshot.media.video_off);
        assert_eq!(snapshot.media.preview, PreviewSource::None);
        assert_eq!(devices.live_streams_of(MediaKind::Audio), 1);
        assert_eq!(devices.live_streams_of(MediaKind::AudioVideo), 0);

        // Audio funktioniert weiterhin
        assert_eq!(session.toggle_mute(), Ok(true));
        assert_eq!(session.toggle_video(), Err(CallError::NotReady));

        let events = drain(&mut rx);
        assert_eq!(notices(&events), vec![NoticeKind::PermissionDenied]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_microphone_is_reported_once() {
        let (devices, tx, mut rx) = setup();
        devices.deny(DeviceClass::Microphone);

        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        assert_eq!(session.status(), CallStatus::Connected);
        assert!(!session.snapshot().has_primary_media);
        assert_eq!(notices(&drain(&mut rx)), vec![NoticeKind::PermissionDenied]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_call_has_no_level_monitor() {
        let (devices, tx, _rx) = setup();
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        let snapshot = session.snapshot();
        assert!(!snapshot.level_monitor_active);
        assert_eq!(snapshot.media.preview, PreviewSource::Camera);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_before_acquisition_are_not_ready() {
        let (devices, tx, _rx) = setup();
        devices.set_permission_delay(Duration::from_secs(2));

        let session = open(CallKind::Video, &devices, &tx);
        assert_eq!(session.toggle_mute(), Err(CallError::NotReady));
        assert_eq!(session.toggle_video(), Err(CallError::NotReady));
        assert_eq!(session.toggle_screen_share().await, Err(CallError::NotReady));

        sleep(Duration::from_millis(2010)).await;
        let primary = session.primary_handle_id().unwrap();
        assert_eq!(session.toggle_mute(), Ok(true));
        assert_eq!(devices.is_track_enabled(primary, TrackKind::Audio), Some(false));
        assert_eq!(session.toggle_video(), Ok(true));
        assert_eq!(devices.is_track_enabled(primary, TrackKind::Video), Some(false));
        assert_eq!(session.toggle_mute(), Ok(false));
        assert_eq!(devices.is_track_enabled(primary, TrackKind::Audio), Some(true));

        // Umschalten fordert das Gerät nicht neu an
        assert_eq!(devices.request_count(MediaKind::AudioVideo), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_call_rejects_video_toggles() {
        let (devices, tx, _rx) = setup();
        let session = open(CallKind::Voice, &devices, &tx);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(session.toggle_video(), Err(CallError::VideoOnly));
        assert_eq!(session.toggle_screen_share().await, Err(CallError::VideoOnly));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acquisition_starts_monitor() {
        let (devices, tx, _rx) = setup();
        devices.set_permission_delay(Duration::from_secs(5));

        let session = open(CallKind::Voice, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, CallStatus::Connected);
        assert!(!snapshot.has_primary_media);
        assert!(!snapshot.level_monitor_active);

        sleep(Duration::from_millis(2000)).await;
        let snapshot = session.snapshot();
        assert!(snapshot.has_primary_media);
        assert!(snapshot.level_monitor_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_level_follows_microphone() {
        let (devices, tx, _rx) = setup();
        let session = open(CallKind::Voice, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        devices.feed_tone(440.0, 0.8, 2048);
        sleep(Duration::from_millis(200)).await;
        assert!(session.audio_level() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_restores_camera() {
        let (devices, tx, _rx) = setup();
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        let camera = session.primary_handle_id().unwrap();
        assert_eq!(session.local_preview(), PreviewSource::Camera);

        assert_eq!(session.toggle_screen_share().await, Ok(true));
        assert_eq!(session.local_preview(), PreviewSource::Screen);
        assert!(session.media_state().screen_sharing);
        assert_eq!(devices.live_streams_of(MediaKind::ScreenCapture), 1);

        assert_eq!(session.toggle_screen_share().await, Ok(false));
        assert_eq!(session.local_preview(), PreviewSource::Camera);
        assert!(!session.media_state().screen_sharing);
        assert!(session.screen_handle_id().is_none());

        // Kamera lief durchgehend weiter
        assert_eq!(session.primary_handle_id(), Some(camera));
        assert_eq!(devices.stop_count(camera), 0);
        assert_eq!(devices.request_count(MediaKind::AudioVideo), 1);
        assert_eq!(devices.live_streams_of(MediaKind::ScreenCapture), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_ends_screen_share() {
        let (devices, tx, mut rx) = setup();
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        session.toggle_screen_share().await.unwrap();
        let screen = session.screen_handle_id().unwrap();
        drain(&mut rx);

        assert!(devices.end_capture_externally(MediaKind::ScreenCapture));
        sleep(Duration::from_millis(10)).await;

        let media = session.media_state();
        assert!(!media.screen_sharing);
        assert_eq!(media.preview, PreviewSource::Camera);
        assert_eq!(devices.stop_count(screen), 1);
        assert_eq!(devices.live_streams_of(MediaKind::ScreenCapture), 0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::MediaChanged { media, .. } if !media.screen_sharing
        )));

        // Erneutes Teilen ist möglich
        assert_eq!(session.toggle_screen_share().await, Ok(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_denied_keeps_call() {
        let (devices, tx, _rx) = setup();
        devices.deny(DeviceClass::Display);
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        assert_eq!(
            session.toggle_screen_share().await,
            Err(CallError::Media(MediaError::PermissionDenied(
                DeviceClass::Display
            )))
        );
        assert_eq!(session.status(), CallStatus::Connected);
        assert_eq!(session.local_preview(), PreviewSource::Camera);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_from_any_state_releases_everything() {
        for delay_ms in [0u64, 1500, 3500] {
            let (devices, tx, _rx) = setup();
            let session = open(CallKind::Voice, &devices, &tx);
            sleep(Duration::from_millis(delay_ms + 10)).await;

            session.end_call();

            let snapshot = session.snapshot();
            assert_eq!(snapshot.status, CallStatus::Ended);
            assert!(!snapshot.level_monitor_active);
            assert!(!snapshot.has_primary_media);
            assert_eq!(devices.live_streams(), 0, "after {}ms", delay_ms);
            assert!(!session.is_closed());

            sleep(Duration::from_millis(510)).await;
            assert!(session.is_closed());

            // Keine Timer mehr aktiv
            let duration = session.snapshot().duration_seconds;
            sleep(Duration::from_secs(5)).await;
            assert_eq!(session.status(), CallStatus::Ended);
            assert_eq!(session.snapshot().duration_seconds, duration);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_pending_acquisition() {
        let (devices, tx, _rx) = setup();
        devices.set_permission_delay(Duration::from_secs(2));

        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(500)).await;
        session.end_call();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(devices.live_streams(), 0);
        assert!(!session.snapshot().has_primary_media);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_screen_request_allows_retry() {
        let (devices, tx, _rx) = setup();
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        devices.set_permission_delay(Duration::from_secs(10));
        let request = tokio::time::timeout(Duration::from_secs(1), session.toggle_screen_share());
        assert!(request.await.is_err());
        assert_eq!(devices.live_streams_of(MediaKind::ScreenCapture), 0);

        devices.set_permission_delay(Duration::ZERO);
        assert_eq!(session.toggle_screen_share().await, Ok(true));
        assert_eq!(session.local_preview(), PreviewSource::Screen);
        assert_eq!(devices.live_streams_of(MediaKind::ScreenCapture), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_screen_request_releases_capture() {
        let (devices, tx, _rx) = setup();
        let session = Arc::new(open(CallKind::Video, &devices, &tx));
        sleep(Duration::from_millis(3010)).await;

        devices.set_permission_delay(Duration::from_secs(2));
        let request = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.toggle_screen_share().await }
        });
        sleep(Duration::from_millis(500)).await;
        session.end_call();

        assert_eq!(request.await.unwrap(), Err(CallError::SessionEnded));
        assert_eq!(devices.live_streams(), 0);
        assert_eq!(session.screen_handle_id(), None);
        assert_eq!(session.local_preview(), PreviewSource::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_invalid_config() {
        let (devices, tx, _rx) = setup();
        let mut config = CallConfig::default();
        config.timings.duration_tick_ms = 0;

        let result = CallSession::start(CallKind::Voice, Arc::new(devices.clone()), &config, tx);
        assert!(matches!(result, Err(CallError::InvalidConfig(_))));
        assert_eq!(devices.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_while_sharing_releases_both_handles() {
        let (devices, tx, _rx) = setup();
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;
        session.toggle_screen_share().await.unwrap();

        let camera = session.primary_handle_id().unwrap();
        let screen = session.screen_handle_id().unwrap();
        session.end_call();

        assert_eq!(devices.stop_count(camera), 1);
        assert_eq!(devices.stop_count(screen), 1);
        assert_eq!(devices.live_streams(), 0);
        assert_eq!(session.local_preview(), PreviewSource::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_twice_is_noop() {
        let (devices, tx, mut rx) = setup();
        let session = open(CallKind::Voice, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;

        session.end_call();
        session.end_call();
        assert_eq!(session.toggle_mute(), Err(CallError::SessionEnded));

        session.closed().await;
        let events = drain(&mut rx);
        let ended = statuses(&events)
            .into_iter()
            .filter(|s| *s == CallStatus::Ended)
            .count();
        assert_eq!(ended, 1);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, CallEvent::SessionClosed { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_right_after_end() {
        let (devices, tx, _rx) = setup();
        let first = open(CallKind::Voice, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;
        first.end_call();

        let second = open(CallKind::Voice, &devices, &tx);
        sleep(Duration::from_millis(10)).await;
        assert!(second.snapshot().has_primary_media);
        assert_eq!(devices.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_closes_immediately() {
        let (devices, tx, mut rx) = setup();
        let session = open(CallKind::Video, &devices, &tx);
        sleep(Duration::from_millis(3010)).await;
        let id = session.id();

        drop(session);
        assert_eq!(devices.live_streams(), 0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            CallEvent::SessionClosed { session_id, .. } if *session_id == id
        )));
    }

    #[test]
    fn test_start_without_runtime() {
        let devices = SimulatedDevices::new();
        let (tx, _rx) = broadcast::channel(16);
        let result = CallSession::start(
            CallKind::Voice,
            Arc::new(devices),
            &CallConfig::default(),
            tx,
        );
        assert!(matches!(result, Err(CallError::NoRuntime(_))));
    }

    #[test]
    fn test_notice_kinds() {
        assert_eq!(
            CallError::Media(MediaError::PermissionDenied(DeviceClass::Camera)).notice_kind(),
            NoticeKind::PermissionDenied
        );
        assert_eq!(
            CallError::Media(MediaError::DeviceUnavailable("busy".into())).notice_kind(),
            NoticeKind::DeviceUnavailable
        );
        assert_eq!(
            CallError::Audio(AudioError::AudioInitFailed("no output".into())).notice_kind(),
            NoticeKind::AudioInitFailed
        );
        assert_eq!(CallError::NotReady.notice_kind(), NoticeKind::NotReady);
        assert_eq!(CallError::NotReady.notice().message, "Media is not ready yet");
    }
}
