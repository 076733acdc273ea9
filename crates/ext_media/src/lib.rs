//! Media Control Bridge.
//!
//! Singleton facility mediating video playback and lock-screen audio
//! metadata between extension code and the platform. The bridge owns
//! session state; the actual decode/render engine, the notification
//! surface, and exclusive device resources (orientation lock,
//! immersive mode) are external collaborators behind traits.
//!
//! Capability ops reach the bridge through a process-wide slot that is
//! written when the real bridge mounts and read lazily on every op
//! invocation — capability tables are built before the bridge exists,
//! so no op may capture the slot's value at build time.

use deno_core::{op2, Extension};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, deno_error::JsError)]
pub enum MediaError {
    #[error("No active media player is mounted")]
    #[class(generic)]
    NoActivePlayer,

    #[error("Playback engine error: {0}")]
    #[class(generic)]
    Engine(String),
}

// ============================================================================
// Session types
// ============================================================================

/// Options for opening a video session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoOptions {
    pub source_uri: String,
    pub title: Option<String>,
    pub start_position: f64,
    #[serde(rename = "loop")]
    pub loop_playback: bool,
    pub headers: Option<HashMap<String, String>>,
}

/// Video sub-bridge states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoState {
    Closed,
    Opening,
    Playing,
    Paused,
    Buffering,
    Ended,
    Error,
}

/// Status report from the external playback engine, tagged with the
/// session generation it belongs to.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub loaded: bool,
    pub playing: bool,
    pub position_sec: f64,
    pub duration_sec: f64,
    pub buffered_sec: f64,
    pub buffering: bool,
    pub just_finished: bool,
    pub error: Option<String>,
}

/// Read-only live view of the video session, in the shape extension
/// code sees.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnapshot {
    pub state: VideoState,
    pub is_playing: bool,
    pub duration_sec: f64,
    pub position_sec: f64,
    pub buffered_sec: f64,
    pub is_buffering: bool,
    pub is_ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lock-screen/notification metadata snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioNotification {
    pub title: String,
    pub artist: String,
    pub artwork: Option<String>,
    pub album: Option<String>,
    pub is_playing: bool,
    pub duration_sec: f64,
    pub position_sec: f64,
}

/// Which remote-control handlers the extension currently has
/// registered. Replaced wholesale on every `set_handlers`, never
/// merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerSet {
    pub on_play: bool,
    pub on_pause: bool,
    pub on_next: bool,
    pub on_prev: bool,
    pub on_seek: bool,
    pub on_stop: bool,
}

impl HandlerSet {
    pub fn from_kinds(kinds: &[String]) -> Self {
        let mut set = Self::default();
        for kind in kinds {
            match kind.as_str() {
                "onPlay" => set.on_play = true,
                "onPause" => set.on_pause = true,
                "onNext" => set.on_next = true,
                "onPrev" => set.on_prev = true,
                "onSeek" => set.on_seek = true,
                "onStop" => set.on_stop = true,
                other => warn!(handler = %other, "ignoring unknown remote handler"),
            }
        }
        set
    }

    fn accepts(&self, cmd: &RemoteCommand) -> bool {
        match cmd {
            RemoteCommand::Play => self.on_play,
            RemoteCommand::Pause => self.on_pause,
            RemoteCommand::Next => self.on_next,
            RemoteCommand::Prev => self.on_prev,
            RemoteCommand::Seek(_) => self.on_seek,
            RemoteCommand::Stop => self.on_stop,
        }
    }
}

/// Button press relayed from the platform notification surface.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    Play,
    Pause,
    Next,
    Prev,
    Seek(f64),
    Stop,
}

impl RemoteCommand {
    /// Handler name the prelude dispatches to.
    pub fn handler_name(&self) -> &'static str {
        match self {
            RemoteCommand::Play => "onPlay",
            RemoteCommand::Pause => "onPause",
            RemoteCommand::Next => "onNext",
            RemoteCommand::Prev => "onPrev",
            RemoteCommand::Seek(_) => "onSeek",
            RemoteCommand::Stop => "onStop",
        }
    }
}

/// Events the host drains and forwards into the owning extension's
/// runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    VideoClosed,
    VideoEnded,
    VideoError(String),
    Remote(RemoteCommand),
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Commands the bridge sends to the external playback engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Play,
    Pause,
    Seek(f64),
    Replay,
}

pub trait PlaybackEngine: Send + Sync {
    fn load(&self, session: u64, options: &VideoOptions);
    fn command(&self, session: u64, cmd: EngineCommand);
    fn teardown(&self, session: u64);
}

pub trait NotificationSurface: Send + Sync {
    fn sync(&self, snapshot: &AudioNotification, handlers: HandlerSet);
    fn teardown(&self);
}

pub trait DeviceResources: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// No-op collaborators for hosts without a mounted engine (and tests).
pub struct NullEngine;
impl PlaybackEngine for NullEngine {
    fn load(&self, _session: u64, _options: &VideoOptions) {}
    fn command(&self, _session: u64, _cmd: EngineCommand) {}
    fn teardown(&self, _session: u64) {}
}

pub struct NullSurface;
impl NotificationSurface for NullSurface {
    fn sync(&self, _snapshot: &AudioNotification, _handlers: HandlerSet) {}
    fn teardown(&self) {}
}

pub struct NullDevice;
impl DeviceResources for NullDevice {
    fn acquire(&self) {}
    fn release(&self) {}
}

// ============================================================================
// Bridge
// ============================================================================

struct VideoSession {
    gen: u64,
    options: VideoOptions,
    state: VideoState,
    is_playing: bool,
    duration_sec: f64,
    position_sec: f64,
    buffered_sec: f64,
    is_buffering: bool,
    is_ended: bool,
    error: Option<String>,
    device_held: bool,
}

impl VideoSession {
    fn new(gen: u64, options: VideoOptions) -> Self {
        let start = options.start_position;
        Self {
            gen,
            options,
            state: VideoState::Opening,
            is_playing: false,
            duration_sec: 0.0,
            position_sec: start,
            buffered_sec: 0.0,
            is_buffering: true,
            is_ended: false,
            error: None,
            device_held: false,
        }
    }

    fn snapshot(&self) -> VideoSnapshot {
        VideoSnapshot {
            state: self.state,
            is_playing: self.is_playing,
            duration_sec: self.duration_sec,
            position_sec: self.position_sec,
            buffered_sec: self.buffered_sec,
            is_buffering: self.is_buffering,
            is_ended: self.is_ended,
            error: self.error.clone(),
        }
    }
}

#[derive(Default)]
struct BridgeInner {
    session_gen: u64,
    video: Option<VideoSession>,
    audio: Option<AudioNotification>,
    handlers: HandlerSet,
    events: VecDeque<MediaEvent>,
}

/// The process-wide playback controller. At most one video session and
/// one audio-notification session are live at any time.
pub struct MediaBridge {
    engine: Arc<dyn PlaybackEngine>,
    surface: Arc<dyn NotificationSurface>,
    device: Arc<dyn DeviceResources>,
    inner: Mutex<BridgeInner>,
}

impl MediaBridge {
    pub fn new(
        engine: Arc<dyn PlaybackEngine>,
        surface: Arc<dyn NotificationSurface>,
        device: Arc<dyn DeviceResources>,
    ) -> Self {
        Self {
            engine,
            surface,
            device,
            inner: Mutex::new(BridgeInner::default()),
        }
    }

    /// Headless bridge with no-op collaborators.
    pub fn detached() -> Self {
        Self::new(Arc::new(NullEngine), Arc::new(NullSurface), Arc::new(NullDevice))
    }

    // ------------------------------------------------------------------
    // Video sub-bridge
    // ------------------------------------------------------------------

    /// Open a video session. A live session is replaced, not stacked:
    /// its engine resource is torn down and its device resources are
    /// released before the new session starts.
    pub fn open(&self, options: VideoOptions) {
        let mut inner = self.inner.lock().expect("bridge lock");
        self.teardown_session(&mut inner, None);

        inner.session_gen += 1;
        let gen = inner.session_gen;
        debug!(gen, source = %options.source_uri, "video.open");

        let mut session = VideoSession::new(gen, options);
        self.device.acquire();
        session.device_held = true;
        self.engine.load(gen, &session.options);
        inner.video = Some(session);
    }

    /// Close the current session and return to `Closed`. Safe to call
    /// with no session live.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("bridge lock");
        self.teardown_session(&mut inner, Some(MediaEvent::VideoClosed));
    }

    /// Tear down any live session. Device resources are released
    /// exactly once per session regardless of which exit path runs.
    fn teardown_session(&self, inner: &mut BridgeInner, event: Option<MediaEvent>) {
        if let Some(mut session) = inner.video.take() {
            debug!(gen = session.gen, "video.teardown");
            self.engine.teardown(session.gen);
            if session.device_held {
                self.device.release();
                session.device_held = false;
            }
            if let Some(event) = event {
                inner.events.push_back(event);
            }
        }
    }

    pub fn play(&self) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if let Some(session) = inner.video.as_mut() {
            if session.state == VideoState::Paused || session.state == VideoState::Playing {
                session.state = VideoState::Playing;
                session.is_playing = true;
            }
            self.engine.command(session.gen, EngineCommand::Play);
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if let Some(session) = inner.video.as_mut() {
            if session.state == VideoState::Playing {
                session.state = VideoState::Paused;
                session.is_playing = false;
            }
            self.engine.command(session.gen, EngineCommand::Pause);
        }
    }

    /// In `Ended` this replays from the start rather than resuming.
    pub fn toggle_play(&self) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if let Some(session) = inner.video.as_mut() {
            match session.state {
                VideoState::Ended => {
                    session.is_ended = false;
                    session.position_sec = 0.0;
                    session.state = VideoState::Playing;
                    session.is_playing = true;
                    self.engine.command(session.gen, EngineCommand::Replay);
                }
                VideoState::Playing => {
                    session.state = VideoState::Paused;
                    session.is_playing = false;
                    self.engine.command(session.gen, EngineCommand::Pause);
                }
                _ => {
                    session.state = VideoState::Playing;
                    session.is_playing = true;
                    self.engine.command(session.gen, EngineCommand::Play);
                }
            }
        }
    }

    pub fn seek(&self, position_sec: f64) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if let Some(session) = inner.video.as_mut() {
            let clamped = position_sec.clamp(0.0, session.duration_sec.max(0.0));
            session.position_sec = clamped;
            self.engine.command(session.gen, EngineCommand::Seek(clamped));
        }
    }

    /// Seek relative to the current position, clamped to
    /// `[0, duration]`.
    pub fn skip(&self, delta_sec: f64) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if let Some(session) = inner.video.as_mut() {
            let clamped =
                (session.position_sec + delta_sec).clamp(0.0, session.duration_sec.max(0.0));
            session.position_sec = clamped;
            self.engine.command(session.gen, EngineCommand::Seek(clamped));
        }
    }

    pub fn video_snapshot(&self) -> VideoSnapshot {
        let inner = self.inner.lock().expect("bridge lock");
        match inner.video.as_ref() {
            Some(session) => session.snapshot(),
            None => VideoSnapshot {
                state: VideoState::Closed,
                is_playing: false,
                duration_sec: 0.0,
                position_sec: 0.0,
                buffered_sec: 0.0,
                is_buffering: false,
                is_ended: false,
                error: None,
            },
        }
    }

    /// Apply an engine status report. Reports carrying a stale session
    /// generation (the session was closed or replaced while the
    /// engine's operation was in flight) are discarded, never applied.
    pub fn on_engine_status(&self, session_gen: u64, status: EngineStatus) {
        let mut inner = self.inner.lock().expect("bridge lock");
        let Some(session) = inner.video.as_mut() else {
            debug!(session_gen, "discarding engine status: no session");
            return;
        };
        if session.gen != session_gen {
            debug!(
                session_gen,
                current = session.gen,
                "discarding stale engine status"
            );
            return;
        }

        if session.state == VideoState::Error || session.state == VideoState::Ended {
            // Terminal until close() or an explicit replay. A late
            // report must not resurrect playback fields.
            debug!(session_gen, state = ?session.state, "discarding post-terminal engine status");
            return;
        }

        if let Some(message) = status.error {
            // Terminal until close().
            session.state = VideoState::Error;
            session.is_playing = false;
            session.error = Some(message.clone());
            inner.events.push_back(MediaEvent::VideoError(message));
            return;
        }

        session.position_sec = status.position_sec;
        session.duration_sec = status.duration_sec;
        session.buffered_sec = status.buffered_sec;
        session.is_buffering = status.buffering;
        session.is_playing = status.playing;

        if status.just_finished && !session.options.loop_playback {
            session.state = VideoState::Ended;
            session.is_playing = false;
            session.is_ended = true;
            inner.events.push_back(MediaEvent::VideoEnded);
            return;
        }

        if !status.loaded {
            return;
        }
        session.state = if status.buffering {
            VideoState::Buffering
        } else if status.playing {
            VideoState::Playing
        } else {
            VideoState::Paused
        };
    }

    pub fn current_session_gen(&self) -> u64 {
        self.inner.lock().expect("bridge lock").session_gen
    }

    // ------------------------------------------------------------------
    // Audio-notification sub-bridge
    // ------------------------------------------------------------------

    /// Replace the metadata snapshot wholesale and sync the platform
    /// surface.
    pub fn update_audio(&self, info: AudioNotification) {
        let mut inner = self.inner.lock().expect("bridge lock");
        let handlers = inner.handlers;
        self.surface.sync(&info, handlers);
        inner.audio = Some(info);
    }

    /// Replace the registered handler set wholesale (no merge) and
    /// resync if a snapshot is active.
    pub fn set_handlers(&self, handlers: HandlerSet) {
        let mut inner = self.inner.lock().expect("bridge lock");
        inner.handlers = handlers;
        if let Some(snapshot) = inner.audio.as_ref() {
            self.surface.sync(snapshot, handlers);
        }
    }

    /// Drop the snapshot and tear the platform notification down.
    pub fn clear_audio(&self) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if inner.audio.take().is_some() {
            self.surface.teardown();
        }
    }

    /// Relay a platform button press. Only commands with a currently
    /// registered handler are forwarded; the rest are dropped.
    pub fn handle_remote(&self, cmd: RemoteCommand) {
        let mut inner = self.inner.lock().expect("bridge lock");
        if inner.handlers.accepts(&cmd) {
            inner.events.push_back(MediaEvent::Remote(cmd));
        } else {
            debug!(handler = cmd.handler_name(), "dropping unhandled remote command");
        }
    }

    /// Drain pending events for dispatch into the owning extension's
    /// runtime.
    pub fn drain_events(&self) -> Vec<MediaEvent> {
        let mut inner = self.inner.lock().expect("bridge lock");
        inner.events.drain(..).collect()
    }
}

// ============================================================================
// Process-wide bridge slot
// ============================================================================

static ACTIVE_BRIDGE: Lazy<RwLock<Option<Arc<MediaBridge>>>> = Lazy::new(|| RwLock::new(None));

/// Mount a bridge as the process-wide active instance (or unmount with
/// `None`). Capability ops pick the change up on their next call
/// without being rebuilt.
pub fn set_active_bridge(bridge: Option<Arc<MediaBridge>>) {
    *ACTIVE_BRIDGE.write().expect("bridge slot lock") = bridge;
}

/// Read the slot. Called lazily on every op invocation.
pub fn active_bridge() -> Option<Arc<MediaBridge>> {
    ACTIVE_BRIDGE.read().expect("bridge slot lock").clone()
}

fn require_bridge() -> Result<Arc<MediaBridge>, MediaError> {
    active_bridge().ok_or(MediaError::NoActivePlayer)
}

// ============================================================================
// Operations
// ============================================================================

#[op2]
fn op_video_open(#[serde] options: VideoOptions) -> Result<(), MediaError> {
    require_bridge()?.open(options);
    Ok(())
}

#[op2]
fn op_video_close() -> Result<(), MediaError> {
    require_bridge()?.close();
    Ok(())
}

#[op2]
fn op_video_play() -> Result<(), MediaError> {
    require_bridge()?.play();
    Ok(())
}

#[op2]
fn op_video_pause() -> Result<(), MediaError> {
    require_bridge()?.pause();
    Ok(())
}

#[op2]
fn op_video_toggle_play() -> Result<(), MediaError> {
    require_bridge()?.toggle_play();
    Ok(())
}

#[op2]
fn op_video_seek(position_sec: f64) -> Result<(), MediaError> {
    require_bridge()?.seek(position_sec);
    Ok(())
}

#[op2]
fn op_video_skip(delta_sec: f64) -> Result<(), MediaError> {
    require_bridge()?.skip(delta_sec);
    Ok(())
}

#[op2]
#[serde]
fn op_video_status() -> Result<VideoSnapshot, MediaError> {
    Ok(require_bridge()?.video_snapshot())
}

#[op2]
fn op_music_update(#[serde] info: AudioNotification) -> Result<(), MediaError> {
    require_bridge()?.update_audio(info);
    Ok(())
}

#[op2]
fn op_music_set_handlers(#[serde] kinds: Vec<String>) -> Result<(), MediaError> {
    require_bridge()?.set_handlers(HandlerSet::from_kinds(&kinds));
    Ok(())
}

#[op2]
fn op_music_clear() -> Result<(), MediaError> {
    require_bridge()?.clear_audio();
    Ok(())
}

deno_core::extension!(
    lhub_media,
    ops = [
        op_video_open,
        op_video_close,
        op_video_play,
        op_video_pause,
        op_video_toggle_play,
        op_video_seek,
        op_video_skip,
        op_video_status,
        op_music_update,
        op_music_set_handlers,
        op_music_clear,
    ]
);

pub fn media_extension() -> Extension {
    lhub_media::ext()
}
