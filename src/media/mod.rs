mod capture;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Result, SessionError};
use crate::lock;

pub use capture::GstreamerDevices;

/// Which capture kinds to acquire, and optionally which device for each.
/// A device is named by its label as reported by `enumerate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
}

impl MediaConstraints {
    pub fn new(video: bool, audio: bool) -> Self {
        Self {
            video,
            audio,
            ..Default::default()
        }
    }

    pub fn with_devices(mut self, video_device: Option<String>, audio_device: Option<String>) -> Self {
        self.video_device = video_device;
        self.audio_device = audio_device;
        self
    }

    fn ensure_any(&self) -> Result<()> {
        if !self.video && !self.audio {
            return Err(SessionError::MediaAcquisition(
                "neither video nor audio was requested".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::VideoInput => write!(f, "camera"),
            DeviceKind::AudioInput => write!(f, "microphone"),
        }
    }
}

/// A capture device as listed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaDeviceInfo {
    pub kind: DeviceKind,
    pub label: String,
}

impl MediaDeviceInfo {
    pub fn new(kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }
}

/// Picks the device of `kind` named by `wanted`: an exact label first, then
/// a case-insensitive substring. `None` means the system default source.
pub fn select_device<'a>(
    available: &'a [MediaDeviceInfo],
    kind: DeviceKind,
    wanted: Option<&str>,
) -> Option<&'a MediaDeviceInfo> {
    let wanted = wanted.map(str::trim).filter(|w| !w.is_empty())?;
    let mut of_kind = available.iter().filter(|d| d.kind == kind);

    if let Some(exact) = of_kind.clone().find(|d| d.label == wanted) {
        return Some(exact);
    }
    let needle = wanted.to_lowercase();
    let found = of_kind.find(|d| d.label.to_lowercase().contains(&needle));
    if found.is_none() {
        tracing::warn!(%kind, wanted, "Requested device not found, using the default");
    }
    found
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Lists the cameras and microphones that can be captured from.
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>>;

    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMediaStream>;
}

/// Running capture behind a stream, stopped once when the stream is released.
pub trait CaptureHandle: Send {
    fn stop(self: Box<Self>);
}

/// The local capture stream. Clones share the same tracks; peer sessions
/// attach the tracks and never stop them.
#[derive(Clone)]
pub struct LocalMediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: String,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    capture: Mutex<Option<Box<dyn CaptureHandle>>>,
    stopped: AtomicBool,
}

impl LocalMediaStream {
    pub fn new(
        id: impl Into<String>,
        tracks: Vec<Arc<TrackLocalStaticSample>>,
        capture: Option<Box<dyn CaptureHandle>>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                tracks,
                capture: Mutex::new(capture),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.inner.tracks
    }

    pub fn has_kind(&self, kind: RTPCodecType) -> bool {
        self.inner.tracks.iter().any(|track| track.kind() == kind)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stops the underlying capture. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }

        let capture = lock(&self.inner.capture).take();
        if let Some(capture) = capture {
            capture.stop();
        }

        tracing::info!(stream_id = %self.inner.id, "Local media stream released");
        true
    }

    pub fn same_stream(&self, other: &LocalMediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

pub(crate) fn new_stream_id() -> String {
    format!("local-{:08x}", rand::random::<u32>())
}

pub(crate) fn video_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_owned(),
        stream_id.to_owned(),
    ))
}

pub(crate) fn audio_track(stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id.to_owned(),
    ))
}

/// Devices that hand out tracks with nothing feeding them. Used for headless
/// sessions and tests; `denied()` behaves like a refused permission prompt.
#[derive(Debug, Default, Clone)]
pub struct SyntheticDevices {
    denied: bool,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self { denied: true }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>> {
        if self.denied {
            return Ok(Vec::new());
        }
        Ok(vec![
            MediaDeviceInfo::new(DeviceKind::VideoInput, "Synthetic Camera"),
            MediaDeviceInfo::new(DeviceKind::AudioInput, "Synthetic Microphone"),
        ])
    }

    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMediaStream> {
        constraints.ensure_any()?;
        if self.denied {
            return Err(SessionError::MediaAcquisition(
                "permission to use capture devices was denied".into(),
            ));
        }

        let available = self.enumerate().await?;
        let video_device = select_device(&available, DeviceKind::VideoInput, constraints.video_device.as_deref());
        let audio_device = select_device(&available, DeviceKind::AudioInput, constraints.audio_device.as_deref());
        tracing::debug!(
            video_device = video_device.map(|d| d.label.as_str()),
            audio_device = audio_device.map(|d| d.label.as_str()),
            "Synthetic devices selected"
        );

        let stream_id = new_stream_id();
        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(video_track(&stream_id));
        }
        if constraints.audio {
            tracks.push(audio_track(&stream_id));
        }

        tracing::debug!(stream_id = %stream_id, tracks = tracks.len(), "Synthetic media acquired");
        Ok(LocalMediaStream::new(stream_id, tracks, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingCapture(Arc<AtomicUsize>);

    impl CaptureHandle for CountingCapture {
        fn stop(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn devices() -> Vec<MediaDeviceInfo> {
        vec![
            MediaDeviceInfo::new(DeviceKind::VideoInput, "Integrated Camera"),
            MediaDeviceInfo::new(DeviceKind::VideoInput, "USB Camera HD"),
            MediaDeviceInfo::new(DeviceKind::AudioInput, "USB Camera HD Audio"),
        ]
    }

    #[test]
    fn test_select_device_by_label() {
        let available = devices();

        let exact = select_device(&available, DeviceKind::VideoInput, Some("USB Camera HD")).unwrap();
        assert_eq!(exact.label, "USB Camera HD");

        let partial = select_device(&available, DeviceKind::VideoInput, Some("integrated")).unwrap();
        assert_eq!(partial.label, "Integrated Camera");

        // The kind filter keeps the microphone out of camera matches
        let audio = select_device(&available, DeviceKind::AudioInput, Some("usb camera")).unwrap();
        assert_eq!(audio.label, "USB Camera HD Audio");
    }

    #[test]
    fn test_select_device_falls_back_to_default() {
        let available = devices();

        assert!(select_device(&available, DeviceKind::VideoInput, None).is_none());
        assert!(select_device(&available, DeviceKind::VideoInput, Some("  ")).is_none());
        assert!(select_device(&available, DeviceKind::VideoInput, Some("Webcam 9000")).is_none());
        assert!(select_device(&[], DeviceKind::AudioInput, Some("USB")).is_none());
    }

    #[tokio::test]
    async fn test_synthetic_devices_enumerate() {
        let listed = SyntheticDevices::new().enumerate().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].kind, DeviceKind::VideoInput);
        assert!(SyntheticDevices::denied().enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_device_still_acquires_default() {
        let constraints = MediaConstraints::new(true, true).with_devices(Some("Missing Cam".into()), None);
        let stream = SyntheticDevices::new().acquire(constraints).await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_synthetic_tracks_follow_constraints() {
        let stream = SyntheticDevices::new()
            .acquire(MediaConstraints::new(true, false))
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.has_kind(RTPCodecType::Video));
        assert!(!stream.has_kind(RTPCodecType::Audio));
    }

    #[tokio::test]
    async fn test_denied_devices_fail() {
        let result = SyntheticDevices::denied()
            .acquire(MediaConstraints::new(true, true))
            .await;
        assert!(matches!(result, Err(SessionError::MediaAcquisition(_))));
    }

    #[tokio::test]
    async fn test_empty_constraints_fail() {
        let result = SyntheticDevices::new()
            .acquire(MediaConstraints::new(false, false))
            .await;
        assert!(matches!(result, Err(SessionError::MediaAcquisition(_))));
    }

    #[test]
    fn test_stop_releases_capture_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stream = LocalMediaStream::new(
            "s1",
            vec![video_track("s1")],
            Some(Box::new(CountingCapture(stops.clone()))),
        );
        let shared = stream.clone();

        assert!(stream.stop());
        assert!(!shared.stop());
        assert!(shared.is_stopped());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
