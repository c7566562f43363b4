use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    audio_track, new_stream_id, select_device, video_track, CaptureHandle, DeviceKind,
    LocalMediaStream, MediaConstraints, MediaDeviceInfo, MediaDevices,
};
use crate::error::{Result, SessionError};

/// Camera and microphone capture through GStreamer, encoded to VP8/Opus and
/// written into WebRTC sample tracks. Without a named device the auto sources
/// pick the system default.
#[derive(Debug, Default, Clone)]
pub struct GstreamerDevices;

#[derive(Debug, Clone, Copy)]
enum CaptureKind {
    Video,
    Audio,
}

impl CaptureKind {
    fn label(&self) -> &'static str {
        match self {
            CaptureKind::Video => "video",
            CaptureKind::Audio => "audio",
        }
    }

    fn device_kind(&self) -> DeviceKind {
        match self {
            CaptureKind::Video => DeviceKind::VideoInput,
            CaptureKind::Audio => DeviceKind::AudioInput,
        }
    }

    fn frame_duration(&self) -> Duration {
        match self {
            CaptureKind::Video => Duration::from_millis(33),
            CaptureKind::Audio => Duration::from_millis(20),
        }
    }
}

struct GstCapture {
    pipeline: gst::Pipeline,
}

impl CaptureHandle for GstCapture {
    fn stop(self: Box<Self>) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!(error = %e, "Failed to stop capture pipeline");
        }
    }
}

fn acquisition_error(msg: impl Into<String>) -> SessionError {
    SessionError::MediaAcquisition(msg.into())
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| acquisition_error(format!("Failed to create {}: {}", factory, e)))
}

fn init() -> Result<()> {
    gst::init().map_err(|e| acquisition_error(format!("GStreamer init failed: {}", e)))
}

/// Cameras and microphones currently visible to GStreamer, with their labels.
fn monitor_devices() -> Result<Vec<(MediaDeviceInfo, gst::Device)>> {
    init()?;
    let monitor = gst::DeviceMonitor::new();
    monitor.add_filter(Some("Video/Source"), None);
    monitor.add_filter(Some("Audio/Source"), None);
    monitor
        .start()
        .map_err(|e| acquisition_error(format!("Failed to start device monitor: {}", e)))?;

    let devices = monitor
        .devices()
        .into_iter()
        .map(|device| {
            let kind = if device.device_class().contains("Video") {
                DeviceKind::VideoInput
            } else {
                DeviceKind::AudioInput
            };
            (MediaDeviceInfo::new(kind, device.display_name().to_string()), device)
        })
        .collect();
    monitor.stop();
    Ok(devices)
}

/// Source element for `kind`: the named device when it exists, otherwise the
/// auto source.
fn source_element(
    kind: CaptureKind,
    wanted: Option<&str>,
    devices: &[(MediaDeviceInfo, gst::Device)],
) -> Result<gst::Element> {
    let infos: Vec<MediaDeviceInfo> = devices.iter().map(|(info, _)| info.clone()).collect();
    if let Some(chosen) = select_device(&infos, kind.device_kind(), wanted) {
        if let Some((_, device)) = devices.iter().find(|(info, _)| info == chosen) {
            tracing::info!(kind = kind.label(), device = %chosen.label, "Using selected capture device");
            return device
                .create_element(None)
                .map_err(|e| acquisition_error(format!("Failed to open {}: {}", chosen.label, e)));
        }
    }

    match kind {
        CaptureKind::Video => make("autovideosrc"),
        CaptureKind::Audio => make("autoaudiosrc"),
    }
}

#[async_trait]
impl MediaDevices for GstreamerDevices {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>> {
        let devices = tokio::task::spawn_blocking(monitor_devices)
            .await
            .map_err(|e| SessionError::Internal(format!("device listing task failed: {}", e)))??;
        Ok(devices.into_iter().map(|(info, _)| info).collect())
    }

    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMediaStream> {
        constraints.ensure_any()?;
        let runtime = Handle::current();

        // Starting the pipeline waits on the devices
        tokio::task::spawn_blocking(move || start_capture(&runtime, &constraints))
            .await
            .map_err(|e| SessionError::Internal(format!("capture task failed: {}", e)))?
    }
}

fn start_capture(runtime: &Handle, constraints: &MediaConstraints) -> Result<LocalMediaStream> {
    init()?;
    let named = constraints.video_device.is_some() || constraints.audio_device.is_some();
    let devices = if named { monitor_devices()? } else { Vec::new() };

    let stream_id = new_stream_id();
    let pipeline = gst::Pipeline::new();
    let mut tracks = Vec::new();

    if constraints.video {
        let track = video_track(&stream_id);
        let source = source_element(CaptureKind::Video, constraints.video_device.as_deref(), &devices)?;
        add_branch(&pipeline, runtime, CaptureKind::Video, source, track.clone())?;
        tracks.push(track);
    }
    if constraints.audio {
        let track = audio_track(&stream_id);
        let source = source_element(CaptureKind::Audio, constraints.audio_device.as_deref(), &devices)?;
        add_branch(&pipeline, runtime, CaptureKind::Audio, source, track.clone())?;
        tracks.push(track);
    }

    let started = pipeline
        .set_state(gst::State::Playing)
        .and_then(|_| pipeline.state(gst::ClockTime::from_seconds(3)).0);
    if let Err(e) = started {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(acquisition_error(format!(
            "capture device unavailable: {}",
            e
        )));
    }

    tracing::info!(
        stream_id = %stream_id,
        video = constraints.video,
        audio = constraints.audio,
        "Local capture started"
    );

    Ok(LocalMediaStream::new(
        stream_id,
        tracks,
        Some(Box::new(GstCapture { pipeline })),
    ))
}

fn add_branch(
    pipeline: &gst::Pipeline,
    runtime: &Handle,
    kind: CaptureKind,
    source: gst::Element,
    track: Arc<TrackLocalStaticSample>,
) -> Result<()> {
    let elements = match kind {
        CaptureKind::Video => vec![
            source,
            make("videoconvert")?,
            gst::ElementFactory::make("vp8enc")
                .property("deadline", 1i64)
                .property("cpu-used", 4i32)
                .build()
                .map_err(|e| acquisition_error(format!("Failed to create vp8enc: {}", e)))?,
        ],
        CaptureKind::Audio => vec![
            source,
            make("audioconvert")?,
            make("audioresample")?,
            make("opusenc")?,
        ],
    };

    let sink_name = format!("{}_sink", kind.label());
    let appsink = gst::ElementFactory::make("appsink")
        .name(sink_name.as_str())
        .property("sync", false)
        .build()
        .map_err(|e| acquisition_error(format!("Failed to create appsink: {}", e)))?
        .dynamic_cast::<gst_app::AppSink>()
        .map_err(|_| acquisition_error("Failed to cast to AppSink"))?;

    let chain: Vec<&gst::Element> = elements
        .iter()
        .chain(std::iter::once(appsink.upcast_ref::<gst::Element>()))
        .collect();

    pipeline
        .add_many(chain.iter().copied())
        .map_err(|e| acquisition_error(format!("Failed to add {} elements: {}", kind.label(), e)))?;
    gst::Element::link_many(chain.iter().copied())
        .map_err(|e| acquisition_error(format!("Failed to link {} elements: {}", kind.label(), e)))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Sample>();
    let default_duration = kind.frame_duration();

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                let duration = buffer
                    .duration()
                    .map(|d| Duration::from_nanos(d.nseconds()))
                    .unwrap_or(default_duration);

                tx.send(Sample {
                    data: Bytes::copy_from_slice(map.as_slice()),
                    duration,
                    ..Default::default()
                })
                .map_err(|_| gst::FlowError::Flushing)?;

                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    let label = kind.label();
    runtime.spawn(async move {
        while let Some(sample) = rx.recv().await {
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!(kind = label, error = %e, "Dropped captured sample");
            }
        }
        tracing::debug!(kind = label, "Capture writer finished");
    });

    Ok(())
}
