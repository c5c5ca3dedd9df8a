use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::{
        track_local::{TrackLocal, track_local_static_sample::TrackLocalStaticSample},
        track_remote::TrackRemote,
    },
};

use crate::errors::{Error, Result};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;
pub type ErrorHandler = Box<dyn FnOnce(&Error) + Send>;

/// Outbound tracks handed to a [`Peer`](crate::Peer). Cloning shares the
/// underlying tracks.
#[derive(Clone, derive_more::Debug)]
pub struct MediaStream {
    id: String,
    #[debug(skip)]
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        MediaStream {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns false and leaves the stream untouched if a track with the same
    /// id is already present.
    pub fn add_track(&mut self, track: LocalTrack) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Tracks that accept whole media samples, such as the ones
    /// [`SampleDevices`] produces.
    pub fn sample_tracks(&self) -> impl Iterator<Item = &TrackLocalStaticSample> {
        self.tracks
            .iter()
            .filter_map(|track| track.as_any().downcast_ref::<TrackLocalStaticSample>())
    }
}

/// Inbound tracks reported by the connection. Only ever grows.
#[derive(Clone, Default, derive_more::Debug)]
pub struct RemoteStream {
    #[debug(skip)]
    tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
}

impl RemoteStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn add_track(&self, track: Arc<TrackRemote>) {
        self.tracks.lock().await.push(track);
    }

    pub async fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tracks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tracks.lock().await.is_empty()
    }
}

#[derive(derive_more::Debug)]
pub struct StreamOptions {
    pub audio: bool,
    pub video: bool,
    #[debug(skip)]
    pub on_error: Option<ErrorHandler>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            audio: true,
            video: true,
            on_error: None,
        }
    }
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, audio: bool, video: bool) -> Result<MediaStream>;
}

/// Capture source backed by sample tracks (Opus audio, VP8 video). Whatever
/// feeds the tracks is up to the caller, see [`MediaStream::sample_tracks`].
#[derive(Debug, Clone)]
pub struct SampleDevices {
    stream_id: String,
}

impl SampleDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        SampleDevices {
            stream_id: stream_id.into(),
        }
    }

    fn track(&self, kind: &str, capability: RTCRtpCodecCapability) -> LocalTrack {
        Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{}-{kind}", self.stream_id),
            self.stream_id.clone(),
        ))
    }
}

impl Default for SampleDevices {
    fn default() -> Self {
        SampleDevices::new("rtcpeer")
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn get_user_media(&self, audio: bool, video: bool) -> Result<MediaStream> {
        if !audio && !video {
            return Err(Error::NoMediaRequested);
        }
        let mut stream = MediaStream::new(self.stream_id.clone());
        if audio {
            stream.add_track(self.track(
                "audio",
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
            ));
        }
        if video {
            stream.add_track(self.track(
                "video",
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            ));
        }
        Ok(stream)
    }
}

/// Asks `devices` for a stream. On failure the `on_error` callback, if any,
/// sees the error before it is returned.
pub async fn get_local_stream<D>(devices: &D, options: StreamOptions) -> Result<MediaStream>
where
    D: MediaDevices + ?Sized,
{
    let StreamOptions { audio, video, on_error } = options;
    match devices.get_user_media(audio, video).await {
        Ok(stream) => {
            debug!(id = stream.id(), tracks = stream.len(), "Local stream acquired");
            Ok(stream)
        }
        Err(err) => {
            warn!("Failed to get local stream: {err}");
            if let Some(on_error) = on_error {
                on_error(&err);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    use super::*;

    #[tokio::test]
    async fn captures_requested_kinds() {
        let devices = SampleDevices::new("cam");
        let stream = get_local_stream(&devices, StreamOptions {
            video: false,
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream.tracks()[0].kind(), RTPCodecType::Audio);
        assert_eq!(stream.tracks()[0].stream_id(), "cam");
        assert_eq!(stream.sample_tracks().count(), 1);

        let both = get_local_stream(&devices, StreamOptions::default()).await.unwrap();
        assert_eq!(both.len(), 2);
    }

    #[tokio::test]
    async fn nothing_requested_reports_error() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let result = get_local_stream(&SampleDevices::default(), StreamOptions {
            audio: false,
            video: false,
            on_error: Some(Box::new(move |err: &Error| {
                assert!(matches!(err, Error::NoMediaRequested));
                called2.store(true, Ordering::SeqCst);
            })),
        })
        .await;
        assert!(matches!(result, Err(Error::NoMediaRequested)));
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_without_handler_still_returns_error() {
        struct Broken;
        #[async_trait]
        impl MediaDevices for Broken {
            async fn get_user_media(&self, _: bool, _: bool) -> Result<MediaStream> {
                Err(Error::Capture("no device".to_string()))
            }
        }
        let result = get_local_stream(&Broken, StreamOptions::default()).await;
        assert!(matches!(result, Err(Error::Capture(_))));
    }

    #[test]
    fn duplicate_track_is_ignored() {
        let devices = SampleDevices::new("s");
        let track = devices.track("audio", RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        });
        let mut stream = MediaStream::new("s");
        assert!(stream.add_track(track.clone()));
        assert!(!stream.add_track(track));
        assert_eq!(stream.len(), 1);
    }
}
