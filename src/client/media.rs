//! Local media handles and per-session configuration.
//!
//! Device acquisition is the embedding application's job; this module only
//! holds the resulting local tracks, at most one per kind, shared read-only
//! across every peer session once acquired.

use std::sync::Arc;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// ICE servers used by every peer session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_owned(),
                "stun:global.stun.twilio.com:3478".to_owned(),
            ],
        }
    }
}

impl SessionConfig {
    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// The local participant's media tracks, one slot per kind.
#[derive(Default, Clone)]
pub struct LocalMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an Opus audio track.
    pub fn with_audio(mut self, stream_id: &str) -> Self {
        self.audio = Some(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.to_owned(),
        )));
        self
    }

    /// Adds a VP8 video track.
    pub fn with_video(mut self, stream_id: &str) -> Self {
        self.video = Some(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.to_owned(),
        )));
        self
    }

    pub fn audio(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio.clone()
    }

    pub fn video(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }

    /// Every attached track as the trait object peer connections take.
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>);
        }
        if let Some(video) = &self.video {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }
}
