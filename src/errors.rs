use std::fmt;

use thiserror::Error;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Primitive call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateConnection,
    AddTrack,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    Close,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Step::CreateConnection => "create connection",
            Step::AddTrack => "add track",
            Step::CreateOffer => "create offer",
            Step::CreateAnswer => "create answer",
            Step::SetLocalDescription => "set local description",
            Step::SetRemoteDescription => "set remote description",
            Step::AddIceCandidate => "add ICE candidate",
            Step::Close => "close",
        };
        f.write_str(step)
    }
}

/// Half of the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub(crate) fn accepts(&self, sdp_type: RTCSdpType) -> bool {
        match self {
            SdpKind::Offer => sdp_type == RTCSdpType::Offer,
            SdpKind::Answer => matches!(sdp_type, RTCSdpType::Answer | RTCSdpType::Pranswer),
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to {step}: {source}")]
    Primitive {
        step: Step,
        #[source]
        source: webrtc::Error,
    },
    #[error("No {0} description supplied")]
    MissingDescription(SdpKind),
    #[error("Expected {expected} description, got {got}")]
    UnexpectedSdpType { expected: SdpKind, got: RTCSdpType },
    #[error("Neither audio nor video requested")]
    NoMediaRequested,
    #[error("Failed to capture local media: {0}")]
    Capture(String),
    #[error("Unexpected ice server: {0}")]
    IceServer(String),
    #[error("Peer connection closed")]
    Closed,
    #[error("Bad signal: {0}")]
    Signal(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`], for callers deciding whether to
/// retry, renegotiate or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    MalformedDescription,
    InvalidState,
    Closed,
    Media,
    Other,
}

impl Error {
    pub(crate) fn primitive(step: Step) -> impl FnOnce(webrtc::Error) -> Error {
        move |source| Error::Primitive { step, source }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::MissingDescription(_) | Error::UnexpectedSdpType { .. } | Error::Signal(_) => {
                FailureKind::MalformedDescription
            }
            Error::NoMediaRequested | Error::Capture(_) => FailureKind::Media,
            Error::Closed => FailureKind::Closed,
            Error::IceServer(_) => FailureKind::Other,
            Error::Primitive { source, .. } => match source {
                webrtc::Error::ErrConnectionClosed => FailureKind::Closed,
                webrtc::Error::ErrIncorrectSignalingState
                | webrtc::Error::ErrNoRemoteDescription => FailureKind::InvalidState,
                webrtc::Error::ErrSessionDescriptionNoFingerprint
                | webrtc::Error::ErrSessionDescriptionMissingIceUfrag
                | webrtc::Error::ErrSessionDescriptionMissingIcePwd
                | webrtc::Error::Sdp(_) => FailureKind::MalformedDescription,
                _ => FailureKind::Other,
            },
        }
    }
}
