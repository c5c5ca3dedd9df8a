use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::errors::Result;

/// What one side has to hand the other over whatever channel the application
/// uses for signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Signal {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
}

impl Signal {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Signal> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn into_description(self) -> Option<RTCSessionDescription> {
        match self {
            Signal::Offer(desc) | Signal::Answer(desc) => Some(desc),
            Signal::Candidate(_) => None,
        }
    }
}
