use webrtc::{
    ice_transport::ice_server::RTCIceServer, peer_connection::configuration::RTCConfiguration,
};

use crate::errors::{Error, Result};

/// Parses `url` or `url|username|credential`.
pub fn parse_ice_server(input: &str) -> Result<RTCIceServer> {
    let splited: Vec<_> = input.split('|').collect();
    match splited.as_slice() {
        [url] if !url.is_empty() => Ok(RTCIceServer {
            urls: vec![url.to_string()],
            ..Default::default()
        }),
        [url, username, credential] if !url.is_empty() => Ok(RTCIceServer {
            urls: vec![url.to_string()],
            username: username.to_string(),
            credential: credential.to_string(),
            ..Default::default()
        }),
        _ => Err(Error::IceServer(input.to_string())),
    }
}

pub fn rtc_configuration(ice_servers: Vec<RTCIceServer>) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}
