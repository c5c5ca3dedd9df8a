use tracing::debug;
use webrtc::{
    api::{
        APIBuilder, interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine,
    },
    interceptor::registry::Registry,
    peer_connection::{RTCPeerConnection, configuration::RTCConfiguration},
};

use crate::errors::{Error, Result, Step};

pub(crate) async fn create_rtc_connection(
    config: RTCConfiguration,
    include_loopback_candidates: bool,
) -> Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(Error::primitive(Step::CreateConnection))?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(Error::primitive(Step::CreateConnection))?;
    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(include_loopback_candidates);
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build();
    debug!("ice servers: {:?}", config.ice_servers);
    api.new_peer_connection(config)
        .await
        .map_err(Error::primitive(Step::CreateConnection))
}
