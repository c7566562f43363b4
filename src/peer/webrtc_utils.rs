use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::config::IceConfig;
use crate::error::Result;

fn feedback(typ: &str, parameter: &str) -> RTCPFeedback {
    RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    }
}

/// Builds the WebRTC API with the codecs the capture pipeline produces:
/// VP8 video and Opus audio.
pub fn create_webrtc_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();

    // Keyframe recovery depends on PLI/FIR feedback
    let video_rtcp_feedback = vec![
        feedback("goog-remb", ""),
        feedback("ccm", "fir"),
        feedback("nack", ""),
        feedback("nack", "pli"),
    ];

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: video_rtcp_feedback,
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    Ok(Arc::new(api))
}

pub fn get_ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut ice_servers = Vec::new();

    if !config.stun_servers.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }

    for turn_server in &config.turn_servers {
        ice_servers.push(RTCIceServer {
            urls: turn_server.urls.clone(),
            username: turn_server.username.clone(),
            credential: turn_server.credential.clone(),
            credential_type: RTCIceCredentialType::Password,
        });
    }

    ice_servers
}

pub fn rtc_configuration(config: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_stun_servers_share_one_entry() {
        let config = IceConfig {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![],
        };

        let servers = get_ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 2);
    }

    #[test]
    fn test_turn_server_carries_credentials() {
        let config = IceConfig {
            stun_servers: vec![],
            turn_servers: vec![TurnServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: "user".to_string(),
                credential: "secret".to_string(),
            }],
        };

        let servers = get_ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential_type, RTCIceCredentialType::Password);
    }

    #[test]
    fn test_api_builds() {
        assert!(create_webrtc_api().is_ok());
    }
}
