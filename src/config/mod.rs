use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::identity::{Identity, ParticipantId, Role, SignalingEndpoint};
use crate::media::MediaConstraints;
use crate::signaling::ReconnectPolicy;

const DEFAULT_SIGNALING_BASE: &str = "ws://localhost:8080/api/ws/chat";
const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

pub struct Config {
    pub identity: IdentityConfig,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub reconnect: ReconnectPolicy,
    pub media: MediaConfig,
    pub status: StatusConfig,
    pub session: SessionConfig,
}

pub struct IdentityConfig {
    pub role: Role,
    pub participant_id: Option<ParticipantId>,
    pub auth_token: Option<String>,
    pub backend_url: String,
    pub login_path: String,
    pub email: Option<String>,
    pub password: Option<String>,
}

pub struct SignalingConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSource {
    Gstreamer,
    Synthetic,
}

impl FromStr for MediaSource {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gstreamer" | "gst" => Ok(MediaSource::Gstreamer),
            "synthetic" | "none" => Ok(MediaSource::Synthetic),
            other => Err(SessionError::configuration(format!(
                "Unknown MEDIA_SOURCE '{}'",
                other
            ))),
        }
    }
}

pub struct MediaConfig {
    pub source: MediaSource,
    pub video: bool,
    pub audio: bool,
    /// Device labels; unset means the system default.
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
}

impl MediaConfig {
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints::new(self.video, self.audio)
            .with_devices(self.video_device.clone(), self.audio_device.clone())
    }
}

pub struct StatusConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

pub struct SessionConfig {
    pub max_peer_restarts: u32,
}

impl Config {
    /// Loads `.env` and reads the role from `SESSION_ROLE`.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Like `from_env`, with the role chosen by the caller.
    pub fn for_role(role: Role) -> Result<Self> {
        Self::load(Some(role))
    }

    fn load(role: Option<Role>) -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok(), role)
    }

    /// Builds the configuration from an arbitrary key lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F, role: Option<Role>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let role = match role {
            Some(role) => role,
            None => get("SESSION_ROLE")
                .ok_or_else(|| SessionError::configuration("SESSION_ROLE is not set"))?
                .parse()?,
        };

        let identity = IdentityConfig {
            role,
            participant_id: parse_opt(&get, "PARTICIPANT_ID")?,
            auth_token: get("AUTH_TOKEN"),
            backend_url: get("BACKEND_URL").unwrap_or_else(|| "http://localhost:8080".to_string()),
            login_path: get("LOGIN_PATH").unwrap_or_else(|| "api/auth/login".to_string()),
            email: get("LOGIN_EMAIL"),
            password: get("LOGIN_PASSWORD"),
        };

        let signaling = SignalingConfig {
            url: get("SIGNALING_URL")
                .unwrap_or_else(|| format!("{}/{}", DEFAULT_SIGNALING_BASE, role.socket_path())),
        };

        let stun_servers = match get("STUN_SERVER_URLS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_STUN_SERVERS.iter().map(|url| url.to_string()).collect(),
        };

        let mut turn_servers = vec![];

        // TURN is only used when all three values are present
        if let (Some(url), Some(username), Some(credential)) = (
            get("TURN_SERVER_URL"),
            get("TURN_USERNAME"),
            get("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![url],
                username,
                credential,
            });
        }

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            initial_delay: parse_opt(&get, "RECONNECT_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: parse_opt(&get, "RECONNECT_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            multiplier: parse_opt(&get, "RECONNECT_MULTIPLIER")?.unwrap_or(defaults.multiplier),
            jitter: parse_opt(&get, "RECONNECT_JITTER")?.unwrap_or(defaults.jitter),
            max_attempts: match get("RECONNECT_MAX_ATTEMPTS") {
                None => defaults.max_attempts,
                Some(v) if v.eq_ignore_ascii_case("unlimited") => None,
                Some(v) => match parse_value::<u32>("RECONNECT_MAX_ATTEMPTS", &v)? {
                    0 => None,
                    n => Some(n),
                },
            },
        };
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(SessionError::configuration(
                "RECONNECT_JITTER must be between 0 and 1",
            ));
        }

        // The proctor shows camera and microphone; candidates only stream video
        let media = MediaConfig {
            source: parse_opt(&get, "MEDIA_SOURCE")?.unwrap_or(MediaSource::Gstreamer),
            video: parse_flag(&get, "MEDIA_VIDEO")?.unwrap_or(true),
            audio: parse_flag(&get, "MEDIA_AUDIO")?.unwrap_or(role == Role::Proctor),
            video_device: get("MEDIA_VIDEO_DEVICE"),
            audio_device: get("MEDIA_AUDIO_DEVICE"),
        };

        let status = StatusConfig {
            enabled: parse_flag(&get, "STATUS_ENABLED")?.unwrap_or(false),
            host: get("STATUS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_opt(&get, "STATUS_PORT")?.unwrap_or(9090),
        };

        let session = SessionConfig {
            max_peer_restarts: parse_opt(&get, "MAX_PEER_RESTARTS")?.unwrap_or(2),
        };

        Ok(Self {
            identity,
            signaling,
            ice: IceConfig {
                stun_servers,
                turn_servers,
            },
            reconnect,
            media,
            status,
            session,
        })
    }

    /// The identity to connect with, if a token and id are configured.
    pub fn static_identity(&self) -> Option<Identity> {
        match (&self.identity.auth_token, self.identity.participant_id) {
            (Some(token), Some(participant_id)) => Some(Identity {
                participant_id,
                role: self.identity.role,
                token: token.clone(),
            }),
            _ => None,
        }
    }

    pub fn endpoint(&self, identity: &Identity) -> SignalingEndpoint {
        SignalingEndpoint::new(
            self.signaling.url.clone(),
            identity.role,
            identity.participant_id,
            identity.token.clone(),
        )
    }
}

impl StatusConfig {
    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.host,
                        "IPv6 status host not supported, binding loopback"
                    );
                    return Ipv4Addr::LOCALHOST;
                }
            }
        }

        match self.host.as_str() {
            "localhost" | "" => Ipv4Addr::LOCALHOST,
            "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.host,
                    "Unable to parse status host as IPv4, binding loopback"
                );
                Ipv4Addr::LOCALHOST
            }
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| SessionError::configuration(format!("Invalid {}: '{}'", key, raw)))
}

fn parse_opt<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key).map(|raw| parse_value(key, &raw)).transpose()
}

fn parse_flag<G>(get: &G, key: &str) -> Result<Option<bool>>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(SessionError::configuration(format!(
                "Invalid {}: '{}'",
                key, raw
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)], role: Option<Role>) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned(), role)
    }

    fn status(host: &str, port: u16) -> StatusConfig {
        StatusConfig {
            enabled: true,
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_role_defaults() {
        let config = config_from(&[], Some(Role::Candidate)).unwrap();
        assert_eq!(
            config.signaling.url,
            "ws://localhost:8080/api/ws/chat/member"
        );
        assert!(config.media.video);
        assert!(!config.media.audio);
        assert_eq!(config.ice.stun_servers.len(), 2);
        assert!(config.ice.turn_servers.is_empty());
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.session.max_peer_restarts, 2);

        let config = config_from(&[("SESSION_ROLE", "proctor")], None).unwrap();
        assert_eq!(config.identity.role, Role::Proctor);
        assert!(config.media.audio);
        assert!(config.signaling.url.ends_with("/proctor"));
    }

    #[test]
    fn test_device_selection_flows_into_constraints() {
        let config = config_from(&[], Some(Role::Proctor)).unwrap();
        let constraints = config.media.constraints();
        assert!(constraints.video && constraints.audio);
        assert_eq!(constraints.video_device, None);
        assert_eq!(constraints.audio_device, None);

        let config = config_from(
            &[
                ("MEDIA_VIDEO_DEVICE", "USB Camera"),
                ("MEDIA_AUDIO_DEVICE", "  "),
            ],
            Some(Role::Candidate),
        )
        .unwrap();
        let constraints = config.media.constraints();
        assert_eq!(constraints.video_device.as_deref(), Some("USB Camera"));
        assert_eq!(constraints.audio_device, None);
        assert!(!constraints.audio);
    }

    #[test]
    fn test_missing_role_is_configuration_error() {
        let result = config_from(&[], None);
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[test]
    fn test_explicit_role_beats_environment() {
        let config = config_from(&[("SESSION_ROLE", "proctor")], Some(Role::Candidate)).unwrap();
        assert_eq!(config.identity.role, Role::Candidate);
    }

    #[test]
    fn test_reconnect_overrides() {
        let config = config_from(
            &[
                ("RECONNECT_INITIAL_MS", "250"),
                ("RECONNECT_MAX_MS", "1000"),
                ("RECONNECT_MULTIPLIER", "1.5"),
                ("RECONNECT_JITTER", "0"),
                ("RECONNECT_MAX_ATTEMPTS", "unlimited"),
            ],
            Some(Role::Proctor),
        )
        .unwrap();

        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnect.multiplier, 1.5);
        assert_eq!(config.reconnect.max_attempts, None);

        let config = config_from(&[("RECONNECT_MAX_ATTEMPTS", "0")], Some(Role::Proctor)).unwrap();
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        for pairs in [
            [("PARTICIPANT_ID", "abc")],
            [("STATUS_PORT", "99999")],
            [("MEDIA_VIDEO", "maybe")],
            [("MEDIA_SOURCE", "webcam")],
            [("RECONNECT_JITTER", "2.5")],
        ] {
            let result = config_from(&pairs, Some(Role::Candidate));
            assert!(
                matches!(result, Err(SessionError::Configuration(_))),
                "{:?} should be rejected",
                pairs
            );
        }
    }

    #[test]
    fn test_turn_requires_all_values() {
        let partial = config_from(
            &[("TURN_SERVER_URL", "turn:turn.example.com:3478")],
            Some(Role::Proctor),
        )
        .unwrap();
        assert!(partial.ice.turn_servers.is_empty());

        let full = config_from(
            &[
                ("STUN_SERVER_URLS", "stun:a:3478, stun:b:3478,"),
                ("TURN_SERVER_URL", "turn:turn.example.com:3478"),
                ("TURN_USERNAME", "user"),
                ("TURN_CREDENTIAL", "secret"),
            ],
            Some(Role::Proctor),
        )
        .unwrap();
        assert_eq!(full.ice.stun_servers, vec!["stun:a:3478", "stun:b:3478"]);
        assert_eq!(full.ice.turn_servers.len(), 1);
    }

    #[test]
    fn test_static_identity_needs_token_and_id() {
        let config = config_from(&[("AUTH_TOKEN", "tok")], Some(Role::Candidate)).unwrap();
        assert!(config.static_identity().is_none());

        let config = config_from(
            &[("AUTH_TOKEN", "tok"), ("PARTICIPANT_ID", "12")],
            Some(Role::Candidate),
        )
        .unwrap();
        let identity = config.static_identity().unwrap();
        assert_eq!(identity.participant_id, 12);
        assert_eq!(
            config.endpoint(&identity).connection_url(),
            "ws://localhost:8080/api/ws/chat/member?token=tok"
        );
    }

    #[test]
    fn test_parse_localhost() {
        assert_eq!(status("localhost", 9090).bind_address(), ([127, 0, 0, 1], 9090));
    }

    #[test]
    fn test_parse_ipv4_address() {
        assert_eq!(status("192.168.1.1", 3000).bind_address(), ([192, 168, 1, 1], 3000));
    }

    #[test]
    fn test_parse_all_interfaces() {
        assert_eq!(status("0.0.0.0", 8080).bind_address(), ([0, 0, 0, 0], 8080));
    }

    #[test]
    fn test_parse_invalid_hostname_defaults_to_loopback() {
        assert_eq!(status("invalid-hostname", 9000).bind_address(), ([127, 0, 0, 1], 9000));
    }
}
