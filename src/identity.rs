use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Numeric participant id as carried in the `participant` envelope field.
pub type ParticipantId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Proctor,
    Candidate,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Proctor => "proctor",
            Role::Candidate => "candidate",
        }
    }

    /// Path segment the coordination server uses for this role's socket.
    pub fn socket_path(&self) -> &'static str {
        match self {
            Role::Proctor => "proctor",
            Role::Candidate => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proctor" => Ok(Role::Proctor),
            "candidate" | "member" | "student" => Ok(Role::Candidate),
            other => Err(SessionError::configuration(format!(
                "unknown session role '{}'",
                other
            ))),
        }
    }
}

/// Identity of one connected party. Immutable for the lifetime of a channel.
#[derive(Clone)]
pub struct SignalingEndpoint {
    url: String,
    role: Role,
    participant_id: ParticipantId,
    token: String,
}

impl SignalingEndpoint {
    pub fn new(
        url: impl Into<String>,
        role: Role,
        participant_id: ParticipantId,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            role,
            participant_id,
            token: token.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// The socket URL with the bearer token appended as a query parameter;
    /// the browser-facing transport cannot carry an Authorization header.
    pub fn connection_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}token={}",
            self.url,
            separator,
            urlencoding::encode(&self.token)
        )
    }
}

impl fmt::Debug for SignalingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingEndpoint")
            .field("url", &self.url)
            .field("role", &self.role)
            .field("participant_id", &self.participant_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Identity handed back by the backend login endpoint.
#[derive(Debug, Clone)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
    user: LoginUser,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    id: ParticipantId,
    #[serde(rename = "type")]
    user_type: String,
}

/// Exchanges credentials for a bearer token against the backend API.
pub async fn login(
    backend_url: &str,
    login_path: &str,
    email: &str,
    password: &str,
) -> Result<Identity> {
    let url = format!(
        "{}/{}",
        backend_url.trim_end_matches('/'),
        login_path.trim_start_matches('/')
    );
    tracing::info!(url = %url, "Requesting session token");

    let response = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "email": email, "password": password }))
        .send()
        .await?;

    let status = response.status();
    let body: LoginResponse = response.json().await?;
    if !status.is_success() || !body.success {
        let reason = if body.message.is_empty() {
            format!("login rejected with status {}", status)
        } else {
            body.message
        };
        return Err(SessionError::Authentication(reason));
    }

    identity_from_login(body)
}

fn identity_from_login(body: LoginResponse) -> Result<Identity> {
    let data = body
        .data
        .ok_or_else(|| SessionError::Authentication("login response has no data".into()))?;

    Ok(Identity {
        participant_id: data.user.id,
        role: data.user.user_type.parse()?,
        token: data.token,
    })
}
