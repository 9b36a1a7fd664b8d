use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_connected: bool,
    pub host: String,
    pub port: u16,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub desktop_name: Option<String>,
    pub error: Option<String>,
    pub client_count: usize,
    pub current_controller: Option<String>,
    pub max_connections: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterKeyRequest {
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyRegistration {
    pub api_key: String,
    /// False when the key was already registered.
    pub created: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyRevocation {
    pub api_key: String,
    pub sessions_closed: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub client_id: String,
    pub connected: bool,
    pub has_control: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

/// A control grant for a client that has not connected yet.
#[derive(Clone, Debug, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionEntry {
    pub client_id: String,
    pub has_control: bool,
}
