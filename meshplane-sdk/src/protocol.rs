//! Wire-level DTOs shared by the host (`meshplane-core`) and the plugin client shim.
//!
//! The concrete RPC codec is out of scope for this workspace (see spec §1); these types
//! are what a binary-framed, typed request/response transport with server-stream support
//! would carry. On the host's HTTP surface they are serialized as JSON request/response
//! bodies, and `WatchEvent` is additionally streamed as Server-Sent Events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request body for `Handshake(req)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    #[serde(default)]
    pub requested_plugins: Vec<String>,
    pub self_id: Option<String>,
    pub self_version: Option<String>,
    #[serde(default)]
    pub client_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    pub available_plugins: Vec<String>,
    #[serde(default)]
    pub host_capabilities: Vec<String>,
    pub runtime_id: Option<String>,
    pub runtime_token: Option<String>,
}

/// One provided service, as declared by `GetPluginInfo` or a registration call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvidesEntry {
    pub service_type: String,
    pub version: String,
    /// Provider-local routing prefix, always `/...`. Only meaningful on `GetPluginInfo`
    /// responses for managed admission; self-registering plugins supply it directly to
    /// `RegisterService` instead.
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,
}

fn default_endpoint_path() -> String {
    "/".to_string()
}

/// One required service, as declared by `GetPluginInfo`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequiresEntry {
    pub service_type: String,
    pub min_version: String,
    pub required_for_startup: bool,
    pub watch_for_changes: bool,
}

/// Response body for the managed-admission `GetPluginInfo` call (host→plugin).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub self_id: String,
    pub self_version: String,
    #[serde(default)]
    pub provides: Vec<ProvidesEntry>,
    #[serde(default)]
    pub requires: Vec<RequiresEntry>,
}

/// Request body for the managed-admission `SetRuntimeIdentity` call (host→plugin).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRuntimeIdentityRequest {
    pub runtime_id: String,
    pub runtime_token: String,
    pub host_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceRequest {
    pub service_type: String,
    pub version: String,
    pub endpoint_path: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    pub registration_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterServiceRequest {
    pub registration_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverServiceRequest {
    pub service_type: String,
    pub min_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverServiceResponse {
    pub endpoint_url: String,
    pub runtime_id: String,
    pub single_provider: bool,
}

/// Availability state carried by a `WatchService` event; not to be confused with
/// [`HealthState`], which is what a plugin reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Available,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub service_type: String,
    pub state: WatchState,
    pub endpoint: Option<String>,
}

/// Health states a plugin can self-report via `ReportHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Default for HealthState {
    fn default() -> Self {
        // Absent state is treated as Healthy (spec §3 Data Model).
        HealthState::Healthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHealthRequest {
    pub state: HealthState,
    pub reason: Option<String>,
    #[serde(default)]
    pub unavailable_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCapabilityRequest {
    pub capability_type: String,
    pub min_version: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCapabilityResponse {
    pub grant_id: String,
    pub endpoint_url: String,
    pub bearer_token: String,
    pub capability_type: String,
    pub version: String,
}

/// Request body for the host→plugin `Shutdown` control call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub grace_seconds: u64,
    pub reason: String,
}

pub const HEADER_RUNTIME_ID: &str = "X-Plugin-Runtime-ID";

/// Fixed HTTP paths the host exposes for the logical RPC services of spec §6. Shared by
/// the client shim (to call them) and the host router (to mount them).
pub mod paths {
    pub const HANDSHAKE: &str = "/rpc/handshake";
    pub const REGISTER_SERVICE: &str = "/rpc/services/register";
    pub const UNREGISTER_SERVICE: &str = "/rpc/services/unregister";
    pub const DISCOVER_SERVICE: &str = "/rpc/services/discover";
    pub const WATCH_SERVICE: &str = "/rpc/services/watch";
    pub const REPORT_HEALTH: &str = "/rpc/health";
    pub const REQUEST_CAPABILITY: &str = "/rpc/capabilities/request";

    /// Host→plugin control-link paths, called on the plugin's own HTTP server.
    pub const PLUGIN_INFO: &str = "/identity/info";
    pub const PLUGIN_SET_RUNTIME_IDENTITY: &str = "/identity/runtime";
    pub const PLUGIN_HEALTH: &str = "/control/health";
    pub const PLUGIN_SHUTDOWN: &str = "/control/shutdown";
}
