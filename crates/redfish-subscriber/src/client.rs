//! Authenticated Redfish sessions against one managed endpoint.
//!
//! Each reconcile attempt opens its own session, uses it for the duration of
//! the attempt, and closes it on every exit path. Sessions are never shared
//! across tasks. The trait seam exists so the reconciler can be exercised
//! against an in-memory endpoint in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::subscription::{DesiredSubscription, Endpoint, LiveSubscription};

const API_ROOT: &str = "/redfish/v1";
const SESSIONS_PATH: &str = "/redfish/v1/SessionService/Sessions";
const SUBSCRIPTIONS_PATH: &str = "/redfish/v1/EventService/Subscriptions";
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("endpoint {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("endpoint {host} rejected credentials")]
    Auth { host: String },

    #[error("unexpected status {status} from {host} on {path}")]
    Protocol {
        host: String,
        path: String,
        status: u16,
    },

    #[error("malformed resource from {host}: {reason}")]
    Malformed { host: String, reason: String },
}

/// Opens sessions against managed endpoints.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn SubscriptionSession>, ClientError>;
}

/// One authenticated session; owns list/create/delete for its lifetime.
#[async_trait]
pub trait SubscriptionSession: Send {
    async fn list_subscriptions(&mut self) -> Result<Vec<LiveSubscription>, ClientError>;

    async fn create_subscription(
        &mut self,
        desired: &DesiredSubscription,
    ) -> Result<LiveSubscription, ClientError>;

    async fn delete_subscription(&mut self, handle: &str) -> Result<(), ClientError>;

    /// Best effort; errors are ignored.
    async fn close(self: Box<Self>);
}

/// Production factory: TLS sessions with a per-attempt timeout and a bounded
/// retry budget for connection failures. BMCs ship self-signed certificates,
/// so peer verification is disabled; the trust boundary is the management
/// network.
pub struct RedfishSessionFactory {
    timeout: Duration,
    retries: u32,
    scheme: &'static str,
}

impl RedfishSessionFactory {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries,
            scheme: "https",
        }
    }

    /// Plain-HTTP sessions, for lab simulators and tests.
    pub fn insecure(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries,
            scheme: "http",
        }
    }

    fn build_http_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()
    }
}

#[async_trait]
impl SessionFactory for RedfishSessionFactory {
    async fn open(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn SubscriptionSession>, ClientError> {
        let http = self
            .build_http_client()
            .map_err(|e| ClientError::Unreachable {
                host: endpoint.host.clone(),
                reason: e.to_string(),
            })?;
        let base = format!("{}://{}", self.scheme, endpoint.host);

        let mut last_reason = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
                trace!(host = %endpoint.host, attempt, "retrying session login");
            }

            let login = http
                .post(format!("{base}{SESSIONS_PATH}"))
                .json(&json!({
                    "UserName": endpoint.username,
                    "Password": endpoint.password,
                }))
                .send()
                .await;

            let response = match login {
                Ok(r) => r,
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                // Credential rejection will not improve with retries.
                return Err(ClientError::Auth {
                    host: endpoint.host.clone(),
                });
            }
            if !status.is_success() {
                last_reason = format!("session login returned {status}");
                continue;
            }

            let token = header_string(&response, "x-auth-token");
            let session_uri = header_string(&response, "location");
            let Some(token) = token else {
                last_reason = "session login response carried no X-Auth-Token".to_string();
                continue;
            };

            debug!(host = %endpoint.host, "redfish session established");
            return Ok(Box::new(RedfishSession {
                http,
                base,
                host: endpoint.host.clone(),
                token,
                session_uri,
            }));
        }

        Err(ClientError::Unreachable {
            host: endpoint.host.clone(),
            reason: last_reason,
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

struct RedfishSession {
    http: reqwest::Client,
    base: String,
    host: String,
    token: String,
    session_uri: Option<String>,
}

/// Wire shape of one subscription resource. Unknown fields are ignored;
/// absent list fields deserialize as empty, which `full_match` treats as
/// equivalent.
#[derive(Debug, Default, Deserialize)]
struct SubscriptionResource {
    #[serde(rename = "@odata.id")]
    odata_id: Option<String>,
    #[serde(rename = "Id")]
    id: Option<String>,
    #[serde(rename = "Destination", default)]
    destination: String,
    #[serde(rename = "Context", default)]
    context: String,
    #[serde(rename = "RegistryPrefixes", default)]
    registry_prefixes: Vec<String>,
    #[serde(rename = "ExcludeRegistryPrefixes", default)]
    exclude_registry_prefixes: Vec<String>,
    #[serde(rename = "MessageIds", default)]
    message_ids: Vec<String>,
    #[serde(rename = "ExcludeMessageIds", default)]
    exclude_message_ids: Vec<String>,
    #[serde(rename = "Protocol", default)]
    protocol: String,
}

impl SubscriptionResource {
    fn into_live(self, host: &str) -> Result<LiveSubscription, ClientError> {
        let handle = match (self.odata_id, self.id) {
            (Some(odata_id), _) => odata_id,
            (None, Some(id)) => format!("{SUBSCRIPTIONS_PATH}/{id}"),
            (None, None) => {
                return Err(ClientError::Malformed {
                    host: host.to_string(),
                    reason: "subscription resource without @odata.id or Id".to_string(),
                })
            }
        };
        Ok(LiveSubscription {
            handle,
            destination: self.destination,
            context: self.context,
            registry_prefixes: self.registry_prefixes,
            exclude_registry_prefixes: self.exclude_registry_prefixes,
            message_ids: self.message_ids,
            exclude_message_ids: self.exclude_message_ids,
            protocol: self.protocol,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionCollection {
    #[serde(rename = "Members", default)]
    members: Vec<MemberRef>,
}

#[derive(Debug, Deserialize)]
struct MemberRef {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionBody<'a> {
    #[serde(rename = "Destination")]
    destination: &'a str,
    #[serde(rename = "Context")]
    context: &'a str,
    #[serde(rename = "Protocol")]
    protocol: &'a str,
    #[serde(rename = "RegistryPrefixes", skip_serializing_if = "<[_]>::is_empty")]
    registry_prefixes: &'a [String],
    #[serde(
        rename = "ExcludeRegistryPrefixes",
        skip_serializing_if = "<[_]>::is_empty"
    )]
    exclude_registry_prefixes: &'a [String],
    #[serde(rename = "MessageIds", skip_serializing_if = "<[_]>::is_empty")]
    message_ids: &'a [String],
    #[serde(rename = "ExcludeMessageIds", skip_serializing_if = "<[_]>::is_empty")]
    exclude_message_ids: &'a [String],
}

impl RedfishSession {
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base, path)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ClientError> {
        let response = self
            .http
            .get(self.url(path))
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Protocol {
                host: self.host.clone(),
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(|e| ClientError::Malformed {
            host: self.host.clone(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl SubscriptionSession for RedfishSession {
    async fn list_subscriptions(&mut self) -> Result<Vec<LiveSubscription>, ClientError> {
        let collection: SubscriptionCollection = self.get_json(SUBSCRIPTIONS_PATH).await?;
        let mut live = Vec::with_capacity(collection.members.len());
        for member in collection.members {
            // One unreadable member does not invalidate the rest of the
            // collection.
            match self.get_json::<SubscriptionResource>(&member.odata_id).await {
                Ok(resource) => live.push(resource.into_live(&self.host)?),
                Err(e) => warn!(host = %self.host, member = %member.odata_id, error = %e,
                    "skipping unreadable subscription"),
            }
        }
        Ok(live)
    }

    async fn create_subscription(
        &mut self,
        desired: &DesiredSubscription,
    ) -> Result<LiveSubscription, ClientError> {
        let body = CreateSubscriptionBody {
            destination: &desired.destination,
            context: &desired.context,
            protocol: &desired.protocol,
            registry_prefixes: &desired.registry_prefixes,
            exclude_registry_prefixes: &desired.exclude_registry_prefixes,
            message_ids: &desired.message_ids,
            exclude_message_ids: &desired.exclude_message_ids,
        };
        let response = self
            .http
            .post(self.url(SUBSCRIPTIONS_PATH))
            .header("X-Auth-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Protocol {
                host: self.host.clone(),
                path: SUBSCRIPTIONS_PATH.to_string(),
                status: status.as_u16(),
            });
        }

        // The created resource's handle comes back in Location. Some
        // implementations return the resource body instead; fall back to it.
        if let Some(location) = header_string(&response, "location") {
            let handle = match location.strip_prefix(&self.base) {
                Some(stripped) => stripped.to_string(),
                None => location,
            };
            return Ok(LiveSubscription {
                handle,
                destination: desired.destination.clone(),
                context: desired.context.clone(),
                registry_prefixes: desired.registry_prefixes.clone(),
                exclude_registry_prefixes: desired.exclude_registry_prefixes.clone(),
                message_ids: desired.message_ids.clone(),
                exclude_message_ids: desired.exclude_message_ids.clone(),
                protocol: desired.protocol.clone(),
            });
        }

        let resource: SubscriptionResource =
            response.json().await.map_err(|e| ClientError::Malformed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        resource.into_live(&self.host)
    }

    async fn delete_subscription(&mut self, handle: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(handle))
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .map_err(|e| ClientError::Unreachable {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Protocol {
                host: self.host.clone(),
                path: handle.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        let Some(session_uri) = self.session_uri.clone() else {
            return;
        };
        let result = self
            .http
            .delete(self.url(&session_uri))
            .header("X-Auth-Token", &self.token)
            .send()
            .await;
        if let Err(e) = result {
            trace!(host = %self.host, error = %e, "session logout failed");
        }
    }
}

/// Opaque pass-through of extra subscription properties from configuration
/// onto the create body, keyed by their Redfish property names.
pub fn desired_from_properties(
    destination: String,
    context: String,
    properties: &HashMap<String, Vec<String>>,
) -> DesiredSubscription {
    let field = |name: &str| properties.get(name).cloned().unwrap_or_default();
    DesiredSubscription {
        destination,
        context,
        registry_prefixes: field("RegistryPrefixes"),
        exclude_registry_prefixes: field("ExcludeRegistryPrefixes"),
        message_ids: field("MessageIds"),
        exclude_message_ids: field("ExcludeMessageIds"),
        protocol: "Redfish".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_resource_into_live() {
        let raw = serde_json::json!({
            "@odata.id": "/redfish/v1/EventService/Subscriptions/7",
            "Destination": "10.0.0.1:9127/redfish",
            "Context": "dftfsub_all",
            "RegistryPrefixes": ["CrayTelemetry"],
            "Protocol": "Redfish",
            "DeliveryRetryPolicy": "TerminateAfterRetries"
        });
        let resource: SubscriptionResource = serde_json::from_value(raw).unwrap();
        let live = resource.into_live("bmc1").unwrap();
        assert_eq!(live.handle, "/redfish/v1/EventService/Subscriptions/7");
        assert_eq!(live.context, "dftfsub_all");
        assert_eq!(live.registry_prefixes, vec!["CrayTelemetry"]);
        assert!(live.message_ids.is_empty());
    }

    #[test]
    fn test_subscription_resource_handle_from_id() {
        let raw = serde_json::json!({ "Id": "3", "Context": "c" });
        let resource: SubscriptionResource = serde_json::from_value(raw).unwrap();
        let live = resource.into_live("bmc1").unwrap();
        assert_eq!(live.handle, "/redfish/v1/EventService/Subscriptions/3");
    }

    #[test]
    fn test_subscription_resource_without_handle() {
        let raw = serde_json::json!({ "Context": "c" });
        let resource: SubscriptionResource = serde_json::from_value(raw).unwrap();
        assert!(resource.into_live("bmc1").is_err());
    }

    #[test]
    fn test_create_body_omits_empty_lists() {
        let desired = DesiredSubscription {
            destination: "d".to_string(),
            context: "c".to_string(),
            protocol: "Redfish".to_string(),
            ..Default::default()
        };
        let body = CreateSubscriptionBody {
            destination: &desired.destination,
            context: &desired.context,
            protocol: &desired.protocol,
            registry_prefixes: &desired.registry_prefixes,
            exclude_registry_prefixes: &desired.exclude_registry_prefixes,
            message_ids: &desired.message_ids,
            exclude_message_ids: &desired.exclude_message_ids,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "Destination": "d",
                "Context": "c",
                "Protocol": "Redfish",
            })
        );
    }

    #[test]
    fn test_desired_from_properties() {
        let mut properties = HashMap::new();
        properties.insert(
            "RegistryPrefixes".to_string(),
            vec!["CrayTelemetry".to_string()],
        );
        let desired = desired_from_properties(
            "10.0.0.1:9127/redfish".to_string(),
            "dftfsub_telemetry".to_string(),
            &properties,
        );
        assert_eq!(desired.protocol, "Redfish");
        assert_eq!(desired.registry_prefixes, vec!["CrayTelemetry"]);
        assert!(desired.exclude_registry_prefixes.is_empty());
    }

    #[test]
    fn test_api_root_constant() {
        assert!(SESSIONS_PATH.starts_with(API_ROOT));
        assert!(SUBSCRIPTIONS_PATH.starts_with(API_ROOT));
    }
}
