//! Endpoint client against a mock Redfish service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use redfish_subscriber::client::{ClientError, RedfishSessionFactory, SessionFactory};
use redfish_subscriber::subscription::{DesiredSubscription, Endpoint};

const SESSIONS: &str = "/redfish/v1/SessionService/Sessions";
const SUBSCRIPTIONS: &str = "/redfish/v1/EventService/Subscriptions";

#[derive(Default)]
struct MockBmcState {
    subscriptions: HashMap<String, serde_json::Value>,
    next_id: usize,
    reject_logins: bool,
}

/// A minimal Redfish event service: session login plus the subscription
/// collection.
#[derive(Clone, Default)]
struct MockBmc {
    state: Arc<Mutex<MockBmcState>>,
}

impl MockBmc {
    async fn start(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock BMC");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let io = TokioIo::new(stream);
                let bmc = self.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let bmc = bmc.clone();
                        async move { bmc.handle(req).await }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
        addr
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = req
            .into_body()
            .collect()
            .await
            .map(|c| c.to_bytes())
            .unwrap_or_default();

        match (method, path.as_str()) {
            (Method::POST, SESSIONS) => {
                if self.state.lock().unwrap().reject_logins {
                    return Response::builder()
                        .status(StatusCode::UNAUTHORIZED)
                        .body(Full::new(Bytes::new()));
                }
                let login: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
                assert_eq!(login["UserName"], "root");
                Response::builder()
                    .status(StatusCode::CREATED)
                    .header("X-Auth-Token", "token-123")
                    .header("Location", format!("{SESSIONS}/1"))
                    .body(Full::new(Bytes::from("{}")))
            }
            (Method::GET, SUBSCRIPTIONS) => {
                let state = self.state.lock().unwrap();
                let members: Vec<serde_json::Value> = state
                    .subscriptions
                    .keys()
                    .map(|handle| serde_json::json!({ "@odata.id": handle }))
                    .collect();
                let collection = serde_json::json!({ "Members": members });
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::from(collection.to_string())))
            }
            (Method::POST, SUBSCRIPTIONS) => {
                let mut state = self.state.lock().unwrap();
                state.next_id += 1;
                let handle = format!("{SUBSCRIPTIONS}/{}", state.next_id);
                let mut resource: serde_json::Value =
                    serde_json::from_slice(&body).unwrap_or_default();
                resource["@odata.id"] = serde_json::Value::String(handle.clone());
                state.subscriptions.insert(handle.clone(), resource);
                Response::builder()
                    .status(StatusCode::CREATED)
                    .header("Location", &handle)
                    .body(Full::new(Bytes::new()))
            }
            (Method::GET, member) if member.starts_with(SUBSCRIPTIONS) => {
                let state = self.state.lock().unwrap();
                match state.subscriptions.get(member) {
                    Some(resource) => Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::from(resource.to_string()))),
                    None => Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::new())),
                }
            }
            (Method::DELETE, member) if member.starts_with(SUBSCRIPTIONS) => {
                let removed = self.state.lock().unwrap().subscriptions.remove(member);
                let status = if removed.is_some() {
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FOUND
                };
                Response::builder().status(status).body(Full::new(Bytes::new()))
            }
            (Method::DELETE, session) if session.starts_with(SESSIONS) => {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::new()))
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::new())),
        }
    }
}

fn endpoint_for(addr: SocketAddr) -> Endpoint {
    Endpoint {
        host: addr.to_string(),
        username: "root".to_string(),
        password: "initial0".to_string(),
    }
}

fn factory() -> RedfishSessionFactory {
    RedfishSessionFactory::insecure(Duration::from_secs(5), 0)
}

#[tokio::test]
async fn test_session_lifecycle_and_subscription_ops() {
    let bmc = MockBmc::default();
    let state = bmc.state.clone();
    let addr = bmc.start().await;

    let mut session = factory()
        .open(&endpoint_for(addr))
        .await
        .expect("session login failed");

    assert!(session.list_subscriptions().await.unwrap().is_empty());

    let desired = DesiredSubscription {
        destination: "10.0.0.1:9127/redfish".to_string(),
        context: "dftfsub_all".to_string(),
        registry_prefixes: vec!["CrayTelemetry".to_string()],
        protocol: "Redfish".to_string(),
        ..Default::default()
    };
    let created = session.create_subscription(&desired).await.unwrap();
    assert_eq!(created.context, "dftfsub_all");
    assert!(created.handle.starts_with(SUBSCRIPTIONS));

    let live = session.list_subscriptions().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].destination, "10.0.0.1:9127/redfish");
    assert_eq!(live[0].registry_prefixes, vec!["CrayTelemetry"]);

    session.delete_subscription(&created.handle).await.unwrap();
    assert!(session.list_subscriptions().await.unwrap().is_empty());

    session.close().await;
    assert!(state.lock().unwrap().subscriptions.is_empty());
}

#[tokio::test]
async fn test_rejected_credentials_classify_as_auth() {
    let bmc = MockBmc::default();
    bmc.state.lock().unwrap().reject_logins = true;
    let addr = bmc.start().await;

    let err = match factory().open(&endpoint_for(addr)).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(matches!(err, ClientError::Auth { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_unreachable_endpoint_classifies_as_unreachable() {
    // Nothing listens on this port.
    let endpoint = Endpoint {
        host: "127.0.0.1:1".to_string(),
        username: "root".to_string(),
        password: "initial0".to_string(),
    };
    let err = match factory().open(&endpoint).await {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(matches!(err, ClientError::Unreachable { .. }), "got {err:?}");
}
