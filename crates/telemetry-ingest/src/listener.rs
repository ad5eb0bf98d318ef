//! HTTP receiver and sticky lane dispatch.
//!
//! Endpoints push event envelopes with short-lived POSTs and stall their
//! own event queues while waiting for the response, so the listener
//! acknowledges as soon as the body is read: dispatch onto a lane is a
//! non-blocking send and response latency never depends on lane depth.
//!
//! The dispatcher task is the only writer of the `client -> lane` map.
//! New clients are assigned round-robin; the assignment is sticky for the
//! process lifetime so each client's sampling state stays inside one lane
//! and its events stay globally ordered.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::lane::LaneInput;

pub const OK_BODY: &str = "<html><body><p>OK</p></body></html>";

/// One accepted POST, as handed to a lane.
#[derive(Debug)]
pub struct IngestPayload {
    pub path: String,
    pub client_ip: IpAddr,
    pub body: Vec<u8>,
}

/// Dead-lane report for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneFailure {
    pub index: usize,
}

/// Control inputs to the dispatcher.
#[derive(Debug)]
pub enum LaneUpdate {
    /// A replacement lane is live at `index`; route new work to it.
    Replace {
        index: usize,
        tx: mpsc::Sender<LaneInput>,
    },
    /// Send the shutdown sentinel to every lane and stop dispatching.
    Shutdown,
}

pub struct Dispatcher {
    payload_rx: mpsc::UnboundedReceiver<IngestPayload>,
    update_rx: mpsc::Receiver<LaneUpdate>,
    lanes: Vec<mpsc::Sender<LaneInput>>,
    assignments: HashMap<IpAddr, usize>,
    next_lane: usize,
    supervisor_tx: mpsc::Sender<LaneFailure>,
    awaiting_restart: HashSet<usize>,
}

impl Dispatcher {
    pub fn new(
        lanes: Vec<mpsc::Sender<LaneInput>>,
        supervisor_tx: mpsc::Sender<LaneFailure>,
    ) -> (
        Self,
        mpsc::UnboundedSender<IngestPayload>,
        mpsc::Sender<LaneUpdate>,
    ) {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::channel(16);
        let dispatcher = Self {
            payload_rx,
            update_rx,
            lanes,
            assignments: HashMap::new(),
            next_lane: 0,
            supervisor_tx,
            awaiting_restart: HashSet::new(),
        };
        (dispatcher, payload_tx, update_tx)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                payload = self.payload_rx.recv() => match payload {
                    Some(payload) => self.dispatch(payload),
                    None => break,
                },
                update = self.update_rx.recv() => match update {
                    Some(LaneUpdate::Replace { index, tx }) => {
                        debug!(lane = index, "replacement lane installed");
                        self.lanes[index] = tx;
                        self.awaiting_restart.remove(&index);
                    }
                    Some(LaneUpdate::Shutdown) | None => {
                        for lane in &self.lanes {
                            let _ = lane.send(LaneInput::Shutdown).await;
                        }
                        break;
                    }
                },
            }
        }
        debug!("dispatcher stopped");
    }

    /// Sticky assignment: an address keeps its lane for the process
    /// lifetime; new addresses take the next lane round-robin.
    fn assign(&mut self, client: IpAddr) -> usize {
        if let Some(&index) = self.assignments.get(&client) {
            return index;
        }
        let index = self.next_lane % self.lanes.len();
        self.next_lane = self.next_lane.wrapping_add(1);
        self.assignments.insert(client, index);
        debug!(client = %client, lane = index, "client assigned to lane");
        index
    }

    fn dispatch(&mut self, payload: IngestPayload) {
        let index = self.assign(payload.client_ip);
        match self.lanes[index].try_send(LaneInput::Payload(payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(input)) => {
                if let LaneInput::Payload(p) = input {
                    warn!(lane = index, client = %p.client_ip, "lane queue full; payload dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(input)) => {
                if let LaneInput::Payload(p) = input {
                    warn!(lane = index, client = %p.client_ip, "lane dead; payload dropped");
                }
                // Report once per outage; further payloads drop until the
                // supervisor installs a replacement.
                if self.awaiting_restart.insert(index) {
                    if let Err(e) = self.supervisor_tx.try_send(LaneFailure { index }) {
                        error!(lane = index, error = %e, "failed to report dead lane");
                        self.awaiting_restart.remove(&index);
                    }
                }
            }
        }
    }
}

pub struct IngestListener {
    listener: tokio::net::TcpListener,
    dispatch_tx: mpsc::UnboundedSender<IngestPayload>,
    cancel: CancellationToken,
    max_content_length: usize,
}

impl IngestListener {
    /// Bind immediately so a busy port fails at startup, not on first push.
    pub async fn bind(
        addr: SocketAddr,
        dispatch_tx: mpsc::UnboundedSender<IngestPayload>,
        cancel: CancellationToken,
        max_content_length: usize,
    ) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatch_tx,
            cancel,
            max_content_length,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: one task per connection, supervised by a `JoinSet` so a
    /// panicking handler never takes the server down.
    pub async fn run(self) -> io::Result<()> {
        let listener = self.listener;
        debug!(addr = %listener.local_addr()?, "ingest listener started");

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = JoinSet::new();

        loop {
            let (conn, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        return Err(e);
                    }
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = ?e, "connection handler panicked");
                        }
                    }
                    continue;
                }
            };

            let client_ip = peer.ip();
            let dispatch_tx = self.dispatch_tx.clone();
            let max_content_length = self.max_content_length;
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let dispatch_tx = dispatch_tx.clone();
                handle_request(req, client_ip, dispatch_tx, max_content_length)
            });

            let io = TokioIo::new(conn);
            let server = server.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(io, service).await {
                    debug!(client = %client_ip, error = %e, "connection error");
                }
            });
        }

        debug!("ingest listener stopped");
        Ok(())
    }
}

/// Validate, read, acknowledge, dispatch, in that order. The 200 goes back
/// as soon as the body is read; the dispatch send cannot block.
async fn handle_request(
    req: Request<Incoming>,
    client_ip: IpAddr,
    dispatch_tx: mpsc::UnboundedSender<IngestPayload>,
    max_content_length: usize,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.method() != Method::POST {
        debug!(client = %client_ip, method = %req.method(), "non-POST rejected");
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::new()));
    }

    let content_length = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let Some(content_length) = content_length else {
        warn!(client = %client_ip, "request without a valid Content-Length rejected");
        return Response::builder()
            .status(StatusCode::LENGTH_REQUIRED)
            .body(Full::new(Bytes::new()));
    };
    if content_length > max_content_length {
        warn!(client = %client_ip, content_length, "oversized payload rejected");
        return Response::builder()
            .status(StatusCode::PAYLOAD_TOO_LARGE)
            .body(Full::new(Bytes::new()));
    }

    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            warn!(client = %client_ip, error = %e, "body read failed");
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::new()));
        }
    };

    // Fails only during shutdown, when the dispatcher is gone.
    if dispatch_tx
        .send(IngestPayload {
            path,
            client_ip,
            body,
        })
        .is_err()
    {
        debug!(client = %client_ip, "dispatcher gone; payload dropped");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html")
        .body(Full::new(Bytes::from(OK_BODY)))
}
