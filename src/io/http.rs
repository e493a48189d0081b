use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{HttpResponse, NetworkTransport, TransferCallback};
use crate::error::IoError;

const TRANSPORT_THREAD_NAME: &str = "pyramid-http";

// =============================================================================
// HttpClient Trait
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Bytes>,
}

/// Performs a single HTTP exchange.
///
/// [`HttpTransport`] drives any client on its own thread, which lets tests
/// substitute a canned client without touching the network.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, IoError>;
}

// =============================================================================
// reqwest Client
// =============================================================================

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> Result<Self, IoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IoError::Connection(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, IoError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self
                .client
                .post(&request.url)
                .body(request.body.unwrap_or_default()),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| IoError::Connection(format!("{}: {}", request.url, e)))?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let status = response.status().as_u16();
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let last_modified = header(reqwest::header::LAST_MODIFIED);

        let body = response
            .bytes()
            .await
            .map_err(|e| IoError::Connection(format!("{}: {}", request.url, e)))?;

        Ok(HttpResponse {
            status,
            content_type,
            last_modified,
            body,
        })
    }
}

// =============================================================================
// HttpTransport
// =============================================================================

struct Transfer {
    request: HttpRequest,
    on_result: TransferCallback,
}

/// Network transport running all transfers on one dedicated thread.
///
/// The thread owns a single-threaded tokio runtime and multiplexes every
/// in-flight transfer on it. Dropping the transport stops accepting work,
/// lets in-flight transfers finish and joins the thread.
pub struct HttpTransport {
    sender: Mutex<Option<mpsc::UnboundedSender<Transfer>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Start the transport thread around `client`.
    pub fn new<C: HttpClient>(client: C) -> Result<Self, IoError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(TRANSPORT_THREAD_NAME.to_string())
            .spawn(move || run_transfers(Arc::new(client), receiver))
            .map_err(|e| IoError::Connection(format!("failed to start transport: {}", e)))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Transport using reqwest with the given per-transfer timeout.
    pub fn with_reqwest(timeout: Duration) -> Result<Self, IoError> {
        Self::new(ReqwestClient::new(timeout)?)
    }

    fn submit(&self, request: HttpRequest, on_result: TransferCallback) {
        let transfer = Transfer { request, on_result };
        let rejected = match self.sender.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(sender) => sender.send(transfer).err().map(|e| e.0),
                None => Some(transfer),
            },
            Err(_) => Some(transfer),
        };
        if let Some(transfer) = rejected {
            (transfer.on_result)(Err(IoError::TransportClosed));
        }
    }

    /// Stop accepting transfers and wait for in-flight ones to complete.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("network transport thread panicked");
            }
        }
    }
}

impl NetworkTransport for HttpTransport {
    fn get(&self, url: &str, on_result: TransferCallback) {
        debug!(url, "GET");
        self.submit(
            HttpRequest {
                method: HttpMethod::Get,
                url: url.to_string(),
                body: None,
            },
            on_result,
        );
    }

    fn post(&self, url: &str, body: Bytes, on_result: TransferCallback) {
        debug!(url, len = body.len(), "POST");
        self.submit(
            HttpRequest {
                method: HttpMethod::Post,
                url: url.to_string(),
                body: Some(body),
            },
            on_result,
        );
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_transfers<C: HttpClient>(client: Arc<C>, mut receiver: mpsc::UnboundedReceiver<Transfer>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build transport runtime: {}", e);
            while let Some(transfer) = receiver.blocking_recv() {
                (transfer.on_result)(Err(IoError::Connection(e.to_string())));
            }
            return;
        }
    };

    runtime.block_on(async move {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                next = receiver.recv() => match next {
                    Some(Transfer { request, on_result }) => {
                        let client = Arc::clone(&client);
                        in_flight.spawn(async move {
                            let result = client.send(request).await;
                            on_result(result);
                        });
                    }
                    None => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!("transfer task failed: {}", e);
                    }
                }
            }
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!("transfer task failed: {}", e);
            }
        }
    });
    debug!("network transport stopped");
}
