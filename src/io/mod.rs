//! Network transport and worker pool.
//!
//! Remote blobs are fetched by a [`NetworkTransport`]; the production one
//! ([`HttpTransport`]) multiplexes transfers on a dedicated thread. CPU-bound
//! and blocking work (decoding, archive extraction, file reads) runs on a
//! [`WorkerPool`].

mod http;
mod pool;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpTransport, ReqwestClient};
pub use pool::{catch_panic, WorkerPool, WorkerRuntime};

use bytes::Bytes;

use crate::error::IoError;

/// A completed transfer.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// 2xx and 3xx count as success.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Completion callback for a transfer. Invoked exactly once, on the
/// transport's thread, so it should hand real work off elsewhere.
pub type TransferCallback = Box<dyn FnOnce(Result<HttpResponse, IoError>) + Send + 'static>;

/// Asynchronous GET/POST transport.
pub trait NetworkTransport: Send + Sync {
    fn get(&self, url: &str, on_result: TransferCallback);

    fn post(&self, url: &str, body: Bytes, on_result: TransferCallback);
}
