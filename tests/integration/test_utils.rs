//! Test utilities for integration tests.
//!
//! This module provides mock network transports and helpers for building
//! test images and archives in memory and on disk.

use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pyramid_cache::{
    DatabaseLocation, HttpResponse, IoError, Locator, ManagerConfig, NetworkTransport,
    ResourceManager, TransferCallback,
};

// =============================================================================
// Mock Transport with Request Tracking
// =============================================================================

/// A transport that answers GETs from a fixed table and counts requests.
///
/// Unknown URLs fail with a connection error.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, (u16, Bytes)>>,
    content_types: Mutex<HashMap<String, String>>,
    request_count: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, url: &str, status: u16, body: impl Into<Bytes>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.into()));
        self
    }

    /// Report `content_type` for `url`.
    pub fn with_content_type(self, url: &str, content_type: &str) -> Self {
        self.content_types
            .lock()
            .unwrap()
            .insert(url.to_string(), content_type.to_string());
        self
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }
}

impl NetworkTransport for MockTransport {
    fn get(&self, url: &str, on_result: TransferCallback) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        let response = self.responses.lock().unwrap().get(url).cloned();
        let content_type = self.content_types.lock().unwrap().get(url).cloned();
        on_result(match response {
            Some((status, body)) => Ok(HttpResponse {
                status,
                content_type,
                last_modified: None,
                body,
            }),
            None => Err(IoError::Connection(format!("no route to {}", url))),
        });
    }

    fn post(&self, _url: &str, _body: Bytes, on_result: TransferCallback) {
        on_result(Err(IoError::Connection("POST not supported".to_string())));
    }
}

// =============================================================================
// Gated Transport
// =============================================================================

/// A transport that parks every GET until the test releases it.
///
/// Lets a test act while a transfer is known to be in flight.
#[derive(Default)]
pub struct GatedTransport {
    responses: Mutex<HashMap<String, Bytes>>,
    held: Mutex<Vec<(String, TransferCallback)>>,
    request_count: AtomicUsize,
}

impl GatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), body.into());
        self
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Wait until `count` transfers are parked.
    pub fn wait_for_held(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.held() < count {
            assert!(Instant::now() < deadline, "timed out waiting for transfers");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Complete every parked transfer.
    pub fn release(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for (url, on_result) in held {
            let body = self.responses.lock().unwrap().get(&url).cloned();
            on_result(match body {
                Some(body) => Ok(HttpResponse {
                    status: 200,
                    content_type: None,
                    last_modified: None,
                    body,
                }),
                None => Ok(HttpResponse {
                    status: 404,
                    content_type: None,
                    last_modified: None,
                    body: Bytes::new(),
                }),
            });
        }
    }
}

impl NetworkTransport for GatedTransport {
    fn get(&self, url: &str, on_result: TransferCallback) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.held
            .lock()
            .unwrap()
            .push((url.to_string(), on_result));
    }

    fn post(&self, _url: &str, _body: Bytes, on_result: TransferCallback) {
        on_result(Err(IoError::Connection("POST not supported".to_string())));
    }
}

// =============================================================================
// Test Images and Archives
// =============================================================================

/// Encode a deterministic RGB gradient.
pub fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * 3 + y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    encoded_image(width, height, ImageFormat::Png)
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encoded_image(width, height, ImageFormat::Jpeg)
}

/// Build a stored (uncompressed) zip archive.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Build a tar archive.
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Write `data` to `dir/name` and return the file's locator.
pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> Locator {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    Locator::from_path(&path)
}

// =============================================================================
// Manager Construction
// =============================================================================

/// Small, fast configuration on an in-memory database.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        threads: 2,
        tile_size: 64,
        ..ManagerConfig::default()
    }
}

pub fn file_config(path: PathBuf) -> ManagerConfig {
    ManagerConfig {
        database: DatabaseLocation::File(path),
        ..test_config()
    }
}

pub fn manager(config: ManagerConfig) -> ResourceManager {
    manager_with(config, Arc::new(MockTransport::new()))
}

pub fn manager_with(config: ManagerConfig, transport: Arc<dyn NetworkTransport>) -> ResourceManager {
    ResourceManager::with_transport(config, transport).unwrap()
}
