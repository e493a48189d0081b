//! Blob resolution.
//!
//! Turns a [`Locator`] into the bytes it names: fetch the root blob by url
//! scheme, then apply each handler in order. `file` urls are read from disk
//! on the worker pool; `http`, `https` and `ftp` urls go through the
//! network transport. Every result is delivered on a worker-pool thread,
//! never on the caller's or the transport's thread.
//!
//! Downloaded root blobs are kept in a small LRU cache so that resolving
//! several entries of one remote archive downloads it once.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, warn};

use crate::archive::{ArchiveRegistry, ARCHIVE_HANDLER_TYPE};
use crate::blob::Blob;
use crate::codec::IMAGE_HANDLER_TYPE;
use crate::error::{IoError, LocatorError, ResourceError};
use crate::io::{catch_panic, NetworkTransport, WorkerPool};
use crate::locator::{Handler, Locator, BLOB_TYPE};

/// Default number of downloaded blobs kept in memory.
pub const DEFAULT_REMOTE_CACHE_CAPACITY: usize = 16;

struct Inner {
    pool: WorkerPool,
    transport: Arc<dyn NetworkTransport>,
    archives: ArchiveRegistry,
    remote: Mutex<LruCache<String, Blob>>,
}

/// Resolves locators to blobs asynchronously.
#[derive(Clone)]
pub struct BlobResolver {
    inner: Arc<Inner>,
}

impl BlobResolver {
    pub fn new(
        pool: WorkerPool,
        transport: Arc<dyn NetworkTransport>,
        archives: ArchiveRegistry,
    ) -> Self {
        Self::with_cache_capacity(pool, transport, archives, DEFAULT_REMOTE_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        pool: WorkerPool,
        transport: Arc<dyn NetworkTransport>,
        archives: ArchiveRegistry,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                pool,
                transport,
                archives,
                remote: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    pub fn archives(&self) -> &ArchiveRegistry {
        &self.inner.archives
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Resolve `locator` and pass the result to `on_done` on a pool thread.
    ///
    /// # Errors (delivered to `on_done`)
    ///
    /// - [`ResourceError::Access`] if the root blob cannot be fetched
    /// - [`ResourceError::UnknownHandler`] for an unsupported scheme or handler
    /// - [`ResourceError::Handler`] if an archive adapter fails or panics
    pub fn resolve<F>(&self, locator: &Locator, on_done: F)
    where
        F: FnOnce(Result<Blob, ResourceError>) + Send + 'static,
    {
        let handlers = locator.handlers().to_vec();
        let inner = Arc::clone(&self.inner);
        self.fetch_root(locator, move |root| {
            let result = root.and_then(|blob| {
                catch_panic(&chain_name(&handlers), || inner.dig(blob, &handlers))
            });
            on_done(result)
        });
    }

    /// Resolve `locator` and list the archive entries inside it as child
    /// locators.
    pub fn resolve_entries<F>(&self, locator: &Locator, on_done: F)
    where
        F: FnOnce(Result<Vec<Locator>, ResourceError>) + Send + 'static,
    {
        let parent = locator.clone();
        let inner = Arc::clone(&self.inner);
        self.resolve(locator, move |blob| {
            let result = blob.and_then(|blob| {
                let (adapter, entries) =
                    catch_panic(ARCHIVE_HANDLER_TYPE, || inner.archives.list(&blob))?;
                Ok(entries
                    .into_iter()
                    .map(|entry| {
                        parent
                            .clone()
                            .with_handler(Handler::new(ARCHIVE_HANDLER_TYPE, adapter.name(), entry))
                    })
                    .collect())
            });
            on_done(result)
        });
    }

    fn fetch_root<F>(&self, locator: &Locator, on_done: F)
    where
        F: FnOnce(Result<Blob, ResourceError>) + Send + 'static,
    {
        let url = locator.url();

        if url.is_local() {
            let path = url.path().to_string();
            self.inner.pool.execute(move || on_done(open_local(&path)));
            return;
        }

        if !url.is_remote() {
            let err = ResourceError::UnknownHandler(format!("unsupported url scheme '{}'", url.scheme()));
            self.inner.pool.execute(move || on_done(Err(err)));
            return;
        }

        let address = url.to_string();
        if let Err(e) = url::Url::parse(&address) {
            let err = ResourceError::Parse(LocatorError::InvalidUrl(format!("{}: {}", address, e)));
            self.inner.pool.execute(move || on_done(Err(err)));
            return;
        }

        let cached = self
            .inner
            .remote
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&address).cloned());
        if let Some(blob) = cached {
            debug!(url = %address, "remote blob cache hit");
            self.inner.pool.execute(move || on_done(Ok(blob)));
            return;
        }

        let name = url.file_name().map(str::to_owned);
        let inner = Arc::clone(&self.inner);
        self.inner.transport.get(
            &address.clone(),
            Box::new(move |response| {
                let pool = inner.pool.clone();
                pool.execute(move || {
                    let result = match response {
                        Ok(response) if response.is_success() => {
                            let blob = Blob::from_bytes(response.body, name)
                                .with_content_type(response.content_type);
                            if let Ok(mut cache) = inner.remote.lock() {
                                cache.put(address, blob.clone());
                            }
                            Ok(blob)
                        }
                        Ok(response) => {
                            warn!(url = %address, status = response.status, "fetch failed");
                            Err(IoError::Http {
                                url: address,
                                status: response.status,
                            }
                            .into())
                        }
                        Err(e) => {
                            warn!(url = %address, "fetch failed: {}", e);
                            Err(e.into())
                        }
                    };
                    on_done(result)
                });
            }),
        );
    }
}

impl Inner {
    /// Apply a handler chain to a root blob.
    ///
    /// `archive-*` handlers extract an entry. An `image-*` handler may close
    /// the chain to name the codec; it leaves the blob untouched.
    fn dig(&self, mut blob: Blob, handlers: &[Handler]) -> Result<Blob, ResourceError> {
        for (i, handler) in handlers.iter().enumerate() {
            let is_last = i + 1 == handlers.len();
            match handler.kind() {
                ARCHIVE_HANDLER_TYPE => blob = self.archives.dig(&blob, handler)?,
                IMAGE_HANDLER_TYPE if is_last => {}
                _ => return Err(ResourceError::UnknownHandler(handler.qualified_name())),
            }
        }
        Ok(blob)
    }
}

/// Name reported when digging through `handlers` fails.
fn chain_name(handlers: &[Handler]) -> String {
    handlers
        .last()
        .map(Handler::qualified_name)
        .unwrap_or_else(|| BLOB_TYPE.to_string())
}

fn open_local(path: &str) -> Result<Blob, ResourceError> {
    let metadata = std::fs::metadata(path).map_err(|e| IoError::file(path, e))?;
    if !metadata.is_file() {
        return Err(IoError::file(path, "not a regular file").into());
    }
    Ok(Blob::from_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{tar_bytes, zip_bytes};
    use crate::io::{HttpResponse, TransferCallback, WorkerRuntime};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Transport answering from a fixed table, counting requests.
    struct TableTransport {
        responses: Vec<(&'static str, u16, Bytes)>,
        content_type: Option<&'static str>,
        requests: AtomicUsize,
    }

    impl NetworkTransport for TableTransport {
        fn get(&self, url: &str, on_result: TransferCallback) {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .iter()
                .find(|(u, _, _)| *u == url)
                .map(|(_, status, body)| HttpResponse {
                    status: *status,
                    content_type: self.content_type.map(str::to_string),
                    last_modified: None,
                    body: body.clone(),
                });
            on_result(response.ok_or_else(|| IoError::Connection(format!("no route to {}", url))));
        }

        fn post(&self, _url: &str, _body: Bytes, on_result: TransferCallback) {
            on_result(Err(IoError::Connection("unsupported".to_string())));
        }
    }

    fn resolver(
        runtime: &WorkerRuntime,
        responses: Vec<(&'static str, u16, Bytes)>,
    ) -> (BlobResolver, Arc<TableTransport>) {
        resolver_with(runtime, responses, None, ArchiveRegistry::with_defaults())
    }

    fn resolver_with(
        runtime: &WorkerRuntime,
        responses: Vec<(&'static str, u16, Bytes)>,
        content_type: Option<&'static str>,
        archives: ArchiveRegistry,
    ) -> (BlobResolver, Arc<TableTransport>) {
        let transport = Arc::new(TableTransport {
            responses,
            content_type,
            requests: AtomicUsize::new(0),
        });
        let resolver = BlobResolver::new(runtime.pool(), transport.clone(), archives);
        (resolver, transport)
    }

    /// Adapter that panics on every read.
    struct ExplodingArchive;

    impl crate::archive::ArchiveAdapter for ExplodingArchive {
        fn name(&self) -> &'static str {
            "boom"
        }

        fn extensions(&self) -> &'static [&'static str] {
            &["boom"]
        }

        fn matches_magic(&self, _header: &[u8]) -> bool {
            false
        }

        fn list_entries(&self, _path: &std::path::Path) -> Result<Vec<String>, ResourceError> {
            panic!("corrupt directory")
        }

        fn read_entry(&self, _path: &std::path::Path, _entry: &str) -> Result<Bytes, ResourceError> {
            panic!("corrupt entry")
        }

        fn extract_all(&self, _path: &std::path::Path, _dest: &std::path::Path) -> Result<(), ResourceError> {
            Ok(())
        }
    }

    fn resolve_sync(resolver: &BlobResolver, text: &str) -> Result<Blob, ResourceError> {
        let (tx, rx) = mpsc::channel();
        resolver.resolve(&Locator::parse(text).unwrap(), move |r| {
            tx.send(r).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_local_archive_entry() {
        let runtime = WorkerRuntime::new(2).unwrap();
        let (resolver, _) = resolver(&runtime, vec![]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, zip_bytes(&[("img.png", b"pixels")])).unwrap();

        let blob = resolve_sync(
            &resolver,
            &format!("file://{}//archive-zip:img.png", path.display()),
        )
        .unwrap();
        assert_eq!(&blob.data().unwrap()[..], b"pixels");
    }

    #[test]
    fn test_nested_archives() {
        let runtime = WorkerRuntime::new(2).unwrap();
        let (resolver, _) = resolver(&runtime, vec![]);
        let dir = tempfile::tempdir().unwrap();
        let inner = zip_bytes(&[("deep.txt", b"found")]);
        let path = dir.path().join("outer.tar");
        std::fs::write(&path, tar_bytes(&[("inner.zip", inner.as_slice())])).unwrap();

        let blob = resolve_sync(
            &resolver,
            &format!(
                "file://{}//archive-tar:inner.zip//archive-zip:deep.txt",
                path.display()
            ),
        )
        .unwrap();
        assert_eq!(&blob.data().unwrap()[..], b"found");
    }

    #[test]
    fn test_missing_file_is_access_error() {
        let runtime = WorkerRuntime::new(1).unwrap();
        let (resolver, _) = resolver(&runtime, vec![]);
        let err = resolve_sync(&resolver, "file:///no/such/file.png").unwrap_err();
        assert!(matches!(err, ResourceError::Access(IoError::File { .. })));
    }

    #[test]
    fn test_http_404_is_access_error() {
        let runtime = WorkerRuntime::new(1).unwrap();
        let (resolver, _) = resolver(&runtime, vec![("http://host/x.png", 404, Bytes::new())]);
        let err = resolve_sync(&resolver, "http://host/x.png").unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Access(IoError::Http { status: 404, .. })
        ));
    }

    #[test]
    fn test_remote_blob_is_cached() {
        let runtime = WorkerRuntime::new(2).unwrap();
        let zip = Bytes::from(zip_bytes(&[("a.txt", b"1"), ("b.txt", b"2")]));
        let (resolver, transport) = resolver(&runtime, vec![("http://host/x.zip", 200, zip)]);

        let a = resolve_sync(&resolver, "http://host/x.zip//archive-zip:a.txt").unwrap();
        let b = resolve_sync(&resolver, "http://host/x.zip//archive-zip:b.txt").unwrap();
        assert_eq!(&a.data().unwrap()[..], b"1");
        assert_eq!(&b.data().unwrap()[..], b"2");
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_scheme_and_handler() {
        let runtime = WorkerRuntime::new(1).unwrap();
        let (resolver, _) = resolver(&runtime, vec![]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();

        let err = resolve_sync(&resolver, &format!("file://{}//video-mp4:1", path.display()))
            .unwrap_err();
        assert!(matches!(err, ResourceError::UnknownHandler(ref h) if h == "video-mp4"));

        // An image handler is only meaningful at the end of the chain
        let ok = resolve_sync(&resolver, &format!("file://{}//image-png", path.display()));
        assert!(ok.is_ok());
        let err = resolve_sync(
            &resolver,
            &format!("file://{}//image-png//archive-zip:a", path.display()),
        )
        .unwrap_err();
        assert!(matches!(err, ResourceError::UnknownHandler(_)));
    }

    #[test]
    fn test_panicking_adapter_still_answers() {
        let runtime = WorkerRuntime::new(1).unwrap();
        let mut archives = ArchiveRegistry::with_defaults();
        archives.register(ExplodingArchive);
        let (resolver, _) = resolver_with(&runtime, vec![], None, archives);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.boom");
        std::fs::write(&path, b"not an archive").unwrap();

        let err = resolve_sync(&resolver, &format!("file://{}//archive-boom:a.png", path.display()))
            .unwrap_err();
        match err {
            ResourceError::Handler { handler, message } => {
                assert_eq!(handler, "archive-boom");
                assert!(message.contains("corrupt entry"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Listing goes through the same guard, and the pool keeps serving
        let (tx, rx) = mpsc::channel();
        resolver.resolve_entries(&Locator::from_path(&path), move |r| tx.send(r).unwrap());
        let listed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(matches!(listed, Err(ResourceError::Handler { .. })));
    }

    #[test]
    fn test_remote_blob_keeps_content_type() {
        let runtime = WorkerRuntime::new(1).unwrap();
        let (resolver, _) = resolver_with(
            &runtime,
            vec![("http://host/render?id=3", 200, Bytes::from_static(b"data"))],
            Some("image/png"),
            ArchiveRegistry::with_defaults(),
        );
        let blob = resolve_sync(&resolver, "http://host/render?id=3").unwrap();
        assert_eq!(blob.content_type(), Some("image/png"));
    }

    #[test]
    fn test_resolve_entries() {
        let runtime = WorkerRuntime::new(1).unwrap();
        let (resolver, _) = resolver(&runtime, vec![]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, zip_bytes(&[("one.png", b"1")])).unwrap();

        let (tx, rx) = mpsc::channel();
        let locator = Locator::from_path(&path);
        resolver.resolve_entries(&locator, move |r| tx.send(r).unwrap());
        let entries = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].to_string(),
            format!("file://{}//archive-zip:one.png", path.display())
        );
    }
}
