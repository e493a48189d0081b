//! End-to-end tests of the resource manager: metadata resolution, tile
//! generation and deduplication, cancellation and maintenance.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pyramid_cache::{
    Handler, JobState, Locator, ResourceError, ResourceStatus, ScaleRange, TilePos,
};

use super::test_utils::{
    file_config, jpeg, manager, manager_with, png, tar_bytes, test_config, write_file, zip_bytes,
    GatedTransport, MockTransport,
};

// =============================================================================
// Metadata
// =============================================================================

#[test]
fn test_local_png_metadata_and_tile() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "photo.png", &png(300, 200));
    let manager = manager(test_config());

    let metadata = manager.request_resource_metadata(locator.clone()).blocking_recv().unwrap();
    assert_eq!(metadata.locator, locator);
    assert_eq!(metadata.info.status, ResourceStatus::Success);
    assert_eq!(metadata.info.name.handler, Handler::new("image", "png", ""));
    let image = metadata.image.unwrap();
    assert_eq!((image.width, image.height), (300, 200));

    // 300x200 in 64px tiles: 5 columns, the last 44px wide; 4 rows, the last 8px high
    let tile = manager
        .request_tile(&metadata, 0, TilePos::new(4, 3))
        .blocking_recv()
        .unwrap();
    let pixels = tile.decode().unwrap();
    assert_eq!((pixels.width(), pixels.height()), (44, 8));

    // Second lookup comes from the locator table
    let again = manager.request_resource_metadata(locator).blocking_recv().unwrap();
    assert_eq!(again.id(), metadata.id());
    assert_eq!(manager.stats().metadata_resolutions, 1);
}

#[test]
fn test_tile_outside_grid_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "small.png", &png(100, 100));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();

    let result = manager
        .request_tile(&metadata, 0, TilePos::new(2, 0))
        .blocking_recv();
    assert!(matches!(result, Err(ResourceError::TileNotFound { x: 2, .. })));

    let max = metadata.image.unwrap().max_scale(manager.tile_size());
    let result = manager
        .request_tile(&metadata, max + 1, TilePos::new(0, 0))
        .blocking_recv();
    assert!(matches!(result, Err(ResourceError::TileNotFound { .. })));
    assert_eq!(manager.stats().generation_jobs, 0);
}

#[test]
fn test_unparsable_locator_fails_immediately() {
    let manager = manager(test_config());
    let result = manager.request_metadata_str("file:///a.zip//").blocking_recv();
    assert!(matches!(result, Err(ResourceError::Parse(_))));
    assert_eq!(manager.stats().requests, 0);
}

#[test]
fn test_http_404_is_access_error() {
    let url = "http://example.com/missing.png";
    let transport = Arc::new(MockTransport::new().with_response(url, 404, "not found"));
    let manager = manager_with(test_config(), transport.clone());

    let err = manager.request_metadata_str(url).blocking_recv().unwrap_err();
    assert!(matches!(err, ResourceError::Access(_)));
    assert_eq!(err.status(), ResourceStatus::AccessError);
    assert_eq!(transport.request_count(), 1);
    assert_eq!(manager.stats().generation_jobs, 0);

    // Access errors are transient and not recorded
    let stored = manager.list_resources(None).blocking_recv().unwrap();
    assert!(stored.is_empty());
}

#[test]
fn test_remote_blob_fetched_once() {
    let url = "http://example.com/scans/a.jpg";
    let transport = Arc::new(MockTransport::new().with_response(url, 200, jpeg(100, 80)));
    let manager = manager_with(test_config(), transport.clone());

    let metadata = manager.request_metadata_str(url).blocking_recv().unwrap();
    assert_eq!(metadata.info.name.handler.name(), "jpeg");
    assert_eq!(metadata.image.map(|i| (i.width, i.height)), Some((100, 80)));

    manager
        .request_tile(&metadata, 0, TilePos::new(1, 1))
        .blocking_recv()
        .unwrap();
    assert_eq!(transport.request_count(), 1);
}

#[test]
fn test_content_type_names_codec_without_extension() {
    let url = "http://example.com/render?id=3";
    let transport = Arc::new(
        MockTransport::new()
            .with_response(url, 200, &b"truncated before the signature"[..])
            .with_content_type(url, "image/png"),
    );
    let manager = manager_with(test_config(), transport);

    // The server says PNG, so this is a broken PNG rather than unknown content
    let err = manager.request_metadata_str(url).blocking_recv().unwrap_err();
    assert!(matches!(err, ResourceError::Decode(_)));

    let stored = manager.list_resources(None).blocking_recv().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].info.name.handler, Handler::new("image", "png", ""));
    assert_eq!(stored[0].info.status, ResourceStatus::HandlerError);
}

#[test]
fn test_unknown_content_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "notes.txt", b"plain text, not an image");
    let manager = manager(test_config());

    let err = manager.request_resource_metadata(locator.clone()).blocking_recv().unwrap_err();
    assert!(matches!(err, ResourceError::UnknownHandler(_)));

    let stored = manager.list_resources(None).blocking_recv().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].locator, locator);
    assert_eq!(stored[0].info.status, ResourceStatus::UnknownHandler);
    assert_eq!(stored[0].image, None);
}

// =============================================================================
// Archives
// =============================================================================

#[test]
fn test_zip_entry_listing_and_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let page = png(150, 100);
    let archive = write_file(
        dir.path(),
        "book.zip",
        &zip_bytes(&[("pages/p1.png", page.as_slice()), ("readme.txt", &b"hello"[..])]),
    );
    let manager = manager(test_config());

    let entries = manager.request_archive_entries(&archive).blocking_recv().unwrap();
    let names: BTreeSet<&str> = entries
        .iter()
        .filter_map(|l| l.last_handler())
        .map(|h| h.args())
        .collect();
    assert_eq!(names, BTreeSet::from(["pages/p1.png", "readme.txt"]));
    assert!(entries.iter().all(|l| archive.is_parent_of(l)));

    let entry = archive
        .clone()
        .with_handler(Handler::new("archive", "zip", "pages/p1.png"));
    let metadata = manager.request_resource_metadata(entry.clone()).blocking_recv().unwrap();
    assert_eq!(metadata.locator.get_blob_locator(), archive);
    assert_eq!(metadata.image.map(|i| (i.width, i.height)), Some((150, 100)));

    let thumbnail = manager.request_thumbnail(&metadata).blocking_recv().unwrap();
    let pixels = thumbnail.decode().unwrap();
    assert!(pixels.width() <= manager.tile_size() && pixels.height() <= manager.tile_size());
}

#[test]
fn test_nested_archive_entry() {
    let dir = tempfile::tempdir().unwrap();
    let inner = zip_bytes(&[("p.png", png(80, 40).as_slice())]);
    let outer = write_file(dir.path(), "scans.tar", &tar_bytes(&[("inner.zip", inner.as_slice())]));
    let manager = manager(test_config());

    let locator = Locator::parse(&format!("{}//archive-tar:inner.zip//archive-zip:p.png", outer))
        .unwrap();
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();
    assert_eq!(metadata.image.map(|i| (i.width, i.height)), Some((80, 40)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_entry_with_bogus_size_fails_every_time() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(1 << 63);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "img.png", &png(8, 8)[..])
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let archive = write_file(dir.path(), "evil.tar", &builder.into_inner().unwrap());
    let manager = manager(test_config());

    let entry = archive.with_handler(Handler::new("archive", "tar", "img.png"));
    for attempt in 0..2 {
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            manager.request_resource_metadata(entry.clone()),
        )
        .await
        .unwrap_or_else(|_| panic!("attempt {} got no answer", attempt));
        assert!(matches!(result, Err(ResourceError::Handler { .. })));
    }
    // Nothing was left in flight for the second request to join
    assert_eq!(manager.stats().metadata_resolutions, 2);
}

#[test]
fn test_missing_archive_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_file(dir.path(), "a.zip", &zip_bytes(&[("a.png", png(8, 8).as_slice())]));
    let manager = manager(test_config());

    let entry = archive.with_handler(Handler::new("archive", "zip", "missing.png"));
    let result = manager.request_resource_metadata(entry).blocking_recv();
    assert!(result.is_err());
}

// =============================================================================
// Generation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_share_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "big.png", &png(400, 300));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).await.unwrap();

    let pending: Vec<_> = (0..8)
        .map(|_| manager.request_tile(&metadata, 0, TilePos::new(1, 1)))
        .collect();
    let mut tiles = Vec::new();
    for request in pending {
        tiles.push(request.await.unwrap());
    }

    assert!(tiles.windows(2).all(|w| w[0] == w[1]));
    let stats = manager.stats();
    assert_eq!(stats.generation_jobs, 1);
    assert_eq!(stats.folded_requests + stats.tile_hits, 7);
}

#[test]
fn test_repeated_request_is_served_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "a.png", &png(200, 200));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();

    let first = manager.request_tile(&metadata, 1, TilePos::new(0, 0)).blocking_recv().unwrap();
    let second = manager.request_tile(&metadata, 1, TilePos::new(0, 0)).blocking_recv().unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.stats().generation_jobs, 1);
    assert_eq!(manager.stats().tile_hits, 1);
}

#[test]
fn test_thumbnail_first_then_finer_scales() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "wide.png", &png(300, 200));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();
    let max = metadata.image.unwrap().max_scale(manager.tile_size());
    assert_eq!(max, 3);

    let generated = manager
        .request_tiles(&metadata, ScaleRange::single(max))
        .blocking_recv()
        .unwrap();
    assert_eq!(generated, 1);

    let thumbnail = manager.request_thumbnail(&metadata).blocking_recv().unwrap();
    assert_eq!(thumbnail.scale, max);
    assert_eq!(manager.stats().generation_jobs, 1);

    // Finer scales are generated by a second job that stops below the thumbnail
    manager
        .request_tile(&metadata, 0, TilePos::new(0, 0))
        .blocking_recv()
        .unwrap();
    manager
        .request_tiles(&metadata, ScaleRange::new(0, max))
        .blocking_recv()
        .unwrap();
    assert_eq!(manager.stats().generation_jobs, 2);

    let again = manager
        .request_tiles(&metadata, ScaleRange::new(0, max))
        .blocking_recv()
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(manager.stats().generation_jobs, 2);
}

#[test]
fn test_abort_before_generation_starts() {
    let first = "http://example.com/a.png";
    let second = "http://example.com/b.png";
    let transport = Arc::new(
        GatedTransport::new()
            .with_response(first, png(120, 90))
            .with_response(second, png(10, 10)),
    );
    let config = pyramid_cache::ManagerConfig {
        remote_cache_capacity: 1,
        ..test_config()
    };
    let manager = manager_with(config, transport.clone());

    let request = manager.request_metadata_str(first);
    transport.wait_for_held(1);
    transport.release();
    let metadata = request.blocking_recv().unwrap();

    // Evict the first blob so generation has to fetch it again
    let request = manager.request_metadata_str(second);
    transport.wait_for_held(1);
    transport.release();
    request.blocking_recv().unwrap();

    let tile = manager.request_tile(&metadata, 0, TilePos::new(0, 0));
    transport.wait_for_held(1);
    assert!(tile.abort());
    transport.release();

    let handle = tile.handle().clone();
    assert!(matches!(tile.blocking_recv(), Err(ResourceError::Aborted)));
    assert_eq!(handle.state(), JobState::Aborted);
    assert_eq!(transport.request_count(), 3);

    let stats = manager.stats();
    assert_eq!(stats.generation_jobs, 1);
    assert_eq!(stats.tiles_stored, 0);
}

#[test]
fn test_dropped_request_is_not_served() {
    let first = "http://example.com/a.png";
    let second = "http://example.com/b.png";
    let transport = Arc::new(
        GatedTransport::new()
            .with_response(first, png(120, 90))
            .with_response(second, png(10, 10)),
    );
    let config = pyramid_cache::ManagerConfig {
        remote_cache_capacity: 1,
        ..test_config()
    };
    let manager = manager_with(config, transport.clone());

    let request = manager.request_metadata_str(first);
    transport.wait_for_held(1);
    transport.release();
    let metadata = request.blocking_recv().unwrap();

    let request = manager.request_metadata_str(second);
    transport.wait_for_held(1);
    transport.release();
    request.blocking_recv().unwrap();

    // The caller walks away while the source is still downloading
    let dropped = manager.request_tile(&metadata, 0, TilePos::new(0, 0));
    let handle = dropped.handle().clone();
    transport.wait_for_held(1);
    assert_eq!(handle.state(), JobState::Running);
    drop(dropped);
    assert_eq!(handle.state(), JobState::Aborted);

    // A new request cannot join the abandoned job and gets its own
    let fresh = manager.request_tile(&metadata, 0, TilePos::new(0, 0));
    let fresh_handle = fresh.handle().clone();
    transport.release();
    fresh.blocking_recv().unwrap();
    assert_eq!(fresh_handle.state(), JobState::Finished);

    let stats = manager.stats();
    assert_eq!(stats.generation_jobs, 2);
    assert_eq!(stats.folded_requests, 0);
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn test_assemble_coarse_scale() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "a.png", &png(300, 200));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).await.unwrap();

    let pixels = manager.assemble(&metadata, 100).await.unwrap();
    assert_eq!((pixels.width(), pixels.height()), (75, 50));
}

// =============================================================================
// Identity and Persistence
// =============================================================================

#[test]
fn test_same_content_shares_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = png(128, 128);
    let a = write_file(dir.path(), "a.png", &bytes);
    let b = write_file(dir.path(), "copy-of-a.png", &bytes);
    let manager = manager(test_config());

    let meta_a = manager.request_resource_metadata(a).blocking_recv().unwrap();
    let meta_b = manager.request_resource_metadata(b).blocking_recv().unwrap();
    assert_eq!(meta_a.id(), meta_b.id());
    assert_eq!(manager.stats().metadata_resolutions, 2);

    let tile_a = manager.request_tile(&meta_a, 0, TilePos::new(1, 0)).blocking_recv().unwrap();
    let tile_b = manager.request_tile(&meta_b, 0, TilePos::new(1, 0)).blocking_recv().unwrap();
    assert_eq!(tile_a, tile_b);
    assert_eq!(manager.stats().generation_jobs, 1);
}

#[test]
fn test_tiles_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "a.png", &png(200, 150));
    let db_path = dir.path().join("cache.sqlite3");

    let full = {
        let manager = manager(file_config(db_path.clone()));
        let metadata = manager.request_resource_metadata(locator.clone()).blocking_recv().unwrap();
        let max = metadata.image.unwrap().max_scale(manager.tile_size());
        let generated = manager
            .request_tiles(&metadata, ScaleRange::new(0, max))
            .blocking_recv()
            .unwrap();
        assert!(generated > 0);
        max
    };

    let manager = manager(file_config(db_path));
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();
    for scale in 0..=full {
        manager
            .request_tile(&metadata, scale, TilePos::new(0, 0))
            .blocking_recv()
            .unwrap();
    }

    let stats = manager.stats();
    assert_eq!(stats.metadata_resolutions, 0);
    assert_eq!(stats.generation_jobs, 0);
    assert_eq!(stats.tile_hits, u64::from(full) + 1);
}

// =============================================================================
// Maintenance
// =============================================================================

#[test]
fn test_delete_resource() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "a.png", &png(100, 100));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();
    manager
        .request_tile(&metadata, 0, TilePos::new(0, 0))
        .blocking_recv()
        .unwrap();

    assert!(manager.delete_resource(metadata.id()).blocking_recv().unwrap());
    assert!(!manager.delete_resource(metadata.id()).blocking_recv().unwrap());
    assert!(manager.list_resources(None).blocking_recv().unwrap().is_empty());

    let result = manager
        .request_tile(&metadata, 0, TilePos::new(0, 0))
        .blocking_recv();
    assert!(matches!(result, Err(ResourceError::TileNotFound { .. })));
}

#[test]
fn test_list_with_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(test_config());
    for (name, size) in [("cat.png", 20), ("dog.png", 30), ("cat.jpg", 40)] {
        let data = if name.ends_with(".png") { png(size, size) } else { jpeg(size, size) };
        let locator = write_file(dir.path(), name, &data);
        manager.request_resource_metadata(locator).blocking_recv().unwrap();
    }

    let all = manager.list_resources(None).blocking_recv().unwrap();
    assert_eq!(all.len(), 3);

    let cats = manager.list_resources(Some("*/cat.*")).blocking_recv().unwrap();
    let names: Vec<_> = cats.iter().filter_map(|m| m.locator.url().file_name()).collect();
    assert_eq!(names, vec!["cat.jpg", "cat.png"]);

    let pngs = manager.list_resources(Some("*.png")).blocking_recv().unwrap();
    assert_eq!(pngs.len(), 2);

    let invalid = manager.list_resources(Some("[")).blocking_recv();
    assert!(matches!(invalid, Err(ResourceError::InvalidPattern { .. })));
}

#[test]
fn test_flush_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "a.png", &png(100, 100));
    let manager = manager(test_config());
    let metadata = manager.request_resource_metadata(locator).blocking_recv().unwrap();
    manager
        .request_tiles(&metadata, ScaleRange::new(0, 1))
        .blocking_recv()
        .unwrap();

    assert!(manager.flush().blocking_recv().unwrap() > 0);
    assert_eq!(manager.flush().blocking_recv().unwrap(), 0);

    let report = manager.cleanup().blocking_recv().unwrap();
    assert_eq!(report.orphan_tiles, 0);
    assert_eq!(report.orphan_locators, 0);
}

#[test]
fn test_requests_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let locator = write_file(dir.path(), "a.png", &png(10, 10));
    let manager = manager(test_config());

    manager.shutdown();
    let result = manager.request_resource_metadata(locator).blocking_recv();
    assert!(matches!(result, Err(ResourceError::Shutdown)));
}
