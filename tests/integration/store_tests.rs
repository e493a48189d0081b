//! Database tests: write-back visibility, persistence and content identity.

use bytes::Bytes;

use pyramid_cache::{
    BlobInfo, Database, Handler, ImageInfo, Locator, ResourceName, ResourceStatus, RowId,
    ScaleRange, TileEntry, TileFormat, TilePos,
};

fn tile(image_id: RowId, scale: u32, x: u32, y: u32) -> TileEntry {
    TileEntry {
        image_id,
        scale,
        pos: TilePos::new(x, y),
        format: TileFormat::Png,
        data: Bytes::from(format!("{}/{}/{}", scale, x, y)),
    }
}

fn image_resource(db: &mut Database, content: &[u8]) -> RowId {
    let name = ResourceName::new(BlobInfo::from_bytes(content), Handler::new("image", "png", ""));
    let info = db.store_resource(&name, ResourceStatus::Success).unwrap();
    db.store_image_info(info.id, &ImageInfo::new(1000, 1000)).unwrap();
    info.id
}

// =============================================================================
// Write-back Buffer
// =============================================================================

#[test]
fn test_tiles_visible_before_and_after_flush() {
    let mut db = Database::open_in_memory().unwrap().with_flush_threshold(4);
    let id = image_resource(&mut db, b"pixels");

    for x in 0..10 {
        db.store_tile(tile(id, 0, x, 0)).unwrap();
        for seen in 0..=x {
            let found = db.get_tile(id, 0, TilePos::new(seen, 0)).unwrap();
            assert_eq!(found, Some(tile(id, 0, seen, 0)), "tile {} after storing {}", seen, x);
        }
    }
    assert!(db.pending_tiles() <= 4);

    db.flush_tiles().unwrap();
    assert_eq!(db.pending_tiles(), 0);
    assert_eq!(db.get_tiles(id, 0).unwrap().len(), 10);
}

#[test]
fn test_scale_range_grows_monotonically() {
    let mut db = Database::open_in_memory().unwrap().with_flush_threshold(2);
    let id = image_resource(&mut db, b"pixels");
    assert_eq!(db.get_min_max_scale(id).unwrap(), None);

    let mut previous: Option<ScaleRange> = None;
    for scale in [3, 4, 2, 2, 1, 0] {
        db.store_tile(tile(id, scale, 0, 0)).unwrap();
        let range = db.get_min_max_scale(id).unwrap().unwrap();
        assert!(range.contains(scale));
        if let Some(previous) = previous {
            assert!(range.covers(&previous));
        }
        previous = Some(range);
    }
    assert_eq!(previous, Some(ScaleRange::new(0, 4)));
}

#[test]
fn test_tiles_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite3");
    let locator = Locator::parse("file:///data/a.png").unwrap();

    let id = {
        let mut db = Database::open(&path).unwrap().with_flush_threshold(100);
        let id = image_resource(&mut db, b"persistent");
        db.store_locator(&locator, id).unwrap();
        db.store_tile(tile(id, 2, 0, 0)).unwrap();
        db.store_tile(tile(id, 1, 1, 0)).unwrap();
        assert_eq!(db.pending_tiles(), 2);
        id
    };

    let db = Database::open(&path).unwrap();
    assert_eq!(db.get_tile(id, 2, TilePos::new(0, 0)).unwrap(), Some(tile(id, 2, 0, 0)));
    assert!(db.has_tile(id, 1, TilePos::new(1, 0)).unwrap());

    let metadata = db.get_metadata(&locator).unwrap().unwrap();
    assert_eq!(metadata.id(), id);
    assert_eq!(metadata.image, Some(ImageInfo::new(1000, 1000)));
    assert_eq!(metadata.info.status, ResourceStatus::Success);
}

// =============================================================================
// Resources
// =============================================================================

#[test]
fn test_same_content_is_one_resource() {
    let mut db = Database::open_in_memory().unwrap();
    let first = image_resource(&mut db, b"same bytes");
    let second = image_resource(&mut db, b"same bytes");
    let other = image_resource(&mut db, b"other bytes");

    assert_eq!(first, second);
    assert_ne!(first, other);

    db.store_locator(&Locator::parse("file:///a.png").unwrap(), first).unwrap();
    db.store_locator(&Locator::parse("file:///copy.png").unwrap(), second).unwrap();
    let listed = db.list_resources(None).unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|m| m.id() == first));
}

#[test]
fn test_delete_removes_tiles_and_locators() {
    let mut db = Database::open_in_memory().unwrap();
    let id = image_resource(&mut db, b"doomed");
    let locator = Locator::parse("file:///doomed.png").unwrap();
    db.store_locator(&locator, id).unwrap();
    db.store_tile(tile(id, 0, 0, 0)).unwrap();
    db.flush_tiles().unwrap();
    db.store_tile(tile(id, 1, 0, 0)).unwrap();

    assert!(db.delete_resource(id).unwrap());
    assert!(!db.delete_resource(id).unwrap());
    assert_eq!(db.get_metadata(&locator).unwrap(), None);
    assert_eq!(db.get_min_max_scale(id).unwrap(), None);
    assert_eq!(db.pending_tiles(), 0);
}

#[test]
fn test_invalid_row_id_is_rejected() {
    let db = Database::open_in_memory().unwrap();
    assert!(db.get_tile(RowId::INVALID, 0, TilePos::new(0, 0)).is_err());
    assert!(db.get_resource(RowId::INVALID).is_err());
}
