//! Locator and pyramid geometry tests through the public API.

use pyramid_cache::pyramid::calc_max_scale;
use pyramid_cache::{Handler, ImageInfo, Locator, LocatorError, PyramidGenerator, ScaleRange};

use pyramid_cache::codec::{PixelBuffer, PixelFormat};

// =============================================================================
// Locators
// =============================================================================

#[test]
fn test_archive_entry_locator() {
    let locator: Locator = "file:///a.zip//archive-zip:img.png".parse().unwrap();

    assert_eq!(locator.url().path(), "/a.zip");
    assert_eq!(locator.get_type(), "archive");
    assert_eq!(locator.last_handler(), Some(&Handler::new("archive", "zip", "img.png")));
    assert_eq!(locator.get_blob_locator().to_string(), "file:///a.zip");
    assert!(locator.get_blob_locator().is_parent_of(&locator));
}

#[test]
fn test_nested_locator_round_trip() {
    let text = "https://example.com/scans.tar//archive-tar:batch/a.zip//archive-zip:page1.png";
    let locator = Locator::parse(text).unwrap();

    assert_eq!(locator.handlers().len(), 2);
    assert_eq!(locator.handlers()[0].args(), "batch/a.zip");
    assert_eq!(locator.handlers()[1].args(), "page1.png");
    assert_eq!(locator.to_string(), text);
    assert_eq!(Locator::parse(&locator.to_string()).unwrap(), locator);
}

#[test]
fn test_locator_built_from_parts() {
    let locator = Locator::from_path("/data/scans.tar")
        .with_handler(Handler::new("archive", "tar", "a.zip"))
        .with_handler(Handler::new("archive", "zip", "b.png"));

    assert_eq!(
        locator.to_string(),
        "file:///data/scans.tar//archive-tar:a.zip//archive-zip:b.png"
    );
}

#[test]
fn test_malformed_locators() {
    assert_eq!(Locator::parse(""), Err(LocatorError::Empty));
    assert!(Locator::parse("file:///a.zip//").is_err());
    assert!(Locator::parse("file:///a.zip//nodash").is_err());
}

// =============================================================================
// Pyramid Geometry
// =============================================================================

#[test]
fn test_scale_zero_grid_of_large_image() {
    let generator = PyramidGenerator::new(256);
    let image = PixelBuffer::new(1000, 1000, PixelFormat::Rgb);

    let mut tiles = Vec::new();
    generator.generate_range(&image, ScaleRange::single(0), || false, |t| tiles.push(t));

    assert_eq!(tiles.len(), 16);
    for tile in &tiles {
        assert!(tile.pos.x < 4 && tile.pos.y < 4);
        let expected_w = if tile.pos.x == 3 { 232 } else { 256 };
        let expected_h = if tile.pos.y == 3 { 232 } else { 256 };
        assert_eq!(tile.pixels.width(), expected_w);
        assert_eq!(tile.pixels.height(), expected_h);
    }
}

#[test]
fn test_max_scale_is_single_tile() {
    let info = ImageInfo::new(1000, 1000);
    let max = info.max_scale(256);

    assert_eq!(max, calc_max_scale(1000, 1000, 256));
    assert_eq!(info.tile_grid(max, 256), (1, 1));
    assert!(max == 0 || info.tile_grid(max - 1, 256) != (1, 1));
}

#[test]
fn test_full_pyramid_is_deterministic() {
    let generator = PyramidGenerator::new(64);
    let mut image = PixelBuffer::new(200, 130, PixelFormat::Rgb);
    for y in 0..130 {
        for x in 0..200 {
            image.set_pixel(x, y, &[x as u8, y as u8, (x ^ y) as u8]);
        }
    }

    let first = generator.generate(&image);
    let second = generator.generate(&image);

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!((a.scale, a.pos), (b.scale, b.pos));
        assert!(a.pixels == b.pixels);
    }
    let scales: Vec<u32> = first.iter().map(|t| t.scale).collect();
    assert_eq!(scales.first(), Some(&0));
    assert_eq!(scales.last(), Some(&calc_max_scale(200, 130, 64)));
}
