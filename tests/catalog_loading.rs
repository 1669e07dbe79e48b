use std::fs;
use std::path::Path;

use image::{GrayImage, Luma};
use maplehelper::automation::catalog::{required_references, Catalog, MANIFEST_FILE};
use maplehelper::automation::variant::Variant;
use maplehelper::error::ConfigError;

fn noise(width: u32, height: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let v = (x.wrapping_mul(73856093) ^ y.wrapping_mul(19349663) ^ seed.wrapping_mul(83492791)) % 251;
        Luma([v as u8])
    })
}

fn write_references(dir: &Path, names: &[&str]) {
    for (i, name) in names.iter().enumerate() {
        noise(12, 8, i as u32 + 1)
            .save(dir.join(format!("{}.png", name)))
            .unwrap();
    }
}

#[test]
fn loads_a_complete_variant_with_builtin_hints() {
    let dir = tempfile::tempdir().unwrap();
    write_references(dir.path(), &required_references(Variant::Orbis));
    fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    let catalog = Catalog::load_dir(dir.path()).unwrap();
    catalog.require_variant(Variant::Orbis).unwrap();
    assert_eq!(catalog.len(), required_references(Variant::Orbis).len());

    let orbis = catalog.get("orbis").unwrap();
    assert_eq!((orbis.width(), orbis.height()), (12, 8));
    assert!(orbis.region().is_some());
    assert_eq!(catalog.get("orbis_wave_3").unwrap().group().unwrap().stage, Some(2));
    assert!(catalog.get("main_menu").unwrap().region().is_none());
}

#[test]
fn missing_reference_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<&str> = required_references(Variant::Ludibrium)
        .into_iter()
        .filter(|n| *n != "in_queue_ludi")
        .collect();
    write_references(dir.path(), &names);

    let catalog = Catalog::load_dir(dir.path()).unwrap();
    match catalog.require_variant(Variant::Ludibrium) {
        Err(ConfigError::MissingReference { name, variant }) => {
            assert_eq!(name, "in_queue_ludi");
            assert_eq!(variant, Variant::Ludibrium);
        }
        other => panic!("expected a missing reference, got {:?}", other),
    }
}

#[test]
fn manifest_adds_region_hints() {
    let dir = tempfile::tempdir().unwrap();
    write_references(dir.path(), &["confirm", "orbis"]);
    fs::write(
        dir.path().join(MANIFEST_FILE),
        r#"{ "references": { "confirm": { "region": [0.25, 0.5, 0.5, 0.5] } } }"#,
    )
    .unwrap();

    let catalog = Catalog::load_dir(dir.path()).unwrap();
    assert_eq!(catalog.get("confirm").unwrap().region(), Some((0.25, 0.5, 0.5, 0.5)));
    // builtin hints survive an unrelated manifest
    assert!(catalog.get("orbis").unwrap().region().is_some());
}

#[test]
fn malformed_manifest_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(MANIFEST_FILE), "{ not json").unwrap();
    assert!(matches!(Catalog::load_dir(dir.path()), Err(ConfigError::Parse { .. })));
}

#[test]
fn png_wins_over_other_formats_with_the_same_name() {
    let dir = tempfile::tempdir().unwrap();
    noise(10, 10, 1).save(dir.path().join("clear.png")).unwrap();
    noise(20, 20, 2).save(dir.path().join("clear.bmp")).unwrap();
    let catalog = Catalog::load_dir(dir.path()).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog.get("clear").unwrap().width(), 10);
}
