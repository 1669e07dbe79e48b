use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::automation::variant::Variant;
use crate::device::coords::{is_normalized, NormRect};
use crate::error::ConfigError;

/// Names of the references shared by every variant.
pub mod refs {
    pub const APP_BUTTON: &str = "app_button";
    pub const MAIN_MENU: &str = "main_menu";
    pub const PQ_BUTTON: &str = "pq_button";
    pub const START_QUEUE: &str = "start_queue";
    pub const STOP_QUEUE: &str = "stop_queue";
    pub const CONFIRM: &str = "confirm";
    pub const CLEAR: &str = "clear";
    pub const FAILED: &str = "failed";
    pub const JUMP: &str = "jump";
    pub const RED_ALERT: &str = "red_alert";
    pub const LOST_CONNECTION: &str = "lost_connection";
    pub const EVENT: &str = "event";
    pub const LEAVE_PARTY: &str = "leave_party";
    pub const EXIT: &str = "exit";
    /// "Clear all" button of the Android recent-apps screen.
    pub const CLEAR_ALL: &str = "clear_all";
    pub const LOADING_SCREENS: [&str; 5] = [
        "loading_screen",
        "loading_screen2",
        "loading_screen3",
        "loading_screen4",
        "loading_screen5",
    ];
}

/// Manifest file inside the templates directory.
pub const MANIFEST_FILE: &str = "catalog.json";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Which variant (and optionally which stage of it) a reference belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantGroup {
    pub variant: Variant,
    pub stage: Option<usize>,
}

/// A named reference image, immutable once loaded.
#[derive(Debug, Clone)]
pub struct ReferenceAppearance {
    name: String,
    pixels: GrayImage,
    region: Option<NormRect>,
    group: Option<VariantGroup>,
}

impl ReferenceAppearance {
    pub fn new(name: impl Into<String>, pixels: GrayImage) -> Result<Self, ConfigError> {
        let name = name.into();
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(ConfigError::EmptyReference(name));
        }
        Ok(Self {
            name,
            pixels,
            region: None,
            group: None,
        })
    }

    pub fn with_region(mut self, region: NormRect) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_group(mut self, group: VariantGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn region(&self) -> Option<NormRect> {
        self.region
    }

    pub fn group(&self) -> Option<VariantGroup> {
        self.group
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMeta {
    #[serde(default)]
    pub region: Option<NormRect>,
    #[serde(default)]
    pub variant: Option<Variant>,
    #[serde(default)]
    pub stage: Option<usize>,
}

impl ReferenceMeta {
    /// Fields set in `other` win; unset ones keep their current value.
    fn overlay(&mut self, other: ReferenceMeta) {
        self.region = other.region.or(self.region);
        self.variant = other.variant.or(self.variant);
        self.stage = other.stage.or(self.stage);
    }
}

/// Region hints and variant groupings, keyed by reference name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceManifest {
    #[serde(default)]
    pub references: BTreeMap<String, ReferenceMeta>,
}

impl ReferenceManifest {
    /// Hints every install gets without a manifest file: variant cards are
    /// confined to their third of the screen, stage banners are grouped.
    pub fn builtin() -> Self {
        let mut references = BTreeMap::new();
        for variant in Variant::ALL {
            let descriptor = variant.descriptor();
            references.insert(
                descriptor.indicator.to_string(),
                ReferenceMeta {
                    region: Some(descriptor.indicator_region),
                    variant: Some(variant),
                    stage: None,
                },
            );
            for (stage, name) in descriptor.stages.iter().enumerate() {
                references.insert(
                    name.to_string(),
                    ReferenceMeta {
                        region: None,
                        variant: Some(variant),
                        stage: Some(stage),
                    },
                );
            }
        }
        Self { references }
    }

    /// Built-in hints overlaid with `dir/catalog.json` when it exists.
    pub fn load_or_builtin(dir: &Path) -> Result<Self, ConfigError> {
        let mut manifest = Self::builtin();
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(manifest);
        }
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let overrides: ReferenceManifest =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        overrides.validate()?;
        for (name, meta) in overrides.references {
            manifest.references.entry(name).or_default().overlay(meta);
        }
        log::info!("Loaded reference manifest from {}", path.display());
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, meta) in &self.references {
            if let Some((x, y, w, h)) = meta.region {
                let ok = [x, y, w, h].into_iter().all(is_normalized) && w > 0.0 && h > 0.0;
                if !ok {
                    return Err(ConfigError::invalid(
                        "catalog region",
                        format!("'{}' has region {:?} outside the unit square", name, meta.region),
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply(&self, reference: ReferenceAppearance) -> ReferenceAppearance {
        let Some(meta) = self.references.get(reference.name()) else {
            return reference;
        };
        let mut reference = reference;
        if let Some(region) = meta.region {
            reference = reference.with_region(region);
        }
        if let Some(variant) = meta.variant {
            reference = reference.with_group(VariantGroup {
                variant,
                stage: meta.stage,
            });
        }
        reference
    }
}

/// References required for a variant to run at all.
pub fn required_references(variant: Variant) -> Vec<&'static str> {
    let descriptor = variant.descriptor();
    let mut names = vec![
        refs::MAIN_MENU,
        refs::PQ_BUTTON,
        refs::START_QUEUE,
        refs::STOP_QUEUE,
        refs::CONFIRM,
        refs::CLEAR,
        descriptor.indicator,
        descriptor.queue_indicator,
    ];
    names.extend_from_slice(descriptor.stages);
    names
}

/// Name-addressable, immutable set of reference appearances.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    references: Vec<ReferenceAppearance>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Builds a catalog; the first reference with a given name wins.
    pub fn new(references: Vec<ReferenceAppearance>) -> Self {
        let mut catalog = Self::default();
        for reference in references {
            if catalog.index.contains_key(reference.name()) {
                log::warn!("Duplicate reference '{}' ignored", reference.name());
                continue;
            }
            catalog
                .index
                .insert(reference.name().to_string(), catalog.references.len());
            catalog.references.push(reference);
        }
        catalog
    }

    /// Loads every image in `dir` (name = file stem) and applies the manifest.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let manifest = ReferenceManifest::load_or_builtin(dir)?;
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();
            let Some(rank) = extension_rank(&path) else {
                continue;
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            files.push((stem.to_string(), rank, path));
        }
        // png beats jpg beats bmp when the same name exists twice
        files.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut references = Vec::with_capacity(files.len());
        for (name, _, path) in files {
            let pixels = image::open(&path)
                .map_err(|source| ConfigError::Image {
                    path: path.clone(),
                    source,
                })?
                .to_luma8();
            let reference = ReferenceAppearance::new(name, pixels)?;
            log::debug!("Loaded reference: {}", reference.name());
            references.push(manifest.apply(reference));
        }

        let catalog = Self::new(references);
        log::info!("Loaded {} references from {}", catalog.len(), dir.display());
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&ReferenceAppearance> {
        self.index.get(name).map(|&i| &self.references[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Fails fast when a reference the variant depends on is missing.
    pub fn require_variant(&self, variant: Variant) -> Result<(), ConfigError> {
        match required_references(variant)
            .into_iter()
            .find(|name| !self.contains(name))
        {
            Some(name) => Err(ConfigError::MissingReference {
                name: name.to_string(),
                variant,
            }),
            None => Ok(()),
        }
    }
}

fn extension_rank(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().position(|e| *e == ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pattern;

    #[test]
    fn empty_reference_is_rejected() {
        let err = ReferenceAppearance::new("empty", GrayImage::new(0, 3)).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyReference(name) if name == "empty"));
    }

    #[test]
    fn builtin_manifest_confines_orbis_to_right_third() {
        let manifest = ReferenceManifest::builtin();
        let orbis = &manifest.references["orbis"];
        assert_eq!(orbis.variant, Some(Variant::Orbis));
        let (x, _, w, _) = orbis.region.unwrap();
        assert!((x - 2.0 / 3.0).abs() < 1e-4 && (x + w - 1.0).abs() < 1e-4);
        assert_eq!(manifest.references["ludibrium_wave_33"].stage, Some(2));
    }

    #[test]
    fn first_duplicate_wins() {
        let a = ReferenceAppearance::new("a", pattern(4, 4, 1)).unwrap();
        let b = ReferenceAppearance::new("a", pattern(6, 6, 2)).unwrap();
        let catalog = Catalog::new(vec![a, b]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().width(), 4);
    }

    #[test]
    fn missing_required_reference_names_the_first_gap() {
        let catalog = Catalog::new(vec![ReferenceAppearance::new("main_menu", pattern(4, 4, 1)).unwrap()]);
        let err = catalog.require_variant(Variant::Orbis).unwrap_err();
        assert!(matches!(err, ConfigError::MissingReference { ref name, variant: Variant::Orbis } if name == "pq_button"));
    }

    #[test]
    fn manifest_entry_only_replaces_the_fields_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{ "references": { "orbis": { "stage": 0 }, "jump": { "region": [0.5, 0.5, 0.5, 0.5] } } }"#,
        )
        .unwrap();
        let manifest = ReferenceManifest::load_or_builtin(dir.path()).unwrap();
        let orbis = &manifest.references["orbis"];
        assert_eq!(orbis.region, Some(Variant::Orbis.descriptor().indicator_region));
        assert_eq!(orbis.variant, Some(Variant::Orbis));
        assert_eq!(orbis.stage, Some(0));
        assert_eq!(manifest.references["jump"].region, Some((0.5, 0.5, 0.5, 0.5)));
    }

    #[test]
    fn manifest_rejects_out_of_range_regions() {
        let mut manifest = ReferenceManifest::default();
        manifest.references.insert(
            "bad".to_string(),
            ReferenceMeta {
                region: Some((0.5, 0.0, 1.5, 1.0)),
                ..Default::default()
            },
        );
        assert!(manifest.validate().is_err());
    }
}
