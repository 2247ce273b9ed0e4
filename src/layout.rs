//! Where things land on disk: `<root>/<YYYY>/<YYYY-MM-DD>/` per acquisition date, holding
//! the scene metadata document, the raw asset and its COG rendition.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::provider::Scene;
use crate::record::AssetRecord;

const UNDATED_DIR: &str = "undated";

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct SceneMetadata {
    pub id: String,
    pub acquired: Option<String>,
    pub cloud_cover: Option<f64>,
    pub sun_azimuth: Option<f64>,
    pub sun_elevation: Option<f64>,
    pub view_angle: Option<f64>,
    pub satellite_id: Option<String>,
    pub ground_control: Option<bool>,
    pub item_type: Option<String>,
    pub quality_category: Option<String>,
}

impl SceneMetadata {
    pub fn from_scene(scene: &Scene) -> Self {
        let p = &scene.properties;
        let text = |k: &str| p.get(k).and_then(Value::as_str).map(str::to_string);
        let number = |k: &str| p.get(k).and_then(Value::as_f64);
        Self {
            id: scene.id.clone(),
            acquired: text("acquired"),
            cloud_cover: number("cloud_cover"),
            sun_azimuth: number("sun_azimuth"),
            sun_elevation: number("sun_elevation"),
            view_angle: number("view_angle"),
            satellite_id: text("satellite_id"),
            ground_control: p.get("ground_control").and_then(Value::as_bool),
            item_type: text("item_type").or_else(|| Some(scene.item_type.clone())),
            quality_category: text("quality_category"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn date_dir(&self, acquired: Option<DateTime<Utc>>) -> PathBuf {
        match acquired {
            Some(dt) => self
                .root
                .join(dt.format("%Y").to_string())
                .join(dt.format("%Y-%m-%d").to_string()),
            None => self.root.join(UNDATED_DIR),
        }
    }

    pub fn raw_path(&self, record: &AssetRecord) -> PathBuf {
        self.date_dir(record.acquired)
            .join(format!("{}_{}.tif", record.scene_id, record.asset_type))
    }

    pub fn converted_path(&self, record: &AssetRecord) -> PathBuf {
        self.date_dir(record.acquired)
            .join(format!("{}_{}_cog.tif", record.scene_id, record.asset_type))
    }

    pub fn metadata_path(&self, scene: &Scene) -> PathBuf {
        self.date_dir(scene.acquired)
            .join(format!("{}_metadata.json", scene.id))
    }

    pub fn write_metadata(self: &Self, scene: &Scene) -> Result<PathBuf> {
        let path = self.metadata_path(scene);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(&SceneMetadata::from_scene(scene))?;
        fs::write(&path, content)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AssetKey;
    use chrono::TimeZone;
    use serde_json::json;

    fn scene() -> Scene {
        Scene {
            id: "20240605_183012_44_24b4".to_string(),
            item_type: "PSScene".to_string(),
            acquired: Some(Utc.with_ymd_and_hms(2024, 6, 5, 18, 30, 12).unwrap()),
            cloud_cover: 12.0,
            asset_types: vec!["ortho_visual".to_string()],
            properties: json!({
                "acquired": "2024-06-05T18:30:12.440Z",
                "cloud_cover": 0.12,
                "sun_azimuth": 120.5,
                "satellite_id": "24b4",
                "ground_control": true,
                "item_type": "PSScene",
                "quality_category": "standard"
            }),
        }
    }

    #[test]
    fn test_paths_are_deterministic() {
        let layout = OutputLayout::new("/data");
        let s = scene();
        let record = AssetRecord::discovered(
            &AssetKey::new(&s.id, "ortho_visual"),
            "PSScene",
            s.acquired,
            s.cloud_cover,
            Utc::now(),
        );
        assert_eq!(
            layout.raw_path(&record),
            PathBuf::from("/data/2024/2024-06-05/20240605_183012_44_24b4_ortho_visual.tif")
        );
        assert_eq!(
            layout.converted_path(&record),
            PathBuf::from("/data/2024/2024-06-05/20240605_183012_44_24b4_ortho_visual_cog.tif")
        );
        assert_eq!(
            layout.metadata_path(&s),
            PathBuf::from("/data/2024/2024-06-05/20240605_183012_44_24b4_metadata.json")
        );
    }

    #[test]
    fn test_undated_records() {
        let layout = OutputLayout::new("/data");
        assert_eq!(layout.date_dir(None), PathBuf::from("/data/undated"));
    }

    #[test]
    fn test_write_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let path = layout.write_metadata(&scene()).unwrap();

        let written: SceneMetadata =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.id, "20240605_183012_44_24b4");
        assert_eq!(written.cloud_cover, Some(0.12));
        assert_eq!(written.ground_control, Some(true));
        assert_eq!(written.view_angle, None);
        assert_eq!(written.quality_category.as_deref(), Some("standard"));
    }
}
