//! センサー計測データの読み込みと保存
//!
//! 計測値はJSON配列として保持します。固定荷重のケースでは `load` を省略できます。
//!
//! ```json
//! [
//!   { "x": 2.0, "y": 2.0, "load": 0.00948, "deflection": 0.00045886 }
//! ]
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// 1点のセンサー計測値（座標、荷重の大きさ、計測たわみ）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Measurement {
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<f32>,
    pub deflection: f32,
}

impl Measurement {
    pub fn new(x: f32, y: f32, deflection: f32) -> Self {
        Self {
            x,
            y,
            load: None,
            deflection,
        }
    }

    pub fn with_load(mut self, load: f32) -> Self {
        self.load = Some(load);
        self
    }
}

/// JSONファイルから計測値を読み込みます。
pub fn load_measurements(path: impl AsRef<Path>) -> Result<Vec<Measurement>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let items = serde_json::from_reader(reader)?;
    Ok(items)
}

/// 計測値をJSONファイルへ書き出します。
pub fn save_measurements(path: impl AsRef<Path>, measurements: &[Measurement]) -> Result<()> {
    let file = File::create(path.as_ref())?;
    serde_json::to_writer_pretty(BufWriter::new(file), measurements)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_records_with_and_without_load() {
        let json = r#"[
            { "x": 2.0, "y": 2.0, "deflection": 0.00045886 },
            { "x": 1.0, "y": 3.0, "load": 0.01, "deflection": 0.0002 }
        ]"#;
        let items: Vec<Measurement> = serde_json::from_str(json).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Measurement::new(2.0, 2.0, 0.00045886));
        assert_eq!(items[1].load, Some(0.01));
    }

    #[test]
    fn round_trips_through_file() {
        let dir = std::env::temp_dir().join(format!("plate_pinn_sensors_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sensors.json");
        let items = vec![Measurement::new(2.0, 2.0, 0.00045886).with_load(0.00948)];

        save_measurements(&path, &items).unwrap();
        let loaded = load_measurements(&path).unwrap();

        assert_eq!(loaded, items);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_measurements("does/not/exist.json").unwrap_err();
        assert!(matches!(err, crate::error::PinnError::Io(_)));
    }
}
