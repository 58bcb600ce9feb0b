//! Column layouts of the land and maritime price files.
//!
//! Offsets live here as data, one table per station kind. A layout can be
//! replaced from a JSON file when the publisher shifts its columns.

use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};
use crate::model::StationKind;

/// Prefix stripped from price header cells to obtain the fuel name.
pub const FUEL_HEADER_PREFIX: &str = "Precio ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub kind: StationKind,
    pub province: usize,
    pub municipality: usize,
    pub locality: usize,
    pub postal_code: usize,
    pub address: usize,
    pub longitude: usize,
    pub latitude: usize,
    #[serde(default)]
    pub margin: Option<usize>,
    /// Absent for files without a timestamp column; rows get the processing time.
    #[serde(default)]
    pub price_date: Option<usize>,
    /// Price columns, end exclusive.
    pub fuel_columns: Range<usize>,
    pub operator: usize,
    pub schedule: usize,
    /// Absent when every row shares [`crate::model::LAND_SALE_TYPE`].
    #[serde(default)]
    pub sale_type: Option<usize>,
}

impl ColumnLayout {
    pub fn land() -> Self {
        Self {
            kind: StationKind::Land,
            province: 0,
            municipality: 1,
            locality: 2,
            postal_code: 3,
            address: 4,
            margin: Some(5),
            longitude: 6,
            latitude: 7,
            price_date: Some(8),
            fuel_columns: 9..24,
            operator: 24,
            schedule: 25,
            sale_type: None,
        }
    }

    pub fn maritime() -> Self {
        Self {
            kind: StationKind::Maritime,
            province: 0,
            municipality: 1,
            locality: 2,
            postal_code: 3,
            address: 4,
            margin: None,
            longitude: 6,
            latitude: 7,
            price_date: None,
            fuel_columns: 8..12,
            operator: 13,
            schedule: 15,
            sale_type: Some(14),
        }
    }

    pub fn for_kind(kind: StationKind) -> Self {
        match kind {
            StationKind::Land => Self::land(),
            StationKind::Maritime => Self::maritime(),
        }
    }

    /// Load a layout override; its `kind` must match the file it is applied to.
    pub fn from_json_file(path: &Path, kind: StationKind) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EtlError::io(path, e))?;
        let layout: ColumnLayout = serde_json::from_str(&content)?;
        if layout.kind != kind {
            return Err(EtlError::Layout(format!(
                "{} describes {} stations, expected {}",
                path.display(),
                layout.kind,
                kind
            )));
        }
        Ok(layout)
    }

    /// Highest column index any field refers to.
    pub fn max_index(&self) -> usize {
        [
            self.province,
            self.municipality,
            self.locality,
            self.postal_code,
            self.address,
            self.longitude,
            self.latitude,
            self.margin.unwrap_or(0),
            self.price_date.unwrap_or(0),
            self.fuel_columns.end.saturating_sub(1),
            self.operator,
            self.schedule,
            self.sale_type.unwrap_or(0),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Check the layout against a header row, once per file.
    pub fn validate(&self, header: &[String]) -> Result<()> {
        if self.fuel_columns.is_empty() {
            return Err(EtlError::Layout("fuel column range is empty".into()));
        }
        if self.max_index() >= header.len() {
            return Err(EtlError::Layout(format!(
                "{} layout needs {} columns, header has {}",
                self.kind,
                self.max_index() + 1,
                header.len()
            )));
        }
        Ok(())
    }

    /// Fuel names in column order, taken from the header row.
    pub fn fuel_names<'a>(&self, header: &'a [String]) -> Vec<&'a str> {
        header[self.fuel_columns.clone()]
            .iter()
            .map(|h| {
                let h = h.trim();
                h.strip_prefix(FUEL_HEADER_PREFIX).unwrap_or(h).trim()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    #[test]
    fn test_land_layout_fits_land_header() {
        let layout = ColumnLayout::land();
        assert_eq!(layout.max_index(), 25);
        assert!(layout.validate(&header(26)).is_ok());
        assert!(layout.validate(&header(25)).is_err());
    }

    #[test]
    fn test_maritime_layout_fits_maritime_header() {
        let layout = ColumnLayout::maritime();
        assert_eq!(layout.max_index(), 15);
        assert!(layout.validate(&header(16)).is_ok());
    }

    #[test]
    fn test_fuel_names_strip_prefix() {
        let mut h = header(26);
        h[9] = "Precio Gasolina 95 E5".into();
        h[10] = "Precio Gasóleo A".into();
        h[11] = "Biodiesel".into();
        let names = ColumnLayout::land().fuel_names(&h);
        assert_eq!(names.len(), 15);
        assert_eq!(names[0], "Gasolina 95 E5");
        assert_eq!(names[1], "Gasóleo A");
        assert_eq!(names[2], "Biodiesel");
    }

    #[test]
    fn test_layout_round_trips_through_json() {
        let json = serde_json::to_string(&ColumnLayout::maritime()).unwrap();
        assert!(json.contains("\"kind\":\"Maritima\""));
        let back: ColumnLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ColumnLayout::maritime());
    }

    fn shipped(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config")
            .join(name)
    }

    #[test]
    fn test_shipped_layout_files_match_builtins() {
        let land = ColumnLayout::from_json_file(&shipped("layout-terrestre.json"), StationKind::Land)
            .unwrap();
        assert_eq!(land, ColumnLayout::land());
        let sea =
            ColumnLayout::from_json_file(&shipped("layout-maritima.json"), StationKind::Maritime)
                .unwrap();
        assert_eq!(sea, ColumnLayout::maritime());
    }

    #[test]
    fn test_layout_file_kind_mismatch() {
        let err = ColumnLayout::from_json_file(&shipped("layout-maritima.json"), StationKind::Land)
            .unwrap_err();
        assert!(matches!(err, EtlError::Layout(_)));
    }

    #[test]
    fn test_empty_fuel_range_rejected() {
        let mut layout = ColumnLayout::land();
        layout.fuel_columns = 9..9;
        let err = layout.validate(&header(26)).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }
}
