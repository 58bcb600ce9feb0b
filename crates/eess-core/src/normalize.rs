//! Row normalization: typed fields, dimension resolution and fact records.
//!
//! A run feeds every file through one [`Dataset`], so dimensions seen in the
//! land file are reused by the maritime file. Any non-empty cell that fails
//! to parse aborts the whole run.

use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{EtlError, Result};
use crate::layout::ColumnLayout;
use crate::model::{Id, MarginKind, Price, Station, LAND_SALE_TYPE};
use crate::registry::Registry;
use crate::source::{Record, SourceTable};

/// Source timestamp format, e.g. `15/11/2023 08:00`.
pub const PRICE_DATE_FORMAT: &str = "%d/%m/%Y %H:%M";

const POSTAL_CODE_DIGITS: usize = 5;

/// Registry plus the fact records produced by one run.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub registry: Registry,
    pub stations: Vec<Station>,
    pub prices: Vec<Price>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    pub rows: usize,
    pub stations: usize,
    pub prices: usize,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize every row of `table` with `layout`.
    pub fn ingest(
        &mut self,
        table: &SourceTable,
        layout: &ColumnLayout,
        processed_at: NaiveDateTime,
    ) -> Result<IngestSummary> {
        let stations_before = self.stations.len();
        let prices_before = self.prices.len();

        let mut normalizer = Normalizer::new(self, layout, &table.header, processed_at)?;
        for record in &table.rows {
            normalizer.normalize_row(record)?;
        }

        let summary = IngestSummary {
            rows: table.rows.len(),
            stations: self.stations.len() - stations_before,
            prices: self.prices.len() - prices_before,
        };
        info!(
            kind = %layout.kind,
            rows = summary.rows,
            stations = summary.stations,
            prices = summary.prices,
            "normalized file"
        );
        Ok(summary)
    }
}

/// Normalizes the rows of one file against a fixed layout.
pub struct Normalizer<'a> {
    dataset: &'a mut Dataset,
    layout: &'a ColumnLayout,
    /// Fuel id per price column, in layout order.
    fuel_ids: Vec<Id>,
    default_sale_type: Option<Id>,
    processed_at: NaiveDateTime,
}

impl<'a> Normalizer<'a> {
    /// Validates the layout against the header and registers the file's fuels.
    pub fn new(
        dataset: &'a mut Dataset,
        layout: &'a ColumnLayout,
        header: &[String],
        processed_at: NaiveDateTime,
    ) -> Result<Self> {
        layout.validate(header)?;

        let fuel_ids = layout
            .fuel_names(header)
            .into_iter()
            .map(|name| dataset.registry.fuel(name))
            .collect();

        let default_sale_type = match layout.sale_type {
            Some(_) => None,
            None => Some(dataset.registry.sale_type(LAND_SALE_TYPE)),
        };

        Ok(Self {
            dataset,
            layout,
            fuel_ids,
            default_sale_type,
            processed_at,
        })
    }

    /// Turn one row into a station plus a price per non-empty fuel cell.
    /// Returns the new station id.
    pub fn normalize_row(&mut self, record: &Record) -> Result<Id> {
        let layout = self.layout;
        let line = record.line;

        let province = cell(record, layout.province, "provincia")?;
        let municipality = cell(record, layout.municipality, "municipio")?;
        let locality = cell(record, layout.locality, "localidad")?;

        let registry = &mut self.dataset.registry;
        registry.province(province);
        registry.municipality(municipality, province);
        let locality_id = registry.locality(locality, municipality, province);

        let sale_type_id = match (layout.sale_type, self.default_sale_type) {
            (Some(idx), _) => registry.sale_type(cell(record, idx, "tipo venta")?),
            (None, Some(id)) => id,
            (None, None) => registry.sale_type(LAND_SALE_TYPE),
        };

        let operator_id = registry.operator(cell(record, layout.operator, "rotulo")?);

        let margin = match layout.margin {
            Some(idx) => {
                let raw = cell(record, idx, "margen")?;
                MarginKind::from_code(raw).ok_or_else(|| EtlError::InvalidMargin {
                    line,
                    value: raw.to_string(),
                })?
            }
            None => MarginKind::None,
        };

        let longitude = parse_decimal(cell(record, layout.longitude, "longitud")?, line, "longitud")?;
        let latitude = parse_decimal(cell(record, layout.latitude, "latitud")?, line, "latitud")?;

        let price_date = match layout.price_date {
            Some(idx) => parse_price_date(cell(record, idx, "toma de datos")?, line)?
                .unwrap_or(self.processed_at),
            None => self.processed_at,
        };

        let station_id = self.dataset.stations.len() as Id + 1;
        self.dataset.stations.push(Station {
            id: station_id,
            operator_id,
            longitude,
            latitude,
            postal_code: normalize_postal_code(cell(record, layout.postal_code, "codigo postal")?),
            address: cell(record, layout.address, "direccion")?.to_string(),
            locality_id,
            margin,
            schedule: cell(record, layout.schedule, "horario")?.to_string(),
            price_date,
            kind: layout.kind,
            sale_type_id,
        });

        for (offset, column) in layout.fuel_columns.clone().enumerate() {
            if let Some(price) = parse_decimal(cell(record, column, "precio")?, line, "precio")? {
                self.dataset.prices.push(Price {
                    station_id,
                    fuel_id: self.fuel_ids[offset],
                    price,
                });
            }
        }

        Ok(station_id)
    }
}

fn cell<'r>(record: &'r Record, index: usize, column: &'static str) -> Result<&'r str> {
    record
        .cells
        .get(index)
        .map(|c| c.trim())
        .ok_or(EtlError::MissingColumn {
            line: record.line,
            index,
            column,
        })
}

/// Parse a comma-decimal cell. Blank cells are absent, never zero.
pub fn parse_decimal(raw: &str, line: usize, column: &'static str) -> Result<Option<Decimal>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let invalid = || EtlError::InvalidNumber {
        line,
        column,
        value: raw.to_string(),
    };
    if !is_plain_number(raw) {
        return Err(invalid());
    }
    Decimal::from_str(&raw.replace(',', "."))
        .map(Some)
        .map_err(|_| invalid())
}

/// Optional sign, digits and at most one `,` or `.` separator.
fn is_plain_number(raw: &str) -> bool {
    let unsigned = raw.strip_prefix(|c| c == '-' || c == '+').unwrap_or(raw);
    let mut separators = 0;
    let mut digits = 0;
    for c in unsigned.chars() {
        match c {
            '0'..='9' => digits += 1,
            ',' | '.' => separators += 1,
            _ => return false,
        }
    }
    digits > 0 && separators <= 1
}

/// Spreadsheets store postal codes as numbers and drop the leading zero.
pub fn normalize_postal_code(raw: &str) -> String {
    let raw = raw.trim();
    if !raw.is_empty() && raw.len() < POSTAL_CODE_DIGITS && raw.bytes().all(|b| b.is_ascii_digit()) {
        format!("{:0>width$}", raw, width = POSTAL_CODE_DIGITS)
    } else {
        raw.to_string()
    }
}

/// Parse a `dd/mm/yyyy hh:mm` cell. Blank cells are absent.
pub fn parse_price_date(raw: &str, line: usize) -> Result<Option<NaiveDateTime>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(raw, PRICE_DATE_FORMAT)
        .map(Some)
        .map_err(|_| EtlError::InvalidDate {
            line,
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StationKind;
    use crate::source::parse_delimited;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    const LAND_CSV: &str = include_str!("../tests/fixtures/precios_terrestres.csv");
    const MARITIME_CSV: &str = include_str!("../tests/fixtures/precios_maritimas.csv");

    fn processed_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 16)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn land_dataset() -> Dataset {
        let mut dataset = Dataset::new();
        let table = parse_delimited(LAND_CSV).unwrap();
        dataset
            .ingest(&table, &ColumnLayout::land(), processed_at())
            .unwrap();
        dataset
    }

    fn record(cells: &[&str]) -> Record {
        Record {
            line: 2,
            cells: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    // -------------------------------------------------------------------------
    // FIELD PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_decimal_comma_separator() {
        assert_eq!(parse_decimal("1,349", 2, "precio").unwrap(), Some(dec!(1.349)));
        assert_eq!(parse_decimal("-3,703790", 2, "longitud").unwrap(), Some(dec!(-3.703790)));
        assert_eq!(parse_decimal("1.5", 2, "precio").unwrap(), Some(dec!(1.5)));
    }

    #[test]
    fn test_parse_decimal_blank_is_absent() {
        assert_eq!(parse_decimal("", 2, "latitud").unwrap(), None);
        assert_eq!(parse_decimal("   ", 2, "latitud").unwrap(), None);
    }

    #[test]
    fn test_parse_decimal_garbage_is_fatal() {
        let err = parse_decimal("1,3,4", 7, "precio").unwrap_err();
        assert!(matches!(err, EtlError::InvalidNumber { line: 7, column: "precio", .. }));
    }

    #[test]
    fn test_parse_decimal_rejects_digit_separators() {
        for raw in ["1_349", "1 349", "1e3", "--1", ",", "-"] {
            let err = parse_decimal(raw, 2, "precio").unwrap_err();
            assert!(
                matches!(err, EtlError::InvalidNumber { line: 2, .. }),
                "{raw} accepted"
            );
        }
    }

    #[test]
    fn test_parse_decimal_signed_and_dotted() {
        assert_eq!(parse_decimal("-1,85", 2, "longitud").unwrap(), Some(dec!(-1.85)));
        assert_eq!(parse_decimal("+40.4", 2, "latitud").unwrap(), Some(dec!(40.4)));
        assert_eq!(parse_decimal("2", 2, "precio").unwrap(), Some(dec!(2)));
    }

    #[test]
    fn test_postal_code_leading_zero_restored() {
        assert_eq!(normalize_postal_code("2001"), "02001");
        assert_eq!(normalize_postal_code("28001"), "28001");
        assert_eq!(normalize_postal_code(""), "");
        assert_eq!(normalize_postal_code("AD500"), "AD500");
    }

    #[test]
    fn test_parse_price_date() {
        let parsed = parse_price_date("15/11/2023 08:05", 2).unwrap().unwrap();
        assert_eq!(
            parsed,
            NaiveDate::from_ymd_opt(2023, 11, 15).unwrap().and_hms_opt(8, 5, 0).unwrap()
        );
        assert_eq!(parse_price_date("", 2).unwrap(), None);
        assert!(matches!(
            parse_price_date("2023-11-15", 3),
            Err(EtlError::InvalidDate { line: 3, .. })
        ));
    }

    // -------------------------------------------------------------------------
    // LAND FILE
    // -------------------------------------------------------------------------

    #[test]
    fn test_land_file_counts() {
        let dataset = land_dataset();
        assert_eq!(dataset.stations.len(), 7);
        assert_eq!(dataset.registry.provinces.len(), 2);
        assert_eq!(dataset.registry.fuels.len(), 15);
        assert_eq!(dataset.registry.sale_types.len(), 1);
        assert_eq!(dataset.registry.sale_types.entries()[0].name, LAND_SALE_TYPE);
        assert!(dataset.stations.iter().all(|s| s.kind == StationKind::Land));
    }

    #[test]
    fn test_madrid_gasolina_95_scenario() {
        let dataset = land_dataset();
        let registry = &dataset.registry;
        let station = &dataset.stations[0];

        let locality = registry.localities.by_id(station.locality_id).unwrap();
        let province = registry.provinces.by_id(locality.province_id).unwrap();
        assert_eq!(province.name, "Madrid");

        let e5 = registry.fuels.get("Gasolina 95 E5").unwrap().id;
        let price = dataset
            .prices
            .iter()
            .find(|p| p.station_id == station.id && p.fuel_id == e5)
            .unwrap();
        assert_eq!(price.price, dec!(1.349));
    }

    #[test]
    fn test_one_price_per_non_empty_cell() {
        let dataset = land_dataset();
        let first: Vec<_> = dataset.prices.iter().filter(|p| p.station_id == 1).collect();
        // Gasolina 95 E5 and Gasóleo A are the only filled cells on line 2
        assert_eq!(first.len(), 2);
        let total_filled = 2 + 2 + 1 + 2 + 1 + 1 + 1;
        assert_eq!(dataset.prices.len(), total_filled);
    }

    #[test]
    fn test_same_province_same_instance() {
        let dataset = land_dataset();
        let registry = &dataset.registry;
        let province_of = |station_id: Id| {
            let station = &dataset.stations[(station_id - 1) as usize];
            registry.localities.by_id(station.locality_id).unwrap().province_id
        };
        assert_eq!(province_of(1), province_of(2));
        assert_eq!(province_of(1), province_of(3));
        assert_eq!(province_of(4), province_of(7));
        assert_ne!(province_of(1), province_of(4));
    }

    #[test]
    fn test_missing_coordinates_are_null() {
        let dataset = land_dataset();
        let station = &dataset.stations[6];
        assert_eq!(station.latitude, None);
        assert_eq!(station.longitude, None);
        assert_eq!(dataset.stations[0].latitude, Some(dec!(40.420000)));
    }

    #[test]
    fn test_margin_and_date_fields() {
        let dataset = land_dataset();
        assert_eq!(dataset.stations[0].margin, MarginKind::Right);
        assert_eq!(dataset.stations[1].margin, MarginKind::Left);
        assert_eq!(dataset.stations[2].margin, MarginKind::None);
        assert_eq!(
            dataset.stations[0].price_date,
            NaiveDate::from_ymd_opt(2023, 11, 15).unwrap().and_hms_opt(8, 0, 0).unwrap()
        );
        assert_eq!(dataset.stations[0].schedule, "L-D: 24H");
    }

    // -------------------------------------------------------------------------
    // MARITIME FILE
    // -------------------------------------------------------------------------

    #[test]
    fn test_maritime_after_land_reuses_dimensions() {
        let mut dataset = land_dataset();
        let table = parse_delimited(MARITIME_CSV).unwrap();
        let summary = dataset
            .ingest(&table, &ColumnLayout::maritime(), processed_at())
            .unwrap();

        assert_eq!(summary.stations, 3);
        assert_eq!(dataset.stations.len(), 10);
        // maritime fuel columns are all already known from the land header
        assert_eq!(dataset.registry.fuels.len(), 15);
        assert_eq!(dataset.registry.sale_types.len(), 3);
        // CEPSA appears in both files
        assert_eq!(
            dataset.registry.operators.entries().iter().filter(|o| o.name == "CEPSA").count(),
            1
        );

        let maritime = &dataset.stations[7];
        assert_eq!(maritime.id, 8);
        assert_eq!(maritime.kind, StationKind::Maritime);
        assert_eq!(maritime.margin, MarginKind::None);
        assert_eq!(maritime.price_date, processed_at());
        let sale_type = dataset.registry.sale_types.by_id(maritime.sale_type_id).unwrap();
        assert_eq!(sale_type.name, "Embarcaciones");
    }

    // -------------------------------------------------------------------------
    // FAILURES
    // -------------------------------------------------------------------------

    #[test]
    fn test_unknown_margin_is_fatal() {
        let mut csv = LAND_CSV.to_string();
        csv = csv.replacen(";D;", ";X;", 1);
        let table = parse_delimited(&csv).unwrap();
        let err = Dataset::new()
            .ingest(&table, &ColumnLayout::land(), processed_at())
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidMargin { line: 2, .. }));
    }

    #[test]
    fn test_bad_price_is_fatal() {
        let csv = LAND_CSV.replacen("1,349", "uno", 1);
        let table = parse_delimited(&csv).unwrap();
        let err = Dataset::new()
            .ingest(&table, &ColumnLayout::land(), processed_at())
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidNumber { column: "precio", .. }));
    }

    #[test]
    fn test_short_header_is_layout_error() {
        let table = parse_delimited("Provincia;Municipio\nMadrid;Madrid\n").unwrap();
        let err = Dataset::new()
            .ingest(&table, &ColumnLayout::land(), processed_at())
            .unwrap_err();
        assert!(matches!(err, EtlError::Layout(_)));
    }

    #[test]
    fn test_short_row_is_missing_column() {
        let table = parse_delimited(LAND_CSV).unwrap();
        let mut dataset = Dataset::new();
        let layout = ColumnLayout::land();
        let mut normalizer =
            Normalizer::new(&mut dataset, &layout, &table.header, processed_at()).unwrap();
        let err = normalizer
            .normalize_row(&record(&["Madrid", "Madrid", "Madrid"]))
            .unwrap_err();
        // the operator column is the first one past the three present cells
        assert!(matches!(
            err,
            EtlError::MissingColumn {
                index: 24,
                column: "rotulo",
                ..
            }
        ));
    }
}
