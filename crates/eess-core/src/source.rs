//! Raw input files: semicolon CSV or spreadsheet exports, flattened to text rows.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, DataType, Reader};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{EtlError, Result};

/// First header cell of every price file; marks the header row in spreadsheets.
const HEADER_MARKER: &str = "Provincia";

/// One data row with its 1-based line (or sheet row) number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub line: usize,
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    pub header: Vec<String>,
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: usize,
    pub table: SourceTable,
}

/// Read a price file, picking the parser from its extension.
pub fn read_source(path: &Path) -> Result<SourceFile> {
    let bytes = std::fs::read(path).map_err(|e| EtlError::io(path, e))?;
    let content_hash = content_digest(&bytes);
    info!(
        path = %path.display(),
        size_bytes = bytes.len(),
        hash = %content_hash,
        "read input file"
    );

    let table = if is_spreadsheet(path) {
        parse_spreadsheet(path)?
    } else {
        parse_delimited(&decode_text(&bytes))?
    };
    debug!(columns = table.header.len(), rows = table.rows.len(), "parsed input file");

    Ok(SourceFile {
        path: path.to_path_buf(),
        content_hash,
        size_bytes: bytes.len(),
        table,
    })
}

pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

pub fn is_spreadsheet(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("xls" | "xlsx" | "xlsb" | "ods")
    )
}

/// UTF-8 (BOM stripped) when valid, Windows-1252 otherwise.
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Cow::Borrowed(s.strip_prefix('\u{feff}').unwrap_or(s)),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded
        }
    }
}

/// Parse semicolon-delimited text with a header row.
pub fn parse_delimited(content: &str) -> Result<SourceTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let header: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(idx + 2);
        rows.push(Record {
            line,
            cells: record.iter().map(|c| c.to_string()).collect(),
        });
    }

    Ok(SourceTable { header, rows })
}

/// Parse the first sheet of a workbook; rows above the header are skipped.
pub fn parse_spreadsheet(path: &Path) -> Result<SourceTable> {
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).map_err(|e| EtlError::Spreadsheet(e.to_string()))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| EtlError::Spreadsheet("workbook has no sheets".into()))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| EtlError::Spreadsheet(e.to_string()))?;

    let mut rows_iter = range.rows().enumerate();
    let header = loop {
        match rows_iter.next() {
            Some((_, row)) if row.first().map(cell_text).as_deref() == Some(HEADER_MARKER) => {
                break row.iter().map(cell_text).collect::<Vec<_>>();
            }
            Some(_) => continue,
            None => {
                return Err(EtlError::Spreadsheet(format!(
                    "no header row starting with '{}' in sheet '{}'",
                    HEADER_MARKER, sheet_name
                )))
            }
        }
    };

    let rows = rows_iter
        .filter(|(_, row)| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|(idx, row)| Record {
            line: idx + 1,
            cells: row.iter().map(cell_text).collect(),
        })
        .collect();

    Ok(SourceTable { header, rows })
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::DateTime(_) | Data::DateTimeIso(_) => match cell.as_datetime() {
            Some(dt) => dt.format("%d/%m/%Y %H:%M").to_string(),
            None => cell.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{ExcelDateTime, ExcelDateTimeType};

    #[test]
    fn test_parse_delimited_semicolons_and_lines() {
        let csv = "Provincia;Municipio;Precio\nMadrid;Madrid;1,349\nAlbacete;Albacete;\n";
        let table = parse_delimited(csv).unwrap();
        assert_eq!(table.header, ["Provincia", "Municipio", "Precio"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].line, 2);
        assert_eq!(table.rows[0].cells[2], "1,349");
        assert_eq!(table.rows[1].line, 3);
        assert_eq!(table.rows[1].cells[2], "");
    }

    #[test]
    fn test_parse_delimited_trims_cells() {
        let table = parse_delimited("a;b\n  x ; y  \n").unwrap();
        assert_eq!(table.rows[0].cells, ["x", "y"]);
    }

    #[test]
    fn test_decode_text_strips_bom() {
        let bytes = "\u{feff}Provincia;Municipio".as_bytes();
        assert_eq!(decode_text(bytes), "Provincia;Municipio");
    }

    #[test]
    fn test_decode_text_falls_back_to_windows_1252() {
        // "Gasóleo" with ó encoded as 0xF3
        let bytes = b"Gas\xf3leo A";
        assert_eq!(decode_text(bytes), "Gasóleo A");
    }

    #[test]
    fn test_content_digest_is_stable() {
        let a = content_digest(b"abc");
        assert_eq!(
            a,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(a, content_digest(b"abc"));
    }

    #[test]
    fn test_is_spreadsheet() {
        assert!(is_spreadsheet(Path::new("precios.xls")));
        assert!(is_spreadsheet(Path::new("precios.XLSX")));
        assert!(!is_spreadsheet(Path::new("precios.csv")));
        assert!(!is_spreadsheet(Path::new("precios")));
    }

    // -------------------------------------------------------------------------
    // SPREADSHEETS
    // -------------------------------------------------------------------------

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_cell_text_scalars() {
        assert_eq!(cell_text(&Data::Empty), "");
        assert_eq!(cell_text(&Data::String("  REPSOL ".into())), "REPSOL");
        assert_eq!(cell_text(&Data::Float(1.349)), "1.349");
        assert_eq!(cell_text(&Data::Float(2001.0)), "2001");
        assert_eq!(cell_text(&Data::Int(28001)), "28001");
    }

    #[test]
    fn test_cell_text_dates_use_price_date_format() {
        // 45245 is 2023-11-15 in the 1900 date system
        let serial = ExcelDateTime::new(45245.0 + 8.0 / 24.0, ExcelDateTimeType::DateTime, false);
        assert_eq!(cell_text(&Data::DateTime(serial)), "15/11/2023 08:00");
        assert_eq!(
            cell_text(&Data::DateTimeIso("2023-11-15T09:30:00".into())),
            "15/11/2023 09:30"
        );
    }

    #[test]
    fn test_parse_spreadsheet_skips_rows_above_header() {
        let table = parse_spreadsheet(&fixture("precios_terrestres.xlsx")).unwrap();
        assert_eq!(table.header.len(), 26);
        assert_eq!(table.header[0], HEADER_MARKER);
        assert_eq!(table.header[24], "Rótulo");
        assert_eq!(table.rows.len(), 2);
        // sheet rows 1-3 are a title, a date line and a blank row
        assert_eq!(table.rows[0].line, 5);
        assert_eq!(table.rows[0].cells[3], "2001");
        assert_eq!(table.rows[0].cells[9], "1.459");
        assert_eq!(table.rows[0].cells[10], "");
        assert_eq!(table.rows[1].cells[24], "CEPSA");
    }

    #[test]
    fn test_read_source_picks_spreadsheet_parser() {
        let file = read_source(&fixture("precios_terrestres.xlsx")).unwrap();
        assert!(file.content_hash.starts_with("sha256:"));
        assert_eq!(file.table.rows.len(), 2);
    }

    #[test]
    fn test_non_workbook_is_spreadsheet_error() {
        let err = parse_spreadsheet(&fixture("precios_terrestres.csv")).unwrap_err();
        assert!(matches!(err, EtlError::Spreadsheet(_)));
    }

    #[test]
    fn test_read_source_missing_file_is_io_error() {
        let err = read_source(Path::new("/nonexistent/precios.csv")).unwrap_err();
        assert!(matches!(err, EtlError::Io { .. }));
    }
}
