//! Station documents for the search index and its bulk NDJSON format.

use std::collections::HashMap;
use std::io::Write;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use crate::error::{EtlError, Result};
use crate::normalize::Dataset;

pub const INDEX_NAME: &str = "estaciones";

/// Env vars holding the search endpoint base URL, in lookup order.
pub const SEARCH_URL_VARS: [&str; 2] = ["SEARCH_URL", "HOST_BONSAI_ELASTICSEARCH"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub carburante: String,
    pub precio: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StationDocument {
    pub empresa: String,
    pub direccion: String,
    pub codigo_postal: String,
    pub latitud: Option<Decimal>,
    pub longitud: Option<Decimal>,
    pub localidad: String,
    pub municipio: String,
    pub provincia: String,
    /// `yyyy-mm-dd`
    pub fecha_precios: String,
    pub horario: String,
    pub tipo_estacion: String,
    pub tipo_venta: String,
    pub margen: String,
    pub precios: Vec<PriceEntry>,
}

#[derive(Debug, sqlx::FromRow)]
struct StationRow {
    estacion_id: i32,
    empresa: String,
    direccion: String,
    codigopostal: String,
    latitud: Option<Decimal>,
    longitud: Option<Decimal>,
    localidad: String,
    municipio: String,
    provincia: String,
    fechaprecios: NaiveDateTime,
    horario: String,
    tipoestacion: String,
    tipo_venta: String,
    margen: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    estacion_id: i32,
    carburante: String,
    precio: Decimal,
}

fn price_date(at: NaiveDateTime) -> String {
    at.date().format("%Y-%m-%d").to_string()
}

/// Read every station with its prices from the store.
pub async fn fetch_station_documents(pool: &PgPool) -> Result<Vec<StationDocument>> {
    let stations: Vec<StationRow> = sqlx::query_as(
        r#"
        SELECT e.id AS estacion_id, r.nombre AS empresa, e.direccion, e.codigopostal,
               e.latitud, e.longitud, l.nombre AS localidad, m.nombre AS municipio,
               p.nombre AS provincia, e.fechaprecios, e.horario, e.tipoestacion,
               tv.nombre AS tipo_venta, e.margen
        FROM estaciones e
        JOIN localidades l ON l.id = e.localidad_id
        JOIN municipios m ON m.id = l.municipio_id
        JOIN provincias p ON p.id = m.provincia_id
        JOIN rotulos r ON r.id = e.rotulo_id
        JOIN tipo_ventas tv ON tv.id = e.tipoventa_id
        ORDER BY e.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let prices: Vec<PriceRow> = sqlx::query_as(
        r#"
        SELECT pr.estacion_id, c.nombre AS carburante, pr.precio
        FROM precios pr
        JOIN carburantes c ON c.id = pr.carburante_id
        ORDER BY pr.estacion_id, c.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut by_station: HashMap<i32, Vec<PriceEntry>> = HashMap::new();
    for row in prices {
        by_station.entry(row.estacion_id).or_default().push(PriceEntry {
            carburante: row.carburante,
            precio: row.precio,
        });
    }

    let documents: Vec<StationDocument> = stations
        .into_iter()
        .map(|s| StationDocument {
            precios: by_station.remove(&s.estacion_id).unwrap_or_default(),
            empresa: s.empresa,
            direccion: s.direccion,
            codigo_postal: s.codigopostal,
            latitud: s.latitud,
            longitud: s.longitud,
            localidad: s.localidad,
            municipio: s.municipio,
            provincia: s.provincia,
            fecha_precios: price_date(s.fechaprecios),
            horario: s.horario,
            tipo_estacion: s.tipoestacion,
            tipo_venta: s.tipo_venta,
            margen: s.margen,
        })
        .collect();

    info!(stations = documents.len(), "fetched station documents");
    Ok(documents)
}

impl Dataset {
    /// Same documents the store would yield after loading this dataset.
    pub fn station_documents(&self) -> Vec<StationDocument> {
        let registry = &self.registry;
        let mut by_station: HashMap<i32, Vec<PriceEntry>> = HashMap::new();
        for price in &self.prices {
            if let Some(fuel) = registry.fuels.by_id(price.fuel_id) {
                by_station.entry(price.station_id).or_default().push(PriceEntry {
                    carburante: fuel.name.clone(),
                    precio: price.price,
                });
            }
        }

        self.stations
            .iter()
            .filter_map(|station| {
                let locality = registry.localities.by_id(station.locality_id)?;
                let municipality = registry.municipalities.by_id(locality.municipality_id)?;
                let province = registry.provinces.by_id(municipality.province_id)?;
                let operator = registry.operators.by_id(station.operator_id)?;
                let sale_type = registry.sale_types.by_id(station.sale_type_id)?;
                Some(StationDocument {
                    empresa: operator.name.clone(),
                    direccion: station.address.clone(),
                    codigo_postal: station.postal_code.clone(),
                    latitud: station.latitude,
                    longitud: station.longitude,
                    localidad: locality.name.clone(),
                    municipio: municipality.name.clone(),
                    provincia: province.name.clone(),
                    fecha_precios: price_date(station.price_date),
                    horario: station.schedule.clone(),
                    tipo_estacion: station.kind.to_string(),
                    tipo_venta: sale_type.name.clone(),
                    margen: station.margin.code().to_string(),
                    precios: by_station.remove(&station.id).unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Write `{"index":{"_index":..}}` + document line pairs. Returns the document count.
pub fn write_bulk<W: Write>(writer: &mut W, index: &str, documents: &[StationDocument]) -> Result<usize> {
    let action = serde_json::json!({ "index": { "_index": index } });
    let action_line = serde_json::to_string(&action)?;
    for document in documents {
        writeln!(writer, "{}", action_line).map_err(|e| EtlError::io("<bulk output>", e))?;
        serde_json::to_writer(&mut *writer, document)?;
        writeln!(writer).map_err(|e| EtlError::io("<bulk output>", e))?;
    }
    Ok(documents.len())
}

/// Hand-authored example document for the document endpoint.
pub fn sample_document() -> StationDocument {
    StationDocument {
        empresa: "OIL EXPRESS".into(),
        direccion: "AVENIDA PRINCIPAL, 123".into(),
        codigo_postal: "12345".into(),
        latitud: Some(Decimal::new(40_123_456, 6)),
        longitud: Some(Decimal::new(-3_987_654, 6)),
        localidad: "CIUDAD DEL PETRÓLEO".into(),
        municipio: "PETROVILLE".into(),
        provincia: "PETROLANDIA".into(),
        fecha_precios: "2023-11-15".into(),
        horario: "L-D: 06:00 - 22:00".into(),
        tipo_estacion: "Urbana".into(),
        tipo_venta: "Gasolina y Diesel".into(),
        margen: "S".into(),
        precios: vec![
            PriceEntry {
                carburante: "gasolina 95".into(),
                precio: Decimal::new(1349, 3),
            },
            PriceEntry {
                carburante: "gasóleo A".into(),
                precio: Decimal::new(1199, 3),
            },
        ],
    }
}

/// Base URL of the search endpoint from the first set variable, without a trailing slash.
pub fn search_base_url<F>(lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    SEARCH_URL_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .find(|url| !url.is_empty())
        .ok_or_else(|| {
            EtlError::Config(format!("none of {} is set", SEARCH_URL_VARS.join(", ")))
        })
}
