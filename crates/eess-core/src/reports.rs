//! Analytical lookups over the loaded schema.
//!
//! [`PriceReports`] has two backends with the same semantics: [`PgReports`]
//! runs SQL against Postgres and the in-memory one answers from a
//! [`Dataset`] before it is loaded. Ties resolve to the first-seen row
//! (lowest id) in both.

use std::fmt;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::Result;
use crate::geo::{haversine_km, EARTH_RADIUS_KM};
use crate::model::{Price, Station, StationKind};
use crate::normalize::Dataset;

pub const GASOLINA_95_E5: &str = "Gasolina 95 E5";
pub const GASOLEO_A: &str = "Gasóleo A";
pub const DEFAULT_PROVINCE: &str = "Madrid";
pub const DEFAULT_ORIGIN: GeoPoint = GeoPoint {
    lat: 38.994349,
    lon: -1.858542,
};
pub const DEFAULT_MAX_KM: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct OperatorCount {
    pub empresa: String,
    pub total: i64,
}

/// One station/fuel price with its location.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StationPrice {
    pub latitud: Option<Decimal>,
    pub longitud: Option<Decimal>,
    pub provincia: String,
    pub municipio: String,
    pub localidad: String,
    pub codigopostal: String,
    pub direccion: String,
    pub empresa: String,
    pub margen: String,
    pub carburante: String,
    pub precio: Decimal,
    /// Only set by the radius query.
    pub distancia: Option<f64>,
}

impl fmt::Display for StationPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {}, {} {} ({}, {}) | {} {} €/l",
            self.empresa,
            self.direccion,
            self.codigopostal,
            self.localidad,
            self.municipio,
            self.provincia,
            self.carburante,
            self.precio
        )?;
        if let Some(km) = self.distancia {
            write!(f, " | {:.2} km", km)?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait PriceReports: Send + Sync {
    /// Operator with the most stations of `kind`.
    async fn top_operator(&self, kind: StationKind) -> Result<Option<OperatorCount>>;

    async fn cheapest_in_province(&self, fuel: &str, province: &str) -> Result<Option<StationPrice>>;

    async fn most_expensive_by_kind(
        &self,
        fuel: &str,
        kind: StationKind,
    ) -> Result<Option<StationPrice>>;

    /// Cheapest `fuel` among stations at most `max_km` from `origin`.
    async fn nearest_cheapest(
        &self,
        origin: GeoPoint,
        fuel: &str,
        max_km: f64,
    ) -> Result<Option<StationPrice>>;
}

/// Answers to the five standing questions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub top_land_operator: Option<OperatorCount>,
    pub top_maritime_operator: Option<OperatorCount>,
    pub cheapest_gasolina_madrid: Option<StationPrice>,
    pub most_expensive_maritime_gasolina: Option<StationPrice>,
    pub cheapest_gasoleo_nearby: Option<StationPrice>,
}

pub async fn summary(reports: &dyn PriceReports) -> Result<Summary> {
    Ok(Summary {
        top_land_operator: reports.top_operator(StationKind::Land).await?,
        top_maritime_operator: reports.top_operator(StationKind::Maritime).await?,
        cheapest_gasolina_madrid: reports
            .cheapest_in_province(GASOLINA_95_E5, DEFAULT_PROVINCE)
            .await?,
        most_expensive_maritime_gasolina: reports
            .most_expensive_by_kind(GASOLINA_95_E5, StationKind::Maritime)
            .await?,
        cheapest_gasoleo_nearby: reports
            .nearest_cheapest(DEFAULT_ORIGIN, GASOLEO_A, DEFAULT_MAX_KM)
            .await?,
    })
}

// =============================================================================
// POSTGRES
// =============================================================================

const STATION_PRICE_FROM: &str = r#"
    FROM estaciones e
    JOIN localidades l ON l.id = e.localidad_id
    JOIN municipios m ON m.id = l.municipio_id
    JOIN provincias p ON p.id = m.provincia_id
    JOIN rotulos r ON r.id = e.rotulo_id
    JOIN precios pr ON pr.estacion_id = e.id
    JOIN carburantes c ON c.id = pr.carburante_id
"#;

const STATION_PRICE_COLUMNS: &str = r#"
    SELECT e.id AS estacion_id, e.latitud, e.longitud,
           p.nombre AS provincia, m.nombre AS municipio, l.nombre AS localidad,
           e.codigopostal, e.direccion, r.nombre AS empresa, e.margen,
           c.nombre AS carburante, pr.precio
"#;

pub struct PgReports {
    pool: PgPool,
}

impl PgReports {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn cheapest_sql() -> String {
        format!(
            "{}, NULL::float8 AS distancia {} WHERE p.nombre = $1 AND c.nombre = $2 \
             ORDER BY pr.precio ASC, e.id LIMIT 1",
            STATION_PRICE_COLUMNS, STATION_PRICE_FROM
        )
    }

    fn most_expensive_sql() -> String {
        format!(
            "{}, NULL::float8 AS distancia {} WHERE e.tipoestacion = $1 AND c.nombre = $2 \
             ORDER BY pr.precio DESC, e.id LIMIT 1",
            STATION_PRICE_COLUMNS, STATION_PRICE_FROM
        )
    }

    fn nearest_sql() -> String {
        format!(
            r#"
            WITH distancias AS (
                {columns},
                {radius} * 2 * asin(sqrt(LEAST(1.0,
                    power(sin(radians(e.latitud::float8 - $1) / 2), 2)
                    + cos(radians($1)) * cos(radians(e.latitud::float8))
                    * power(sin(radians(e.longitud::float8 - $2) / 2), 2)
                ))) AS distancia
                {from}
                WHERE c.nombre = $3 AND e.latitud IS NOT NULL AND e.longitud IS NOT NULL
            )
            SELECT * FROM distancias
            WHERE distancia <= $4
            ORDER BY precio ASC, estacion_id
            LIMIT 1
            "#,
            columns = STATION_PRICE_COLUMNS,
            radius = EARTH_RADIUS_KM,
            from = STATION_PRICE_FROM
        )
    }
}

#[async_trait]
impl PriceReports for PgReports {
    async fn top_operator(&self, kind: StationKind) -> Result<Option<OperatorCount>> {
        let row = sqlx::query_as::<_, OperatorCount>(
            r#"
            SELECT r.nombre AS empresa, COUNT(*) AS total
            FROM estaciones e
            JOIN rotulos r ON r.id = e.rotulo_id
            WHERE e.tipoestacion = $1
            GROUP BY r.id, r.nombre
            ORDER BY total DESC, r.id
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn cheapest_in_province(&self, fuel: &str, province: &str) -> Result<Option<StationPrice>> {
        let row = sqlx::query_as::<_, StationPrice>(&Self::cheapest_sql())
            .bind(province)
            .bind(fuel)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn most_expensive_by_kind(
        &self,
        fuel: &str,
        kind: StationKind,
    ) -> Result<Option<StationPrice>> {
        let row = sqlx::query_as::<_, StationPrice>(&Self::most_expensive_sql())
            .bind(kind.as_str())
            .bind(fuel)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn nearest_cheapest(
        &self,
        origin: GeoPoint,
        fuel: &str,
        max_km: f64,
    ) -> Result<Option<StationPrice>> {
        let row = sqlx::query_as::<_, StationPrice>(&Self::nearest_sql())
            .bind(origin.lat)
            .bind(origin.lon)
            .bind(fuel)
            .bind(max_km)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

impl Dataset {
    fn station(&self, id: i32) -> Option<&Station> {
        usize::try_from(id - 1).ok().and_then(|idx| self.stations.get(idx))
    }

    fn station_price(&self, station: &Station, price: &Price, distancia: Option<f64>) -> Option<StationPrice> {
        let registry = &self.registry;
        let locality = registry.localities.by_id(station.locality_id)?;
        let municipality = registry.municipalities.by_id(locality.municipality_id)?;
        let province = registry.provinces.by_id(municipality.province_id)?;
        let operator = registry.operators.by_id(station.operator_id)?;
        let fuel = registry.fuels.by_id(price.fuel_id)?;
        Some(StationPrice {
            latitud: station.latitude,
            longitud: station.longitude,
            provincia: province.name.clone(),
            municipio: municipality.name.clone(),
            localidad: locality.name.clone(),
            codigopostal: station.postal_code.clone(),
            direccion: station.address.clone(),
            empresa: operator.name.clone(),
            margen: station.margin.code().to_string(),
            carburante: fuel.name.clone(),
            precio: price.price,
            distancia,
        })
    }

    /// Prices of `fuel` with their station, in station order.
    fn fuel_prices<'a>(&'a self, fuel: &str) -> impl Iterator<Item = (&'a Station, &'a Price)> + 'a {
        let fuel_id = self.registry.fuels.get(fuel).map(|f| f.id);
        self.prices
            .iter()
            .filter(move |p| Some(p.fuel_id) == fuel_id)
            .filter_map(move |p| self.station(p.station_id).map(|s| (s, p)))
    }

    fn province_of(&self, station: &Station) -> Option<&str> {
        let locality = self.registry.localities.by_id(station.locality_id)?;
        let municipality = self.registry.municipalities.by_id(locality.municipality_id)?;
        self.registry
            .provinces
            .by_id(municipality.province_id)
            .map(|p| p.name.as_str())
    }
}

/// Keep the first candidate unless a later one is strictly better.
fn pick_first<T>(best: &mut Option<(T, Decimal)>, candidate: T, price: Decimal, better: fn(Decimal, Decimal) -> bool) {
    let replace = match best {
        Some((_, current)) => better(price, *current),
        None => true,
    };
    if replace {
        *best = Some((candidate, price));
    }
}

#[async_trait]
impl PriceReports for Dataset {
    async fn top_operator(&self, kind: StationKind) -> Result<Option<OperatorCount>> {
        let mut counts = vec![0i64; self.registry.operators.len()];
        for station in self.stations.iter().filter(|s| s.kind == kind) {
            if let Some(slot) = usize::try_from(station.operator_id - 1)
                .ok()
                .and_then(|idx| counts.get_mut(idx))
            {
                *slot += 1;
            }
        }

        let mut best: Option<(usize, i64)> = None;
        for (idx, &count) in counts.iter().enumerate() {
            if count > 0 && best.map_or(true, |(_, top)| count > top) {
                best = Some((idx, count));
            }
        }

        Ok(best.map(|(idx, total)| OperatorCount {
            empresa: self.registry.operators.entries()[idx].name.clone(),
            total,
        }))
    }

    async fn cheapest_in_province(&self, fuel: &str, province: &str) -> Result<Option<StationPrice>> {
        let mut best = None;
        for (station, price) in self.fuel_prices(fuel) {
            if self.province_of(station) == Some(province) {
                pick_first(&mut best, (station, price), price.price, |a, b| a < b);
            }
        }
        Ok(best.and_then(|((s, p), _)| self.station_price(s, p, None)))
    }

    async fn most_expensive_by_kind(
        &self,
        fuel: &str,
        kind: StationKind,
    ) -> Result<Option<StationPrice>> {
        let mut best = None;
        for (station, price) in self.fuel_prices(fuel).filter(|(s, _)| s.kind == kind) {
            pick_first(&mut best, (station, price), price.price, |a, b| a > b);
        }
        Ok(best.and_then(|((s, p), _)| self.station_price(s, p, None)))
    }

    async fn nearest_cheapest(
        &self,
        origin: GeoPoint,
        fuel: &str,
        max_km: f64,
    ) -> Result<Option<StationPrice>> {
        let mut best = None;
        for (station, price) in self.fuel_prices(fuel) {
            let (Some(lat), Some(lon)) = (
                station.latitude.and_then(|d| d.to_f64()),
                station.longitude.and_then(|d| d.to_f64()),
            ) else {
                continue;
            };
            let distance = haversine_km(lat, lon, origin.lat, origin.lon);
            if distance <= max_km {
                pick_first(&mut best, (station, price, distance), price.price, |a, b| a < b);
            }
        }
        Ok(best.and_then(|((s, p, d), _)| self.station_price(s, p, Some(d))))
    }
}
