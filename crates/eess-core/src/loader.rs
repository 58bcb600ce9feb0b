//! Batched persistence of a normalized [`Dataset`].
//!
//! Each table is written inside its own transaction, in fixed-size
//! multi-row `INSERT`s, and committed once at the end. A failing table
//! leaves earlier tables committed and its own transaction rolled back.

use std::collections::{BTreeMap, HashMap};

use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::model::{
    Fuel, Id, Locality, Municipality, Operator, Price, Province, SaleType, Station,
};
use crate::normalize::Dataset;

/// Target table of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableBinding {
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub batch_size: usize,
}

pub const PROVINCIAS: TableBinding = TableBinding {
    table: "provincias",
    columns: &["id", "nombre"],
    batch_size: 10,
};

pub const MUNICIPIOS: TableBinding = TableBinding {
    table: "municipios",
    columns: &["id", "nombre", "provincia_id"],
    batch_size: 500,
};

pub const LOCALIDADES: TableBinding = TableBinding {
    table: "localidades",
    columns: &["id", "nombre", "municipio_id"],
    batch_size: 500,
};

pub const CARBURANTES: TableBinding = TableBinding {
    table: "carburantes",
    columns: &["id", "nombre"],
    batch_size: 10,
};

pub const ROTULOS: TableBinding = TableBinding {
    table: "rotulos",
    columns: &["id", "nombre"],
    batch_size: 500,
};

pub const TIPO_VENTAS: TableBinding = TableBinding {
    table: "tipo_ventas",
    columns: &["id", "nombre"],
    batch_size: 5,
};

pub const ESTACIONES: TableBinding = TableBinding {
    table: "estaciones",
    columns: &[
        "id",
        "codigopostal",
        "latitud",
        "longitud",
        "localidad_id",
        "margen",
        "direccion",
        "fechaprecios",
        "horario",
        "tipoestacion",
        "tipoventa_id",
        "rotulo_id",
    ],
    batch_size: 500,
};

pub const PRECIOS: TableBinding = TableBinding {
    table: "precios",
    columns: &["estacion_id", "carburante_id", "precio"],
    batch_size: 500,
};

/// Load order; every table only references tables before it.
pub const LOAD_ORDER: [TableBinding; 8] = [
    PROVINCIAS,
    MUNICIPIOS,
    LOCALIDADES,
    CARBURANTES,
    ROTULOS,
    TIPO_VENTAS,
    ESTACIONES,
    PRECIOS,
];

/// Tables rewritten on every run, even when dimensions are kept.
pub const FACT_TABLES: [TableBinding; 2] = [ESTACIONES, PRECIOS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Insert every row; target tables are expected to be empty.
    #[default]
    Fast,
    /// Keep stored dimension rows and skip candidates already present by
    /// `nombre`. A stored row must carry the id this run assigned.
    CheckExisting,
}

/// A record that can be written as one `VALUES` tuple.
pub trait Insertable {
    /// Bind the row's values in [`TableBinding::columns`] order.
    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);

    /// Dimension rows are matched by name; facts have no natural key.
    const KEYED: bool = false;

    /// Surrogate id and name used by [`LoadMode::CheckExisting`].
    fn natural_key(&self) -> Option<(Id, &str)> {
        None
    }
}

macro_rules! insertable_named {
    ($ty:ty) => {
        impl Insertable for $ty {
            const KEYED: bool = true;

            fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
                row.push_bind(self.id).push_bind(self.name.clone());
            }

            fn natural_key(&self) -> Option<(Id, &str)> {
                Some((self.id, &self.name))
            }
        }
    };
}

insertable_named!(Province);
insertable_named!(Fuel);
insertable_named!(Operator);
insertable_named!(SaleType);

impl Insertable for Municipality {
    const KEYED: bool = true;

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id)
            .push_bind(self.name.clone())
            .push_bind(self.province_id);
    }

    fn natural_key(&self) -> Option<(Id, &str)> {
        Some((self.id, &self.name))
    }
}

impl Insertable for Locality {
    const KEYED: bool = true;

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id)
            .push_bind(self.name.clone())
            .push_bind(self.municipality_id);
    }

    fn natural_key(&self) -> Option<(Id, &str)> {
        Some((self.id, &self.name))
    }
}

impl Insertable for Station {
    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.id)
            .push_bind(self.postal_code.clone())
            .push_bind(self.latitude)
            .push_bind(self.longitude)
            .push_bind(self.locality_id)
            .push_bind(self.margin.code())
            .push_bind(self.address.clone())
            .push_bind(self.price_date)
            .push_bind(self.schedule.clone())
            .push_bind(self.kind.as_str())
            .push_bind(self.sale_type_id)
            .push_bind(self.operator_id);
    }
}

impl Insertable for Price {
    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.station_id)
            .push_bind(self.fuel_id)
            .push_bind(self.price);
    }
}

/// Collects rows and hands out a batch every `size` processed rows.
///
/// Skipped rows still count towards the flush cadence.
#[derive(Debug)]
pub struct BatchBuffer<'a, T> {
    size: usize,
    processed: usize,
    pending: Vec<&'a T>,
}

impl<'a, T> BatchBuffer<'a, T> {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            processed: 0,
            pending: Vec::with_capacity(size),
        }
    }

    pub fn push(&mut self, row: &'a T) -> Option<Vec<&'a T>> {
        self.pending.push(row);
        self.advance()
    }

    pub fn skip(&mut self) -> Option<Vec<&'a T>> {
        self.advance()
    }

    /// Remaining rows after the last full batch.
    pub fn finish(self) -> Option<Vec<&'a T>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }

    fn advance(&mut self) -> Option<Vec<&'a T>> {
        self.processed += 1;
        if self.processed % self.size == 0 && !self.pending.is_empty() {
            Some(std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.size),
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct LoadReport {
    pub inserted: usize,
    pub skipped: usize,
    pub batches: usize,
}

/// Build one multi-row insert for `rows`.
pub fn build_insert<T: Insertable>(binding: &TableBinding, rows: &[&T]) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        binding.table,
        binding.columns.join(", ")
    ));
    qb.push_values(rows.iter(), |mut b, row| row.push_binds(&mut b));
    qb
}

/// Batches of one table plus the candidates left out of them.
#[derive(Debug)]
pub struct LoadPlan<'a, T> {
    pub batches: Vec<Vec<&'a T>>,
    pub skipped: usize,
}

/// Split `rows` into insert batches, leaving out candidates already in
/// `stored` (name to persisted id).
///
/// A stored name under a different id is fatal: facts of this run point at
/// the run's own ids.
pub fn plan_batches<'a, T: Insertable>(
    rows: &'a [T],
    binding: &TableBinding,
    stored: Option<&HashMap<String, Id>>,
) -> Result<LoadPlan<'a, T>> {
    let mut buffer = BatchBuffer::new(binding.batch_size);
    let mut batches = Vec::new();
    let mut skipped = 0;

    for row in rows {
        let hit = match (stored, row.natural_key()) {
            (Some(stored), Some((id, name))) => match stored.get(name) {
                Some(&existing) if existing != id => {
                    return Err(EtlError::KeyConflict {
                        table: binding.table,
                        name: name.to_string(),
                        stored: existing,
                        candidate: id,
                    })
                }
                Some(_) => true,
                None => false,
            },
            _ => false,
        };

        let full = if hit {
            skipped += 1;
            buffer.skip()
        } else {
            buffer.push(row)
        };
        batches.extend(full);
    }
    batches.extend(buffer.finish());

    Ok(LoadPlan { batches, skipped })
}

async fn stored_keys(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    binding: &TableBinding,
) -> Result<HashMap<String, Id>> {
    let sql = format!("SELECT nombre, id FROM {}", binding.table);
    let rows: Vec<(String, Id)> = sqlx::query_as(&sql).fetch_all(&mut **tx).await?;
    Ok(rows.into_iter().collect())
}

/// Write `rows` to one table inside a single transaction.
pub async fn load_table<T: Insertable>(
    pool: &PgPool,
    rows: &[T],
    binding: &TableBinding,
    mode: LoadMode,
) -> Result<LoadReport> {
    let mut tx = pool.begin().await?;

    let stored = match mode {
        LoadMode::CheckExisting if T::KEYED => Some(stored_keys(&mut tx, binding).await?),
        _ => None,
    };
    let plan = plan_batches(rows, binding, stored.as_ref())?;

    let mut report = LoadReport {
        skipped: plan.skipped,
        ..LoadReport::default()
    };
    for batch in &plan.batches {
        build_insert(binding, batch).build().execute(&mut *tx).await?;
        report.inserted += batch.len();
        report.batches += 1;
        debug!(table = binding.table, rows = batch.len(), "flushed batch");
    }

    tx.commit().await?;
    info!(
        table = binding.table,
        inserted = report.inserted,
        skipped = report.skipped,
        batches = report.batches,
        "loaded table"
    );
    Ok(report)
}

/// Load every collection of `dataset` in [`LOAD_ORDER`].
pub async fn load_dataset(
    pool: &PgPool,
    dataset: &Dataset,
    mode: LoadMode,
) -> Result<BTreeMap<&'static str, LoadReport>> {
    let registry = &dataset.registry;
    let mut reports = BTreeMap::new();

    reports.insert(
        PROVINCIAS.table,
        load_table(pool, registry.provinces.entries(), &PROVINCIAS, mode).await?,
    );
    reports.insert(
        MUNICIPIOS.table,
        load_table(pool, registry.municipalities.entries(), &MUNICIPIOS, mode).await?,
    );
    reports.insert(
        LOCALIDADES.table,
        load_table(pool, registry.localities.entries(), &LOCALIDADES, mode).await?,
    );
    reports.insert(
        CARBURANTES.table,
        load_table(pool, registry.fuels.entries(), &CARBURANTES, mode).await?,
    );
    reports.insert(
        ROTULOS.table,
        load_table(pool, registry.operators.entries(), &ROTULOS, mode).await?,
    );
    reports.insert(
        TIPO_VENTAS.table,
        load_table(pool, registry.sale_types.entries(), &TIPO_VENTAS, mode).await?,
    );
    reports.insert(
        ESTACIONES.table,
        load_table(pool, &dataset.stations, &ESTACIONES, mode).await?,
    );
    reports.insert(
        PRECIOS.table,
        load_table(pool, &dataset.prices, &PRECIOS, mode).await?,
    );

    Ok(reports)
}

/// `DELETE` statements for `tables`, in reverse load order.
pub fn erase_statements(tables: &[TableBinding]) -> Vec<String> {
    tables
        .iter()
        .rev()
        .map(|binding| format!("DELETE FROM {}", binding.table))
        .collect()
}

async fn erase_tables(pool: &PgPool, tables: &[TableBinding]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut deleted = 0;
    for statement in erase_statements(tables) {
        deleted += sqlx::query(&statement).execute(&mut *tx).await?.rows_affected();
    }
    tx.commit().await?;
    Ok(deleted)
}

/// Empty every target table in one transaction.
pub async fn erase_all(pool: &PgPool) -> Result<u64> {
    let deleted = erase_tables(pool, &LOAD_ORDER).await?;
    info!(rows = deleted, "erased previous load");
    Ok(deleted)
}

/// Empty stations and prices only, keeping the stored dimensions.
pub async fn erase_facts(pool: &PgPool) -> Result<u64> {
    let deleted = erase_tables(pool, &FACT_TABLES).await?;
    info!(rows = deleted, "erased previous stations and prices");
    Ok(deleted)
}

/// Erase what `mode` reloads.
pub async fn erase_for(pool: &PgPool, mode: LoadMode) -> Result<u64> {
    match mode {
        LoadMode::Fast => erase_all(pool).await,
        LoadMode::CheckExisting => erase_facts(pool).await,
    }
}
