//! Fuel-price station ETL: file intake, normalization into a small relational
//! schema, batched loading into Postgres, price reports and search-index export.

pub mod error;
pub mod export;
pub mod geo;
pub mod layout;
pub mod loader;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod reports;
pub mod schema;
pub mod source;
pub mod telemetry;

pub use error::{EtlError, Result};
pub use layout::ColumnLayout;
pub use loader::{LoadMode, LoadReport};
pub use model::{MarginKind, StationKind};
pub use normalize::{Dataset, IngestSummary};
pub use reports::{GeoPoint, PgReports, PriceReports};
