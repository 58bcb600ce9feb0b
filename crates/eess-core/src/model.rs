//! Dimension entities, fact records and the closed enumerations they carry.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EtlError;

/// Surrogate identifier assigned on first sight (1-based, per collection).
pub type Id = i32;

/// Foreign key used when a parent cannot be resolved by name.
pub const UNKNOWN_ID: Id = 0;

/// Sale type shared by every land station of a run.
pub const LAND_SALE_TYPE: &str = "Vehículos terrestres";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationKind {
    #[serde(rename = "Terrestre")]
    Land,
    #[serde(rename = "Maritima")]
    Maritime,
}

impl StationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StationKind::Land => "Terrestre",
            StationKind::Maritime => "Maritima",
        }
    }
}

impl fmt::Display for StationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StationKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "terrestre" | "land" => Ok(StationKind::Land),
            "maritima" | "marítima" | "maritime" => Ok(StationKind::Maritime),
            _ => Err(EtlError::InvalidStationKind(s.to_string())),
        }
    }
}

/// Side of the road the station sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarginKind {
    Left,
    Right,
    None,
}

impl MarginKind {
    /// One-letter code used by the source files and the `margen` column.
    pub fn code(self) -> &'static str {
        match self {
            MarginKind::Left => "I",
            MarginKind::Right => "D",
            MarginKind::None => "N",
        }
    }

    /// `None` when the code is not one of I, D, N or blank.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" | "i" => Some(MarginKind::Left),
            "D" | "d" => Some(MarginKind::Right),
            "N" | "n" | "" => Some(MarginKind::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Province {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Municipality {
    pub id: Id,
    pub name: String,
    pub province_id: Id,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locality {
    pub id: Id,
    pub name: String,
    pub province_id: Id,
    pub municipality_id: Id,
}

/// Brand shown on the station canopy (rótulo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fuel {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleType {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: Id,
    pub operator_id: Id,
    pub longitude: Option<Decimal>,
    pub latitude: Option<Decimal>,
    pub postal_code: String,
    pub address: String,
    pub locality_id: Id,
    pub margin: MarginKind,
    pub schedule: String,
    pub price_date: NaiveDateTime,
    pub kind: StationKind,
    pub sale_type_id: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Price {
    pub station_id: Id,
    pub fuel_id: Id,
    pub price: Decimal,
}
