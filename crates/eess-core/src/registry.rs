//! In-memory dimension registry for a single intake run.
//!
//! Each table hands out surrogate ids in first-sight order and returns the
//! existing entry for a name it has already seen (get-or-create). Nothing is
//! ever removed, and the registry is dropped once the run has been loaded.

use std::collections::HashMap;

use crate::model::{Fuel, Id, Locality, Municipality, Operator, Province, SaleType, UNKNOWN_ID};

/// A reference entity deduplicated by its natural key.
pub trait Dimension {
    fn natural_key(&self) -> &str;
    fn id(&self) -> Id;
    fn assign_id(&mut self, id: Id);
}

macro_rules! impl_dimension {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Dimension for $ty {
                fn natural_key(&self) -> &str {
                    &self.name
                }

                fn id(&self) -> Id {
                    self.id
                }

                fn assign_id(&mut self, id: Id) {
                    self.id = id;
                }
            }
        )*
    };
}

impl_dimension!(Province, Municipality, Locality, Operator, Fuel, SaleType);

/// Ordered, deduplicated collection of one dimension.
#[derive(Debug, Clone)]
pub struct DimensionTable<T> {
    entries: Vec<T>,
    by_key: HashMap<String, usize>,
}

impl<T> Default for DimensionTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<T: Dimension> DimensionTable<T> {
    /// Return the entry already registered under the candidate's key, or
    /// register the candidate with id `len + 1`.
    pub fn get_or_create(&mut self, mut candidate: T) -> &T {
        let existing = self.by_key.get(candidate.natural_key()).copied();
        let idx = match existing {
            Some(idx) => idx,
            None => {
                let idx = self.entries.len();
                candidate.assign_id(idx as Id + 1);
                self.by_key
                    .insert(candidate.natural_key().to_string(), idx);
                self.entries.push(candidate);
                idx
            }
        };
        &self.entries[idx]
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.by_key.get(name).map(|&idx| &self.entries[idx])
    }

    /// Id registered for `name`, or [`UNKNOWN_ID`].
    pub fn id_or_unknown(&self, name: &str) -> Id {
        self.get(name).map(Dimension::id).unwrap_or(UNKNOWN_ID)
    }

    pub fn by_id(&self, id: Id) -> Option<&T> {
        usize::try_from(id - 1).ok().and_then(|idx| self.entries.get(idx))
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All dimension tables of one run.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub provinces: DimensionTable<Province>,
    pub municipalities: DimensionTable<Municipality>,
    pub localities: DimensionTable<Locality>,
    pub operators: DimensionTable<Operator>,
    pub fuels: DimensionTable<Fuel>,
    pub sale_types: DimensionTable<SaleType>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn province(&mut self, name: &str) -> Id {
        self.provinces
            .get_or_create(Province {
                id: UNKNOWN_ID,
                name: name.to_string(),
            })
            .id
    }

    /// The owning province is resolved by name; it must have been registered first.
    pub fn municipality(&mut self, name: &str, province: &str) -> Id {
        let province_id = self.provinces.id_or_unknown(province);
        self.municipalities
            .get_or_create(Municipality {
                id: UNKNOWN_ID,
                name: name.to_string(),
                province_id,
            })
            .id
    }

    pub fn locality(&mut self, name: &str, municipality: &str, province: &str) -> Id {
        let province_id = self.provinces.id_or_unknown(province);
        let municipality_id = self.municipalities.id_or_unknown(municipality);
        self.localities
            .get_or_create(Locality {
                id: UNKNOWN_ID,
                name: name.to_string(),
                province_id,
                municipality_id,
            })
            .id
    }

    pub fn operator(&mut self, name: &str) -> Id {
        self.operators
            .get_or_create(Operator {
                id: UNKNOWN_ID,
                name: name.to_string(),
            })
            .id
    }

    pub fn fuel(&mut self, name: &str) -> Id {
        self.fuels
            .get_or_create(Fuel {
                id: UNKNOWN_ID,
                name: name.to_string(),
            })
            .id
    }

    pub fn sale_type(&mut self, name: &str) -> Id {
        self.sale_types
            .get_or_create(SaleType {
                id: UNKNOWN_ID,
                name: name.to_string(),
            })
            .id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_reuses_first_occurrence() {
        let mut table = DimensionTable::default();
        let first = table
            .get_or_create(Province {
                id: 0,
                name: "Madrid".into(),
            })
            .id;
        table.get_or_create(Province {
            id: 0,
            name: "Albacete".into(),
        });
        let again = table
            .get_or_create(Province {
                id: 99,
                name: "Madrid".into(),
            })
            .id;

        assert_eq!(first, 1);
        assert_eq!(again, 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.by_id(2).unwrap().name, "Albacete");
    }

    #[test]
    fn test_ids_follow_insertion_order() {
        let mut registry = Registry::new();
        assert_eq!(registry.operator("REPSOL"), 1);
        assert_eq!(registry.operator("CEPSA"), 2);
        assert_eq!(registry.operator("REPSOL"), 1);
        assert_eq!(registry.operator("BP"), 3);
        let names: Vec<_> = registry.operators.entries().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["REPSOL", "CEPSA", "BP"]);
    }

    #[test]
    fn test_children_resolve_registered_parents() {
        let mut registry = Registry::new();
        let madrid = registry.province("Madrid");
        let alcala = registry.municipality("Alcalá de Henares", "Madrid");
        let loc = registry.locality("Alcalá de Henares", "Alcalá de Henares", "Madrid");

        let municipality = registry.municipalities.by_id(alcala).unwrap();
        assert_eq!(municipality.province_id, madrid);
        let locality = registry.localities.by_id(loc).unwrap();
        assert_eq!(locality.municipality_id, alcala);
        assert_eq!(locality.province_id, madrid);
    }

    #[test]
    fn test_unresolved_parent_defaults_to_unknown() {
        let mut registry = Registry::new();
        let id = registry.municipality("Huérfano", "Nowhere");
        assert_eq!(registry.municipalities.by_id(id).unwrap().province_id, UNKNOWN_ID);
    }

    #[test]
    fn test_unique_by_name_keeps_first_parent() {
        let mut registry = Registry::new();
        registry.province("A");
        registry.province("B");
        let first = registry.municipality("Villanueva", "A");
        let second = registry.municipality("Villanueva", "B");
        assert_eq!(first, second);
        assert_eq!(registry.municipalities.by_id(first).unwrap().province_id, 1);
    }

    #[test]
    fn test_by_id_out_of_range() {
        let registry = Registry::new();
        assert!(registry.fuels.by_id(0).is_none());
        assert!(registry.fuels.by_id(1).is_none());
        assert!(registry.fuels.is_empty());
    }
}
