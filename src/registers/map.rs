use log::info;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::codec::{EncodingKind, REGISTERS_PER_VALUE};
use crate::storage::models::MappingRow;
use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub wellhead_id: String,
    pub parameter_code: String,
    pub parameter_id: String,
    pub mapping_id: i64,
    pub address: u16,
    pub kind: EncodingKind,
}

impl MapEntry {
    pub fn end(&self) -> u32 {
        self.address as u32 + REGISTERS_PER_VALUE as u32
    }
}

/// Entries are in ascending address order and no two share a register.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    entries: Vec<MapEntry>,
    index: HashMap<String, HashMap<String, usize>>,
}

impl RegisterMap {
    pub fn build<I>(rows: I) -> Result<Self, TelemetryError>
    where
        I: IntoIterator<Item = MappingRow>,
    {
        let mut entries = Vec::new();
        for row in rows.into_iter().filter(|row| row.active) {
            entries.push(Self::entry_from_row(row)?);
        }

        if entries.is_empty() {
            return Err(TelemetryError::EmptyMap);
        }

        // Rows normally arrive ordered by address already.
        entries.sort_by_key(|entry| entry.address);

        for pair in entries.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            if (next.address as u32) < previous.end() {
                return Err(TelemetryError::RegisterOverlap {
                    address: next.address,
                    first: format!("{}/{}", previous.wellhead_id, previous.parameter_code),
                    second: format!("{}/{}", next.wellhead_id, next.parameter_code),
                });
            }
        }

        let mut index: HashMap<String, HashMap<String, usize>> = HashMap::new();
        for (position, entry) in entries.iter().enumerate() {
            let by_code = index.entry(entry.wellhead_id.clone()).or_default();
            if by_code.insert(entry.parameter_code.clone(), position).is_some() {
                return Err(TelemetryError::InvalidData(format!(
                    "Duplicate active mapping for {}/{}",
                    entry.wellhead_id, entry.parameter_code
                )));
            }
        }

        info!(
            "🗺️  Built register map: {} mappings across {} wellheads",
            entries.len(),
            index.len()
        );
        Ok(Self { entries, index })
    }

    fn entry_from_row(row: MappingRow) -> Result<MapEntry, TelemetryError> {
        let kind: EncodingKind = row.data_type.parse()?;
        let max_start = (u16::MAX - (REGISTERS_PER_VALUE - 1)) as i64;
        if row.register_address < 0 || row.register_address > max_start {
            return Err(TelemetryError::InvalidData(format!(
                "Register address {} for {}/{} is outside the register space",
                row.register_address, row.wellhead_id, row.parameter_code
            )));
        }

        Ok(MapEntry {
            wellhead_id: row.wellhead_id,
            parameter_code: row.parameter_code,
            parameter_id: row.parameter_id,
            mapping_id: row.mapping_id,
            address: row.register_address as u16,
            kind,
        })
    }

    pub fn lookup(&self, wellhead_id: &str, parameter_code: &str) -> Option<&MapEntry> {
        self.index
            .get(wellhead_id)
            .and_then(|by_code| by_code.get(parameter_code))
            .map(|&position| &self.entries[position])
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn wellhead_count(&self) -> usize {
        self.index.len()
    }

    pub fn required_registers(&self) -> usize {
        self.entries.last().map(|entry| entry.end() as usize).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct SharedRegisterMap {
    current: Arc<RwLock<Arc<RegisterMap>>>,
}

impl SharedRegisterMap {
    pub fn new(map: RegisterMap) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(map))),
        }
    }

    pub fn snapshot(&self) -> Arc<RegisterMap> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, map: RegisterMap) -> Arc<RegisterMap> {
        let next = Arc::new(map);
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *guard, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, wellhead: &str, code: &str, address: i64, data_type: &str) -> MappingRow {
        MappingRow {
            mapping_id: id,
            wellhead_id: wellhead.to_string(),
            parameter_id: format!("P{:02}", id),
            parameter_code: code.to_string(),
            register_address: address,
            data_type: data_type.to_string(),
            active: true,
        }
    }

    #[test]
    fn test_build_and_lookup() {
        let map = RegisterMap::build(vec![
            row(2, "WH-001", "FLP", 2, "float"),
            row(1, "WH-001", "THP", 0, "float"),
            row(3, "WH-002", "SDV_ST", 50, "bool"),
        ])
        .unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map.wellhead_count(), 2);
        let thp = map.lookup("WH-001", "THP").unwrap();
        assert_eq!(thp.address, 0);
        assert_eq!(thp.kind, EncodingKind::Float32);
        assert_eq!(map.lookup("WH-002", "SDV_ST").unwrap().kind, EncodingKind::Bool32);
        assert!(map.lookup("WH-002", "THP").is_none());
        assert!(map.lookup("WH-009", "THP").is_none());

        let addresses: Vec<u16> = map.entries().iter().map(|e| e.address).collect();
        assert_eq!(addresses, vec![0, 2, 50]);
        assert_eq!(map.required_registers(), 52);
    }

    #[test]
    fn test_empty_map_fails() {
        assert!(matches!(RegisterMap::build(Vec::new()), Err(TelemetryError::EmptyMap)));

        let mut inactive = row(1, "WH-001", "THP", 0, "float");
        inactive.active = false;
        assert!(matches!(RegisterMap::build(vec![inactive]), Err(TelemetryError::EmptyMap)));
    }

    #[test]
    fn test_overlapping_pairs_rejected() {
        let result = RegisterMap::build(vec![
            row(1, "WH-001", "THP", 10, "float"),
            row(2, "WH-002", "THP", 11, "float"),
        ]);
        assert!(matches!(
            result,
            Err(TelemetryError::RegisterOverlap { address: 11, .. })
        ));
    }

    #[test]
    fn test_adjacent_pairs_allowed() {
        let map = RegisterMap::build(vec![
            row(1, "WH-001", "THP", 10, "float"),
            row(2, "WH-001", "FLP", 12, "float"),
        ])
        .unwrap();
        for pair in map.entries().windows(2) {
            assert!(pair[0].end() <= pair[1].address as u32);
        }
    }

    #[test]
    fn test_inactive_rows_do_not_overlap() {
        let mut retired = row(1, "WH-001", "THP", 10, "float");
        retired.active = false;
        let map = RegisterMap::build(vec![retired, row(2, "WH-001", "THP", 10, "float")]).unwrap();
        assert_eq!(map.lookup("WH-001", "THP").unwrap().mapping_id, 2);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result = RegisterMap::build(vec![row(1, "WH-001", "THP", 0, "string")]);
        assert!(matches!(result, Err(TelemetryError::UnsupportedKind(_))));
    }

    #[test]
    fn test_address_outside_space_rejected() {
        assert!(RegisterMap::build(vec![row(1, "WH-001", "THP", -1, "float")]).is_err());
        assert!(RegisterMap::build(vec![row(1, "WH-001", "THP", 65_535, "float")]).is_err());
        assert!(RegisterMap::build(vec![row(1, "WH-001", "THP", 65_534, "float")]).is_ok());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let result = RegisterMap::build(vec![
            row(1, "WH-001", "THP", 0, "float"),
            row(2, "WH-001", "THP", 4, "float"),
        ]);
        assert!(matches!(result, Err(TelemetryError::InvalidData(_))));
    }

    #[test]
    fn test_shared_map_swap() {
        let shared = SharedRegisterMap::new(
            RegisterMap::build(vec![row(1, "WH-001", "THP", 0, "float")]).unwrap(),
        );
        let before = shared.snapshot();

        let replaced = shared.replace(
            RegisterMap::build(vec![
                row(1, "WH-001", "THP", 0, "float"),
                row(2, "WH-001", "FLP", 2, "float"),
            ])
            .unwrap(),
        );

        assert_eq!(replaced.len(), 1);
        // Snapshots taken before the swap keep seeing the old map.
        assert_eq!(before.len(), 1);
        assert_eq!(shared.snapshot().len(), 2);
    }
}
