//! Allele reference store.
//!
//! The pipeline only sees the [`AlleleDatabase`] trait. [`JsonAlleleStore`]
//! is the bundled implementation: the whole reference loaded into memory
//! from a JSON document, optionally gzip-compressed, with known-eplet
//! dictionaries read from a directory.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::eplets::{EpletDictionary, EpletIndex};
use crate::error::{DatabaseError, MatchError, Result};
use crate::parsers::open_file;
use crate::types::*;

type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Read-only lookups the matching pipeline needs from a reference store.
///
/// Implementations must be safe to share between concurrent runs.
pub trait AlleleDatabase: Send + Sync {
    /// Exact identifier lookup
    fn find(&self, id: &str) -> DbResult<Option<Allele>>;

    /// First allele listing `name` among its secondary names
    fn find_by_secondary_name(&self, name: &str) -> DbResult<Option<Allele>>;

    /// Every allele whose identifier contains `fragment`, in store order
    fn search_substring(&self, fragment: &str) -> DbResult<Vec<Allele>>;

    /// Known-eplet dictionary, if the store has one for this family
    fn eplet_dictionary(&self, family: EpletFamily) -> DbResult<Option<Arc<EpletDictionary>>>;

    /// Class bucket of a stored allele
    fn allele_class(&self, id: &str) -> Result<AlleleClass> {
        let allele = self
            .find(id)?
            .ok_or_else(|| MatchError::MissingAllele(id.to_string()))?;
        AlleleClass::of(&allele)
    }
}

/// On-disk layouts accepted for the reference store
#[derive(Deserialize)]
#[serde(untagged)]
enum StoreDocument {
    Records(Vec<Allele>),
    Keyed(serde_json::Map<String, serde_json::Value>),
}

/// In-memory reference store
#[derive(Debug, Clone, Default)]
pub struct JsonAlleleStore {
    alleles: Vec<Allele>,
    by_id: HashMap<String, usize>,
    by_secondary_name: HashMap<String, usize>,
    eplets: HashMap<EpletFamily, Arc<EpletDictionary>>,
}

impl JsonAlleleStore {
    pub fn from_alleles(alleles: Vec<Allele>) -> Self {
        let mut by_id = HashMap::with_capacity(alleles.len());
        let mut by_secondary_name = HashMap::new();

        for (i, allele) in alleles.iter().enumerate() {
            if by_id.insert(allele.id.clone(), i).is_some() {
                warn!("Duplicate allele {} in reference store, keeping the last", allele.id);
            }
            for name in &allele.secondary_names {
                by_secondary_name.entry(name.clone()).or_insert(i);
            }
        }

        Self {
            alleles,
            by_id,
            by_secondary_name,
            eplets: HashMap::new(),
        }
    }

    /// Load either `[{"_id": ..., ...}, ...]` or `{"<id>": {...}, ...}`
    pub fn from_reader<R: Read>(reader: R) -> DbResult<Self> {
        let alleles = match serde_json::from_reader(reader)? {
            StoreDocument::Records(records) => records,
            StoreDocument::Keyed(map) => {
                let mut records = Vec::with_capacity(map.len());
                for (id, value) in map {
                    let mut allele: Allele = serde_json::from_value(value)?;
                    if allele.id.is_empty() {
                        allele.id = id;
                    }
                    records.push(allele);
                }
                records
            }
        };
        Ok(Self::from_alleles(alleles))
    }

    pub fn from_path(path: &Path) -> DbResult<Self> {
        let reader = open_file(path).map_err(|source| DatabaseError::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_reader(reader)?;
        info!(
            "Loaded {} alleles from {}",
            store.alleles.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn with_eplet_dictionary(mut self, family: EpletFamily, dictionary: EpletDictionary) -> Self {
        self.eplets.insert(family, Arc::new(dictionary));
        self
    }

    /// Load every known-eplet file present in `dir`; missing files are skipped
    pub fn with_eplet_dir(mut self, dir: &Path) -> DbResult<Self> {
        for family in EpletFamily::ALL {
            let path = dir.join(family.file_name());
            if !path.is_file() {
                warn!("Eplet file {} not found", path.display());
                continue;
            }
            let dictionary = EpletDictionary::from_reader(File::open(&path)?)?;
            info!(
                "Loaded {} eplets from {}",
                dictionary.len(),
                path.display()
            );
            self.eplets.insert(family, Arc::new(dictionary));
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.alleles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alleles.is_empty()
    }

    pub fn alleles(&self) -> &[Allele] {
        &self.alleles
    }

    /// Record which known eplets each allele presents.
    ///
    /// Alleles of a class without a dictionary, or that cannot be classified,
    /// are left untouched. Returns the number of alleles annotated.
    pub fn annotate_eplets(&mut self) -> usize {
        let indexes: HashMap<EpletFamily, EpletIndex> = self
            .eplets
            .iter()
            .map(|(family, dictionary)| (*family, EpletIndex::new(Arc::clone(dictionary))))
            .collect();

        let mut annotated = 0;
        for allele in &mut self.alleles {
            let Some(index) = AlleleClass::of(allele)
                .ok()
                .and_then(|class| class.eplet_family())
                .and_then(|family| indexes.get(&family))
            else {
                continue;
            };
            let found = index.scan(&allele.aligned_seq);
            if !found.is_empty() {
                annotated += 1;
            }
            allele.eplets = Some(found);
        }
        annotated
    }

    /// Write the store as a JSON record list
    pub fn write_json(&self, path: &Path) -> DbResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &self.alleles)?;
        Ok(())
    }
}

impl AlleleDatabase for JsonAlleleStore {
    fn find(&self, id: &str) -> DbResult<Option<Allele>> {
        Ok(self.by_id.get(id).map(|i| self.alleles[*i].clone()))
    }

    fn find_by_secondary_name(&self, name: &str) -> DbResult<Option<Allele>> {
        Ok(self
            .by_secondary_name
            .get(name)
            .map(|i| self.alleles[*i].clone()))
    }

    fn search_substring(&self, fragment: &str) -> DbResult<Vec<Allele>> {
        Ok(self
            .alleles
            .iter()
            .filter(|allele| allele.id.contains(fragment))
            .cloned()
            .collect())
    }

    fn eplet_dictionary(&self, family: EpletFamily) -> DbResult<Option<Arc<EpletDictionary>>> {
        Ok(self.eplets.get(&family).cloned())
    }
}

/// Fixture store shared by unit tests
#[cfg(test)]
pub(crate) fn fixture_store() -> JsonAlleleStore {
    let alleles = include_str!("../tests/data/alleles.json");
    let mut store = JsonAlleleStore::from_reader(alleles.as_bytes()).unwrap();
    for (family, json) in [
        (EpletFamily::ClassI, include_str!("../tests/data/eplets/eplets_I.json")),
        (EpletFamily::Dq, include_str!("../tests/data/eplets/eplets_DQ.json")),
        (EpletFamily::Drb, include_str!("../tests/data/eplets/eplets_DRB.json")),
    ] {
        store = store.with_eplet_dictionary(
            family,
            EpletDictionary::from_reader(json.as_bytes()).unwrap(),
        );
    }
    store
}
