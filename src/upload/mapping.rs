//! Column mapping between upload headers and the canonical coordinate
//! columns the analysis backend expects.

use std::collections::BTreeMap;

use crate::error::AppError;

/// A logical field the analysis needs, with the canonical column name the
/// backend renames mapped headers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredField {
    /// Logical name shown to the user and matched against headers.
    pub name: &'static str,
    /// Canonical column name on the backend.
    pub column: &'static str,
}

/// Fields a batch analysis requires. Headers left unmapped are handed to the
/// backend's best-effort auto-detection.
pub const REQUIRED_FIELDS: &[RequiredField] = &[
    RequiredField {
        name: "latitude",
        column: "PropertyLatitude",
    },
    RequiredField {
        name: "longitude",
        column: "PropertyLongitude",
    },
];

/// Mapping from upload header names to canonical backend columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    /// source header → canonical column
    entries: BTreeMap<String, String>,
}

impl ColumnMapping {
    /// Infers a mapping by case-insensitive *exact* match of each required
    /// field's logical name against the headers. "Latitude" matches
    /// `latitude`; "lat" does not — near-misses require manual mapping.
    pub fn infer(headers: &[String], required: &[RequiredField]) -> Self {
        let mut mapping = Self::default();
        for field in required {
            if let Some(header) = headers
                .iter()
                .find(|h| h.trim().eq_ignore_ascii_case(field.name))
            {
                mapping.set(header.trim(), field);
            }
        }
        mapping
    }

    /// Maps a header onto a required field, replacing any previous source
    /// for that field.
    pub fn set(&mut self, header: &str, field: &RequiredField) {
        self.entries
            .retain(|_, column| column != field.column);
        self.entries
            .insert(header.to_string(), field.column.to_string());
    }

    /// Required fields that have no mapped source header yet.
    pub fn missing<'a>(&self, required: &'a [RequiredField]) -> Vec<&'a RequiredField> {
        required
            .iter()
            .filter(|field| !self.entries.values().any(|column| column == field.column))
            .collect()
    }

    /// True when every required field has a source header.
    pub fn is_complete(&self, required: &[RequiredField]) -> bool {
        self.missing(required).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// JSON object for the `column_mapping` form field, or `None` when there
    /// is nothing to send.
    pub fn to_json(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        // BTreeMap of strings cannot fail to serialize.
        Some(serde_json::to_string(&self.entries).expect("mapping serialization"))
    }

    /// Parses `header=field` pairs (e.g. `Lat=latitude`) as entered on the
    /// command line.
    pub fn parse_pairs(
        pairs: &[String],
        required: &[RequiredField],
    ) -> Result<Self, AppError> {
        let mut mapping = Self::default();
        mapping.apply_pairs(pairs, required)?;
        Ok(mapping)
    }

    /// Applies `header=field` pairs on top of the current mapping. Manual
    /// pairs override inferred entries for the same field.
    pub fn apply_pairs(
        &mut self,
        pairs: &[String],
        required: &[RequiredField],
    ) -> Result<(), AppError> {
        for pair in pairs {
            let (header, field_name) = pair.split_once('=').ok_or_else(|| {
                AppError::Config(format!("mapping {:?} is not in header=field form", pair))
            })?;
            let field = required
                .iter()
                .find(|f| f.name.eq_ignore_ascii_case(field_name.trim()))
                .ok_or_else(|| {
                    AppError::Config(format!("unknown field {:?} in mapping", field_name))
                })?;
            self.set(header.trim(), field);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
