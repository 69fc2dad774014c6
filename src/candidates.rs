use std::fmt;

use serde::Serialize;

use crate::geography::GeographyTable;
use crate::normalize::clean_address_part;
use crate::source::FacilityRecord;

/// Fallback tier that produced a query, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Strategy {
    NameStreet,
    NameDistrict,
    StreetOnly,
    NameOnly,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::NameStreet => "name+street",
            Strategy::NameDistrict => "name+district",
            Strategy::StreetOnly => "street-only",
            Strategy::NameOnly => "name-only",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressCandidate {
    pub query_text: String,
    pub strategy: Strategy,
}

pub struct CandidateBuilder<'a> {
    geography: &'a GeographyTable,
    country: String,
}

impl<'a> CandidateBuilder<'a> {
    pub fn new(geography: &'a GeographyTable, country: impl Into<String>) -> Self {
        Self {
            geography,
            country: country.into(),
        }
    }

    /// Ordered queries for `record`, or `None` when its municipality cannot
    /// be named. Without a city a facility is treated as unresolvable.
    pub fn build(&self, record: &FacilityRecord) -> Option<Vec<AddressCandidate>> {
        let municipality = self.geography.get(record.municipality_id.as_deref()?)?;
        let locality = municipality.locality();
        let country = clean_address_part(&self.country);

        let name = record.name.as_deref().and_then(clean_address_part);
        let street = record.street.as_deref().and_then(clean_address_part);
        let number = record.number.as_deref().and_then(clean_address_part);
        let district = record.district.as_deref().and_then(clean_address_part);

        let tail = [Some(locality), country];
        let query = |parts: &[&Option<String>]| -> String {
            parts
                .iter()
                .copied()
                .chain(tail.iter())
                .filter_map(|part| part.as_deref())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut candidates = Vec::with_capacity(4);
        if name.is_some() && street.is_some() {
            candidates.push(AddressCandidate {
                query_text: query(&[&name, &street, &number]),
                strategy: Strategy::NameStreet,
            });
        }
        if name.is_some() && district.is_some() {
            candidates.push(AddressCandidate {
                query_text: query(&[&name, &district]),
                strategy: Strategy::NameDistrict,
            });
        }
        if street.is_some() {
            candidates.push(AddressCandidate {
                query_text: query(&[&street, &number, &district]),
                strategy: Strategy::StreetOnly,
            });
        }
        if name.is_some() {
            candidates.push(AddressCandidate {
                query_text: query(&[&name]),
                strategy: Strategy::NameOnly,
            });
        }

        if candidates.is_empty() {
            None
        } else {
            Some(candidates)
        }
    }
}
