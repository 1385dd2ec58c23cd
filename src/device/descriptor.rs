//! Device descriptors and the catalog that resolves advertised names.
//!
//! A descriptor names a supported dive computer (vendor, product) and the
//! protocol family plus numeric model the driver needs to talk to it. The
//! catalog maps the name a device advertises over BLE to a descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Protocol family of a dive computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceFamily {
    /// Suunto EON Steel, EON Core, D5.
    SuuntoEonSteel,
    /// Shearwater Predator, Petrel, Perdix, Teric and successors.
    ShearwaterPetrel,
    /// Heinrichs Weikamp OSTC 3/4/Plus/Sport.
    HwOstc3,
    /// Scubapro G2/G3, Aladin, Luna.
    UwatecSmart,
    /// Oceanic and Aqualung Atom 2 protocol.
    OceanicAtom2,
    /// Pelagic i330R and DSX.
    PelagicI330R,
    /// Mares Icon HD, Genius, Sirius, Quad Ci, Puck 4.
    #[serde(rename = "maresIconHD")]
    MaresIconHd,
    /// Deep Six Excursion.
    DeepsixExcursion,
    /// Deepblu Cosmiq+.
    DeepbluCosmiq,
    /// Oceans S1.
    OceansS1,
    /// McLean Extreme.
    McleanExtreme,
    /// Divesoft Freedom and Liberty.
    DivesoftFreedom,
    /// Cressi Goa, Cartesio, Leonardo 2.0 and siblings.
    CressiGoa,
    /// Ratio and other DiveSystem computers.
    DiveSystem,
    /// Tecdiving DiveComputer.eu.
    Tecdiving,
}

impl DeviceFamily {
    /// All known families.
    pub const ALL: [DeviceFamily; 15] = [
        Self::SuuntoEonSteel,
        Self::ShearwaterPetrel,
        Self::HwOstc3,
        Self::UwatecSmart,
        Self::OceanicAtom2,
        Self::PelagicI330R,
        Self::MaresIconHd,
        Self::DeepsixExcursion,
        Self::DeepbluCosmiq,
        Self::OceansS1,
        Self::McleanExtreme,
        Self::DivesoftFreedom,
        Self::CressiGoa,
        Self::DiveSystem,
        Self::Tecdiving,
    ];

    /// Stable string form, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuuntoEonSteel => "suuntoEonSteel",
            Self::ShearwaterPetrel => "shearwaterPetrel",
            Self::HwOstc3 => "hwOstc3",
            Self::UwatecSmart => "uwatecSmart",
            Self::OceanicAtom2 => "oceanicAtom2",
            Self::PelagicI330R => "pelagicI330R",
            Self::MaresIconHd => "maresIconHD",
            Self::DeepsixExcursion => "deepsixExcursion",
            Self::DeepbluCosmiq => "deepbluCosmiq",
            Self::OceansS1 => "oceansS1",
            Self::McleanExtreme => "mcleanExtreme",
            Self::DivesoftFreedom => "divesoftFreedom",
            Self::CressiGoa => "cressiGoa",
            Self::DiveSystem => "diveSystem",
            Self::Tecdiving => "tecdiving",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| Error::InvalidParameter {
                name: "family".to_string(),
                value: s.to_string(),
            })
    }
}

/// A supported dive computer model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    /// Manufacturer name.
    pub vendor: String,
    /// Product name.
    pub product: String,
    /// Protocol family.
    pub family: DeviceFamily,
    /// Numeric model within the family.
    pub model: u32,
}

impl Descriptor {
    /// Create a descriptor.
    pub fn new(vendor: &str, product: &str, family: DeviceFamily, model: u32) -> Self {
        Self {
            vendor: vendor.to_string(),
            product: product.to_string(),
            family,
            model,
        }
    }

    /// "Vendor Product", the model string reported to the fingerprint store.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.vendor, self.product)
    }
}

/// Resolves advertised names and family/model pairs to descriptors.
///
/// Implementations must resolve a descriptor's own product name back to
/// that descriptor, so that a canonical product name is a fixed point.
#[cfg_attr(test, mockall::automock)]
pub trait DescriptorCatalog: Send + Sync {
    /// Resolve an advertised BLE name.
    fn resolve_by_name(&self, name: &str) -> Option<Descriptor>;

    /// Resolve a family and numeric model.
    fn resolve_by_model(&self, family: DeviceFamily, model: u32) -> Option<Descriptor>;

    /// Human-readable name for an advertised name, or the name itself.
    fn display_name(&self, name: &str) -> String;
}

/// How a name pattern is compared to an advertised name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The pattern occurs anywhere in the name.
    Contains,
    /// The name starts with the pattern.
    Prefix,
}

/// Maps an advertised-name fragment to a vendor/product pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    /// Fragment to look for.
    pub pattern: &'static str,
    /// Comparison mode.
    pub kind: MatchKind,
    /// Vendor of the matching product.
    pub vendor: &'static str,
    /// Product the fragment identifies.
    pub product: &'static str,
}

impl NamePattern {
    const fn contains(pattern: &'static str, vendor: &'static str, product: &'static str) -> Self {
        Self {
            pattern,
            kind: MatchKind::Contains,
            vendor,
            product,
        }
    }

    const fn prefix(pattern: &'static str, vendor: &'static str, product: &'static str) -> Self {
        Self {
            pattern,
            kind: MatchKind::Prefix,
            vendor,
            product,
        }
    }

    /// Check the pattern against an advertised name.
    pub fn matches(&self, name: &str) -> bool {
        match self.kind {
            MatchKind::Contains => name.contains(self.pattern),
            MatchKind::Prefix => name.starts_with(self.pattern),
        }
    }
}

/// Advertised-name fragments of BLE-capable dive computers, most specific first.
pub fn default_name_patterns() -> Vec<NamePattern> {
    vec![
        // Shearwater
        NamePattern::contains("Predator", "Shearwater", "Predator"),
        NamePattern::contains("Perdix 2", "Shearwater", "Perdix 2"),
        NamePattern::contains("Petrel 3", "Shearwater", "Petrel 3"),
        NamePattern::contains("Petrel", "Shearwater", "Petrel 2"),
        NamePattern::contains("Perdix", "Shearwater", "Perdix"),
        NamePattern::contains("Teric", "Shearwater", "Teric"),
        NamePattern::contains("Peregrine", "Shearwater", "Peregrine"),
        NamePattern::contains("NERD 2", "Shearwater", "NERD 2"),
        NamePattern::contains("NERD", "Shearwater", "NERD"),
        NamePattern::contains("Tern", "Shearwater", "Tern"),
        // Suunto
        NamePattern::contains("EON Steel", "Suunto", "EON Steel"),
        NamePattern::contains("Suunto D5", "Suunto", "D5"),
        NamePattern::contains("EON Core", "Suunto", "EON Core"),
        // Scubapro
        NamePattern::contains("G2", "Scubapro", "G2"),
        NamePattern::contains("HUD", "Scubapro", "G2 HUD"),
        NamePattern::contains("G3", "Scubapro", "G3"),
        NamePattern::contains("Aladin", "Scubapro", "Aladin Sport Matrix"),
        NamePattern::contains("A1", "Scubapro", "Aladin A1"),
        NamePattern::contains("A2", "Scubapro", "Aladin A2"),
        NamePattern::contains("Luna 2.0 AI", "Scubapro", "Luna 2.0 AI"),
        NamePattern::contains("Luna 2.0", "Scubapro", "Luna 2.0"),
        // Mares
        NamePattern::contains("Mares Genius", "Mares", "Genius"),
        NamePattern::contains("Sirius", "Mares", "Sirius"),
        NamePattern::contains("Quad Ci", "Mares", "Quad Ci"),
        NamePattern::contains("Puck4", "Mares", "Puck 4"),
        // Cressi
        NamePattern::prefix("CARESIO_", "Cressi", "Cartesio"),
        NamePattern::prefix("GOA_", "Cressi", "Goa"),
        NamePattern::contains("Leonardo", "Cressi", "Leonardo 2.0"),
        NamePattern::contains("Donatello", "Cressi", "Donatello"),
        NamePattern::contains("Michelangelo", "Cressi", "Michelangelo"),
        NamePattern::contains("Neon", "Cressi", "Neon"),
        NamePattern::contains("Nepto", "Cressi", "Nepto"),
        // Heinrichs Weikamp
        NamePattern::contains("OSTC 3", "Heinrichs Weikamp", "OSTC Plus"),
        NamePattern::contains("OSTC s#", "Heinrichs Weikamp", "OSTC Sport"),
        NamePattern::contains("OSTC s ", "Heinrichs Weikamp", "OSTC Sport"),
        NamePattern::contains("OSTC 4-", "Heinrichs Weikamp", "OSTC 4"),
        NamePattern::contains("OSTC 2-", "Heinrichs Weikamp", "OSTC 2N"),
        NamePattern::contains("OSTC + ", "Heinrichs Weikamp", "OSTC 2"),
        NamePattern::contains("OSTC", "Heinrichs Weikamp", "OSTC 2"),
        // Others
        NamePattern::contains("COSMIQ", "Deepblu", "Cosmiq+"),
        NamePattern::contains("S1", "Oceans", "S1"),
        NamePattern::contains("McLean Extreme", "McLean", "Extreme"),
        NamePattern::contains("DiveComputer", "Tecdiving", "DiveComputer.eu"),
        NamePattern::prefix("DS", "Ratio", "iX3M 2021 GPS Easy"),
        NamePattern::prefix("IX5M", "Ratio", "iX3M 2021 GPS Easy"),
        NamePattern::prefix("RATIO-", "Ratio", "iX3M 2021 GPS Easy"),
    ]
}

/// Descriptors of BLE-capable dive computers.
pub fn default_descriptors() -> Vec<Descriptor> {
    use DeviceFamily::*;

    vec![
        Descriptor::new("Shearwater", "Predator", ShearwaterPetrel, 2),
        Descriptor::new("Shearwater", "Petrel 2", ShearwaterPetrel, 3),
        Descriptor::new("Shearwater", "NERD", ShearwaterPetrel, 4),
        Descriptor::new("Shearwater", "Perdix", ShearwaterPetrel, 5),
        Descriptor::new("Shearwater", "Perdix AI", ShearwaterPetrel, 6),
        Descriptor::new("Shearwater", "NERD 2", ShearwaterPetrel, 7),
        Descriptor::new("Shearwater", "Teric", ShearwaterPetrel, 8),
        Descriptor::new("Shearwater", "Peregrine", ShearwaterPetrel, 9),
        Descriptor::new("Shearwater", "Petrel 3", ShearwaterPetrel, 10),
        Descriptor::new("Shearwater", "Perdix 2", ShearwaterPetrel, 11),
        Descriptor::new("Shearwater", "Tern", ShearwaterPetrel, 12),
        Descriptor::new("Suunto", "EON Steel", SuuntoEonSteel, 0),
        Descriptor::new("Suunto", "EON Core", SuuntoEonSteel, 1),
        Descriptor::new("Suunto", "D5", SuuntoEonSteel, 2),
        Descriptor::new("Scubapro", "Aladin Sport Matrix", UwatecSmart, 0x17),
        Descriptor::new("Scubapro", "Aladin A1", UwatecSmart, 0x25),
        Descriptor::new("Scubapro", "Aladin A2", UwatecSmart, 0x28),
        Descriptor::new("Scubapro", "G2", UwatecSmart, 0x32),
        Descriptor::new("Scubapro", "G3", UwatecSmart, 0x34),
        Descriptor::new("Scubapro", "G2 HUD", UwatecSmart, 0x42),
        Descriptor::new("Scubapro", "Luna 2.0 AI", UwatecSmart, 0x50),
        Descriptor::new("Scubapro", "Luna 2.0", UwatecSmart, 0x51),
        Descriptor::new("Mares", "Genius", MaresIconHd, 0x1C),
        Descriptor::new("Mares", "Quad Ci", MaresIconHd, 0x29),
        Descriptor::new("Mares", "Sirius", MaresIconHd, 0x2F),
        Descriptor::new("Mares", "Puck 4", MaresIconHd, 0x35),
        Descriptor::new("Cressi", "Cartesio", CressiGoa, 1),
        Descriptor::new("Cressi", "Goa", CressiGoa, 2),
        Descriptor::new("Cressi", "Leonardo 2.0", CressiGoa, 3),
        Descriptor::new("Cressi", "Donatello", CressiGoa, 4),
        Descriptor::new("Cressi", "Michelangelo", CressiGoa, 5),
        Descriptor::new("Cressi", "Neon", CressiGoa, 9),
        Descriptor::new("Cressi", "Nepto", CressiGoa, 10),
        Descriptor::new("Heinrichs Weikamp", "OSTC 2", HwOstc3, 0x11),
        Descriptor::new("Heinrichs Weikamp", "OSTC Sport", HwOstc3, 0x12),
        Descriptor::new("Heinrichs Weikamp", "OSTC Plus", HwOstc3, 0x13),
        Descriptor::new("Heinrichs Weikamp", "OSTC 2N", HwOstc3, 0x15),
        Descriptor::new("Heinrichs Weikamp", "OSTC 4", HwOstc3, 0x3B),
        Descriptor::new("Aqualung", "i770R", OceanicAtom2, 0x4651),
        Descriptor::new("Aqualung", "i200C", OceanicAtom2, 0x4649),
        Descriptor::new("Aqualung", "i330R", PelagicI330R, 0x4744),
        Descriptor::new("Apeks", "DSX", PelagicI330R, 0x4741),
        Descriptor::new("Deep Six", "Excursion", DeepsixExcursion, 0),
        Descriptor::new("Deepblu", "Cosmiq+", DeepbluCosmiq, 0),
        Descriptor::new("Oceans", "S1", OceansS1, 0),
        Descriptor::new("McLean", "Extreme", McleanExtreme, 0),
        Descriptor::new("Divesoft", "Freedom", DivesoftFreedom, 19),
        Descriptor::new("Divesoft", "Liberty", DivesoftFreedom, 10),
        Descriptor::new("Ratio", "iX3M 2021 GPS Easy", DiveSystem, 0x60),
        Descriptor::new("Tecdiving", "DiveComputer.eu", Tecdiving, 0),
    ]
}

/// Catalog backed by fixed descriptor and name-pattern tables.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    descriptors: Vec<Descriptor>,
    patterns: Vec<NamePattern>,
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new(default_descriptors(), default_name_patterns())
    }
}

impl StaticCatalog {
    /// Create a catalog from explicit tables.
    pub fn new(descriptors: Vec<Descriptor>, patterns: Vec<NamePattern>) -> Self {
        Self {
            descriptors,
            patterns,
        }
    }

    /// All descriptors in the catalog.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    fn find_product(&self, vendor: &str, product: &str) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.vendor == vendor && d.product == product)
    }
}

impl DescriptorCatalog for StaticCatalog {
    fn resolve_by_name(&self, name: &str) -> Option<Descriptor> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        if let Some(exact) = self
            .descriptors
            .iter()
            .find(|d| d.product == name || d.display_name() == name)
        {
            return Some(exact.clone());
        }

        if let Some(found) = self
            .patterns
            .iter()
            .filter(|p| p.matches(name))
            .find_map(|p| self.find_product(p.vendor, p.product))
        {
            return Some(found.clone());
        }

        // Longest product name that prefixes the advertised name
        self.descriptors
            .iter()
            .filter(|d| name.starts_with(d.product.as_str()))
            .max_by_key(|d| d.product.len())
            .cloned()
    }

    fn resolve_by_model(&self, family: DeviceFamily, model: u32) -> Option<Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.family == family && d.model == model)
            .cloned()
    }

    fn display_name(&self, name: &str) -> String {
        self.resolve_by_name(name)
            .map(|d| d.display_name())
            .unwrap_or_else(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_family_serde_names() {
        let json = serde_json::to_string(&DeviceFamily::MaresIconHd).unwrap();
        assert_eq!(json, "\"maresIconHD\"");
        let json = serde_json::to_string(&DeviceFamily::PelagicI330R).unwrap();
        assert_eq!(json, "\"pelagicI330R\"");

        for family in DeviceFamily::ALL {
            let json = serde_json::to_string(&family).unwrap();
            assert_eq!(json, format!("\"{}\"", family));
            assert_eq!(family.as_str().parse::<DeviceFamily>().unwrap(), family);
        }
    }

    #[test]
    fn test_family_from_str_rejects_unknown() {
        assert!("scubaSteve".parse::<DeviceFamily>().is_err());
    }

    #[test]
    fn test_resolve_by_advertised_name() {
        let catalog = StaticCatalog::default();

        let perdix = catalog.resolve_by_name("Perdix 2 1A2B3C").unwrap();
        assert_eq!(perdix.product, "Perdix 2");
        assert_eq!(perdix.family, DeviceFamily::ShearwaterPetrel);

        let petrel = catalog.resolve_by_name("Petrel").unwrap();
        assert_eq!(petrel.product, "Petrel 2");

        let goa = catalog.resolve_by_name("GOA_00123").unwrap();
        assert_eq!(goa.product, "Goa");

        let ostc = catalog.resolve_by_name("OSTC 4-12345").unwrap();
        assert_eq!(ostc.product, "OSTC 4");

        let steel = catalog.resolve_by_name("EON Steel").unwrap();
        assert_eq!(steel.family, DeviceFamily::SuuntoEonSteel);

        assert!(catalog.resolve_by_name("").is_none());
        assert!(catalog.resolve_by_name("Fitbit Charge").is_none());
    }

    #[test]
    fn test_prefix_fallback() {
        let catalog = StaticCatalog::default();
        let freedom = catalog.resolve_by_name("Freedom 40211").unwrap();
        assert_eq!(freedom.vendor, "Divesoft");
    }

    #[test]
    fn test_product_names_are_fixed_points() {
        let catalog = StaticCatalog::default();
        for descriptor in catalog.descriptors() {
            let resolved = catalog.resolve_by_name(&descriptor.product).unwrap();
            assert_eq!(resolved.product, descriptor.product);
        }
    }

    #[test]
    fn test_resolve_by_model() {
        let catalog = StaticCatalog::default();
        let teric = catalog
            .resolve_by_model(DeviceFamily::ShearwaterPetrel, 8)
            .unwrap();
        assert_eq!(teric.display_name(), "Shearwater Teric");
        assert!(catalog
            .resolve_by_model(DeviceFamily::OceansS1, 99)
            .is_none());
    }

    #[test]
    fn test_display_name() {
        let catalog = StaticCatalog::default();
        assert_eq!(catalog.display_name("Teric"), "Shearwater Teric");
        assert_eq!(catalog.display_name("Unknown Thing"), "Unknown Thing");
    }
}
