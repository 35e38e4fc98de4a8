//! Compliance regime tagging.
//!
//! Each entry is tagged with the regimes its resource falls under, based on
//! the resource type alone. The mapping is a plain table so deployments can
//! extend it without code changes.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// A regulatory regime an audit entry may be relevant to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComplianceRegime {
    /// Sarbanes-Oxley: financial records and the audit trail itself.
    #[serde(rename = "SOX")]
    Sox,
    /// GDPR: personal data.
    #[serde(rename = "GDPR")]
    Gdpr,
    /// HIPAA: health data.
    #[serde(rename = "HIPAA")]
    Hipaa,
    /// PCI-DSS: payment card data.
    #[serde(rename = "PCI-DSS")]
    PciDss,
}

impl ComplianceRegime {
    /// Every known regime.
    pub const ALL: [Self; 4] = [Self::Sox, Self::Gdpr, Self::Hipaa, Self::PciDss];

    /// Canonical display name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sox => "SOX",
            Self::Gdpr => "GDPR",
            Self::Hipaa => "HIPAA",
            Self::PciDss => "PCI-DSS",
        }
    }
}

impl fmt::Display for ComplianceRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown compliance regime '{s}'"))
    }
}

/// Resource-type to regime table.
///
/// A rule for `payment` matches the resource types `payment`,
/// `payment_method`, `payment.card` and `payment:intent`; matching is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRules {
    rules: BTreeMap<String, BTreeSet<ComplianceRegime>>,
}

impl Default for ComplianceRules {
    fn default() -> Self {
        let mut rules = Self::empty();
        for category in ["financial", "ledger", "audit", "audit_log"] {
            rules.insert(category, ComplianceRegime::Sox);
        }
        for category in ["personal", "pii", "user_profile", "contact"] {
            rules.insert(category, ComplianceRegime::Gdpr);
        }
        for category in ["health", "medical", "phi"] {
            rules.insert(category, ComplianceRegime::Hipaa);
        }
        for category in ["payment", "card", "cardholder"] {
            rules.insert(category, ComplianceRegime::PciDss);
        }
        rules
    }
}

impl ComplianceRules {
    /// A table with no rules; nothing gets tagged.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: BTreeMap::new() }
    }

    /// Adds `regime` to the regimes of `category`.
    pub fn insert(&mut self, category: impl Into<String>, regime: ComplianceRegime) {
        self.rules.entry(category.into().to_ascii_lowercase()).or_default().insert(regime);
    }

    /// Regimes that apply to `resource_type`.
    #[must_use]
    pub fn tags_for(&self, resource_type: &str) -> BTreeSet<ComplianceRegime> {
        let resource_type = resource_type.to_ascii_lowercase();
        self.rules
            .iter()
            .filter(|(category, _)| category_matches(category, &resource_type))
            .flat_map(|(_, regimes)| regimes.iter().copied())
            .collect()
    }
}

fn category_matches(category: &str, resource_type: &str) -> bool {
    match resource_type.strip_prefix(category) {
        Some("") => true,
        Some(rest) => rest.starts_with(['_', '.', ':', '/']),
        None => false,
    }
}
