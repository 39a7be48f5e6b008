//! Scope selector resolution.

use crate::catalog::{Catalog, Preset, Scope, EVERYTHING, EVERYTHING_LABEL};
use std::str::FromStr;
use tqbundle_common::{Error, Result};

/// A requested scope: one named group, or everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeSelector {
    Everything,
    Scope(Scope),
}

impl ScopeSelector {
    pub fn value(&self) -> &'static str {
        match self {
            ScopeSelector::Everything => EVERYTHING,
            ScopeSelector::Scope(scope) => scope.value(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScopeSelector::Everything => EVERYTHING_LABEL,
            ScopeSelector::Scope(scope) => scope.label(),
        }
    }
}

impl FromStr for ScopeSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let lower = raw.to_lowercase();

        if lower == EVERYTHING || lower == "all" || lower == EVERYTHING_LABEL.to_lowercase() {
            return Ok(ScopeSelector::Everything);
        }

        Scope::ALL
            .iter()
            .find(|scope| {
                scope.value() == lower
                    || scope.label().to_lowercase() == lower
                    || scope.aliases().contains(&lower.as_str())
            })
            .map(|scope| ScopeSelector::Scope(*scope))
            .ok_or_else(|| Error::InvalidScope(raw.to_string()))
    }
}

/// Ordered, deduplicated presets for a request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub selectors: Vec<ScopeSelector>,
    pub presets: Vec<&'static Preset>,
}

impl Resolution {
    /// Canonical selector values.
    pub fn selection(&self) -> Vec<String> {
        self.selectors.iter().map(|s| s.value().to_string()).collect()
    }

    /// Display labels for the selection.
    pub fn selection_labels(&self) -> Vec<String> {
        self.selectors.iter().map(|s| s.label().to_string()).collect()
    }
}

/// Split raw selector strings on commas, trimming and dropping empties.
pub fn split_selectors<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .flat_map(|item| item.as_ref().split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve selectors against the catalog.
///
/// No selectors means everything. An unknown selector rejects the whole
/// request. Presets come back in catalog order, each at most once.
pub fn resolve<S: AsRef<str>>(catalog: &Catalog, raw: &[S]) -> Result<Resolution> {
    let mut selectors: Vec<ScopeSelector> = Vec::new();
    for part in split_selectors(raw) {
        let selector: ScopeSelector = part.parse()?;
        if !selectors.contains(&selector) {
            selectors.push(selector);
        }
    }

    if selectors.is_empty() || selectors.contains(&ScopeSelector::Everything) {
        return Ok(Resolution {
            selectors: vec![ScopeSelector::Everything],
            presets: catalog.everything(),
        });
    }

    let scopes: Vec<Scope> = selectors
        .iter()
        .filter_map(|s| match s {
            ScopeSelector::Scope(scope) => Some(*scope),
            ScopeSelector::Everything => None,
        })
        .collect();

    let presets = catalog
        .presets()
        .iter()
        .filter(|p| scopes.iter().any(|scope| p.in_scope(*scope)))
        .collect();

    Ok(Resolution { selectors, presets })
}
