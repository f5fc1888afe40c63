//! Retrieval mode selection with plan-based entitlement fallback.
//!
//! [`resolve_mode`] is the single decision point that turns a requested
//! mode string and a tenant's plan into the mode that will actually run.
//! Anything unset, unparseable, or not entitled resolves to
//! [`RetrievalMode::Naive`], so every tenant can always get an answer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Vector search over chunks.
    Naive,
    /// Entity search, then provenance chunks.
    Local,
    /// Relation search, then endpoint entities and provenance chunks.
    Global,
    /// `local` ∪ `global`.
    Hybrid,
    /// `naive` ∪ `local` ∪ `global`.
    Mix,
}

impl RetrievalMode {
    pub const ALL: [RetrievalMode; 5] = [
        RetrievalMode::Naive,
        RetrievalMode::Local,
        RetrievalMode::Global,
        RetrievalMode::Hybrid,
        RetrievalMode::Mix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Naive => "naive",
            RetrievalMode::Local => "local",
            RetrievalMode::Global => "global",
            RetrievalMode::Hybrid => "hybrid",
            RetrievalMode::Mix => "mix",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a mode string names none of the five strategies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown retrieval mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for RetrievalMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "naive" => Ok(RetrievalMode::Naive),
            "local" => Ok(RetrievalMode::Local),
            "global" => Ok(RetrievalMode::Global),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            "mix" => Ok(RetrievalMode::Mix),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// Answers whether a plan may use a mode.
pub trait ModeEntitlements: Send + Sync {
    fn is_mode_available(&self, plan: &str, mode: RetrievalMode) -> bool;
}

/// Why the effective mode differs from the requested one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeFallback {
    /// The requested mode was used as-is.
    None,
    /// No mode was requested.
    Unspecified,
    /// The requested string is not a mode name.
    Invalid(String),
    /// The plan does not include the requested mode.
    NotEntitled {
        requested: RetrievalMode,
        plan: String,
    },
}

/// Outcome of [`resolve_mode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeResolution {
    pub effective: RetrievalMode,
    pub fallback: ModeFallback,
}

impl ModeResolution {
    pub fn downgraded(&self) -> bool {
        matches!(self.fallback, ModeFallback::NotEntitled { .. })
    }
}

/// Decide which mode runs for a request.
///
/// Deterministic: the same `(requested, plan, entitlements)` always yields
/// the same resolution. `naive` is never subject to entitlement checks.
pub fn resolve_mode(
    requested: Option<&str>,
    plan: &str,
    entitlements: &dyn ModeEntitlements,
) -> ModeResolution {
    let requested = match requested.map(str::trim).filter(|s| !s.is_empty()) {
        None => {
            return ModeResolution {
                effective: RetrievalMode::Naive,
                fallback: ModeFallback::Unspecified,
            }
        }
        Some(s) => s,
    };

    let mode = match requested.parse::<RetrievalMode>() {
        Ok(m) => m,
        Err(_) => {
            return ModeResolution {
                effective: RetrievalMode::Naive,
                fallback: ModeFallback::Invalid(requested.to_string()),
            }
        }
    };

    if mode == RetrievalMode::Naive || entitlements.is_mode_available(plan, mode) {
        ModeResolution {
            effective: mode,
            fallback: ModeFallback::None,
        }
    } else {
        ModeResolution {
            effective: RetrievalMode::Naive,
            fallback: ModeFallback::NotEntitled {
                requested: mode,
                plan: plan.to_string(),
            },
        }
    }
}

/// All modes available to `plan`, in canonical order. Always contains `naive`.
pub fn available_modes(plan: &str, entitlements: &dyn ModeEntitlements) -> Vec<RetrievalMode> {
    RetrievalMode::ALL
        .iter()
        .copied()
        .filter(|m| *m == RetrievalMode::Naive || entitlements.is_mode_available(plan, *m))
        .collect()
}
