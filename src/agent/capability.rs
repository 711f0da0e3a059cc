//! Capability fingerprints, naming, and duplicate detection.
//!
//! A capability proposal is derived from the assistant's summary of a
//! completed turn. The fingerprint is the normalized summary text
//! (case-folded, punctuation-stripped, whitespace-collapsed, bounded), so
//! near-identical outcomes collapse to one proposal; the stable hash of
//! that fingerprint drives the deterministic skill name.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// Upper bound on fingerprint length, in characters.
const FINGERPRINT_MAX_CHARS: usize = 160;

/// Minimum shared-substring length that counts as a duplicate overlap.
const OVERLAP_MIN_CHARS: usize = 4;

/// Maximum length of the human-readable part of a derived name.
const NAME_SLUG_MAX_CHARS: usize = 24;

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize text into its duplicate-detection fingerprint.
///
/// Case-folded, punctuation stripped, whitespace collapsed, truncated to a
/// bounded length. The same outcome phrased with different punctuation or
/// casing lands on the same fingerprint.
pub fn normalize_fingerprint(text: &str) -> String {
    let mut out = String::new();
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if !ch.is_alphanumeric() {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        for lowered in ch.to_lowercase() {
            out.push(lowered);
        }
    }
    out.chars().take(FINGERPRINT_MAX_CHARS).collect()
}

/// Stable hex digest of a fingerprint.
pub fn stable_hash(fingerprint: &str) -> String {
    blake3::hash(fingerprint.as_bytes()).to_hex().to_string()
}

/// Derive the deterministic skill name for a fingerprint.
///
/// Same fingerprint, same name, on every heartbeat: a short ASCII slug of
/// the leading words plus the first 8 hex chars of the stable hash.
pub fn derive_skill_name(fingerprint: &str) -> String {
    let mut slug = String::new();
    for ch in fingerprint.chars() {
        let mapped = if ch.is_ascii_alphanumeric() {
            ch.to_ascii_lowercase()
        } else if ch == ' ' {
            '-'
        } else {
            continue;
        };
        if mapped == '-' && (slug.is_empty() || slug.ends_with('-')) {
            continue;
        }
        slug.push(mapped);
        if slug.len() >= NAME_SLUG_MAX_CHARS {
            break;
        }
    }
    let slug = slug.trim_matches('-');
    let hash = stable_hash(fingerprint);
    if slug.is_empty() {
        format!("skill-{}", &hash[..8])
    } else {
        format!("{}-{}", slug, &hash[..8])
    }
}

/// True when the two fingerprints share a substring of at least
/// [`OVERLAP_MIN_CHARS`] characters.
///
/// Deliberately coarse; it both over- and under-matches, and the threshold
/// is part of the compatibility contract.
pub fn fingerprints_overlap(a: &str, b: &str) -> bool {
    let shorter: Vec<char>;
    let longer: &str;
    if a.chars().count() <= b.chars().count() {
        shorter = a.chars().collect();
        longer = b;
    } else {
        shorter = b.chars().collect();
        longer = a;
    }
    if shorter.len() < OVERLAP_MIN_CHARS {
        return false;
    }
    shorter
        .windows(OVERLAP_MIN_CHARS)
        .any(|window| longer.contains(&window.iter().collect::<String>()))
}

/// A candidate capability awaiting user approval.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityProposal {
    pub name: String,
    pub description: String,
    pub summary: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl CapabilityProposal {
    /// Build a proposal from an assistant summary.
    ///
    /// Returns `None` when the summary normalizes to nothing.
    pub fn from_summary(summary: &str, created_at: DateTime<Utc>) -> Option<Self> {
        let summary = collapse_whitespace(summary);
        let fingerprint = normalize_fingerprint(&summary);
        if fingerprint.is_empty() {
            return None;
        }
        let description: String = summary.chars().take(120).collect();
        Some(Self {
            name: derive_skill_name(&fingerprint),
            description,
            summary,
            fingerprint,
            created_at,
        })
    }
}

/// Capabilities known at startup plus anything created since.
#[derive(Debug, Default)]
pub struct KnownCapabilities {
    names: HashSet<String>,
    fingerprints: HashSet<String>,
}

impl KnownCapabilities {
    /// Seed the registry with the injected capability names.
    ///
    /// Each name also contributes its own normalized fingerprint so a
    /// proposal equivalent to an existing capability is caught even when
    /// the derived name differs.
    pub fn seed(names: impl IntoIterator<Item = String>) -> Self {
        let mut registry = Self::default();
        for name in names {
            let fingerprint = normalize_fingerprint(&name);
            if !fingerprint.is_empty() {
                registry.fingerprints.insert(fingerprint);
            }
            registry.names.insert(name);
        }
        registry
    }

    /// Record a capability created at runtime.
    pub fn register(&mut self, name: impl Into<String>, fingerprint: impl Into<String>) {
        self.names.insert(name.into());
        self.fingerprints.insert(fingerprint.into());
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    /// Whether any known fingerprint overlaps the candidate.
    pub fn overlaps(&self, fingerprint: &str) -> bool {
        self.fingerprints
            .iter()
            .any(|known| fingerprints_overlap(known, fingerprint))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Why a proposal was judged a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    ExactName,
    ExactFingerprint,
    Suppressed,
    FingerprintOverlap,
}

/// Check a proposal against the registry and the suppression set.
pub fn detect_duplicate(
    proposal: &CapabilityProposal,
    known: &KnownCapabilities,
    suppressed: &HashSet<String>,
) -> Option<DuplicateReason> {
    if known.contains_name(&proposal.name) {
        return Some(DuplicateReason::ExactName);
    }
    if known.contains_fingerprint(&proposal.fingerprint) {
        return Some(DuplicateReason::ExactFingerprint);
    }
    if suppressed.contains(&proposal.fingerprint) {
        return Some(DuplicateReason::Suppressed);
    }
    if known.overlaps(&proposal.fingerprint) {
        return Some(DuplicateReason::FingerprintOverlap);
    }
    None
}

/// Skill hints lifted from the original prompt front-door: requests that
/// clearly want a browser or a skill capture get the matching capability
/// prefix when it is installed.
pub fn wants_browser_skill(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("browser")
        || lowered.contains("web")
        || lowered.contains("site")
        || text.contains("ブラウザ")
        || text.contains("サイト")
        || text.contains("ウェブ")
}

pub fn wants_skill_creator(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("make a skill")
        || lowered.contains("create a skill")
        || lowered.contains("turn this into a skill")
        || lowered.contains("skillize")
        || text.contains("スキルにして")
        || text.contains("スキル化して")
        || text.contains("再現できるようにスキル")
}
