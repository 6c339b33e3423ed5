//! Lookup-map relationship synthesis.
//!
//! Candidate relationships for one POI come from O(n) category-keyed maps
//! built over its file- and directory-peers, followed by a single pass over
//! references extracted from the POI's text. Name collisions resolve
//! deterministically: in-file scope beats directory scope, then the lowest
//! POI id wins.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::store::{Poi, RelationshipCandidate};

/// In-file matches carry more confidence than directory-scope matches.
const IN_FILE_CONFIDENCE: f64 = 0.7;
const DIRECTORY_CONFIDENCE: f64 = 0.55;

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap())
}

fn instantiation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bnew\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").unwrap())
}

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    poi_id: i64,
    /// 0 = in-file, 1 = directory peer.
    scope: u8,
}

/// Category-keyed name maps over a POI's peers.
#[derive(Debug, Default)]
pub struct LookupMaps {
    functions: HashMap<String, MapEntry>,
    classes: HashMap<String, MapEntry>,
    variables: HashMap<String, MapEntry>,
    exports: HashMap<String, MapEntry>,
}

impl LookupMaps {
    /// Build maps from file peers (scope 0) and directory peers (scope 1).
    pub fn build(file_peers: &[Poi], directory_peers: &[Poi]) -> Self {
        let mut maps = Self::default();
        for poi in file_peers {
            maps.insert(poi, 0);
        }
        for poi in directory_peers {
            maps.insert(poi, 1);
        }
        maps
    }

    fn insert(&mut self, poi: &Poi, scope: u8) {
        let entry = MapEntry {
            poi_id: poi.id,
            scope,
        };
        match poi.category.as_str() {
            "function" => upsert(&mut self.functions, &poi.name, entry),
            "class" => upsert(&mut self.classes, &poi.name, entry),
            "variable" => upsert(&mut self.variables, &poi.name, entry),
            "export" => upsert(&mut self.exports, &poi.name, entry),
            _ => {}
        }
        // Exported entities are also reachable through the export map.
        if poi.is_exported {
            upsert(&mut self.exports, &poi.name, entry);
        }
    }
}

fn upsert(map: &mut HashMap<String, MapEntry>, name: &str, entry: MapEntry) {
    match map.get(name) {
        Some(existing)
            if (existing.scope, existing.poi_id) <= (entry.scope, entry.poi_id) => {}
        _ => {
            map.insert(name.to_string(), entry);
        }
    }
}

/// Enumerate candidate relationships for one POI against its peers.
pub fn synthesize_candidates(poi: &Poi, maps: &LookupMaps) -> Vec<RelationshipCandidate> {
    let mut candidates = Vec::new();
    let mut seen: HashMap<(i64, &'static str), ()> = HashMap::new();

    let mut push = |target: MapEntry, rel_type: &'static str, rule: &'static str, name: &str| {
        if target.poi_id == poi.id {
            return;
        }
        if seen.insert((target.poi_id, rel_type), ()).is_some() {
            return;
        }
        let confidence = if target.scope == 0 {
            IN_FILE_CONFIDENCE
        } else {
            DIRECTORY_CONFIDENCE
        };
        candidates.push(RelationshipCandidate {
            source_poi_id: poi.id,
            target_poi_id: target.poi_id,
            rel_type: rel_type.to_string(),
            reason: format!("{} resolved '{}' from {}", rule, name, poi.name),
            evidence_type: rule.to_string(),
            agent_confidence: confidence,
            evidence_payload: serde_json::json!({
                "rule": rule,
                "reference": name,
                "scope": if target.scope == 0 { "file" } else { "directory" },
            }),
        });
    };

    for capture in call_regex().captures_iter(&poi.snippet) {
        let name = &capture[1];
        if let Some(entry) = maps.functions.get(name) {
            push(*entry, "CALLS", "function-call-pattern", name);
        }
    }

    for capture in instantiation_regex().captures_iter(&poi.snippet) {
        let name = &capture[1];
        if let Some(entry) = maps.classes.get(name) {
            push(*entry, "INSTANTIATES", "class-reference-pattern", name);
        }
    }

    if poi.category == "import" {
        if let Some(entry) = maps.exports.get(&poi.name) {
            push(*entry, "IMPORTS", "import-export-match", &poi.name);
        }
    }

    for m in identifier_regex().find_iter(&poi.snippet) {
        if let Some(entry) = maps.variables.get(m.as_str()) {
            push(*entry, "REFERENCES", "identifier-reference", m.as_str());
        }
    }

    candidates
}
