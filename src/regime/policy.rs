//! Regime policy table and tighten-only resolution.
//!
//! Each layer label contributes a policy; resolution picks the strictest
//! across dimensions (min size_mult, max stop_mult, intersection of allowed
//! orders/setups, min gross_cap, min pyramids). The resolver is a pure
//! function so the hysteresis tracker can consume it without any coupling to
//! policy internals. An optional TOML overlay overrides selected label keys.

use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub size_mult: f64,
    pub stop_mult: f64,
    pub orders: Vec<String>,
    pub setups: Vec<String>,
    pub gross_cap: f64,
    pub pyramids: u32,
}

impl Policy {
    fn new(
        size_mult: f64,
        stop_mult: f64,
        orders: &[&str],
        setups: &[&str],
        gross_cap: f64,
        pyramids: u32,
    ) -> Self {
        Self {
            size_mult,
            stop_mult,
            orders: orders.iter().map(|s| (*s).to_string()).collect(),
            setups: setups.iter().map(|s| (*s).to_string()).collect(),
            gross_cap,
            pyramids,
        }
    }
}

/// A transition tightens when it reduces size or widens stops.
pub fn is_tightening(old: &Policy, new: &Policy) -> bool {
    new.size_mult < old.size_mult || new.stop_mult > old.stop_mult
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    by_label: FxHashMap<String, Policy>,
}

#[derive(Debug, Deserialize)]
struct Overlay {
    #[serde(default)]
    labels: FxHashMap<String, Policy>,
}

impl PolicyTable {
    /// Built-in defaults keyed `"<layer>:<label>"`.
    pub fn default_table() -> Self {
        let mut by_label = FxHashMap::default();
        let all_orders = &["market", "limit"][..];
        let all_setups = &["trend", "breakout", "reversion"][..];

        by_label.insert(
            "l0:bull_cycle".to_string(),
            Policy::new(1.0, 1.0, all_orders, all_setups, 1.0, 2),
        );
        by_label.insert(
            "l0:transition".to_string(),
            Policy::new(0.75, 1.2, all_orders, &["trend", "reversion"], 0.75, 1),
        );
        by_label.insert(
            "l0:bear_cycle".to_string(),
            Policy::new(0.5, 1.5, &["limit"], &["reversion"], 0.5, 0),
        );

        by_label.insert(
            "l1:risk_on".to_string(),
            Policy::new(1.0, 1.0, all_orders, all_setups, 1.0, 2),
        );
        by_label.insert(
            "l1:neutral".to_string(),
            Policy::new(0.8, 1.2, all_orders, all_setups, 0.8, 1),
        );
        by_label.insert(
            "l1:risk_off".to_string(),
            Policy::new(0.6, 1.4, &["limit"], &["reversion"], 0.6, 0),
        );

        by_label.insert(
            "l2:bull".to_string(),
            Policy::new(1.0, 1.0, all_orders, all_setups, 1.0, 2),
        );
        by_label.insert(
            "l2:chop".to_string(),
            Policy::new(0.7, 1.3, all_orders, &["reversion", "breakout"], 0.7, 1),
        );
        by_label.insert(
            "l2:bear".to_string(),
            Policy::new(0.5, 1.5, &["limit"], &["reversion"], 0.5, 0),
        );

        Self { by_label }
    }

    /// Defaults plus a TOML overlay overriding selected label keys.
    pub fn with_overlay(path: &Path) -> Result<Self> {
        let mut table = Self::default_table();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let overlay: Overlay = toml::from_str(&text).map_err(|e| PipelineError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        for (label, policy) in overlay.labels {
            table.by_label.insert(label, policy);
        }
        Ok(table)
    }

    /// Per-layer policy for a single label, falling back to the layer's most
    /// conservative entry when the label is unknown.
    pub fn for_label(&self, layer: &str, label: &str) -> Policy {
        if let Some(p) = self.by_label.get(&format!("{layer}:{label}")) {
            return p.clone();
        }
        // unknown label: strictest policy in the layer
        let mut strictest: Option<Policy> = None;
        for (key, p) in &self.by_label {
            if key.starts_with(&format!("{layer}:")) {
                strictest = Some(match strictest {
                    None => p.clone(),
                    Some(s) => combine(&s, p),
                });
            }
        }
        strictest.unwrap_or_else(|| Policy::new(0.5, 1.5, &["limit"], &["reversion"], 0.5, 0))
    }

    /// Tighten-only resolution across the three active layer labels.
    pub fn resolve(&self, l0: &str, l1: &str, l2: &str) -> Policy {
        let p0 = self.for_label("l0", l0);
        let p1 = self.for_label("l1", l1);
        let p2 = self.for_label("l2", l2);
        combine(&combine(&p0, &p1), &p2)
    }

    /// Hash identifying the policy table plus labeller code snapshot.
    pub fn version_hash(&self, labeler_version: &str) -> String {
        let mut keys: Vec<&String> = self.by_label.keys().collect();
        keys.sort();
        let mut hasher = blake3::Hasher::new();
        hasher.update(labeler_version.as_bytes());
        for key in keys {
            hasher.update(key.as_bytes());
            if let Ok(json) = serde_json::to_vec(&self.by_label[key]) {
                hasher.update(&json);
            }
        }
        hasher.finalize().to_hex()[..16].to_string()
    }
}

fn combine(a: &Policy, b: &Policy) -> Policy {
    Policy {
        size_mult: a.size_mult.min(b.size_mult),
        stop_mult: a.stop_mult.max(b.stop_mult),
        orders: intersect(&a.orders, &b.orders),
        setups: intersect(&a.setups, &b.setups),
        gross_cap: a.gross_cap.min(b.gross_cap),
        pyramids: a.pyramids.min(b.pyramids),
    }
}

fn intersect(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().filter(|x| b.contains(x)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_is_strictest_across_layers() {
        let table = PolicyTable::default_table();
        let p = table.resolve("bull_cycle", "risk_off", "bull");
        assert_eq!(p.size_mult, 0.6); // risk_off dominates size
        assert_eq!(p.stop_mult, 1.4);
        assert_eq!(p.orders, vec!["limit".to_string()]);
        assert_eq!(p.pyramids, 0);
    }

    #[test]
    fn all_permissive_layers_stay_permissive() {
        let table = PolicyTable::default_table();
        let p = table.resolve("bull_cycle", "risk_on", "bull");
        assert_eq!(p.size_mult, 1.0);
        assert_eq!(p.stop_mult, 1.0);
        assert_eq!(p.setups.len(), 3);
    }

    #[test]
    fn bull_to_bear_is_tightening() {
        let table = PolicyTable::default_table();
        let bull = table.for_label("l2", "bull");
        let bear = table.for_label("l2", "bear");
        assert!(is_tightening(&bull, &bear));
        assert!(!is_tightening(&bear, &bull)); // the reverse is loosening
    }

    #[test]
    fn unknown_label_falls_back_to_strictest() {
        let table = PolicyTable::default_table();
        let p = table.for_label("l2", "nonsense");
        assert!(p.size_mult <= 0.5);
        assert!(p.stop_mult >= 1.5);
    }

    #[test]
    fn overlay_overrides_single_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.toml");
        std::fs::write(
            &path,
            r#"
[labels."l2:bear"]
size_mult = 0.25
stop_mult = 2.0
orders = ["limit"]
setups = ["reversion"]
gross_cap = 0.25
pyramids = 0
"#,
        )
        .unwrap();
        let table = PolicyTable::with_overlay(&path).unwrap();
        assert_eq!(table.for_label("l2", "bear").size_mult, 0.25);
        // untouched keys keep defaults
        assert_eq!(table.for_label("l2", "bull").size_mult, 1.0);
    }

    #[test]
    fn version_hash_tracks_table_changes() {
        let a = PolicyTable::default_table();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.toml");
        std::fs::write(
            &path,
            "[labels.\"l2:bear\"]\nsize_mult = 0.1\nstop_mult = 2.0\norders = []\nsetups = []\ngross_cap = 0.1\npyramids = 0\n",
        )
        .unwrap();
        let b = PolicyTable::with_overlay(&path).unwrap();
        assert_ne!(a.version_hash("v1"), b.version_hash("v1"));
        assert_ne!(a.version_hash("v1"), a.version_hash("v2"));
    }
}
