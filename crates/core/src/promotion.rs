//! Promotion signals and freight references embedded in stage payloads.
//!
//! Stage payloads follow the Kargo layout:
//!
//! - `status.lastPromotion.status.phase` (or a bare `status` string)
//! - `status.lastPromotion.freight` with `images`, `commits` and `charts`
//! - `status.currentFreight.name` and `status.freightHistory[0].items.*.name`
//!
//! A generic `freight.artifacts[{repo, tag}]` list is accepted as well.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::{Kind, Resource};

/// Phase of the most recent promotion into a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    Unknown(String),
}

impl PromotionPhase {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" => PromotionPhase::Pending,
            "running" => PromotionPhase::Running,
            "succeeded" | "success" => PromotionPhase::Succeeded,
            "failed" => PromotionPhase::Failed,
            "errored" => PromotionPhase::Errored,
            "aborted" => PromotionPhase::Aborted,
            _ => PromotionPhase::Unknown(s.to_string()),
        }
    }

    pub fn is_success(&self) -> bool { matches!(self, PromotionPhase::Succeeded) }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PromotionPhase::Succeeded | PromotionPhase::Failed | PromotionPhase::Errored | PromotionPhase::Aborted)
    }
}

/// One artifact version: an image tag, a commit, or a chart version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub repo: String,
    pub tag: String,
}

impl ArtifactRef {
    pub fn new(repo: impl Into<String>, tag: impl Into<String>) -> Self {
        Self { repo: repo.into(), tag: tag.into() }
    }
}

/// Artifact versions carried by one freight bundle.
pub type FreightRef = SmallVec<[ArtifactRef; 4]>;

/// "This freight is now (or failed to become) active at this stage."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionSignal {
    pub stage: String,
    pub phase: PromotionPhase,
    pub freight: Option<FreightRef>,
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str()).filter(|s| !s.is_empty())
}

/// Extract artifact references from a freight reference object.
pub fn freight_artifacts(freight: &Value) -> FreightRef {
    let mut out = FreightRef::new();
    if let Some(images) = freight.get("images").and_then(|v| v.as_array()) {
        for img in images {
            let (Some(repo), Some(tag)) = (str_at(img, "repoURL"), str_at(img, "tag").or_else(|| str_at(img, "digest"))) else { continue; };
            out.push(ArtifactRef::new(repo, tag));
        }
    }
    if let Some(commits) = freight.get("commits").and_then(|v| v.as_array()) {
        for c in commits {
            let (Some(repo), Some(tag)) = (str_at(c, "repoURL"), str_at(c, "tag").or_else(|| str_at(c, "id"))) else { continue; };
            out.push(ArtifactRef::new(repo, tag));
        }
    }
    if let Some(charts) = freight.get("charts").and_then(|v| v.as_array()) {
        for ch in charts {
            let (Some(repo_url), Some(version)) = (str_at(ch, "repoURL"), str_at(ch, "version")) else { continue; };
            let repo = match str_at(ch, "name") {
                Some(name) => format!("{}/{}", repo_url.trim_end_matches('/'), name),
                None => repo_url.to_string(),
            };
            out.push(ArtifactRef::new(repo, version));
        }
    }
    if let Some(artifacts) = freight.get("artifacts").and_then(|v| v.as_array()) {
        for a in artifacts {
            let (Some(repo), Some(tag)) = (str_at(a, "repo"), str_at(a, "tag")) else { continue; };
            out.push(ArtifactRef::new(repo, tag));
        }
    }
    out
}

/// Read the last-promotion signal from a stage resource.
///
/// Returns `None` for non-stage resources and stages that were never promoted.
pub fn promotion_signal(stage: &Resource) -> Option<PromotionSignal> {
    if stage.kind != Kind::Stage { return None; }
    let last = stage.payload.get("status")?.get("lastPromotion")?;
    let phase = match last.get("status") {
        Some(Value::String(s)) => PromotionPhase::parse(s),
        Some(obj) => obj.get("phase").and_then(|v| v.as_str()).map(PromotionPhase::parse)?,
        None => return None,
    };
    let freight = last.get("freight").filter(|v| !v.is_null()).map(freight_artifacts);
    Some(PromotionSignal { stage: stage.name.clone(), phase, freight })
}

/// Names of freight a stage currently points at.
pub fn referenced_freight(stage: &Resource) -> SmallVec<[String; 4]> {
    let mut out = SmallVec::new();
    if stage.kind != Kind::Stage { return out; }
    let Some(status) = stage.payload.get("status") else { return out; };
    if let Some(name) = status.get("currentFreight").and_then(|f| str_at(f, "name")) {
        out.push(name.to_string());
    }
    let head = status.get("freightHistory").and_then(|h| h.as_array()).and_then(|h| h.first());
    if let Some(items) = head.and_then(|h| h.get("items")).and_then(|i| i.as_object()) {
        for item in items.values() {
            if let Some(name) = str_at(item, "name") {
                if !out.iter().any(|n| n == name) { out.push(name.to_string()); }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage(payload: Value) -> Resource { Resource::new("demo", Kind::Stage, "prod", payload) }

    #[test]
    fn reads_kargo_last_promotion() {
        let s = stage(json!({
            "status": {
                "lastPromotion": {
                    "name": "prod.01",
                    "status": { "phase": "Succeeded" },
                    "freight": {
                        "images": [{ "repoURL": "nginx", "tag": "1.0" }],
                        "commits": [{ "repoURL": "https://git/app", "id": "abc123" }],
                        "charts": [{ "repoURL": "oci://charts/", "name": "app", "version": "0.3.1" }]
                    }
                }
            }
        }));
        let sig = promotion_signal(&s).expect("signal");
        assert_eq!(sig.stage, "prod");
        assert!(sig.phase.is_success());
        let freight = sig.freight.expect("freight");
        assert_eq!(freight.as_slice(), &[
            ArtifactRef::new("nginx", "1.0"),
            ArtifactRef::new("https://git/app", "abc123"),
            ArtifactRef::new("oci://charts/app", "0.3.1"),
        ]);
    }

    #[test]
    fn reads_generic_status_string() {
        let s = stage(json!({ "status": { "lastPromotion": {
            "status": "Failed",
            "freight": { "artifacts": [{ "repo": "nginx", "tag": "3.0" }] }
        }}}));
        let sig = promotion_signal(&s).unwrap();
        assert_eq!(sig.phase, PromotionPhase::Failed);
        assert!(sig.phase.is_terminal());
        assert_eq!(sig.freight.unwrap().len(), 1);
    }

    #[test]
    fn never_promoted_stage_has_no_signal() {
        assert!(promotion_signal(&stage(json!({ "status": {} }))).is_none());
        let wh = Resource::new("demo", Kind::Warehouse, "w", json!({ "status": { "lastPromotion": { "status": "Succeeded" } } }));
        assert!(promotion_signal(&wh).is_none());
    }

    #[test]
    fn incomplete_artifacts_are_skipped() {
        let refs = freight_artifacts(&json!({ "images": [{ "repoURL": "nginx" }, { "tag": "1.0" }] }));
        assert!(refs.is_empty());
    }

    #[test]
    fn collects_referenced_freight_without_duplicates() {
        let s = stage(json!({ "status": {
            "currentFreight": { "name": "f1" },
            "freightHistory": [
                { "items": { "Warehouse/a": { "name": "f1" }, "Warehouse/b": { "name": "f2" } } },
                { "items": { "Warehouse/a": { "name": "f0" } } }
            ]
        }}));
        let refs = referenced_freight(&s);
        assert_eq!(refs.as_slice(), &["f1".to_string(), "f2".to_string()]);
    }
}
