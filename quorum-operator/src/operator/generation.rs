//! Generation tokens.
//!
//! A token is stamped into a StatefulSet's pod template annotations and copied
//! by the platform onto every pod it creates from that template. Comparing a
//! pod's token with the StatefulSet's tells whether the pod runs the current
//! template. Tokens are compared for equality only.

use crate::config::GenerationStrategyKind;
use crate::error::OperatorResult;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Annotation holding the generation token.
pub const ANNOTATION_GENERATION: &str = "quorum.io/generation";

/// StatefulSet annotation holding the hash of the template it was last
/// applied with.
pub const ANNOTATION_TEMPLATE_HASH: &str = "quorum.io/template-hash";

/// Derives the generation token for a desired pod template.
pub trait GenerationStrategy: Send + Sync + fmt::Debug {
    /// Token for `desired`, given the live StatefulSet if there is one.
    ///
    /// Must be deterministic, and must change if and only if the template
    /// (ignoring the token annotation itself) changes.
    fn token(&self, desired: &PodTemplateSpec, live: Option<&StatefulSet>) -> OperatorResult<String>;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Hex SHA-256 of the canonical JSON of the template.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateHash;

impl GenerationStrategy for TemplateHash {
    fn token(&self, desired: &PodTemplateSpec, _live: Option<&StatefulSet>) -> OperatorResult<String> {
        template_hash(desired)
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}

/// Integer that increments each time the template changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateCounter;

impl GenerationStrategy for TemplateCounter {
    fn token(&self, desired: &PodTemplateSpec, live: Option<&StatefulSet>) -> OperatorResult<String> {
        let Some(live) = live else {
            return Ok("0".to_string());
        };

        let live_token = live
            .spec
            .as_ref()
            .and_then(|spec| template_token(&spec.template))
            .and_then(|t| t.parse::<u64>().ok());
        let live_hash = live
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_TEMPLATE_HASH));
        let desired_hash = template_hash(desired)?;
        let unchanged = live_hash.is_some_and(|hash| *hash == desired_hash);

        Ok(match (live_token, unchanged) {
            (Some(token), true) => token.to_string(),
            (Some(token), false) => (token + 1).to_string(),
            (None, _) => "0".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "counter"
    }
}

/// Strategy for a configured kind.
pub fn strategy_for(kind: GenerationStrategyKind) -> Arc<dyn GenerationStrategy> {
    match kind {
        GenerationStrategyKind::Hash => Arc::new(TemplateHash),
        GenerationStrategyKind::Counter => Arc::new(TemplateCounter),
    }
}

/// Hex SHA-256 of the canonical JSON of `template`, ignoring its token.
pub fn template_hash(template: &PodTemplateSpec) -> OperatorResult<String> {
    let value = template_without_token(template)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

/// Token stamped on a pod template.
pub fn template_token(template: &PodTemplateSpec) -> Option<&str> {
    template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(ANNOTATION_GENERATION)
        .map(String::as_str)
}

/// Token recorded on a pod.
pub fn pod_token(pod: &Pod) -> Option<&str> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(ANNOTATION_GENERATION)
        .map(String::as_str)
}

fn template_without_token(template: &PodTemplateSpec) -> OperatorResult<Value> {
    let mut value = serde_json::to_value(template)?;
    if let Some(annotations) = value
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    {
        annotations.remove(ANNOTATION_GENERATION);
        if annotations.is_empty() {
            if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.remove("annotations");
            }
        }
    }
    Ok(value)
}

// Sorted keys, so the hash does not depend on map ordering.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn template(image: &str, token: Option<&str>) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                annotations: token
                    .map(|t| BTreeMap::from([(ANNOTATION_GENERATION.to_string(), t.to_string())])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "server".into(),
                    image: Some(image.into()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn live(template: PodTemplateSpec) -> StatefulSet {
        let hash = template_hash(&template).expect("hash");
        StatefulSet {
            metadata: ObjectMeta {
                annotations: Some(BTreeMap::from([(ANNOTATION_TEMPLATE_HASH.to_string(), hash)])),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                template,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn hash_ignores_existing_token() {
        let a = TemplateHash.token(&template("img:1", None), None).expect("hash");
        let b = TemplateHash.token(&template("img:1", Some("abc")), None).expect("hash");
        let c = TemplateHash.token(&template("img:2", None), None).expect("hash");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn counter_starts_at_zero_and_bumps_on_change() {
        assert_eq!(TemplateCounter.token(&template("img:1", None), None).expect("token"), "0");

        let current = live(template("img:1", Some("4")));
        assert_eq!(
            TemplateCounter
                .token(&template("img:1", None), Some(&current))
                .expect("token"),
            "4"
        );
        assert_eq!(
            TemplateCounter
                .token(&template("img:2", None), Some(&current))
                .expect("token"),
            "5"
        );
    }

    #[test]
    fn counter_bumps_when_a_field_is_dropped() {
        let mut limited = template("img:1", Some("2"));
        if let Some(spec) = limited.spec.as_mut() {
            spec.containers[0].resources = Some(ResourceRequirements {
                limits: Some(BTreeMap::from([("cpu".to_string(), Quantity("2".into()))])),
                ..Default::default()
            });
        }
        let current = live(limited);

        assert_eq!(
            TemplateCounter
                .token(&template("img:1", None), Some(&current))
                .expect("token"),
            "3"
        );
    }

    #[test]
    fn canonical_form_sorts_keys() {
        let mut out = String::new();
        write_canonical(&serde_json::json!({"b": 1, "a": [true, null]}), &mut out);
        assert_eq!(out, r#"{"a":[true,null],"b":1}"#);
    }
}
