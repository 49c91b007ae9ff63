//! The blackboard: versioned per-project aggregates with partial-update
//! operations, optimistic concurrency, a change log, and a read-through
//! cache with an invalidation side channel.

pub mod store;

use serde_json::Value;

pub use store::{StateStore, StateStoreConfig};

/// Request metadata every mutation carries into the change log.
#[derive(Debug, Clone, Default)]
pub struct WriteCtx {
    pub actor: String,
    pub causation_event_id: Option<String>,
    /// When set, the mutation fails with a version conflict unless the
    /// current aggregate version matches exactly. When unset, compound
    /// mutations retry internally on conflict.
    pub expected_version: Option<u64>,
}

impl WriteCtx {
    pub fn actor(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            ..Self::default()
        }
    }

    pub fn caused_by(mut self, event_id: impl Into<String>) -> Self {
        self.causation_event_id = Some(event_id.into());
        self
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Recursive JSON merge: objects merge key-wise, everything else replaces.
/// `Null` in the patch deletes the key.
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_json(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        (slot, patch_value) => *slot = patch_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overrides_scalars_and_keeps_siblings() {
        let mut doc = json!({"status": "init", "qa": {"status": "pass", "score": 0.9}});
        merge_json(&mut doc, &json!({"qa": {"score": 0.95}}));
        assert_eq!(doc["qa"]["status"], "pass");
        assert_eq!(doc["qa"]["score"], 0.95);
        assert_eq!(doc["status"], "init");
    }

    #[test]
    fn merge_null_deletes_key() {
        let mut doc = json!({"preview_video": "blob://x", "status": "init"});
        merge_json(&mut doc, &json!({"preview_video": null}));
        assert!(doc.get("preview_video").is_none());
    }

    #[test]
    fn merge_inserts_missing_paths() {
        let mut doc = json!({});
        merge_json(&mut doc, &json!({"render_meta": {"model": "vgen-2"}}));
        assert_eq!(doc["render_meta"]["model"], "vgen-2");
    }
}
