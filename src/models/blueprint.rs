//! Blueprint Model
//!
//! The structured project plan produced at initialization: title, frameworks,
//! views, roadmap, and the initial phase. Mutable after creation only through
//! a whitelisted patch set; `projectName` changes are routed through the
//! rename path so sandbox and registry stay in sync.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::phase::PhaseConcept;

/// Structured plan for the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub title: String,
    pub project_name: String,
    pub description: String,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub views: Vec<BlueprintView>,
    #[serde(default)]
    pub user_flow: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub pitfalls: Vec<String>,
    #[serde(default)]
    pub implementation_roadmap: Vec<RoadmapItem>,
    pub initial_phase: PhaseConcept,
    #[serde(default)]
    pub color_palette: Vec<String>,
}

/// A single UI view of the planned application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintView {
    pub name: String,
    pub description: String,
}

/// One planned stretch of implementation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapItem {
    pub phase: String,
    pub description: String,
}

/// Keys a client-supplied blueprint patch may touch. `projectName` is
/// deliberately absent: renames go through the dedicated path.
const PATCHABLE_KEYS: &[&str] = &[
    "title",
    "description",
    "frameworks",
    "views",
    "userFlow",
    "architecture",
    "pitfalls",
    "implementationRoadmap",
    "colorPalette",
];

/// Deep-merge the whitelisted keys of `patch` into `blueprint`.
///
/// Returns the list of keys that were applied; non-whitelisted keys are
/// ignored. Objects merge recursively, everything else replaces.
pub fn apply_blueprint_patch(blueprint: &mut Value, patch: &Value) -> Vec<String> {
    let mut applied = Vec::new();
    let Some(patch_map) = patch.as_object() else {
        return applied;
    };
    for (key, incoming) in patch_map {
        if !PATCHABLE_KEYS.contains(&key.as_str()) {
            continue;
        }
        match blueprint.get_mut(key) {
            Some(existing) => deep_merge(existing, incoming),
            None => {
                if let Some(map) = blueprint.as_object_mut() {
                    map.insert(key.clone(), incoming.clone());
                }
            }
        }
        applied.push(key.clone());
    }
    applied
}

fn deep_merge(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, incoming) => *target = incoming.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blueprint_round_trip_is_camel_case() {
        let blueprint = Blueprint {
            title: "Todo".to_string(),
            project_name: "todo-app".to_string(),
            description: "A todo app".to_string(),
            frameworks: vec!["react".to_string()],
            views: vec![],
            user_flow: "open, add, done".to_string(),
            architecture: "spa".to_string(),
            pitfalls: vec![],
            implementation_roadmap: vec![],
            initial_phase: PhaseConcept::new("p0", "Setup", "Scaffold the app"),
            color_palette: vec!["#112233".to_string()],
        };
        let value = serde_json::to_value(&blueprint).unwrap();
        assert!(value.get("projectName").is_some());
        assert!(value.get("userFlow").is_some());
        assert!(value.get("initialPhase").is_some());

        let parsed: Blueprint = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, blueprint);
    }

    #[test]
    fn test_patch_applies_whitelisted_keys_only() {
        let mut blueprint = json!({
            "title": "Todo",
            "projectName": "todo-app",
            "description": "old",
        });
        let applied = apply_blueprint_patch(
            &mut blueprint,
            &json!({
                "description": "new",
                "projectName": "hacked",
                "frameworks": ["react"],
                "bogus": true,
            }),
        );
        assert_eq!(blueprint["description"], "new");
        assert_eq!(blueprint["projectName"], "todo-app");
        assert_eq!(blueprint["frameworks"], json!(["react"]));
        assert!(blueprint.get("bogus").is_none());
        assert_eq!(applied.len(), 2);
    }

    #[test]
    fn test_deep_merge_objects() {
        let mut target = json!({"a": {"x": 1, "y": 2}});
        deep_merge(&mut target, &json!({"a": {"y": 3, "z": 4}, "b": 5}));
        assert_eq!(target, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": 5}));
    }

    #[test]
    fn test_arrays_replace_rather_than_merge() {
        let mut target = json!({"frameworks": ["react", "vite"]});
        deep_merge(&mut target, &json!({"frameworks": ["svelte"]}));
        assert_eq!(target["frameworks"], json!(["svelte"]));
    }
}
