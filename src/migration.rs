//! State Migration Engine
//!
//! Upgrades persisted project documents to the current schema at load time.
//! Operates on raw JSON values before typed deserialization so that legacy
//! documents never have to round-trip through the current structs.
//!
//! Migration is a fixed point: `migrate(migrate(s)) == migrate(s)` for any
//! input, and `None` is returned when the document is already current.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Conversation length beyond which internal memos are dropped.
const MAX_RETAINED_MESSAGES: usize = 25;

/// Maximum length of a generated project name.
const MAX_PROJECT_NAME_LEN: usize = 20;

/// Run all migrations over `doc`. Returns the upgraded document, or `None`
/// when nothing needed to change.
pub fn migrate(doc: &Value) -> Option<Value> {
    let mut doc = doc.clone();
    let mut changed = false;

    changed |= migrate_file_keys(&mut doc);
    changed |= migrate_conversation(&mut doc);
    changed |= strip_user_api_keys(&mut doc);
    changed |= migrate_template_details(&mut doc);
    changed |= ensure_project_name(&mut doc);
    changed |= ensure_updates_accumulator(&mut doc);

    changed.then_some(doc)
}

/// `file_path` / `file_contents` / `file_purpose` → current field names.
fn migrate_file_keys(doc: &mut Value) -> bool {
    let mut changed = false;
    let Some(files) = doc
        .get_mut("generatedFilesMap")
        .and_then(Value::as_object_mut)
    else {
        return false;
    };
    for file in files.values_mut() {
        let Some(map) = file.as_object_mut() else {
            continue;
        };
        for (legacy, current) in [
            ("file_path", "path"),
            ("file_contents", "contents"),
            ("file_purpose", "purpose"),
            ("last_diff", "lastDiff"),
            ("last_modified", "lastModified"),
        ] {
            if let Some(value) = map.remove(legacy) {
                map.entry(current.to_string()).or_insert(value);
                changed = true;
            }
        }
    }
    changed
}

/// Dedup by `conversationId` (last writer wins) and, beyond the retention
/// threshold, drop internal-memo entries.
fn migrate_conversation(doc: &mut Value) -> bool {
    let Some(messages) = doc
        .get("conversationMessages")
        .and_then(Value::as_array)
        .cloned()
    else {
        return false;
    };

    let mut deduped: Vec<Value> = Vec::with_capacity(messages.len());
    for msg in &messages {
        let id = msg.get("conversationId").and_then(Value::as_str);
        match id {
            Some(id) => {
                if let Some(existing) = deduped
                    .iter_mut()
                    .find(|m| m.get("conversationId").and_then(Value::as_str) == Some(id))
                {
                    *existing = msg.clone();
                } else {
                    deduped.push(msg.clone());
                }
            }
            None => deduped.push(msg.clone()),
        }
    }

    if deduped.len() > MAX_RETAINED_MESSAGES {
        deduped.retain(|m| !message_is_internal_memo(m));
    }

    if deduped != messages {
        doc["conversationMessages"] = Value::Array(deduped);
        true
    } else {
        false
    }
}

fn message_is_internal_memo(msg: &Value) -> bool {
    match msg.get("content") {
        Some(Value::String(text)) => text.contains(crate::models::INTERNAL_MEMO),
        Some(Value::Array(parts)) => parts.iter().any(|p| {
            p.get("text")
                .and_then(Value::as_str)
                .is_some_and(|t| t.contains(crate::models::INTERNAL_MEMO))
        }),
        _ => false,
    }
}

/// Drop the legacy `inferenceContext.userApiKeys` field.
fn strip_user_api_keys(doc: &mut Value) -> bool {
    doc.get_mut("inferenceContext")
        .and_then(Value::as_object_mut)
        .and_then(|ctx| ctx.remove("userApiKeys"))
        .is_some()
}

/// Replace a legacy inline `templateDetails` blob with `templateName`; the
/// details cache is reconstructed lazily from the template source.
fn migrate_template_details(doc: &mut Value) -> bool {
    let Some(map) = doc.as_object_mut() else {
        return false;
    };
    let Some(details) = map.remove("templateDetails") else {
        return false;
    };
    if map
        .get("templateName")
        .and_then(Value::as_str)
        .map_or(true, str::is_empty)
    {
        let name = details
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        map.insert("templateName".to_string(), json!(name));
    }
    true
}

/// Generate a project name when missing, from blueprint/template/query plus
/// a content-derived suffix, capped to 20 characters.
fn ensure_project_name(doc: &mut Value) -> bool {
    let present = doc
        .get("projectName")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    if present {
        return false;
    }

    let base = doc
        .pointer("/blueprint/projectName")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            doc.get("templateName")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        })
        .map(str::to_string)
        .unwrap_or_else(|| {
            doc.get("query")
                .and_then(Value::as_str)
                .unwrap_or("app")
                .split_whitespace()
                .take(2)
                .collect::<Vec<_>>()
                .join("-")
        });

    let name = generated_name(&base, doc);
    doc["projectName"] = json!(name);
    true
}

fn generated_name(base: &str, doc: &Value) -> String {
    let mut slug: String = base
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if slug.len() < 3 {
        slug = format!("app-{slug}");
    }

    // Suffix derived from document content keeps the fixed-point property
    // while still disambiguating projects that share a base name.
    let mut hasher = Sha256::new();
    hasher.update(doc.get("query").and_then(Value::as_str).unwrap_or("").as_bytes());
    hasher.update(
        doc.get("templateName")
            .and_then(Value::as_str)
            .unwrap_or("")
            .as_bytes(),
    );
    let suffix = format!("{:x}", hasher.finalize())[..6].to_string();

    let budget = MAX_PROJECT_NAME_LEN - suffix.len() - 1;
    slug.truncate(budget);
    let slug = slug.trim_end_matches('-');
    format!("{slug}-{suffix}")
}

/// Older documents predate the updates accumulator.
fn ensure_updates_accumulator(doc: &mut Value) -> bool {
    let Some(map) = doc.as_object_mut() else {
        return false;
    };
    if map.contains_key("projectUpdatesAccumulator") {
        return false;
    }
    map.insert(
        "projectUpdatesAccumulator".to_string(),
        Value::Array(Vec::new()),
    );
    true
}

/// Convenience used by tests and load paths: migrate or pass through.
pub fn migrate_or_passthrough(doc: &Value) -> Value {
    migrate(doc).unwrap_or_else(|| doc.clone())
}
