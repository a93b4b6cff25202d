//! Structural three-way merge of JSON documents.

use serde_json::{Map, Value};

use crate::sync::merge::{MergeContext, MergeResult};

/// A key-level disagreement; the text merges get the next chance.
struct Conflict;

fn merge_value(
    base: Option<&Value>,
    ours: Option<&Value>,
    theirs: Option<&Value>,
) -> Result<Option<Value>, Conflict> {
    if ours == theirs || base == theirs {
        return Ok(ours.cloned());
    }
    if base == ours {
        return Ok(theirs.cloned());
    }

    match (base, ours, theirs) {
        (None | Some(Value::Object(_)), Some(Value::Object(ours)), Some(Value::Object(theirs))) => {
            let empty = Map::new();
            let base = match base {
                Some(Value::Object(base)) => base,
                _ => &empty,
            };
            merge_object(base, ours, theirs).map(|map| Some(Value::Object(map)))
        }
        _ => Err(Conflict),
    }
}

/// Keys keep the working document's order; keys only the generator added
/// follow in the generator's order.
fn merge_object(
    base: &Map<String, Value>,
    ours: &Map<String, Value>,
    theirs: &Map<String, Value>,
) -> Result<Map<String, Value>, Conflict> {
    let mut merged = Map::new();

    let keys = ours
        .keys()
        .chain(theirs.keys().filter(|key| !ours.contains_key(*key)))
        .chain(
            base.keys()
                .filter(|key| !ours.contains_key(*key) && !theirs.contains_key(*key)),
        );

    for key in keys {
        if let Some(value) = merge_value(base.get(key), ours.get(key), theirs.get(key))? {
            merged.insert(key.clone(), value);
        }
    }

    Ok(merged)
}

/// Whether printing `value` gives back `text`, so a merged document keeps
/// the layout and number spelling of the files it came from.
fn reproduces(value: &Value, text: &str) -> bool {
    serde_json::to_string_pretty(value).is_ok_and(|pretty| pretty == text.trim_end_matches('\n'))
}

/// Merges `.json` files whose three versions all parse as objects.
///
/// Declines anything else, any file not laid out the way the merged result
/// would be printed, and any file where both sides changed the same key to
/// different values.
pub fn json_merge(ctx: &MergeContext<'_>) -> Option<MergeResult> {
    if ctx.path.extension() != Some("json") {
        return None;
    }

    let parse = |text: &str| match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) if reproduces(&value, text) => Some(value),
        _ => None,
    };

    let base = parse(ctx.base)?;
    let ours = parse(ctx.working)?;
    let theirs = parse(ctx.generated)?;

    let merged = merge_value(Some(&base), Some(&ours), Some(&theirs)).ok()??;
    let mut text = serde_json::to_string_pretty(&merged).ok()?;
    if ctx.generated.ends_with('\n') {
        text.push('\n');
    }

    Some(MergeResult {
        text,
        has_conflict: false,
    })
}
