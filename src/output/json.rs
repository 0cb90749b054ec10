use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use crate::sync::SyncOutcome;

pub fn to_pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// The outcome plus its derived change flag.
pub fn format_outcome(outcome: &SyncOutcome) -> Result<String> {
    let mut value = serde_json::to_value(outcome)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("has_changes".to_string(), json!(outcome.has_changes()));
    }
    Ok(serde_json::to_string_pretty(&value)?)
}
