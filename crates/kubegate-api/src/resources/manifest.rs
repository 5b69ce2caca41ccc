//! Multi-document manifest parsing
//!
//! Every document is parsed and checked before anything is sent upstream, so
//! a bad document anywhere in the payload means nothing gets created.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Parse a YAML payload into the objects it describes, in document order
///
/// Empty documents (a stray `---`) are skipped. Each remaining document must
/// be a mapping with `apiVersion`, `kind` and `metadata.name`.
pub fn parse(raw: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(raw).enumerate() {
        let yaml = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::manifest_at(index, e.to_string()))?;
        if yaml.is_null() {
            continue;
        }

        let object = serde_json::to_value(&yaml)
            .map_err(|e| Error::manifest_at(index, e.to_string()))?;
        check_object(&object, index)?;
        objects.push(object);
    }

    if objects.is_empty() {
        return Err(Error::validation_for_field("yaml", "manifest contains no objects"));
    }
    Ok(objects)
}

fn check_object(object: &Value, index: usize) -> Result<()> {
    let Some(map) = object.as_object() else {
        return Err(Error::validation(format!(
            "document {} is not a mapping",
            index
        )));
    };

    let present = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    };

    for field in ["apiVersion", "kind"] {
        if !present(map.get(field)) {
            return Err(Error::validation_for_field(
                field,
                format!("document {} is missing {}", index, field),
            ));
        }
    }
    if !present(object.pointer("/metadata/name")) {
        return Err(Error::validation_for_field(
            "metadata.name",
            format!("document {} is missing metadata.name", index),
        ));
    }
    Ok(())
}
