//! JSON Schema generation for the wire types, for downstream tooling and
//! documentation generation. Purely additive; nothing in the core depends on
//! this feature being enabled.

#![cfg(feature = "schema")]

use schemars::schema_for;

/// Generates the JSON Schema for [`crate::message::Message`] as a pretty-printed string.
pub fn message_schema() -> String {
    let schema = schema_for!(crate::message::Message);
    serde_json::to_string_pretty(&schema).expect("schema serializes")
}

/// Generates the JSON Schema for [`crate::task::TaskOptions`] as a pretty-printed string.
pub fn task_options_schema() -> String {
    let schema = schema_for!(crate::task::TaskOptions);
    serde_json::to_string_pretty(&schema).expect("schema serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_schema_is_valid_json() {
        let schema = message_schema();
        let parsed: serde_json::Value = serde_json::from_str(&schema).unwrap();
        assert!(parsed.get("properties").is_some());
    }

    #[test]
    fn task_options_schema_is_valid_json() {
        let schema = task_options_schema();
        let parsed: serde_json::Value = serde_json::from_str(&schema).unwrap();
        assert!(parsed.get("properties").is_some());
    }
}
