//! Structured JSON exchange format for network definitions.
//!
//! The document is the serde form of [`NetworkDefinition`]; rate laws are
//! carried as expression strings and parsed on load.

use crate::{CrnError, Result};

use super::NetworkDefinition;

pub fn to_json(definition: &NetworkDefinition) -> Result<String> {
    Ok(serde_json::to_string_pretty(definition)?)
}

pub fn from_json(text: &str) -> Result<NetworkDefinition> {
    let definition: NetworkDefinition = serde_json::from_str(text)
        .map_err(|e| CrnError::parse(e.line(), format!("invalid exchange document: {e}")))?;
    definition.validate_document(0)?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_hand_written_document() {
        let text = r#"{
            "name": "source",
            "species": [
                {"name": "X", "initial": 4},
                {"name": "S", "initial": 1, "boundary": true}
            ],
            "parameters": [{"name": "k", "value": 0.5}],
            "reactions": [
                {"label": "make", "reactants": [{"species": "S", "stoichiometry": 1}],
                 "products": [{"species": "X", "stoichiometry": 1}], "rate_law": "k*S"}
            ]
        }"#;
        let def = from_json(text).unwrap();
        assert_eq!(def.name.as_deref(), Some("source"));
        assert_eq!(def.species_names(), vec!["X"]);
        assert_eq!(def.reactions[0].rate_law.source(), "k*S");
    }

    #[test]
    fn bad_rate_law_is_a_parse_error() {
        let text = r#"{
            "species": [{"name": "X"}],
            "reactions": [{"label": "r", "rate_law": "k*("}]
        }"#;
        assert!(matches!(from_json(text), Err(CrnError::Parse { .. })));
    }

    #[test]
    fn dangling_species_reference_is_rejected() {
        let text = r#"{
            "species": [{"name": "X"}],
            "parameters": [{"name": "k", "value": 1}],
            "reactions": [{"label": "r", "reactants": [{"species": "Y", "stoichiometry": 1}], "rate_law": "k"}]
        }"#;
        match from_json(text) {
            Err(CrnError::Parse { message, .. }) => assert!(message.contains("'Y'"), "{message}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
