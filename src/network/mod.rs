//! Reaction-network definitions.
//!
//! A definition is read either from the rule text format ([`rules`]) or from
//! the JSON exchange format ([`exchange`]). Both produce the same
//! [`NetworkDefinition`], and both can be rendered back out.

pub mod exchange;
pub mod expr;
pub mod rules;

pub use rules::render as render_rules;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{CrnError, Result};
use expr::{parse_expr, Expr};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub name: String,
    #[serde(default)]
    pub initial: f64,
    /// Boundary species hold their value for the whole run.
    #[serde(default)]
    pub boundary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoichTerm {
    pub species: String,
    pub stoichiometry: u32,
}

/// Rate law kept alongside its source text so rendering is lossless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLaw {
    source: String,
    expr: Expr,
}

impl RateLaw {
    pub fn parse(source: &str, line: usize) -> Result<Self> {
        let source = source.trim().to_string();
        let expr = parse_expr(&source, line)?;
        Ok(Self { source, expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

impl PartialEq for RateLaw {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl TryFrom<String> for RateLaw {
    type Error = CrnError;

    fn try_from(source: String) -> Result<Self> {
        RateLaw::parse(&source, 0)
    }
}

impl From<RateLaw> for String {
    fn from(law: RateLaw) -> Self {
        law.source
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub label: String,
    #[serde(default)]
    pub reactants: Vec<StoichTerm>,
    #[serde(default)]
    pub products: Vec<StoichTerm>,
    pub rate_law: RateLaw,
}

impl Reaction {
    /// Net count change per species name, reactants negative.
    pub fn net_change(&self) -> Vec<(&str, i64)> {
        let mut out: Vec<(&str, i64)> = Vec::new();
        for term in &self.reactants {
            bump(&mut out, &term.species, -(term.stoichiometry as i64));
        }
        for term in &self.products {
            bump(&mut out, &term.species, term.stoichiometry as i64);
        }
        out
    }
}

fn bump<'a>(out: &mut Vec<(&'a str, i64)>, name: &'a str, delta: i64) {
    match out.iter_mut().find(|(n, _)| *n == name) {
        Some((_, total)) => *total += delta,
        None => out.push((name, delta)),
    }
}

/// A parsed reaction network: species, global parameters and reactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub species: Vec<Species>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl NetworkDefinition {
    /// Parses either format; text whose first non-blank character is `{` is JSON.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim_start().starts_with('{') {
            exchange::from_json(text)
        } else {
            rules::parse(text)
        }
    }

    /// Floating species names in declaration order.
    pub fn species_names(&self) -> Vec<String> {
        self.species
            .iter()
            .filter(|s| !s.boundary)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn boundary_species_names(&self) -> Vec<String> {
        self.species
            .iter()
            .filter(|s| s.boundary)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn species(&self, name: &str) -> Option<&Species> {
        self.species.iter().find(|s| s.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Checks names are unique and that every reference resolves.
    /// [`validate`](Self::validate) for a document just read from text. Failures
    /// come back as [`CrnError::Parse`] at `line`; line 0 stands for the whole
    /// document.
    pub(crate) fn validate_document(&self, line: usize) -> Result<()> {
        self.validate().map_err(|err| match err {
            CrnError::Validation(message) => CrnError::parse(line, message),
            err @ CrnError::UnknownName { .. } => CrnError::parse(line, err.to_string()),
            err => err,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.species.iter().all(|s| s.boundary) {
            return Err(CrnError::Validation(
                "network declares no floating species".to_string(),
            ));
        }

        let mut seen: Vec<&str> = Vec::new();
        for name in self
            .species
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.parameters.iter().map(|p| p.name.as_str()))
        {
            if !is_identifier(name) {
                return Err(CrnError::Validation(format!("'{name}' is not a valid identifier")));
            }
            if seen.contains(&name) {
                return Err(CrnError::Validation(format!("'{name}' is declared more than once")));
            }
            seen.push(name);
        }

        for reaction in &self.reactions {
            for term in reaction.reactants.iter().chain(&reaction.products) {
                if self.species(&term.species).is_none() {
                    return Err(CrnError::UnknownName {
                        kind: "species",
                        name: term.species.clone(),
                    });
                }
                if term.stoichiometry == 0 {
                    return Err(CrnError::Validation(format!(
                        "reaction {} has a zero stoichiometric coefficient",
                        reaction.label
                    )));
                }
            }
            for ident in reaction.rate_law.expr().identifiers() {
                if !seen.contains(&ident) {
                    return Err(CrnError::UnknownName {
                        kind: "rate law identifier",
                        name: ident.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Reads a definition file, dispatching on extension.
///
/// Returns the parsed definition and the raw text it came from.
pub fn read_definition(path: &Path) -> Result<(NetworkDefinition, String)> {
    let format = DefinitionFormat::from_path(path)?;
    let text = fs::read_to_string(path)?;
    let definition = match format {
        DefinitionFormat::Rules => rules::parse(&text)?,
        DefinitionFormat::Exchange => exchange::from_json(&text)?,
    };
    Ok((definition, text))
}

pub fn write_definition(definition: &NetworkDefinition, path: &Path) -> Result<()> {
    let text = match DefinitionFormat::from_path(path)? {
        DefinitionFormat::Rules => rules::render(definition),
        DefinitionFormat::Exchange => exchange::to_json(definition)?,
    };
    fs::write(path, text)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Rules,
    Exchange,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("txt") | Some("ant") => Ok(DefinitionFormat::Rules),
            Some("json") => Ok(DefinitionFormat::Exchange),
            _ => Err(CrnError::Validation(format!(
                "unsupported definition file '{}': expected .txt, .ant or .json",
                path.display()
            ))),
        }
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMER: &str = "
        bind: 2A -> B; k1*A*(A-1)/2
        unbind: B -> 2A; k2*B
        A = 20
        B = 0
        k1 = 0.01
        k2 = 0.1
    ";

    #[test]
    fn dispatches_on_leading_brace() {
        let from_rules = NetworkDefinition::parse(DIMER).unwrap();
        let json = exchange::to_json(&from_rules).unwrap();
        let from_json = NetworkDefinition::parse(&json).unwrap();
        assert_eq!(from_rules, from_json);
    }

    #[test]
    fn net_change_merges_both_sides() {
        let def = NetworkDefinition::parse("r: A + B -> 2A; k*A*B\nA = 1\nB = 1\nk = 1").unwrap();
        let change = def.reactions[0].net_change();
        assert_eq!(change, vec![("A", 1), ("B", -1)]);
    }

    #[test]
    fn rejects_unknown_extension_before_reading() {
        let err = read_definition(Path::new("/does/not/exist/model.xml")).unwrap_err();
        assert!(matches!(err, CrnError::Validation(_)));
    }

    #[test]
    fn extension_dispatch_is_case_insensitive() {
        assert_eq!(
            DefinitionFormat::from_path(Path::new("net.ANT")).unwrap(),
            DefinitionFormat::Rules
        );
        assert_eq!(
            DefinitionFormat::from_path(Path::new("net.json")).unwrap(),
            DefinitionFormat::Exchange
        );
    }

    #[test]
    fn validate_flags_dangling_rate_law_names() {
        let mut def = NetworkDefinition::parse(DIMER).unwrap();
        def.reactions[0].rate_law = RateLaw::parse("k9*A", 0).unwrap();
        assert!(matches!(
            def.validate(),
            Err(CrnError::UnknownName { ref name, .. }) if name == "k9"
        ));
    }
}
