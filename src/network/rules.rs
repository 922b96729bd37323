//! Line-oriented reaction rule format.
//!
//! ```text
//! model dimer()
//!   species A, B, $S;
//!   bind: 2A -> B; k1*A*(A-1)/2
//!   unbind: B -> 2A; k2*B
//!   A = 20; B = 0; S = 1
//!   k1 = 0.01
//!   k2 = 0.1
//! end
//! ```
//!
//! Statements end at a newline or `;`. A reaction statement is always
//! followed by its rate law. `$` marks a boundary species. Comments start
//! with `//` or `#`.

use crate::{CrnError, Result};

use super::expr::parse_expr;
use super::{is_identifier, NetworkDefinition, Parameter, RateLaw, Reaction, Species, StoichTerm};

#[derive(Default)]
struct Builder {
    name: Option<String>,
    in_model: bool,
    closed: bool,
    order: Vec<String>,
    species: Vec<String>,
    boundary: Vec<String>,
    values: Vec<(String, f64)>,
    reactions: Vec<(Reaction, usize)>,
}

impl Builder {
    fn see(&mut self, name: &str) {
        if !self.order.iter().any(|n| n == name) {
            self.order.push(name.to_string());
        }
    }

    fn mark_species(&mut self, name: &str, boundary: bool) {
        self.see(name);
        if !self.species.iter().any(|n| n == name) {
            self.species.push(name.to_string());
        }
        if boundary && !self.boundary.iter().any(|n| n == name) {
            self.boundary.push(name.to_string());
        }
    }

    fn value(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    fn assign(&mut self, name: &str, value: f64) {
        self.see(name);
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    fn statement(&mut self, stmt: &str, rate: Option<&str>, line: usize) -> Result<()> {
        if self.closed {
            return Err(CrnError::parse(line, "statement after 'end'"));
        }

        if stmt == "end" {
            if !self.in_model {
                return Err(CrnError::parse(line, "'end' without 'model'"));
            }
            self.closed = true;
            return Ok(());
        }

        if let Some(rest) = keyword(stmt, "model") {
            if self.in_model || !self.order.is_empty() {
                return Err(CrnError::parse(line, "'model' must open the definition"));
            }
            let name = rest.trim_start_matches('*').trim_end_matches("()").trim();
            if !is_identifier(name) {
                return Err(CrnError::parse(line, format!("invalid model name '{name}'")));
            }
            self.name = Some(name.to_string());
            self.in_model = true;
            return Ok(());
        }

        if let Some(rest) = keyword(stmt, "species") {
            for item in rest.split(',') {
                let (name, boundary) = strip_boundary(item.trim());
                if !is_identifier(name) {
                    return Err(CrnError::parse(line, format!("invalid species name '{name}'")));
                }
                self.mark_species(name, boundary);
            }
            return Ok(());
        }

        if let Some(rest) = keyword(stmt, "const").or_else(|| keyword(stmt, "var")) {
            return self.statement(rest.trim(), rate, line);
        }

        if stmt.contains("=>") {
            return Err(CrnError::parse(line, "'=>' is not supported, write reactions with '->'"));
        }

        if stmt.contains("->") {
            let rate = rate
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .ok_or_else(|| CrnError::parse(line, "reaction is missing its rate law"))?;
            return self.reaction(stmt, rate, line);
        }

        if let Some((lhs, rhs)) = stmt.split_once('=') {
            let (name, boundary) = strip_boundary(lhs.trim());
            if !is_identifier(name) {
                return Err(CrnError::parse(line, format!("invalid assignment target '{name}'")));
            }
            if boundary {
                self.mark_species(name, true);
            }
            let expr = parse_expr(rhs, line)?;
            let value = expr
                .eval_with(&|n: &str| self.value(n))
                .ok_or_else(|| {
                    CrnError::parse(line, format!("assignment to '{name}' uses an unassigned name"))
                })?;
            if !value.is_finite() {
                return Err(CrnError::parse(line, format!("'{name}' evaluates to {value}")));
            }
            self.assign(name, value);
            return Ok(());
        }

        Err(CrnError::parse(line, format!("unrecognized statement '{stmt}'")))
    }

    fn reaction(&mut self, stmt: &str, rate: &str, line: usize) -> Result<()> {
        let (label, body) = match stmt.split_once(':') {
            Some((label, body)) => {
                let label = label.trim();
                if !is_identifier(label) {
                    return Err(CrnError::parse(line, format!("invalid reaction label '{label}'")));
                }
                (Some(label.to_string()), body)
            }
            None => (None, stmt),
        };

        let (lhs, rhs) = body
            .split_once("->")
            .ok_or_else(|| CrnError::parse(line, "reaction is missing '->'"))?;
        let reactants = self.side(lhs, line)?;
        let products = self.side(rhs, line)?;

        let label = match label {
            Some(label) => {
                if self.reactions.iter().any(|(r, _)| r.label == label) {
                    return Err(CrnError::parse(line, format!("duplicate reaction label '{label}'")));
                }
                label
            }
            None => self.auto_label(),
        };

        let rate_law = RateLaw::parse(rate, line)?;
        self.reactions.push((
            Reaction {
                label,
                reactants,
                products,
                rate_law,
            },
            line,
        ));
        Ok(())
    }

    fn side(&mut self, text: &str, line: usize) -> Result<Vec<StoichTerm>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut terms: Vec<StoichTerm> = Vec::new();
        for raw in text.split('+') {
            let raw = raw.trim();
            let digits = raw.chars().take_while(char::is_ascii_digit).count();
            let coefficient = if digits == 0 {
                1
            } else {
                raw[..digits]
                    .parse::<u32>()
                    .map_err(|_| CrnError::parse(line, format!("invalid coefficient in '{raw}'")))?
            };
            if coefficient == 0 {
                return Err(CrnError::parse(line, format!("zero coefficient in '{raw}'")));
            }

            let (name, boundary) = strip_boundary(raw[digits..].trim());
            if !is_identifier(name) {
                return Err(CrnError::parse(line, format!("invalid species term '{raw}'")));
            }
            self.mark_species(name, boundary);

            match terms.iter_mut().find(|t| t.species == name) {
                Some(term) => term.stoichiometry += coefficient,
                None => terms.push(StoichTerm {
                    species: name.to_string(),
                    stoichiometry: coefficient,
                }),
            }
        }
        Ok(terms)
    }

    fn auto_label(&self) -> String {
        let mut idx = self.reactions.len();
        loop {
            let candidate = format!("J{idx}");
            if !self.reactions.iter().any(|(r, _)| r.label == candidate) {
                return candidate;
            }
            idx += 1;
        }
    }

    fn finish(self, last_line: usize) -> Result<NetworkDefinition> {
        if self.in_model && !self.closed {
            return Err(CrnError::parse(last_line, "missing 'end' for model block"));
        }

        let is_species = |name: &str| self.species.iter().any(|s| s == name);

        let species: Vec<Species> = self
            .order
            .iter()
            .filter(|name| is_species(name))
            .map(|name| Species {
                name: name.clone(),
                initial: self.value(name).unwrap_or(0.0),
                boundary: self.boundary.contains(name),
            })
            .collect();

        let parameters: Vec<Parameter> = self
            .order
            .iter()
            .filter(|name| !is_species(name))
            .filter_map(|name| {
                self.value(name).map(|value| Parameter {
                    name: name.clone(),
                    value,
                })
            })
            .collect();

        for (reaction, line) in &self.reactions {
            for ident in reaction.rate_law.expr().identifiers() {
                if !is_species(ident) && self.value(ident).is_none() {
                    return Err(CrnError::parse(
                        *line,
                        format!("rate law of {} references undefined '{ident}'", reaction.label),
                    ));
                }
            }
        }

        let definition = NetworkDefinition {
            name: self.name,
            species,
            parameters,
            reactions: self.reactions.into_iter().map(|(r, _)| r).collect(),
        };
        definition.validate_document(last_line)?;
        Ok(definition)
    }
}

fn keyword<'a>(stmt: &'a str, word: &str) -> Option<&'a str> {
    let rest = stmt.strip_prefix(word)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn strip_boundary(name: &str) -> (&str, bool) {
    match name.strip_prefix('$') {
        Some(rest) => (rest.trim(), true),
        None => (name, false),
    }
}

fn strip_comment(line: &str) -> &str {
    let cut = [line.find("//"), line.find('#')]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    &line[..cut]
}

/// Parses the rule text format.
pub fn parse(text: &str) -> Result<NetworkDefinition> {
    let mut builder = Builder::default();
    let mut last_line = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        last_line = line;
        let content = strip_comment(raw).trim();
        if content.is_empty() {
            continue;
        }

        let mut pieces = content.split(';');
        while let Some(piece) = pieces.next() {
            let stmt = piece.trim();
            if stmt.is_empty() {
                continue;
            }
            let rate = if stmt.contains("->") { pieces.next() } else { None };
            builder.statement(stmt, rate, line)?;
        }
    }

    builder.finish(last_line)
}

fn render_side(terms: &[StoichTerm]) -> String {
    terms
        .iter()
        .map(|t| {
            if t.stoichiometry == 1 {
                t.species.clone()
            } else {
                format!("{} {}", t.stoichiometry, t.species)
            }
        })
        .collect::<Vec<_>>()
        .join(" + ")
}

/// Renders a definition back into rule text that parses to an equal definition.
pub fn render(definition: &NetworkDefinition) -> String {
    let indent = if definition.name.is_some() { "  " } else { "" };
    let mut out = String::new();

    if let Some(name) = &definition.name {
        out.push_str(&format!("model {name}()\n"));
    }

    let declared = definition
        .species
        .iter()
        .map(|s| {
            if s.boundary {
                format!("${}", s.name)
            } else {
                s.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    out.push_str(&format!("{indent}species {declared};\n\n"));

    for reaction in &definition.reactions {
        out.push_str(&format!(
            "{indent}{}: {} -> {}; {}\n",
            reaction.label,
            render_side(&reaction.reactants),
            render_side(&reaction.products),
            reaction.rate_law.source()
        ));
    }
    out.push('\n');

    for species in &definition.species {
        out.push_str(&format!("{indent}{} = {}\n", species.name, species.initial));
    }
    for parameter in &definition.parameters {
        out.push_str(&format!("{indent}{} = {}\n", parameter.name, parameter.value));
    }

    if definition.name.is_some() {
        out.push_str("end\n");
    }
    out
}
