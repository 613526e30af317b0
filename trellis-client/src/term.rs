//! SPARQL JSON result terms and SPARQL-syntax escaping.
//!
//! Terms follow the SPARQL 1.1 Query Results JSON Format, including the
//! `typed-literal` and `triple` kinds some endpoints emit. Literals may
//! carry a language tag under either `xml:lang` or `lang`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of an RDF term in a result binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TermKind {
    Uri,
    Bnode,
    Literal,
    TypedLiteral,
    Triple,
}

/// One RDF term from a SPARQL JSON result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparqlTerm {
    #[serde(rename = "type")]
    pub kind: TermKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(
        default,
        rename = "xml:lang",
        alias = "lang",
        skip_serializing_if = "Option::is_none"
    )]
    pub lang: Option<String>,
}

impl SparqlTerm {
    /// Construct a URI term.
    pub fn uri(value: impl Into<String>) -> Self {
        Self {
            kind: TermKind::Uri,
            value: value.into(),
            datatype: None,
            lang: None,
        }
    }

    /// Construct a plain literal term.
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            kind: TermKind::Literal,
            value: value.into(),
            datatype: None,
            lang: None,
        }
    }

    /// Construct a typed literal term.
    pub fn typed_literal(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            kind: TermKind::TypedLiteral,
            value: value.into(),
            datatype: Some(datatype.into()),
            lang: None,
        }
    }

    /// Construct a language-tagged literal term.
    pub fn lang_literal(value: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            kind: TermKind::Literal,
            value: value.into(),
            datatype: None,
            lang: Some(lang.into()),
        }
    }

    pub fn is_uri(&self) -> bool {
        self.kind == TermKind::Uri
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, TermKind::Literal | TermKind::TypedLiteral)
    }

    /// Render this term in SPARQL syntax, preserving language tag and
    /// datatype.
    pub fn to_sparql(&self) -> String {
        match self.kind {
            TermKind::Uri => format!("<{}>", self.value),
            TermKind::Bnode => format!("_:{}", self.value),
            TermKind::Literal | TermKind::TypedLiteral => {
                let quoted = format!("\"{}\"", escape_string(&self.value));
                if let Some(lang) = &self.lang {
                    format!("{quoted}@{lang}")
                } else if let Some(datatype) = &self.datatype {
                    format!("{quoted}^^<{datatype}>")
                } else {
                    quoted
                }
            }
            // Quoted triples cannot be rendered back faithfully from the
            // flat value; embed as-is.
            TermKind::Triple => self.value.clone(),
        }
    }
}

/// Escape a string for use inside a SPARQL double-quoted literal.
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// One row of a SELECT result: variable name → term.
pub type Binding = HashMap<String, SparqlTerm>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultHead {
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultBindings {
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

/// A SPARQL JSON results document. SELECT fills `results`; ASK fills
/// `boolean`.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectResponse {
    #[serde(default)]
    pub head: ResultHead,
    #[serde(default)]
    pub results: ResultBindings,
    #[serde(default)]
    pub boolean: Option<bool>,
}

impl SelectResponse {
    /// All terms bound to a variable, in row order.
    pub fn column<'a>(&'a self, var: &'a str) -> impl Iterator<Item = &'a SparqlTerm> + 'a {
        self.results.bindings.iter().filter_map(move |b| b.get(var))
    }
}

/// One triple of a CONSTRUCT result.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstructTriple {
    pub subject: SparqlTerm,
    pub predicate: SparqlTerm,
    pub object: SparqlTerm,
}
