//! Case registration and selection.
//!
//! Cases form a tree through [`Registry::group`] and [`Group::group`], but are
//! stored flat under their composite `Group/SubCase` names, in registration
//! order.

use std::collections::HashSet;
use std::fmt;

use regex::Regex;

use crate::error::HarnessError;
use crate::harness::{Bencher, CaseFn, CaseResult};

pub struct Case {
    name: String,
    body: Box<CaseFn<'static>>,
}

impl Case {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &CaseFn<'static> {
        self.body.as_ref()
    }
}

impl fmt::Debug for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Case").field("name", &self.name).finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    cases: Vec<Case>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `body` under the full name `name`.
    ///
    /// Fails if the name is malformed or already taken.
    pub fn register<F>(&mut self, name: &str, body: F) -> Result<(), HarnessError>
    where
        F: Fn(&mut Bencher) -> CaseResult + Send + Sync + 'static,
    {
        validate_name(name)?;
        if !self.names.insert(name.to_string()) {
            return Err(HarnessError::DuplicateCase(name.to_string()));
        }
        self.cases.push(Case {
            name: name.to_string(),
            body: Box::new(body),
        });
        Ok(())
    }

    /// Opens a group; cases registered through it are named `name/<sub>`.
    pub fn group(&mut self, name: &str) -> Group<'_> {
        Group {
            registry: self,
            prefix: name.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Case> {
        self.cases.iter()
    }

    /// Cases matching `filter`, in registration order.
    pub fn select(&self, filter: &Filter) -> Vec<&Case> {
        self.cases.iter().filter(|c| filter.matches(&c.name)).collect()
    }
}

pub struct Group<'r> {
    registry: &'r mut Registry,
    prefix: String,
}

impl Group<'_> {
    pub fn register<F>(&mut self, name: &str, body: F) -> Result<(), HarnessError>
    where
        F: Fn(&mut Bencher) -> CaseResult + Send + Sync + 'static,
    {
        let full = format!("{}/{}", self.prefix, name);
        self.registry.register(&full, body)
    }

    pub fn group(&mut self, name: &str) -> Group<'_> {
        Group {
            prefix: format!("{}/{}", self.prefix, name),
            registry: &mut *self.registry,
        }
    }
}

fn validate_name(name: &str) -> Result<(), HarnessError> {
    let invalid = |reason| HarnessError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.split('/').any(str::is_empty) {
        return Err(invalid("empty path segment"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("whitespace in name"));
    }
    Ok(())
}

/// Case selection.
///
/// A pattern is split on `/` and each element is an unanchored regular
/// expression matched against the name segment at the same depth, so `Add`
/// selects `Add/Int` and `Chan/Buf.*/1$` selects `Channel/BufferSize/1`.
/// Segments deeper than the pattern match anything.
#[derive(Debug, Clone)]
pub enum Filter {
    All,
    Exact(String),
    Pattern(Vec<Regex>),
}

impl Filter {
    pub fn parse(pattern: Option<&str>, exact: bool) -> Result<Self, HarnessError> {
        let pattern = match pattern {
            None | Some("") => return Ok(Filter::All),
            Some(p) => p,
        };
        if exact {
            return Ok(Filter::Exact(pattern.to_string()));
        }
        let elems = pattern
            .split('/')
            .map(|elem| {
                Regex::new(elem).map_err(|source| HarnessError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Filter::Pattern(elems))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Exact(want) => want == name,
            Filter::Pattern(elems) => {
                let segments: Vec<&str> = name.split('/').collect();
                if elems.len() > segments.len() {
                    return false;
                }
                elems
                    .iter()
                    .zip(&segments)
                    .all(|(re, segment)| re.is_match(segment))
            }
        }
    }
}
