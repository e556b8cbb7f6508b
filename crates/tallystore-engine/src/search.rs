//! Predicate trees evaluated over decoded rows
//!
//! Stores resolve the fields named in a [`Criteria`] into their own
//! extractors once per query, then evaluate the tree per row through a
//! lookup callback so only the fields a predicate touches get decoded.

use std::cmp::Ordering;
use std::fmt;
use tallystore_common::{Error, Result, Timestamp};

/// A decoded field value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Time(Timestamp),
    Bytes(Vec<u8>),
}

impl FieldValue {
    fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// Comparison operators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Byte prefix match
    StartsWith,
}

impl Comparison {
    // Two character operators first so "<=" is not read as "<"
    const TOKENS: [(&'static str, Self); 7] = [
        ("==", Self::Eq),
        ("!=", Self::Ne),
        ("<=", Self::Le),
        (">=", Self::Ge),
        ("^=", Self::StartsWith),
        ("<", Self::Lt),
        (">", Self::Gt),
    ];

    fn holds(self, actual: &FieldValue, expected: &FieldValue) -> bool {
        if self == Self::StartsWith {
            return match (actual, expected) {
                (FieldValue::Bytes(a), FieldValue::Bytes(p)) => a.starts_with(p),
                _ => false,
            };
        }
        let Some(ordering) = actual.compare(expected) else {
            return false;
        };
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::StartsWith => false,
        }
    }
}

/// Split `field<op>value` into its parts
pub fn split_condition(expr: &str) -> Result<(&str, Comparison, &str)> {
    let mut best: Option<(usize, &str, Comparison)> = None;
    for (token, op) in Comparison::TOKENS {
        if let Some(pos) = expr.find(token)
            && best.is_none_or(|(p, t, _)| pos < p || (pos == p && token.len() > t.len()))
        {
            best = Some((pos, token, op));
        }
    }
    let (pos, token, op) =
        best.ok_or_else(|| Error::invalid_argument(format!("no operator in '{expr}'")))?;
    let field = expr[..pos].trim();
    let value = expr[pos + token.len()..].trim();
    if field.is_empty() {
        return Err(Error::invalid_argument(format!("no field in '{expr}'")));
    }
    Ok((field, op, value))
}

/// Boolean predicate tree over fields of type `F`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Criteria<F> {
    /// Matches every row
    All,
    Condition {
        field: F,
        op: Comparison,
        value: FieldValue,
    },
    And(Vec<Criteria<F>>),
    Or(Vec<Criteria<F>>),
    Not(Box<Criteria<F>>),
}

impl<F> Default for Criteria<F> {
    fn default() -> Self {
        Self::All
    }
}

impl<F: Copy> Criteria<F> {
    #[must_use]
    pub const fn condition(field: F, op: Comparison, value: FieldValue) -> Self {
        Self::Condition { field, op, value }
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::All, c) | (c, Self::All) => c,
            (Self::And(mut items), c) => {
                items.push(c);
                Self::And(items)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(vec![self, other])
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Map every field through `resolve`, failing on the first error
    pub fn resolve<G>(&self, resolve: &impl Fn(F) -> Result<G>) -> Result<Criteria<G>> {
        Ok(match self {
            Self::All => Criteria::All,
            Self::Condition { field, op, value } => Criteria::Condition {
                field: resolve(*field)?,
                op: *op,
                value: value.clone(),
            },
            Self::And(items) => Criteria::And(
                items
                    .iter()
                    .map(|c| c.resolve(resolve))
                    .collect::<Result<_>>()?,
            ),
            Self::Or(items) => Criteria::Or(
                items
                    .iter()
                    .map(|c| c.resolve(resolve))
                    .collect::<Result<_>>()?,
            ),
            Self::Not(inner) => Criteria::Not(Box::new(inner.resolve(resolve)?)),
        })
    }
}

impl<F> Criteria<F> {
    /// Evaluate against one row. `lookup` decodes a field on demand;
    /// `And`/`Or` short-circuit so untouched fields stay encoded.
    pub fn evaluate(&self, lookup: &mut impl FnMut(&F) -> Result<FieldValue>) -> Result<bool> {
        match self {
            Self::All => Ok(true),
            Self::Condition { field, op, value } => Ok(op.holds(&lookup(field)?, value)),
            Self::And(items) => {
                for item in items {
                    if !item.evaluate(lookup)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(items) => {
                for item in items {
                    if item.evaluate(lookup)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(inner) => Ok(!inner.evaluate(lookup)?),
        }
    }
}

/// Outcome of a search
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchSummary {
    pub scanned: u64,
    pub matched: u64,
    /// Rows that failed to decode and were skipped
    pub skipped_corrupt: u64,
    /// The consumer asked to stop before the scan finished
    pub stopped_early: bool,
}
