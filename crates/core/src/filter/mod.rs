//! LDAP-style filters over [`Properties`].
//!
//! # Role
//!
//! Filters select services by their properties. The registry treats a parsed
//! [`Filter`] as an opaque predicate: [`Filter::matches`] is pure and
//! deterministic for a given filter and property map.
//!
//! # Grammar
//!
//! ```text
//! filter     = "(" body ")"
//! body       = "&" filter+ | "|" filter+ | "!" filter | item
//! item       = attr ( "=" value | "=*" | "~=" value | ">" value | ">=" value
//!                   | "<" value | "<=" value )
//! ```
//!
//! A value containing an unescaped `*` is a substring pattern. `\` escapes the
//! next character. The outer parentheses may be omitted for a single item,
//! and an empty string parses to the empty filter, which matches everything.
//!
//! # Invariants
//!
//! - A missing attribute never matches, including under the ordering operators.
//!   - Enforced in: `Criterion::matches`
//!   - Tested by: `filter::tests::missing_attribute_never_matches`
//!   - Failure symptom: services without a key leak into `(!(key=*))`-style lookups.
//! - `to_string` output parses back to an equivalent filter.
//!   - Enforced in: `Criterion::fmt`
//!   - Tested by: `filter::tests::prop_display_reparses`
//!   - Failure symptom: filters rebuilt from logged text select different services.

use std::fmt;
use std::str::FromStr;

use crate::properties::Properties;

mod parse;

/// Comparison applied by a leaf criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
	/// `attr=value`
	Equal,
	/// `attr~=value`, ASCII case-insensitive equality.
	Approx,
	/// `attr>value`
	Greater,
	/// `attr>=value`
	GreaterEqual,
	/// `attr<value`
	Less,
	/// `attr<=value`
	LessEqual,
}

impl FilterOperator {
	fn symbol(self) -> &'static str {
		match self {
			Self::Equal => "=",
			Self::Approx => "~=",
			Self::Greater => ">",
			Self::GreaterEqual => ">=",
			Self::Less => "<",
			Self::LessEqual => "<=",
		}
	}
}

/// Errors produced while parsing a filter string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
	#[error("expected '{expected}' at offset {pos}")]
	Expected { expected: char, pos: usize },
	#[error("missing attribute at offset {pos}")]
	MissingAttribute { pos: usize },
	#[error("missing value at offset {pos}")]
	MissingValue { pos: usize },
	#[error("invalid operator at offset {pos}")]
	InvalidOperator { pos: usize },
	#[error("'(' not allowed in value at offset {pos}")]
	InvalidValue { pos: usize },
	#[error("unclosed filter")]
	Unclosed,
	#[error("unexpected trailing input at offset {pos}")]
	TrailingInput { pos: usize },
}

/// Parsed filter tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Criterion {
	And(Vec<Criterion>),
	Or(Vec<Criterion>),
	Not(Box<Criterion>),
	Present {
		attr: String,
	},
	/// Pieces between wildcards. An empty first piece means a leading `*`,
	/// an empty last piece a trailing `*`. Always at least two pieces.
	Substring {
		attr: String,
		pieces: Vec<String>,
	},
	Compare {
		attr: String,
		op: FilterOperator,
		value: String,
	},
}

impl Criterion {
	fn matches(&self, props: &Properties) -> bool {
		match self {
			Self::And(subs) => subs.iter().all(|c| c.matches(props)),
			Self::Or(subs) => subs.iter().any(|c| c.matches(props)),
			Self::Not(sub) => !sub.matches(props),
			Self::Present { attr } => props.contains(attr),
			Self::Substring { attr, pieces } => props.get(attr).is_some_and(|v| substring_match(v, pieces)),
			Self::Compare { attr, op, value } => props.get(attr).is_some_and(|v| compare(v, *op, value)),
		}
	}
}

fn substring_match(value: &str, pieces: &[String]) -> bool {
	let (first, rest) = match pieces.split_first() {
		Some(split) => split,
		None => return false,
	};
	let Some((last, middle)) = rest.split_last() else {
		return value == first;
	};
	let Some(mut remaining) = value.strip_prefix(first.as_str()) else {
		return false;
	};
	for piece in middle {
		match remaining.find(piece.as_str()) {
			Some(idx) => remaining = &remaining[idx + piece.len()..],
			None => return false,
		}
	}
	remaining.len() >= last.len() && remaining.ends_with(last.as_str())
}

/// Ordering operators compare numerically when both sides are integers,
/// lexicographically otherwise.
fn compare(actual: &str, op: FilterOperator, expected: &str) -> bool {
	use std::cmp::Ordering;

	let ordering = || match (actual.trim().parse::<i64>(), expected.trim().parse::<i64>()) {
		(Ok(a), Ok(b)) => a.cmp(&b),
		_ => actual.cmp(expected),
	};
	match op {
		FilterOperator::Equal => actual == expected,
		FilterOperator::Approx => !actual.is_empty() && actual.eq_ignore_ascii_case(expected),
		FilterOperator::Greater => ordering() == Ordering::Greater,
		FilterOperator::GreaterEqual => ordering() != Ordering::Less,
		FilterOperator::Less => ordering() == Ordering::Less,
		FilterOperator::LessEqual => ordering() != Ordering::Greater,
	}
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
	for c in value.chars() {
		if matches!(c, '(' | ')' | '*' | '\\') {
			f.write_str("\\")?;
		}
		write!(f, "{c}")?;
	}
	Ok(())
}

impl fmt::Display for Criterion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("(")?;
		match self {
			Self::And(subs) | Self::Or(subs) => {
				f.write_str(if matches!(self, Self::And(_)) { "&" } else { "|" })?;
				for sub in subs {
					write!(f, "{sub}")?;
				}
			}
			Self::Not(sub) => write!(f, "!{sub}")?,
			Self::Present { attr } => write!(f, "{attr}=*")?,
			Self::Substring { attr, pieces } => {
				write!(f, "{attr}=")?;
				for (i, piece) in pieces.iter().enumerate() {
					if i > 0 {
						f.write_str("*")?;
					}
					write_escaped(f, piece)?;
				}
			}
			Self::Compare { attr, op, value } => {
				write!(f, "{attr}{}", op.symbol())?;
				write_escaped(f, value)?;
			}
		}
		f.write_str(")")
	}
}

/// A parsed LDAP-style filter. The default value is the empty filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
	root: Option<Criterion>,
}

impl Filter {
	/// The empty filter; matches every property map.
	pub fn empty() -> Self {
		Self::default()
	}

	pub fn parse(text: &str) -> Result<Self, FilterError> {
		let root = parse::parse(text).inspect_err(|err| {
			tracing::debug!(filter = text, error = %err, "filter parse failed");
		})?;
		Ok(Self { root })
	}

	pub fn is_empty(&self) -> bool {
		self.root.is_none()
	}

	pub fn matches(&self, props: &Properties) -> bool {
		self.root.as_ref().is_none_or(|c| c.matches(props))
	}
}

impl FromStr for Filter {
	type Err = FilterError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Filter::parse(s)
	}
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.root {
			Some(root) => write!(f, "{root}"),
			None => Ok(()),
		}
	}
}
