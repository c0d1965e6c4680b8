//! Recursive descent parser for the filter grammar.

use super::{Criterion, FilterError, FilterOperator};

pub(super) fn parse(text: &str) -> Result<Option<Criterion>, FilterError> {
	let mut parser = Parser { src: text, pos: 0 };
	parser.skip_ws();
	if parser.at_end() {
		return Ok(None);
	}

	let root = if parser.peek() == Some('(') {
		parser.filter()?
	} else {
		parser.item()?
	};

	parser.skip_ws();
	if !parser.at_end() {
		return Err(FilterError::TrailingInput { pos: parser.pos });
	}
	Ok(Some(root))
}

struct Parser<'a> {
	src: &'a str,
	pos: usize,
}

impl Parser<'_> {
	fn peek(&self) -> Option<char> {
		self.src[self.pos..].chars().next()
	}

	fn peek_at(&self, offset: usize) -> Option<char> {
		self.src[self.pos..].chars().nth(offset)
	}

	fn bump(&mut self) -> Option<char> {
		let c = self.peek()?;
		self.pos += c.len_utf8();
		Some(c)
	}

	fn at_end(&self) -> bool {
		self.pos >= self.src.len()
	}

	fn skip_ws(&mut self) {
		while self.peek().is_some_and(char::is_whitespace) {
			self.bump();
		}
	}

	fn expect(&mut self, expected: char) -> Result<(), FilterError> {
		self.skip_ws();
		match self.peek() {
			Some(c) if c == expected => {
				self.bump();
				Ok(())
			}
			Some(_) => Err(FilterError::Expected { expected, pos: self.pos }),
			None => Err(FilterError::Unclosed),
		}
	}

	/// `"(" body ")"`
	fn filter(&mut self) -> Result<Criterion, FilterError> {
		self.expect('(')?;
		self.skip_ws();
		let criterion = match self.peek() {
			Some('&') => {
				self.bump();
				Criterion::And(self.filter_list()?)
			}
			Some('|') => {
				self.bump();
				Criterion::Or(self.filter_list()?)
			}
			Some('!') => {
				self.bump();
				self.skip_ws();
				Criterion::Not(Box::new(self.filter()?))
			}
			_ => self.item()?,
		};
		self.expect(')')?;
		Ok(criterion)
	}

	fn filter_list(&mut self) -> Result<Vec<Criterion>, FilterError> {
		self.skip_ws();
		if self.peek() != Some('(') {
			return Err(FilterError::Expected {
				expected: '(',
				pos: self.pos,
			});
		}
		let mut subs = Vec::new();
		while self.peek() == Some('(') {
			subs.push(self.filter()?);
			self.skip_ws();
		}
		Ok(subs)
	}

	fn item(&mut self) -> Result<Criterion, FilterError> {
		let attr = self.attr()?;
		let op_pos = self.pos;
		let op = match self.bump() {
			Some('=') => {
				if self.is_presence() {
					self.bump();
					self.skip_ws();
					return Ok(Criterion::Present { attr });
				}
				return self.equal_or_substring(attr);
			}
			Some('~') if self.peek() == Some('=') => {
				self.bump();
				FilterOperator::Approx
			}
			Some('>') => self.with_equal(FilterOperator::Greater, FilterOperator::GreaterEqual),
			Some('<') => self.with_equal(FilterOperator::Less, FilterOperator::LessEqual),
			Some(_) => return Err(FilterError::InvalidOperator { pos: op_pos }),
			None => return Err(FilterError::Unclosed),
		};
		let value = self.value()?.join("*");
		Ok(Criterion::Compare { attr, op, value })
	}

	fn with_equal(&mut self, bare: FilterOperator, with_eq: FilterOperator) -> FilterOperator {
		if self.peek() == Some('=') {
			self.bump();
			with_eq
		} else {
			bare
		}
	}

	/// `=*` followed only by whitespace up to the closing paren or end of input.
	fn is_presence(&self) -> bool {
		if self.peek() != Some('*') {
			return false;
		}
		let rest = self.src[self.pos + 1..].trim_start();
		rest.is_empty() || rest.starts_with(')')
	}

	fn equal_or_substring(&mut self, attr: String) -> Result<Criterion, FilterError> {
		self.skip_ws();
		let pieces = self.value()?;
		if pieces.len() == 1 {
			let value = pieces.into_iter().next().unwrap_or_default();
			Ok(Criterion::Compare {
				attr,
				op: FilterOperator::Equal,
				value,
			})
		} else {
			Ok(Criterion::Substring { attr, pieces })
		}
	}

	fn attr(&mut self) -> Result<String, FilterError> {
		self.skip_ws();
		let start = self.pos;
		while let Some(c) = self.peek() {
			if matches!(c, '~' | '<' | '>' | '=' | '(' | ')') {
				break;
			}
			self.bump();
		}
		let attr = self.src[start..self.pos].trim_end();
		if attr.is_empty() {
			if self.at_end() {
				return Err(FilterError::Unclosed);
			}
			return Err(FilterError::MissingAttribute { pos: start });
		}
		Ok(attr.to_owned())
	}

	/// Reads a value up to the closing paren, splitting on unescaped `*`.
	fn value(&mut self) -> Result<Vec<String>, FilterError> {
		let start = self.pos;
		let mut pieces = vec![String::new()];
		let mut raw_len = 0usize;
		loop {
			match self.peek() {
				None | Some(')') => break,
				Some('(') => return Err(FilterError::InvalidValue { pos: self.pos }),
				Some('\\') => {
					self.bump();
					let escaped = self.bump().ok_or(FilterError::Unclosed)?;
					push_char(&mut pieces, escaped);
				}
				Some('*') => {
					self.bump();
					pieces.push(String::new());
				}
				Some(c) => {
					self.bump();
					push_char(&mut pieces, c);
				}
			}
			raw_len += 1;
		}
		if raw_len == 0 {
			return Err(FilterError::MissingValue { pos: start });
		}
		Ok(pieces)
	}
}

fn push_char(pieces: &mut [String], c: char) {
	if let Some(last) = pieces.last_mut() {
		last.push(c);
	}
}
