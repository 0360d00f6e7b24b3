//! Canonical fragment identifiers.
//!
//! A [`Cfi`] addresses a point (or a range) inside the structure of a
//! document: the spine item it lives in, the element path inside that item
//! and an optional character offset. Addresses never depend on layout, so
//! they survive reflow, font changes and re-pagination.
//!
//! Ordering follows reading order: spine position first, then the element
//! path of the (range) start, then the character offset. Id assertions are
//! hints for re-anchoring and take no part in comparison.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// Step of the package document that holds the `<spine>` element.
pub const PACKAGE_SPINE_STEP: u32 = 6;

const WRAPPER_OPEN: &str = "epubcfi(";
const SPECIAL_CHARS: &[char] = &['^', '[', ']', '(', ')', ',', ';', '='];

static HREF_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"epubcfi\(((?:\^.|[^)^])*)\)").expect("valid address pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CfiParseError {
    #[error("empty address")]
    Empty,
    #[error("missing closing parenthesis")]
    Unterminated,
    #[error("unexpected end of address")]
    UnexpectedEnd,
    #[error("unexpected character {found:?} at {position}")]
    UnexpectedChar { found: char, position: usize },
    #[error("invalid step number at {position}")]
    InvalidNumber { position: usize },
    #[error("unterminated assertion starting at {position}")]
    UnterminatedAssertion { position: usize },
    #[error("address does not reference a spine item")]
    MissingSpineStep,
    #[error("range addresses need an indirection step")]
    RangeWithoutIndirection,
    #[error("no epubcfi(...) address in {input:?}")]
    MissingAddress { input: String },
}

/// One `/n[assertion]` step. Even numbers address elements, odd numbers
/// address the character data between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub index: u32,
    pub assertion: Option<String>,
}

impl Step {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            assertion: None,
        }
    }

    pub fn with_assertion(index: u32, assertion: impl Into<String>) -> Self {
        Self {
            index,
            assertion: Some(assertion.into()),
        }
    }

    pub fn is_element(&self) -> bool {
        self.index % 2 == 0
    }
}

/// `:offset[assertion]` at the end of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub offset: u32,
    pub assertion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CfiPath {
    pub steps: Vec<Step>,
    pub terminal: Option<Terminal>,
}

impl CfiPath {
    pub fn new(steps: Vec<Step>, offset: Option<u32>) -> Self {
        Self {
            steps,
            terminal: offset.map(|offset| Terminal {
                offset,
                assertion: None,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.terminal.is_none()
    }

    fn offset(&self) -> Option<u32> {
        self.terminal.as_ref().map(|t| t.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfiRange {
    pub start: CfiPath,
    pub end: CfiPath,
}

#[derive(Clone, SerializeDisplay, DeserializeFromStr)]
pub struct Cfi {
    spine_index: usize,
    base: CfiPath,
    path: Option<CfiPath>,
    range: Option<CfiRange>,
}

impl Cfi {
    pub fn parse(input: &str) -> Result<Self, CfiParseError> {
        let trimmed = input.trim();
        let body = match trimmed.strip_prefix(WRAPPER_OPEN) {
            Some(rest) => rest.strip_suffix(')').ok_or(CfiParseError::Unterminated)?,
            None => trimmed,
        };
        if body.is_empty() {
            return Err(CfiParseError::Empty);
        }
        Parser::new(body).cfi()
    }

    /// The start of a spine item, before any of its content.
    pub fn section_start(spine_index: usize) -> Self {
        Self {
            spine_index,
            base: spine_base(spine_index),
            path: Some(CfiPath::default()),
            range: None,
        }
    }

    /// A point inside a spine item.
    pub fn point(spine_index: usize, steps: Vec<Step>, offset: Option<u32>) -> Self {
        Self {
            spine_index,
            base: spine_base(spine_index),
            path: Some(CfiPath::new(steps, offset)),
            range: None,
        }
    }

    /// A character range inside one text node: `parent` is the element path,
    /// `node` the text step, and `start..end` the character span.
    pub fn text_range(
        spine_index: usize,
        parent: Vec<Step>,
        node: Step,
        start: u32,
        end: u32,
    ) -> Self {
        Self {
            spine_index,
            base: spine_base(spine_index),
            path: Some(CfiPath::new(parent, None)),
            range: Some(CfiRange {
                start: CfiPath::new(vec![node.clone()], Some(start)),
                end: CfiPath::new(vec![node], Some(end)),
            }),
        }
    }

    /// Attaches an id assertion to the spine itemref step.
    pub fn with_spine_id(mut self, id: impl Into<String>) -> Self {
        if let Some(step) = self.base.steps.get_mut(1) {
            step.assertion = Some(id.into());
        }
        self
    }

    pub fn spine_index(&self) -> usize {
        self.spine_index
    }

    pub fn is_range(&self) -> bool {
        self.range.is_some()
    }

    /// Element path indices of the addressed start, inside the spine item.
    pub fn element_path(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .path
            .iter()
            .flat_map(|path| path.steps.iter().map(|step| step.index))
            .collect();
        if let Some(range) = &self.range {
            indices.extend(range.start.steps.iter().map(|step| step.index));
        }
        indices
    }

    /// Character offset of the addressed start, if any.
    pub fn offset(&self) -> Option<u32> {
        match &self.range {
            Some(range) => range.start.offset(),
            None => self.path.as_ref().and_then(CfiPath::offset),
        }
    }

    /// Collapses a range to its start point; points are returned unchanged.
    pub fn start(&self) -> Cfi {
        let Some(range) = &self.range else {
            return self.clone();
        };
        let mut path = self.path.clone().unwrap_or_default();
        path.steps.extend(range.start.steps.iter().cloned());
        path.terminal = range.start.terminal.clone();
        Cfi {
            spine_index: self.spine_index,
            base: self.base.clone(),
            path: Some(path),
            range: None,
        }
    }
}

fn spine_base(spine_index: usize) -> CfiPath {
    let itemref = u32::try_from(spine_index)
        .ok()
        .and_then(|index| index.checked_add(1))
        .and_then(|index| index.checked_mul(2))
        .unwrap_or(u32::MAX - 1);
    CfiPath::new(vec![Step::new(PACKAGE_SPINE_STEP), Step::new(itemref)], None)
}

fn spine_index_of(base: &CfiPath) -> Option<usize> {
    let step = base.steps.get(1)?;
    if step.index == 0 || !step.is_element() {
        return None;
    }
    Some((step.index / 2 - 1) as usize)
}

/// Extracts the address from a link target such as
/// `#epubcfi(/6/4!/4/2/1:0)`.
pub fn address_from_href(href: &str) -> Result<&str, CfiParseError> {
    HREF_ADDRESS
        .captures(href)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
        .filter(|address| !address.is_empty())
        .ok_or_else(|| CfiParseError::MissingAddress {
            input: href.to_owned(),
        })
}

impl PartialEq for Cfi {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cfi {}

impl PartialOrd for Cfi {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cfi {
    fn cmp(&self, other: &Self) -> Ordering {
        self.spine_index
            .cmp(&other.spine_index)
            .then_with(|| self.element_path().cmp(&other.element_path()))
            .then_with(|| {
                self.offset()
                    .unwrap_or(0)
                    .cmp(&other.offset().unwrap_or(0))
            })
    }
}

impl fmt::Debug for Cfi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cfi({})", self)
    }
}

impl fmt::Display for Cfi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(WRAPPER_OPEN)?;
        write_path(f, &self.base)?;
        if let Some(path) = &self.path {
            f.write_str("!")?;
            write_path(f, path)?;
        }
        if let Some(range) = &self.range {
            f.write_str(",")?;
            write_path(f, &range.start)?;
            f.write_str(",")?;
            write_path(f, &range.end)?;
        }
        f.write_str(")")
    }
}

fn write_path(f: &mut fmt::Formatter<'_>, path: &CfiPath) -> fmt::Result {
    for step in &path.steps {
        write!(f, "/{}", step.index)?;
        write_assertion(f, step.assertion.as_deref())?;
    }
    if let Some(terminal) = &path.terminal {
        write!(f, ":{}", terminal.offset)?;
        write_assertion(f, terminal.assertion.as_deref())?;
    }
    Ok(())
}

fn write_assertion(f: &mut fmt::Formatter<'_>, assertion: Option<&str>) -> fmt::Result {
    let Some(assertion) = assertion else {
        return Ok(());
    };
    f.write_str("[")?;
    for c in assertion.chars() {
        if SPECIAL_CHARS.contains(&c) {
            f.write_str("^")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("]")
}

impl FromStr for Cfi {
    type Err = CfiParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cfi::parse(s)
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), CfiParseError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(found) => Err(CfiParseError::UnexpectedChar {
                found,
                position: self.pos,
            }),
            None => Err(CfiParseError::UnexpectedEnd),
        }
    }

    fn cfi(mut self) -> Result<Cfi, CfiParseError> {
        let base = self.path()?;
        if base.terminal.is_some() {
            return Err(CfiParseError::MissingSpineStep);
        }
        let spine_index = spine_index_of(&base).ok_or(CfiParseError::MissingSpineStep)?;
        let path = if self.eat('!') {
            Some(self.path()?)
        } else {
            None
        };
        let range = if self.eat(',') {
            if path.is_none() {
                return Err(CfiParseError::RangeWithoutIndirection);
            }
            let start = self.path()?;
            self.expect(',')?;
            let end = self.path()?;
            Some(CfiRange { start, end })
        } else {
            None
        };
        if let Some(found) = self.peek() {
            return Err(CfiParseError::UnexpectedChar {
                found,
                position: self.pos,
            });
        }
        Ok(Cfi {
            spine_index,
            base,
            path,
            range,
        })
    }

    fn path(&mut self) -> Result<CfiPath, CfiParseError> {
        let mut path = CfiPath::default();
        while self.eat('/') {
            let index = self.number()?;
            let assertion = self.assertion()?;
            path.steps.push(Step { index, assertion });
        }
        if self.eat(':') {
            let offset = self.number()?;
            let assertion = self.assertion()?;
            path.terminal = Some(Terminal { offset, assertion });
        }
        Ok(path)
    }

    fn number(&mut self) -> Result<u32, CfiParseError> {
        let start = self.pos;
        let digits = self.input[start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if digits == 0 {
            return match self.peek() {
                Some(found) => Err(CfiParseError::UnexpectedChar {
                    found,
                    position: start,
                }),
                None => Err(CfiParseError::UnexpectedEnd),
            };
        }
        self.pos += digits;
        self.input[start..self.pos]
            .parse()
            .map_err(|_| CfiParseError::InvalidNumber { position: start })
    }

    fn assertion(&mut self) -> Result<Option<String>, CfiParseError> {
        let start = self.pos;
        if !self.eat('[') {
            return Ok(None);
        }
        let mut value = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '^' => match chars.next() {
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                ']' => {
                    self.pos += offset + 1;
                    return Ok(Some(value));
                }
                other => value.push(other),
            }
        }
        Err(CfiParseError::UnterminatedAssertion { position: start })
    }
}
