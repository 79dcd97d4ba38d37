//! OAuth2 scopes
//!
//! Scopes requested by a caller are kept in the order given, with duplicates
//! removed. Comparison between scope tokens is ASCII case-insensitive, as the
//! identity service treats `User.Read` and `user.read` as the same
//! permission.

use std::{convert::TryFrom, fmt, iter::FromIterator, slice, str::FromStr};

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The OpenID Connect scopes implicitly requested on every user flow
pub const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// An invalid scope token
#[derive(Debug, Error)]
pub enum InvalidScopeToken {
    /// The scope token was the empty string
    #[error("scope token cannot be empty")]
    EmptyString,
    /// The scope token contained an invalid byte
    #[error("invalid scope token byte at position {position}: 0x{value:02x}")]
    InvalidByte {
        /// The index in the scope token where the invalid byte was found
        position: usize,
        /// The invalid byte value
        value: u8,
    },
}

impl From<std::convert::Infallible> for InvalidScopeToken {
    #[inline(always)]
    fn from(x: std::convert::Infallible) -> Self {
        match x {}
    }
}

/// An OAuth2 scope token as defined in [RFC 6749, Section 3.3][RFC6749 3.3]
///
/// A scope token must be composed of printable ASCII characters excluding
/// ` ` (space), `"` (double quote), and `\` (backslash).
///
///   [RFC6749 3.3]: (https://datatracker.ietf.org/doc/html/rfc6749#section-3.3)
#[braid(
    serde,
    validator,
    ref_doc = "A borrowed reference to an OAuth2 [`ScopeToken`]"
)]
pub struct ScopeToken;

impl aliri_braid::Validator for ScopeToken {
    type Error = InvalidScopeToken;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidScopeToken::EmptyString)
        } else if let Some((position, &value)) = s
            .as_bytes()
            .iter()
            .enumerate()
            .find(|(_, &b)| b <= 0x20 || b == 0x22 || b == 0x5C || 0x7F <= b)
        {
            Err(InvalidScopeToken::InvalidByte { position, value })
        } else {
            Ok(())
        }
    }
}

impl ScopeTokenRef {
    /// Whether this is one of the reserved OpenID Connect scopes
    #[inline]
    pub fn is_reserved(&self) -> bool {
        RESERVED_SCOPES
            .iter()
            .any(|r| r.eq_ignore_ascii_case(self.as_str()))
    }

    #[inline]
    fn matches(&self, other: &ScopeTokenRef) -> bool {
        self.as_str().eq_ignore_ascii_case(other.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum ScopeDto {
    String(String),
    Array(Vec<ScopeToken>),
}

impl TryFrom<Option<ScopeDto>> for Scope {
    type Error = InvalidScopeToken;

    fn try_from(dto: Option<ScopeDto>) -> Result<Self, Self::Error> {
        match dto {
            Some(ScopeDto::String(s)) => Self::try_from(s),
            Some(ScopeDto::Array(arr)) => Ok(arr.into_iter().collect()),
            None => Ok(Self::empty()),
        }
    }
}

impl From<Scope> for ScopeDto {
    fn from(s: Scope) -> Self {
        ScopeDto::String(s.to_string())
    }
}

/// An ordered, duplicate-free set of OAuth2 scope tokens
///
/// Equality of two sets is order-independent and case-insensitive.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(try_from = "Option<ScopeDto>", into = "ScopeDto")]
pub struct Scope(Vec<ScopeToken>);

impl Scope {
    /// Produces an empty scope
    #[inline]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Constructs a new scope from a single scope token
    #[inline]
    pub fn single(scope_token: ScopeToken) -> Self {
        Self(vec![scope_token])
    }

    /// Adds an additional scope token
    #[inline]
    pub fn and(mut self, scope_token: ScopeToken) -> Self {
        self.insert(scope_token);
        self
    }

    /// Adds a scope token if no equivalent token is already present
    ///
    /// Returns whether the token was added.
    pub fn insert(&mut self, scope_token: ScopeToken) -> bool {
        if self.contains(&scope_token) {
            false
        } else {
            self.0.push(scope_token);
            true
        }
    }

    /// Whether an equivalent scope token is present
    #[inline]
    pub fn contains(&self, scope_token: &ScopeTokenRef) -> bool {
        self.0.iter().any(|s| s.matches(scope_token))
    }

    /// Checks to see whether this scope contains all of
    /// the scope tokens in `subset`.
    #[inline]
    pub fn contains_all(&self, subset: &Scope) -> bool {
        subset.iter().all(|s| self.contains(s))
    }

    /// The number of scope tokens
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no scope tokens
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Produces an iterator of the scope tokens in this set
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        self.into_iter()
    }

    /// The set with the reserved OpenID Connect scopes removed
    pub fn without_reserved(&self) -> Self {
        self.iter()
            .filter(|s| !s.is_reserved())
            .map(ToOwned::to_owned)
            .collect()
    }

    /// The set with the reserved OpenID Connect scopes appended
    pub fn with_reserved(&self) -> Self {
        let mut scope = self.clone();
        for reserved in RESERVED_SCOPES {
            scope.insert(ScopeToken::from_static(reserved));
        }
        scope
    }

    /// The union of both sets, keeping the order of `self` first
    pub fn union(&self, other: &Scope) -> Self {
        let mut scope = self.clone();
        scope.extend(other.iter().map(ToOwned::to_owned));
        scope
    }

    /// A canonical form used when keying caches
    ///
    /// Tokens are lowercased and sorted so that equivalent sets produce the
    /// same key regardless of request order or casing.
    pub fn normalized_key(&self) -> String {
        let mut tokens: Vec<String> = self.0.iter().map(|s| s.as_str().to_ascii_lowercase()).collect();
        tokens.sort_unstable();
        tokens.join(" ")
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.contains_all(other)
    }
}

impl Eq for Scope {}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for s in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(s.as_str())?;
            first = false;
        }
        Ok(())
    }
}

impl IntoIterator for Scope {
    type Item = ScopeToken;
    type IntoIter = std::vec::IntoIter<ScopeToken>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// An iterator over a set of borrowed scope tokens
#[derive(Clone, Debug)]
pub struct Iter<'a> {
    iter: slice::Iter<'a, ScopeToken>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ScopeTokenRef;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|x| x.as_ref())
    }
}

impl<'a> IntoIterator for &'a Scope {
    type Item = &'a ScopeTokenRef;
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        Iter {
            iter: self.0.iter(),
        }
    }
}

impl Extend<ScopeToken> for Scope {
    #[inline]
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = ScopeToken>,
    {
        for s in iter {
            self.insert(s);
        }
    }
}

impl FromIterator<ScopeToken> for Scope {
    #[inline]
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = ScopeToken>,
    {
        let mut set = Self::empty();
        set.extend(iter);
        set
    }
}

impl TryFrom<&'_ str> for Scope {
    type Error = InvalidScopeToken;

    #[inline]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.split_whitespace()
            .map(|t| ScopeToken::new(t.to_owned()))
            .collect()
    }
}

impl TryFrom<String> for Scope {
    type Error = InvalidScopeToken;

    #[inline]
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

impl FromStr for Scope {
    type Err = InvalidScopeToken;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}
