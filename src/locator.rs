//! Resource locators.
//!
//! A locator names a blob plus a chain of handlers that dig into it:
//!
//! ```text
//! file:///photos/holiday.zip//archive-zip:img/beach.png
//! \_____________________/  \______________________/
//!          url                     handler
//! ```
//!
//! The url part is `scheme://authority/path`. A string with no recognized
//! scheme prefix is a bare local path and gets the `file` scheme. Every
//! further `//` starts a handler segment of the form `<type>-<name>[:<args>]`.
//!
//! Parsing then serializing yields the canonical string form, which is what
//! the store keys locators by.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::LocatorError;

/// Scheme used for local files.
pub const FILE_SCHEME: &str = "file";

/// Schemes fetched through the network transport.
pub const REMOTE_SCHEMES: [&str; 3] = ["http", "https", "ftp"];

/// Handler type for a locator without handlers.
pub const BLOB_TYPE: &str = "blob";

const HANDLER_DELIMITER: &str = "//";
const SCHEME_SEPARATOR: &str = "://";

// =============================================================================
// ResourceUrl
// =============================================================================

/// The url part of a locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUrl {
    scheme: String,
    authority: String,
    path: String,
}

impl ResourceUrl {
    pub fn new(
        scheme: impl Into<String>,
        authority: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            authority: authority.into(),
            path: path.into(),
        }
    }

    /// Url of a local file.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(FILE_SCHEME, "", path)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_local(&self) -> bool {
        self.scheme == FILE_SCHEME
    }

    pub fn is_remote(&self) -> bool {
        REMOTE_SCHEMES.contains(&self.scheme.as_str())
    }

    /// Last path component, used as a name hint for format selection.
    pub fn file_name(&self) -> Option<&str> {
        self.path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    fn parse(input: &str, scheme: Option<&str>) -> Result<Self, LocatorError> {
        let Some(scheme) = scheme else {
            return Ok(Self::file(input));
        };

        let rest = &input[scheme.len() + SCHEME_SEPARATOR.len()..];
        if rest.is_empty() {
            return Err(LocatorError::InvalidUrl(input.to_string()));
        }

        if scheme == FILE_SCHEME {
            return Ok(Self::file(rest));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(LocatorError::InvalidUrl(input.to_string()));
        }
        Ok(Self::new(scheme, authority, path))
    }
}

impl fmt::Display for ResourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

// =============================================================================
// Handler
// =============================================================================

/// One handler segment: `<type>-<name>[:<args>]`.
///
/// `archive-zip:img/a.png` has type `archive`, name `zip` and args
/// `img/a.png`. Args may contain any character except the `//` delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handler {
    kind: String,
    name: String,
    args: String,
}

impl Handler {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            args: args.into(),
        }
    }

    /// The handler type, e.g. `archive` or `image`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    /// `<type>-<name>` without args.
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.kind, self.name)
    }

    /// Parse a single handler segment.
    pub fn parse(segment: &str) -> Result<Self, LocatorError> {
        let (head, args) = match segment.split_once(':') {
            Some((head, args)) => (head, args),
            None => (segment, ""),
        };

        match head.split_once('-') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(kind, name, args))
            }
            _ => Err(LocatorError::InvalidHandler(segment.to_string())),
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.name)?;
        if !self.args.is_empty() {
            write!(f, ":{}", self.args)?;
        }
        Ok(())
    }
}

// =============================================================================
// Locator
// =============================================================================

/// A url plus an ordered handler chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    url: ResourceUrl,
    handlers: Vec<Handler>,
}

impl Locator {
    pub fn new(url: ResourceUrl) -> Self {
        Self {
            url,
            handlers: Vec::new(),
        }
    }

    /// Locator for a local path with no handlers.
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Self {
        Self::new(ResourceUrl::file(path.as_ref().to_string_lossy()))
    }

    /// Parse a locator string.
    ///
    /// # Errors
    /// Fails on an empty string, a trailing `//` with no handler segment,
    /// or a handler segment without a `<type>-<name>` head.
    pub fn parse(input: &str) -> Result<Self, LocatorError> {
        if input.is_empty() {
            return Err(LocatorError::Empty);
        }

        let scheme = known_scheme(input);
        let skip = scheme.map_or(0, |s| s.len() + SCHEME_SEPARATOR.len());

        let (url_part, handler_part) = match input[skip..].find(HANDLER_DELIMITER) {
            Some(idx) => (&input[..skip + idx], Some(&input[skip + idx + 2..])),
            None => (input, None),
        };

        let url = ResourceUrl::parse(url_part, scheme)?;
        let mut handlers = Vec::new();
        if let Some(part) = handler_part {
            for segment in part.split(HANDLER_DELIMITER) {
                if segment.is_empty() {
                    return Err(LocatorError::UnterminatedHandler(input.to_string()));
                }
                handlers.push(Handler::parse(segment)?);
            }
        }

        Ok(Self { url, handlers })
    }

    pub fn url(&self) -> &ResourceUrl {
        &self.url
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn last_handler(&self) -> Option<&Handler> {
        self.handlers.last()
    }

    /// Type of the last handler, or `blob` when there is none.
    pub fn get_type(&self) -> &str {
        self.handlers.last().map_or(BLOB_TYPE, |h| h.kind())
    }

    /// Append a handler, returning the child locator.
    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Strip every handler, leaving the locator of the raw blob.
    pub fn get_blob_locator(&self) -> Self {
        Self::new(self.url.clone())
    }

    /// True when `other` names this resource or something nested inside it.
    pub fn is_parent_of(&self, other: &Locator) -> bool {
        self.url == other.url
            && self.handlers.len() <= other.handlers.len()
            && other.handlers.starts_with(&self.handlers)
    }
}

fn known_scheme(input: &str) -> Option<&'static str> {
    std::iter::once(FILE_SCHEME)
        .chain(REMOTE_SCHEMES)
        .find(|scheme| {
            input
                .strip_prefix(scheme)
                .is_some_and(|rest| rest.starts_with(SCHEME_SEPARATOR))
        })
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)?;
        for handler in &self.handlers {
            write!(f, "{}{}", HANDLER_DELIMITER, handler)?;
        }
        Ok(())
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Locator::parse(s)
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
