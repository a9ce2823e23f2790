//! Fetch specifications (entity graphs).
//!
//! A [`FetchSpec`] names the association paths that should be loaded eagerly
//! together with a root entity, instead of being left as proxies.

/// A named, reusable tree of association paths to load eagerly.
///
/// # Example
///
/// ```
/// use persistkit_core::FetchSpec;
///
/// let spec = FetchSpec::new("graph.AuthorBooks", "author")
///     .include("books")
///     .include_nested("books.publisher");
/// assert_eq!(spec.paths().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    name: String,
    root_type: &'static str,
    paths: Vec<FetchPath>,
}

/// One association path, e.g. `["books", "publisher"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPath(Vec<String>);

impl FetchPath {
    /// The association names along this path.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl FetchSpec {
    /// Create an empty spec for a root entity type.
    #[must_use]
    pub fn new(name: impl Into<String>, root_type: &'static str) -> Self {
        Self {
            name: name.into(),
            root_type,
            paths: Vec::new(),
        }
    }

    /// Include a direct association of the root.
    #[must_use]
    pub fn include(self, association: &str) -> Self {
        self.include_nested(association)
    }

    /// Include a dotted association path (e.g. `"books.publisher"`).
    ///
    /// Blank segments are dropped; a path with no segments left is ignored,
    /// as is a path identical to one already included.
    #[must_use]
    pub fn include_nested(mut self, path: &str) -> Self {
        let segments: Vec<String> = path
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return self;
        }
        let path = FetchPath(segments);
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
        self
    }

    /// Spec name (how it is registered on a session factory).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity type this spec applies to.
    #[must_use]
    pub fn root_type(&self) -> &'static str {
        self.root_type
    }

    /// Paths in declaration order.
    #[must_use]
    pub fn paths(&self) -> &[FetchPath] {
        &self.paths
    }

    /// Check if any paths are included.
    #[must_use]
    pub fn has_paths(&self) -> bool {
        !self.paths.is_empty()
    }

    /// Whether a direct association of the root is named by some path.
    #[must_use]
    pub fn covers(&self, association: &str) -> bool {
        self.paths
            .iter()
            .any(|p| p.0.first().is_some_and(|s| s == association))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_single() {
        let spec = FetchSpec::new("graph.AuthorBooks", "author").include("books");
        assert_eq!(spec.name(), "graph.AuthorBooks");
        assert_eq!(spec.root_type(), "author");
        assert_eq!(spec.paths()[0].segments(), ["books".to_string()]);
        assert!(spec.covers("books"));
        assert!(!spec.covers("publisher"));
    }

    #[test]
    fn test_include_nested_keeps_order() {
        let spec = FetchSpec::new("g", "author")
            .include_nested("books.publisher")
            .include("awards");
        let segments: Vec<&[String]> = spec.paths().iter().map(FetchPath::segments).collect();
        assert_eq!(segments[0], ["books".to_string(), "publisher".to_string()]);
        assert_eq!(segments[1], ["awards".to_string()]);
        assert!(spec.covers("books"));
    }

    #[test]
    fn test_blank_segments_ignored() {
        let spec = FetchSpec::new("g", "author")
            .include("")
            .include_nested(".")
            .include_nested("books..publisher");
        assert_eq!(spec.paths().len(), 1);
        assert_eq!(spec.paths()[0].segments().len(), 2);
    }

    #[test]
    fn test_duplicate_paths_collapse() {
        let spec = FetchSpec::new("g", "author").include("books").include("books");
        assert_eq!(spec.paths().len(), 1);
        assert!(!FetchSpec::new("g", "author").has_paths());
    }
}
