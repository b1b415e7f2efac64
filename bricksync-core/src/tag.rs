//! Invalidation tags.
//!
//! Cached results declare the tags they depend on; mutations declare the tags
//! they invalidate. A tag is a `{kind, id}` pair where the id may be the
//! wildcard `*`, matching every id of the same kind.

use std::collections::BTreeSet;
use std::fmt;

/// Id used by list views.
pub const LIST_ID: &str = "LIST";

/// Textual form of the wildcard id.
pub const WILDCARD: &str = "*";

/// Identifier half of a [`Tag`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
    Exact(String),
    Wildcard,
}

impl TagId {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, TagId::Wildcard)
    }
}

impl From<&str> for TagId {
    fn from(id: &str) -> Self {
        if id == WILDCARD {
            TagId::Wildcard
        } else {
            TagId::Exact(id.to_string())
        }
    }
}

impl From<String> for TagId {
    fn from(id: String) -> Self {
        if id == WILDCARD {
            TagId::Wildcard
        } else {
            TagId::Exact(id)
        }
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagId::Exact(id) => f.write_str(id),
            TagId::Wildcard => f.write_str(WILDCARD),
        }
    }
}

/// Label describing what a cached result depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    kind: String,
    id: TagId,
}

/// Set of tags attached to a cache entry or declared by a mutation.
pub type TagSet = BTreeSet<Tag>;

impl Tag {
    /// Build a tag; an id of `"*"` becomes the wildcard.
    pub fn new(kind: impl Into<String>, id: impl Into<TagId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// The `{kind, "LIST"}` tag used by collection queries.
    pub fn list(kind: impl Into<String>) -> Self {
        Self::new(kind, TagId::Exact(LIST_ID.to_string()))
    }

    /// The `{kind, "*"}` tag matching every id of `kind`.
    pub fn any(kind: impl Into<String>) -> Self {
        Self::new(kind, TagId::Wildcard)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &TagId {
        &self.id
    }

    /// Whether two tags refer to overlapping data.
    ///
    /// Kinds must be equal; a wildcard on either side matches any id.
    pub fn matches(&self, other: &Tag) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (&self.id, &other.id) {
            (TagId::Wildcard, _) | (_, TagId::Wildcard) => true,
            (TagId::Exact(a), TagId::Exact(b)) => a == b,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// True when any tag of `entry` is matched by any tag of `targets`.
pub fn tags_intersect<'a, I>(entry: &TagSet, targets: I) -> bool
where
    I: IntoIterator<Item = &'a Tag>,
{
    targets
        .into_iter()
        .any(|target| entry.iter().any(|tag| target.matches(tag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wildcard_matches_same_kind_only() {
        let wildcard = Tag::any("item");
        assert!(wildcard.matches(&Tag::list("item")));
        assert!(wildcard.matches(&Tag::new("item", "42")));
        assert!(!wildcard.matches(&Tag::list("other")));
    }

    #[test]
    fn test_exact_ids_must_match() {
        assert!(Tag::new("WishlistItem", "a").matches(&Tag::new("WishlistItem", "a")));
        assert!(!Tag::new("WishlistItem", "a").matches(&Tag::new("WishlistItem", "b")));
    }

    #[test]
    fn test_star_string_parses_as_wildcard() {
        assert_eq!(Tag::new("wishlist", "*"), Tag::any("wishlist"));
        assert_eq!(Tag::any("wishlist").to_string(), "wishlist:*");
        assert_eq!(Tag::list("wishlist").to_string(), "wishlist:LIST");
    }

    #[test]
    fn test_tags_intersect() {
        let entry: TagSet = [Tag::list("item"), Tag::new("item", "7")].into_iter().collect();
        assert!(tags_intersect(&entry, &[Tag::any("item")]));
        assert!(tags_intersect(&entry, &[Tag::new("item", "7")]));
        assert!(!tags_intersect(&entry, &[Tag::new("item", "8")]));
        assert!(!tags_intersect(&entry, &[Tag::any("other")]));
        assert!(!tags_intersect(&TagSet::new(), &[Tag::any("item")]));
    }

    proptest! {
        #[test]
        fn prop_matching_is_symmetric(
            kind_a in "[a-c]", kind_b in "[a-c]",
            id_a in prop_oneof!["[0-3]", Just("*".to_string())],
            id_b in prop_oneof!["[0-3]", Just("*".to_string())],
        ) {
            let a = Tag::new(kind_a, id_a);
            let b = Tag::new(kind_b, id_b);
            prop_assert_eq!(a.matches(&b), b.matches(&a));
        }
    }
}
