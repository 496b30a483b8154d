//! Completion tokens for the extraction chain.
//!
//! A token is a stack of scope counters, outermost first. Each level records
//! how many sibling units remain after the current one in that scope and
//! whether the scope still has unfetched pages. A unit is the last of its
//! step exactly when every level is exhausted, so the terminal flag can be
//! decided locally, at emission time, without a central counter.

use serde::{Deserialize, Serialize};

/// One level of a [`CompletionToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCounter {
    pub scope: String,
    /// Siblings remaining after the current unit within this scope.
    pub remaining: usize,
    /// The scope has further pages that have not been fetched yet.
    pub more_pages: bool,
}

impl ScopeCounter {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0 && !self.more_pages
    }
}

/// Stack of [`ScopeCounter`]s describing the work still ahead of a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionToken {
    levels: Vec<ScopeCounter>,
}

impl CompletionToken {
    /// Token with no enclosing scope.
    pub fn root() -> Self {
        Self::default()
    }

    /// A child token one scope deeper.
    pub fn descend(&self, scope: impl Into<String>, remaining: usize, more_pages: bool) -> Self {
        let mut levels = self.levels.clone();
        levels.push(ScopeCounter {
            scope: scope.into(),
            remaining,
            more_pages,
        });
        Self { levels }
    }

    /// Tokens for `count` siblings of one scope, in emission order.
    pub fn siblings<'a>(
        &'a self,
        scope: &'a str,
        count: usize,
        more_pages: bool,
    ) -> impl Iterator<Item = CompletionToken> + 'a {
        (0..count).map(move |i| self.descend(scope, count - 1 - i, more_pages))
    }

    /// The outermost `depth` levels, dropping page-local scopes so the token
    /// can ride a continuation request.
    pub fn outer(&self, depth: usize) -> Self {
        Self {
            levels: self.levels.iter().take(depth).cloned().collect(),
        }
    }

    /// True when no enclosing scope has remaining siblings or pages.
    pub fn is_exhausted(&self) -> bool {
        self.levels.iter().all(ScopeCounter::is_exhausted)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[ScopeCounter] {
        &self.levels
    }

    /// Scopes that still hold work, outermost first.
    pub fn pending_scopes(&self) -> Vec<&str> {
        self.levels
            .iter()
            .filter(|l| !l.is_exhausted())
            .map(|l| l.scope.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_drops_inner_levels() {
        let base = CompletionToken::root().descend("parents", 1, false);
        let inner = base.descend("child_pages", 0, true).descend("items", 0, false);
        assert_eq!(inner.outer(base.depth()), base);
        assert_eq!(inner.outer(10), inner);
    }

    #[test]
    fn test_root_is_exhausted() {
        assert!(CompletionToken::root().is_exhausted());
        assert_eq!(CompletionToken::root().depth(), 0);
    }

    #[test]
    fn test_last_sibling_of_last_page() {
        let root = CompletionToken::root();
        let tokens: Vec<_> = root.siblings("items", 3, false).collect();
        assert_eq!(tokens.len(), 3);
        assert!(!tokens[0].is_exhausted());
        assert!(!tokens[1].is_exhausted());
        assert!(tokens[2].is_exhausted());
    }

    #[test]
    fn test_more_pages_blocks_exhaustion() {
        let root = CompletionToken::root();
        let last = root.siblings("items", 2, true).last().unwrap();
        assert!(!last.is_exhausted());
        assert_eq!(last.pending_scopes(), vec!["items"]);
    }

    #[test]
    fn test_outer_scope_blocks_exhaustion() {
        let parent = CompletionToken::root().descend("parents", 1, false);
        let child = parent.descend("children", 0, false);
        assert!(!child.is_exhausted());

        let last_parent = CompletionToken::root().descend("parents", 0, false);
        let child = last_parent.descend("children", 0, false);
        assert!(child.is_exhausted());
        assert_eq!(child.depth(), 2);
    }

    #[test]
    fn test_descend_does_not_mutate_parent() {
        let parent = CompletionToken::root().descend("parents", 0, false);
        let _child = parent.descend("children", 4, true);
        assert_eq!(parent.depth(), 1);
        assert!(parent.is_exhausted());
    }

    #[test]
    fn test_token_serde() {
        let token = CompletionToken::root()
            .descend("parents", 2, true)
            .descend("child_pages", 0, false);
        let json = serde_json::to_string(&token).unwrap();
        let back: CompletionToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
        assert_eq!(back.levels()[0].scope, "parents");
    }
}
