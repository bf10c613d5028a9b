//! Gitignore rule stacks for the diff engine.
//!
//! Each directory visited during a diff pushes one frame holding the
//! rules from its own `.gitignore` (possibly empty), chained to the
//! parent directory's frame. Deeper rules take precedence, matching git
//! semantics. The root frame additionally carries the mount's reserved
//! names, which are hidden from diff output entirely.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Result of matching a path against an ignore stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreMatch {
    /// Not excluded by any rule.
    Include,
    /// Excluded by a gitignore rule.
    Exclude,
    /// A reserved name that must never appear in diff output.
    Hidden,
}

/// One frame of gitignore rules, chained to the enclosing directory's
/// frame.
pub struct GitIgnoreStack {
    parent: Option<Arc<GitIgnoreStack>>,
    /// Directory this frame's rules are rooted at, relative to the mount.
    root: PathBuf,
    matcher: Option<Gitignore>,
    /// Root-frame only: first-level names hidden from diffing.
    hidden_names: Vec<OsString>,
}

impl GitIgnoreStack {
    /// Create the root frame with the mount's reserved names.
    #[must_use]
    pub fn root(hidden_names: Vec<OsString>) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            root: PathBuf::new(),
            matcher: None,
            hidden_names,
        })
    }

    /// Push an empty frame for a directory without a `.gitignore`.
    #[must_use]
    pub fn empty(parent: &Arc<Self>, dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            root: dir.into(),
            matcher: None,
            hidden_names: Vec::new(),
        })
    }

    /// Push a frame built from `.gitignore` content for `dir`.
    ///
    /// Unparseable lines are skipped with a warning, matching the
    /// tolerant behavior of the rule loader: a broken ignore file must
    /// not fail the diff.
    #[must_use]
    pub fn push(parent: &Arc<Self>, dir: impl Into<PathBuf>, content: &[u8]) -> Arc<Self> {
        let dir = dir.into();
        let mut builder = GitignoreBuilder::new("");
        for line in String::from_utf8_lossy(content).lines() {
            if let Err(err) = builder.add_line(None, line) {
                tracing::warn!(dir = %dir.display(), line, %err, "skipping unparseable ignore rule");
            }
        }
        let matcher = match builder.build() {
            Ok(matcher) => Some(matcher),
            Err(err) => {
                tracing::warn!(dir = %dir.display(), %err, "failed to build ignore matcher");
                None
            }
        };
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            root: dir,
            matcher,
            hidden_names: Vec::new(),
        })
    }

    /// Match a mount-relative path against the stack.
    ///
    /// Frames are consulted deepest-first; the first frame with a
    /// definitive answer wins. Reserved first-level names return
    /// [`IgnoreMatch::Hidden`].
    #[must_use]
    pub fn matches(&self, path: &Path, is_dir: bool) -> IgnoreMatch {
        if let Some(first) = path.components().next() {
            let root = self.root_frame();
            if root
                .hidden_names
                .iter()
                .any(|name| first.as_os_str() == name.as_os_str())
            {
                return IgnoreMatch::Hidden;
            }
        }
        self.match_inner(path, is_dir)
    }

    fn match_inner(&self, path: &Path, is_dir: bool) -> IgnoreMatch {
        if let Some(matcher) = &self.matcher {
            let rel = path.strip_prefix(&self.root).unwrap_or(path);
            let matched = matcher.matched(rel, is_dir);
            if matched.is_ignore() {
                return IgnoreMatch::Exclude;
            }
            if matched.is_whitelist() {
                return IgnoreMatch::Include;
            }
        }
        match &self.parent {
            Some(parent) => parent.match_inner(path, is_dir),
            None => IgnoreMatch::Include,
        }
    }

    fn root_frame(&self) -> &GitIgnoreStack {
        let mut frame = self;
        while let Some(parent) = &frame.parent {
            frame = parent;
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_exclude() {
        let root = GitIgnoreStack::root(Vec::new());
        let stack = GitIgnoreStack::push(&root, "", b"*.o\n");
        assert_eq!(
            stack.matches(Path::new("main.o"), false),
            IgnoreMatch::Exclude
        );
        assert_eq!(
            stack.matches(Path::new("main.rs"), false),
            IgnoreMatch::Include
        );
    }

    #[test]
    fn deeper_frame_wins() {
        let root = GitIgnoreStack::root(Vec::new());
        let outer = GitIgnoreStack::push(&root, "", b"*.log\n");
        let inner = GitIgnoreStack::push(&outer, "keep", b"!important.log\n");
        assert_eq!(
            inner.matches(Path::new("keep/important.log"), false),
            IgnoreMatch::Include
        );
        assert_eq!(
            inner.matches(Path::new("keep/other.log"), false),
            IgnoreMatch::Exclude
        );
    }

    #[test]
    fn hidden_names_short_circuit() {
        let root = GitIgnoreStack::root(vec![OsString::from(".ctl")]);
        let stack = GitIgnoreStack::empty(&root, "");
        assert_eq!(stack.matches(Path::new(".ctl"), true), IgnoreMatch::Hidden);
        assert_eq!(
            stack.matches(Path::new(".ctl/socket"), false),
            IgnoreMatch::Hidden
        );
    }

    #[test]
    fn broken_rules_are_skipped() {
        let root = GitIgnoreStack::root(Vec::new());
        let stack = GitIgnoreStack::push(&root, "", b"a[\n*.tmp\n");
        assert_eq!(
            stack.matches(Path::new("x.tmp"), false),
            IgnoreMatch::Exclude
        );
    }
}
