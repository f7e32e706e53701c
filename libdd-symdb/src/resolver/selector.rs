// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collections::FxHashMap;

/// How a stack trace relates to the selected call site. The flags are
/// independent of each other.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Relation(u8);

impl Relation {
    /// The stack trace goes through the call site.
    pub const IN_SUBTREE: Relation = Relation(1);
    /// The call site is the leaf of the stack trace.
    pub const IS_LEAF: Relation = Relation(1 << 1);
    /// The stack trace is a strict prefix of the call site.
    pub const IS_ANCESTOR: Relation = Relation(1 << 2);

    pub const fn empty() -> Self {
        Relation(0)
    }

    pub const fn contains(self, other: Relation) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Relation {
    type Output = Relation;

    fn bitor(self, rhs: Relation) -> Relation {
        Relation(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Relation {
    fn bitor_assign(&mut self, rhs: Relation) {
        self.0 |= rhs.0;
    }
}

/// Selects the stack traces that go through a call site, given as
/// root-first function names.
#[derive(Clone, Debug)]
pub struct CallSiteSelector {
    call_site: Vec<String>,
}

impl CallSiteSelector {
    pub fn new(call_site: &[String]) -> Self {
        Self {
            call_site: call_site.to_vec(),
        }
    }

    /// Classifies the root-first function names of a stack trace.
    pub fn relation<S: AsRef<str>>(&self, stack: &[S]) -> Relation {
        let common = self
            .call_site
            .iter()
            .zip(stack)
            .take_while(|(a, b)| a.as_str() == b.as_ref())
            .count();
        let mut relation = Relation::empty();
        if common == self.call_site.len() {
            relation |= Relation::IN_SUBTREE;
            if stack.len() == common {
                relation |= Relation::IS_LEAF;
            }
        } else if common == stack.len() {
            relation |= Relation::IS_ANCESTOR;
        }
        relation
    }
}

/// Remembers the relation of every stack trace seen.
pub(crate) struct SampleFilter<'a> {
    selector: &'a CallSiteSelector,
    relations: FxHashMap<u32, Relation>,
}

impl<'a> SampleFilter<'a> {
    pub(crate) fn new(selector: &'a CallSiteSelector) -> Self {
        Self {
            selector,
            relations: FxHashMap::default(),
        }
    }

    /// Reports whether the stack trace is in the selected subtree. `stack`
    /// is only called the first time a stack trace is seen.
    pub(crate) fn keep<S: AsRef<str>>(
        &mut self,
        stacktrace_id: u32,
        stack: impl FnOnce() -> Vec<S>,
    ) -> bool {
        let selector = self.selector;
        self.relations
            .entry(stacktrace_id)
            .or_insert_with(|| selector.relation(&stack()))
            .contains(Relation::IN_SUBTREE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(call_site: &[&str]) -> CallSiteSelector {
        let call_site: Vec<String> = call_site.iter().map(|s| s.to_string()).collect();
        CallSiteSelector::new(&call_site)
    }

    #[test]
    fn relations() {
        let s = selector(&["a", "b"]);
        let r = s.relation(&["a", "b", "c"]);
        assert!(r.contains(Relation::IN_SUBTREE));
        assert!(!r.contains(Relation::IS_LEAF));

        let r = s.relation(&["a", "b"]);
        assert_eq!(r, Relation::IN_SUBTREE | Relation::IS_LEAF);

        assert_eq!(s.relation(&["a"]), Relation::IS_ANCESTOR);
        assert_eq!(s.relation(&[] as &[&str]), Relation::IS_ANCESTOR);
        assert_eq!(s.relation(&["a", "c"]), Relation::empty());
        assert_eq!(s.relation(&["d"]), Relation::empty());
    }

    #[test]
    fn filter_memoizes() {
        let s = selector(&["main"]);
        let mut filter = SampleFilter::new(&s);
        assert!(filter.keep(1, || vec!["main", "work"]));
        assert!(filter.keep(1, || -> Vec<&str> { panic!("already classified") }));
        assert!(!filter.keep(2, || vec!["init"]));
    }
}
