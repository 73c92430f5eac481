// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Merged tree of the JSON pointers carried by the `preload` and `fields` directives

use std::collections::BTreeMap;

use crate::directives::Directives;

/// Segment matching every key of an object or every index of an array.
pub const WILDCARD: &str = "*";

/// The two directives a client may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Preload,
    Fields,
}

impl DirectiveKind {
    /// Lowercase name, as used for query parameters.
    pub fn name(self) -> &'static str {
        match self {
            DirectiveKind::Preload => "preload",
            DirectiveKind::Fields => "fields",
        }
    }
}

/// Set of directives selecting a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    preload: bool,
    fields: bool,
}

impl Selection {
    pub fn contains(self, kind: DirectiveKind) -> bool {
        match kind {
            DirectiveKind::Preload => self.preload,
            DirectiveKind::Fields => self.fields,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.preload && !self.fields
    }

    fn insert(&mut self, kind: DirectiveKind) {
        match kind {
            DirectiveKind::Preload => self.preload = true,
            DirectiveKind::Fields => self.fields = true,
        }
    }
}

/// One path segment of the selector tree.
///
/// `selected` only holds the directives whose pointer ends exactly here, while
/// `in_subtree` also accounts for every selection below this node.
#[derive(Debug, Default)]
pub struct Node {
    pointer: String,
    selected: Selection,
    in_subtree: Selection,
    children: BTreeMap<String, Node>,
    wildcard: Option<Box<Node>>,
}

impl Node {
    /// Absolute JSON pointer of this node, wildcards rendered as `*`.
    pub fn pointer(&self) -> &str {
        &self.pointer
    }

    pub fn selected_by(&self) -> Selection {
        self.selected
    }

    pub fn is_selected(&self, kind: DirectiveKind) -> bool {
        self.selected.contains(kind)
    }

    /// Whether this node or one of its descendants is selected by `kind`.
    pub fn has_in_subtree(&self, kind: DirectiveKind) -> bool {
        self.in_subtree.contains(kind)
    }

    /// Child matching a concrete key or array index.
    ///
    /// A literal child always wins over the wildcard child.
    pub fn match_child(&self, segment: &str) -> Option<&Node> {
        self.children
            .get(segment)
            .or_else(|| self.wildcard.as_deref())
    }

    /// Every `kind` selection strictly below this node, as pointers relative to it.
    pub fn sub_selectors(&self, kind: DirectiveKind) -> Vec<String> {
        let mut selectors = Vec::new();
        self.collect_selectors(kind, "", &mut selectors);
        selectors
    }

    fn collect_selectors(&self, kind: DirectiveKind, prefix: &str, out: &mut Vec<String>) {
        let literals = self
            .children
            .iter()
            .map(|(key, child)| (escape_segment(key), child));
        let wildcard = self
            .wildcard
            .as_deref()
            .map(|child| (WILDCARD.to_owned(), child));

        for (segment, child) in literals.chain(wildcard) {
            if !child.has_in_subtree(kind) {
                continue;
            }
            let path = format!("{prefix}/{segment}");
            if child.is_selected(kind) {
                out.push(path.clone());
            }
            child.collect_selectors(kind, &path, out);
        }
    }

    fn child_mut(&mut self, segment: Segment) -> &mut Node {
        let pointer = &self.pointer;
        match segment {
            Segment::Wildcard => &mut **self.wildcard.get_or_insert_with(|| {
                Box::new(Node {
                    pointer: format!("{pointer}/{WILDCARD}"),
                    ..Default::default()
                })
            }),
            Segment::Key(key) => {
                let pointer = format!("{pointer}/{}", escape_segment(&key));
                self.children.entry(key).or_insert_with(|| Node {
                    pointer,
                    ..Default::default()
                })
            }
        }
    }
}

enum Segment {
    Key(String),
    Wildcard,
}

fn parse_pointer(pointer: &str) -> impl Iterator<Item = Segment> + '_ {
    let trimmed = pointer.trim_matches('/');
    trimmed
        .split('/')
        .filter(move |_| !trimmed.is_empty())
        .map(|raw| match raw {
            WILDCARD => Segment::Wildcard,
            _ => Segment::Key(raw.replace("~1", "/").replace("~0", "~")),
        })
}

fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// The merged `preload`/`fields` tree for one request.
#[derive(Debug, Default)]
pub struct SelectorTree {
    root: Node,
    fields_active: bool,
}

impl SelectorTree {
    /// Merges both pointer lists into a single tree.
    pub fn build<'a>(
        preload: impl IntoIterator<Item = &'a str>,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut tree = Self::default();
        for pointer in preload {
            tree.insert(pointer, DirectiveKind::Preload);
        }
        for pointer in fields {
            tree.insert(pointer, DirectiveKind::Fields);
        }
        tree
    }

    pub fn from_directives(directives: &Directives) -> Self {
        Self::build(
            directives.paths(DirectiveKind::Preload),
            directives.paths(DirectiveKind::Fields),
        )
    }

    /// Adds one pointer, tagging only its terminal node with `kind`.
    pub fn insert(&mut self, pointer: &str, kind: DirectiveKind) {
        if kind == DirectiveKind::Fields {
            self.fields_active = true;
        }

        let mut node = &mut self.root;
        node.in_subtree.insert(kind);
        for segment in parse_pointer(pointer) {
            node = node.child_mut(segment);
            node.in_subtree.insert(kind);
        }
        node.selected.insert(kind);
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Whether the document has to be pruned down to the `fields` selections.
    pub fn fields_active(&self) -> bool {
        self.fields_active
    }

    /// Whether `node` survives `fields` pruning on its own merits.
    ///
    /// Without a `fields` directive everything is included.
    pub fn is_selected_for_fields(&self, node: &Node) -> bool {
        !self.fields_active || node.has_in_subtree(DirectiveKind::Fields)
    }

    pub fn is_empty(&self) -> bool {
        self.root.in_subtree.is_empty()
    }
}
