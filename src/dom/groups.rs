//! Mapping from override group keys to the game cards they scope.

use std::collections::HashMap;

use tracing::debug;

use super::{Document, GAME_ID_ATTR, GROUP_ATTR, NodeId};

/// A game card that belongs to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    /// `data-game-id` of the card.
    pub game_key: String,
    /// Card element.
    pub node: NodeId,
}

/// Group key to member cards, rebuilt only when the document revision changes.
#[derive(Debug, Default)]
pub struct GroupIndex {
    revision: Option<u64>,
    groups: HashMap<String, Vec<GroupMember>>,
}

impl GroupIndex {
    /// Empty index; the first [`GroupIndex::refresh`] populates it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the index if `document` changed since the last refresh. Returns whether a
    /// rebuild happened.
    pub fn refresh(&mut self, document: &Document) -> bool {
        if self.revision == Some(document.revision()) {
            return false;
        }

        self.groups.clear();
        for marker in document.descendants(document.root()) {
            let Some(key) = document.attribute(marker, GROUP_ATTR) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            let members = scope_members(document, marker);
            debug!(group = key, members = members.len(), "indexed override group");
            self.groups
                .entry(key.to_string())
                .or_default()
                .extend(members);
        }
        self.revision = Some(document.revision());
        true
    }

    /// Cards scoped by `group`, in document order.
    pub fn members(&self, group: &str) -> &[GroupMember] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if `game_key` is scoped by `group`.
    pub fn contains(&self, group: &str, game_key: &str) -> bool {
        self.members(group)
            .iter()
            .any(|member| member.game_key == game_key)
    }

    /// Every group key seen in the last refresh.
    pub fn group_keys(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }
}

/// Resolve the cards a group marker scopes.
///
/// Tried in order: cards nested inside the marker; cards in the forward siblings up to the next
/// marker; cards among the parent's remaining children after the marker, skipping other markers.
fn scope_members(document: &Document, marker: NodeId) -> Vec<GroupMember> {
    let nested = cards_within(document, marker, false);
    if !nested.is_empty() {
        return nested;
    }

    let mut forward = Vec::new();
    let mut sibling = document.next_sibling(marker);
    while let Some(node) = sibling {
        if is_marker(document, node) {
            break;
        }
        forward.extend(cards_within(document, node, true));
        sibling = document.next_sibling(node);
    }
    if !forward.is_empty() {
        return forward;
    }

    let Some(parent) = document.parent(marker) else {
        return Vec::new();
    };
    document
        .children(parent)
        .iter()
        .skip_while(|child| **child != marker)
        .skip(1)
        .filter(|child| !is_marker(document, **child))
        .flat_map(|child| cards_within(document, *child, true))
        .collect()
}

fn cards_within(document: &Document, node: NodeId, include_self: bool) -> Vec<GroupMember> {
    let mut candidates = Vec::new();
    if include_self {
        candidates.push(node);
    }
    candidates.extend(document.descendants(node));

    candidates
        .into_iter()
        .filter_map(|id| {
            document
                .attribute(id, GAME_ID_ATTR)
                .filter(|key| !key.is_empty())
                .map(|key| GroupMember {
                    game_key: key.to_string(),
                    node: id,
                })
        })
        .collect()
}

fn is_marker(document: &Document, node: NodeId) -> bool {
    document.attribute(node, GROUP_ATTR).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::markup::MarkupNode;

    fn card(game: &str) -> MarkupNode {
        MarkupNode::new("div")
            .attr(GAME_ID_ATTR, game)
            .child(MarkupNode::new("img"))
    }

    fn marker(group: &str) -> MarkupNode {
        MarkupNode::new("div").attr(GROUP_ATTR, group)
    }

    fn keys(index: &GroupIndex, group: &str) -> Vec<String> {
        index
            .members(group)
            .iter()
            .map(|member| member.game_key.clone())
            .collect()
    }

    #[test]
    fn nested_cards_belong_to_the_marker() {
        let doc = Document::from_markup(&[marker("hero").child(card("a")).child(card("b"))]);
        let mut index = GroupIndex::new();
        index.refresh(&doc);

        assert_eq!(keys(&index, "hero"), vec!["a", "b"]);
    }

    #[test]
    fn forward_siblings_stop_at_next_marker() {
        let doc = Document::from_markup(&[
            marker("hero"),
            card("a"),
            MarkupNode::new("section").child(card("b")),
            marker("lobby"),
            card("c"),
        ]);
        let mut index = GroupIndex::new();
        index.refresh(&doc);

        assert_eq!(keys(&index, "hero"), vec!["a", "b"]);
        assert_eq!(keys(&index, "lobby"), vec!["c"]);
    }

    #[test]
    fn parent_children_skip_other_markers() {
        // "hero" is immediately followed by another marker, so only the parent scan finds cards.
        let doc = Document::from_markup(&[marker("hero"), marker("lobby").child(card("x")), card("a")]);
        let mut index = GroupIndex::new();
        index.refresh(&doc);

        assert_eq!(keys(&index, "hero"), vec!["a"]);
        assert_eq!(keys(&index, "lobby"), vec!["x"]);
        assert!(index.contains("hero", "a"));
        assert!(!index.contains("hero", "x"));
    }

    #[test]
    fn refresh_only_rebuilds_on_revision_change() {
        let mut doc = Document::from_markup(&[marker("hero").child(card("a"))]);
        let mut index = GroupIndex::new();

        assert!(index.refresh(&doc));
        assert!(!index.refresh(&doc));

        let root = doc.root();
        doc.append_markup(root, &marker("hero").child(card("z")));
        assert!(index.refresh(&doc));
        assert_eq!(keys(&index, "hero"), vec!["a", "z"]);
    }

    #[test]
    fn unknown_group_has_no_members() {
        let doc = Document::from_markup(&[card("a")]);
        let mut index = GroupIndex::new();
        index.refresh(&doc);
        assert!(index.members("missing").is_empty());
    }
}
