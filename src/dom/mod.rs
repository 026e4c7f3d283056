//! In-memory mirror of the host page's element tree.
//!
//! The runtime never talks to a browser directly. A host integration mirrors the page into a
//! [`Document`], applies the mutations the runtime makes, and reports media readiness and
//! pointer events back.

pub mod groups;
/// Serializable page snapshots and their conversion into a [`Document`].
pub mod markup;

use std::time::Duration;

use indexmap::IndexMap;

/// Attribute tagging an element as a game card.
pub const GAME_ID_ATTR: &str = "data-cardsync-game-id";
/// Attribute marking an override group.
pub const GROUP_ATTR: &str = "data-cardsync-group";
/// Attribute written on the rendered media node with the applied version.
pub const VERSION_ATTR: &str = "data-cardsync-version";

/// Handle to an element inside a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Inline style properties the runtime animates.
#[derive(Debug, Clone, PartialEq)]
pub struct Style {
    /// Rendered opacity, `0.0` to `1.0`.
    pub opacity: f32,
    /// Blur radius in pixels.
    pub blur_px: f32,
    /// Duration of the transition applied with the last change, `None` for instant changes.
    pub transition: Option<Duration>,
    /// Whether the element is removed from layout.
    pub hidden: bool,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            opacity: 1.0,
            blur_px: 0.0,
            transition: None,
            hidden: false,
        }
    }
}

/// Playback state of a video element.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaState {
    /// Current `src`, `None` until a source is assigned.
    pub src: Option<String>,
    /// Current `poster` image.
    pub poster: Option<String>,
    /// Whether playback is paused.
    pub paused: bool,
    /// Playback position in seconds.
    pub current_time: f64,
    /// Set by the host once enough data is buffered to play.
    pub ready: bool,
    /// Number of times the runtime asked the host to (re)load the source.
    pub load_requests: u32,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            src: None,
            poster: None,
            paused: true,
            current_time: 0.0,
            ready: false,
            load_requests: 0,
        }
    }
}

/// Single node of the mirrored page.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    /// Lowercased tag name.
    pub tag: String,
    /// Attributes in source order.
    pub attributes: IndexMap<String, String>,
    /// Class list in insertion order.
    pub classes: Vec<String>,
    /// Inline style the runtime animates.
    pub style: Style,
    /// Playback state, present on `video` elements only.
    pub media: Option<MediaState>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Element {
    fn new(tag: &str) -> Self {
        let tag = tag.to_ascii_lowercase();
        let media = (tag == "video").then(MediaState::default);
        Self {
            tag,
            attributes: IndexMap::new(),
            classes: Vec::new(),
            style: Style::default(),
            media,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Attribute value, if set.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Whether the class list contains `class`.
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|existing| existing == class)
    }

    /// Parent node, `None` for the root or detached nodes.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child nodes in document order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Arena of elements rooted at a single node.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Option<Element>>,
    root: NodeId,
    revision: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document with a `body` root.
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Element::new("body"))],
            root: NodeId(0),
            revision: 0,
        }
    }

    /// Root node of the document.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Counter bumped by every structural or markup change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Element behind `id`, `None` once removed.
    pub fn get(&self, id: NodeId) -> Option<&Element> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Mutable element behind `id`.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Whether `id` refers to a node still in the document.
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Create a detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Some(Element::new(tag)));
        NodeId(self.nodes.len() - 1)
    }

    /// Move `child` to the end of `parent`'s children. Returns `false` if either node is gone
    /// or if the move would create a cycle.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if !self.contains_node(parent) || !self.contains_node(child) || self.contains(child, parent)
        {
            return false;
        }

        self.detach(child);
        if let Some(element) = self.get_mut(parent) {
            element.children.push(child);
        }
        if let Some(element) = self.get_mut(child) {
            element.parent = Some(parent);
        }
        self.revision += 1;
        true
    }

    /// Remove `id` and its whole subtree. The root cannot be removed.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if id == self.root || !self.contains_node(id) {
            return false;
        }

        self.detach(id);
        let mut doomed = self.descendants(id);
        doomed.push(id);
        for node in doomed {
            if let Some(slot) = self.nodes.get_mut(node.0) {
                *slot = None;
            }
        }
        self.revision += 1;
        true
    }

    /// Put `replacement` where `old` sits in its parent, then remove `old` and its subtree.
    pub fn replace(&mut self, old: NodeId, replacement: NodeId) -> bool {
        let Some(parent) = self.parent(old) else {
            return false;
        };
        if old == replacement || !self.contains_node(replacement) || self.contains(replacement, parent)
        {
            return false;
        }

        self.detach(replacement);
        if let Some(element) = self.get_mut(parent)
            && let Some(position) = element.children.iter().position(|child| *child == old)
        {
            element.children.insert(position, replacement);
        }
        if let Some(element) = self.get_mut(replacement) {
            element.parent = Some(parent);
        }
        self.remove(old)
    }

    fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.get(id).and_then(|element| element.parent) else {
            return;
        };
        if let Some(element) = self.get_mut(parent) {
            element.children.retain(|child| *child != id);
        }
        if let Some(element) = self.get_mut(id) {
            element.parent = None;
        }
    }

    /// Attribute value on `id`, if both exist.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.get(id).and_then(|element| element.attribute(name))
    }

    /// Set an attribute. Changing a markup contract attribute bumps the revision.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: impl Into<String>) -> bool {
        let Some(element) = self.get_mut(id) else {
            return false;
        };
        let value = value.into();
        let changed = element.attribute(name) != Some(value.as_str());
        element.attributes.insert(name.to_string(), value);
        if changed && is_markup_attribute(name) {
            self.revision += 1;
        }
        true
    }

    /// Remove an attribute. Removing a markup contract attribute bumps the revision.
    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> bool {
        let removed = self
            .get_mut(id)
            .and_then(|element| element.attributes.shift_remove(name))
            .is_some();
        if removed && is_markup_attribute(name) {
            self.revision += 1;
        }
        removed
    }

    /// Append a class unless already present. Returns `false` for unknown nodes.
    pub fn add_class(&mut self, id: NodeId, class: &str) -> bool {
        let Some(element) = self.get_mut(id) else {
            return false;
        };
        if !element.has_class(class) {
            element.classes.push(class.to_string());
        }
        true
    }

    /// Remove a class. Returns `false` for unknown nodes.
    pub fn remove_class(&mut self, id: NodeId, class: &str) -> bool {
        let Some(element) = self.get_mut(id) else {
            return false;
        };
        element.classes.retain(|existing| existing != class);
        true
    }

    /// Mutable inline style of `id`.
    pub fn style_mut(&mut self, id: NodeId) -> Option<&mut Style> {
        self.get_mut(id).map(|element| &mut element.style)
    }

    /// Playback state of a video node.
    pub fn media(&self, id: NodeId) -> Option<&MediaState> {
        self.get(id).and_then(|element| element.media.as_ref())
    }

    /// Mutable playback state of a video node.
    pub fn media_mut(&mut self, id: NodeId) -> Option<&mut MediaState> {
        self.get_mut(id).and_then(|element| element.media.as_mut())
    }

    /// Parent of `id`.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(Element::parent)
    }

    /// Child nodes, empty for unknown nodes.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(Element::children).unwrap_or(&[])
    }

    /// All nodes below `id` in document order, `id` excluded.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    /// Sibling following `id` under the same parent.
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let position = siblings.iter().position(|sibling| *sibling == id)?;
        siblings.get(position + 1).copied()
    }

    /// Nearest node, starting at `id` itself, that satisfies `predicate`.
    pub fn closest<F>(&self, id: NodeId, mut predicate: F) -> Option<NodeId>
    where
        F: FnMut(&Element) -> bool,
    {
        let mut current = Some(id);
        while let Some(node) = current {
            let element = self.get(node)?;
            if predicate(element) {
                return Some(node);
            }
            current = element.parent;
        }
        None
    }

    /// True if `node` is `ancestor` or lies below it.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Tagged game cards in document order.
    pub fn game_cards(&self) -> Vec<(NodeId, String)> {
        self.descendants(self.root)
            .into_iter()
            .filter_map(|id| {
                self.attribute(id, GAME_ID_ATTR)
                    .filter(|value| !value.is_empty())
                    .map(|value| (id, value.to_string()))
            })
            .collect()
    }

    /// First `<img>` below `card`, used as the pre-upgrade placeholder.
    pub fn placeholder(&self, card: NodeId) -> Option<NodeId> {
        self.descendants(card)
            .into_iter()
            .find(|id| self.get(*id).is_some_and(|element| element.tag == "img"))
    }
}

fn is_markup_attribute(name: &str) -> bool {
    name == GAME_ID_ATTR || name == GROUP_ATTR
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(doc: &mut Document, parent: NodeId, game: &str) -> NodeId {
        let card = doc.create_element("div");
        doc.set_attribute(card, GAME_ID_ATTR, game);
        doc.append_child(parent, card);
        let img = doc.create_element("img");
        doc.append_child(card, img);
        card
    }

    #[test]
    fn descendants_are_in_document_order() {
        let mut doc = Document::new();
        let root = doc.root();
        let a = card(&mut doc, root, "a");
        let b = card(&mut doc, root, "b");

        let cards = doc.game_cards();
        assert_eq!(cards, vec![(a, "a".to_string()), (b, "b".to_string())]);
        assert_eq!(doc.next_sibling(a), Some(b));
        assert_eq!(doc.next_sibling(b), None);
    }

    #[test]
    fn remove_drops_subtree_and_bumps_revision() {
        let mut doc = Document::new();
        let root = doc.root();
        let a = card(&mut doc, root, "a");
        let placeholder = doc.placeholder(a).unwrap();
        let before = doc.revision();

        assert!(doc.remove(a));
        assert!(!doc.contains_node(placeholder));
        assert!(doc.revision() > before);
        assert!(doc.game_cards().is_empty());
        assert!(!doc.remove(root));
    }

    #[test]
    fn only_markup_attributes_bump_revision() {
        let mut doc = Document::new();
        let root = doc.root();
        let a = card(&mut doc, root, "a");
        let before = doc.revision();

        doc.set_attribute(a, VERSION_ATTR, "3");
        assert_eq!(doc.revision(), before);

        doc.set_attribute(a, GROUP_ATTR, "hero");
        assert_eq!(doc.revision(), before + 1);
    }

    #[test]
    fn closest_includes_self_and_stops_at_root() {
        let mut doc = Document::new();
        let root = doc.root();
        let a = card(&mut doc, root, "a");
        let img = doc.placeholder(a).unwrap();

        assert_eq!(doc.closest(img, |el| el.tag == "img"), Some(img));
        assert_eq!(doc.closest(img, |el| el.attribute(GAME_ID_ATTR).is_some()), Some(a));
        assert_eq!(doc.closest(img, |el| el.tag == "button"), None);
        assert!(doc.contains(root, img));
    }

    #[test]
    fn append_child_refuses_cycles() {
        let mut doc = Document::new();
        let root = doc.root();
        let a = card(&mut doc, root, "a");
        assert!(!doc.append_child(a, root));
    }

    #[test]
    fn replace_keeps_position() {
        let mut doc = Document::new();
        let root = doc.root();
        let a = card(&mut doc, root, "a");
        let img = doc.placeholder(a).unwrap();
        let trailer = doc.create_element("div");
        doc.append_child(a, trailer);

        let video = doc.create_element("video");
        assert!(doc.replace(img, video));
        assert_eq!(doc.children(a), &[video, trailer]);
        assert!(!doc.contains_node(img));
        assert!(!doc.replace(root, video));
    }

    #[test]
    fn video_elements_carry_media_state() {
        let mut doc = Document::new();
        let video = doc.create_element("VIDEO");
        assert_eq!(doc.get(video).unwrap().tag, "video");
        assert!(doc.media(video).unwrap().paused);
    }
}
