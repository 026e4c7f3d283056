use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{Document, NodeId};

/// Serialisable description of a page fragment, used for page snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkupNode {
    /// Lowercased element tag.
    pub tag: String,
    /// Attributes in source order.
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
    /// Child nodes in document order.
    #[serde(default)]
    pub children: Vec<MarkupNode>,
}

impl MarkupNode {
    /// Bare node with no attributes or children.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: IndexMap::new(),
            children: Vec::new(),
        }
    }

    /// Builder: set an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder: append a child node.
    pub fn child(mut self, child: MarkupNode) -> Self {
        self.children.push(child);
        self
    }
}

impl Document {
    /// Build a document whose root children are `nodes`.
    pub fn from_markup(nodes: &[MarkupNode]) -> Self {
        let mut document = Document::new();
        let root = document.root();
        for node in nodes {
            document.append_markup(root, node);
        }
        document
    }

    /// Append `markup` below `parent` and return the new subtree root.
    pub fn append_markup(&mut self, parent: NodeId, markup: &MarkupNode) -> NodeId {
        let id = self.create_element(&markup.tag);
        for (name, value) in &markup.attributes {
            if name == "class" {
                for class in value.split_whitespace() {
                    self.add_class(id, class);
                }
            } else {
                self.set_attribute(id, name, value.clone());
            }
        }
        if let Some(media) = self.media_mut(id) {
            media.src = markup.attributes.get("src").cloned();
            media.poster = markup.attributes.get("poster").cloned();
        }
        self.append_child(parent, id);
        for child in &markup.children {
            self.append_markup(id, child);
        }
        id
    }
}
