//! Template content trees.
//!
//! Content is a tree of typed blocks held in an arena (`Vec<Block>` indexed
//! by [`BlockId`]) rather than a pointer graph. Duplicating a template is a
//! plain `Clone` of the arena, so a copy can never share structure with its
//! source, and validation is an index walk.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Index of a block inside its content tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub usize);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Vertical grouping of blocks.
    Section,
    /// Side-by-side grouping. May not directly contain another Columns.
    Columns,
    /// Heading text.
    Heading,
    /// Paragraph text.
    Text,
    /// Image reference (url in attrs).
    Image,
    /// Call-to-action button (href in attrs).
    Button,
    /// Horizontal rule.
    Divider,
    /// Vertical whitespace.
    Spacer,
}

impl BlockKind {
    /// Whether this kind may have child blocks.
    #[must_use]
    pub const fn is_container(self) -> bool {
        matches!(self, Self::Section | Self::Columns)
    }

    /// Whether this kind may directly contain a block of its own kind.
    #[must_use]
    pub const fn is_recursive(self) -> bool {
        !matches!(self, Self::Columns)
    }

    /// Convert to string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Section => "section",
            Self::Columns => "columns",
            Self::Heading => "heading",
            Self::Text => "text",
            Self::Image => "image",
            Self::Button => "button",
            Self::Divider => "divider",
            Self::Spacer => "spacer",
        }
    }
}

/// One block in a content tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block kind.
    pub kind: BlockKind,
    /// Text content, for kinds that carry text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Presentation attributes (url, href, alignment, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    /// Arena indices of child blocks, in display order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockId>,
}

impl Block {
    /// Creates a childless block of the given kind.
    #[must_use]
    pub const fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            text: None,
            attrs: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Creates a text-bearing block.
    #[must_use]
    pub fn text_block(kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: Some(text.into()),
            attrs: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Creates a container block with the given children.
    #[must_use]
    pub const fn container(kind: BlockKind, children: Vec<BlockId>) -> Self {
        Self {
            kind,
            text: None,
            attrs: BTreeMap::new(),
            children,
        }
    }
}

/// A complete message body: an arena of blocks plus the root order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentTree {
    /// All blocks, addressed by index.
    pub blocks: Vec<Block>,
    /// Top-level block indices, in display order.
    pub roots: Vec<BlockId>,
}

impl ContentTree {
    /// Creates an empty tree.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blocks: Vec::new(),
            roots: Vec::new(),
        }
    }

    /// Appends a block to the arena, returning its id.
    ///
    /// The block is not reachable until referenced from `roots` or from
    /// another block's children.
    pub fn push(&mut self, block: Block) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(block);
        id
    }

    /// Appends a block and registers it as a root.
    pub fn push_root(&mut self, block: Block) -> BlockId {
        let id = self.push(block);
        self.roots.push(id);
        id
    }

    /// Validates the tree structure.
    ///
    /// Rules:
    /// - every root and child index is in range
    /// - every block is referenced exactly once (no sharing, no orphans,
    ///   which together with reachability also excludes cycles)
    /// - only container kinds have children
    /// - a non-recursive kind never directly contains its own kind
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContent`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let len = self.blocks.len();
        let mut referenced = vec![0_u32; len];

        for root in &self.roots {
            if root.0 >= len {
                return Err(Error::InvalidContent(format!(
                    "root index {root} out of range"
                )));
            }
            referenced[root.0] += 1;
        }

        for (index, block) in self.blocks.iter().enumerate() {
            if !block.children.is_empty() && !block.kind.is_container() {
                return Err(Error::InvalidContent(format!(
                    "{} block at {index} cannot have children",
                    block.kind.as_str()
                )));
            }
            for child in &block.children {
                if child.0 >= len {
                    return Err(Error::InvalidContent(format!(
                        "child index {child} out of range"
                    )));
                }
                let child_kind = self.blocks[child.0].kind;
                if child_kind == block.kind && !block.kind.is_recursive() {
                    return Err(Error::InvalidContent(format!(
                        "{} block at {index} directly contains another {}",
                        block.kind.as_str(),
                        child_kind.as_str()
                    )));
                }
                referenced[child.0] += 1;
            }
        }

        for (index, count) in referenced.iter().enumerate() {
            match count {
                0 => {
                    return Err(Error::InvalidContent(format!(
                        "block at {index} is unreferenced"
                    )));
                }
                1 => {}
                _ => {
                    return Err(Error::InvalidContent(format!(
                        "block at {index} is referenced {count} times"
                    )));
                }
            }
        }

        // Single-reference plus full coverage leaves one structural hole:
        // a detached ring of blocks referencing each other. Reachability
        // from the roots closes it.
        let mut visited = vec![false; len];
        let mut stack: Vec<BlockId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            if visited[id.0] {
                return Err(Error::InvalidContent(format!(
                    "block at {id} reachable twice"
                )));
            }
            visited[id.0] = true;
            stack.extend(self.blocks[id.0].children.iter().copied());
        }
        if visited.iter().any(|v| !v) {
            return Err(Error::InvalidContent(
                "content contains an unreachable block ring".into(),
            ));
        }

        Ok(())
    }

    /// Renders the tree as plain text for dispatch.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            self.render_block(*root, &mut out);
        }
        out.trim_end().to_string()
    }

    fn render_block(&self, id: BlockId, out: &mut String) {
        let Some(block) = self.blocks.get(id.0) else {
            return;
        };
        match block.kind {
            BlockKind::Heading | BlockKind::Text => {
                if let Some(text) = &block.text {
                    out.push_str(text);
                    out.push('\n');
                }
            }
            BlockKind::Button => {
                if let Some(text) = &block.text {
                    out.push_str(text);
                    if let Some(href) = block.attrs.get("href") {
                        out.push_str(": ");
                        out.push_str(href);
                    }
                    out.push('\n');
                }
            }
            BlockKind::Image => {
                if let Some(alt) = block.attrs.get("alt") {
                    out.push('[');
                    out.push_str(alt);
                    out.push_str("]\n");
                }
            }
            BlockKind::Divider => out.push_str("----\n"),
            BlockKind::Spacer => out.push('\n'),
            BlockKind::Section | BlockKind::Columns => {
                for child in &block.children {
                    self.render_block(*child, out);
                }
            }
        }
    }
}
