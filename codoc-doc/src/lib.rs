//! Structured rich-text document model with a canonical JSON form.
//!
//! The tree is intentionally small: a root holding ordered block nodes
//! (paragraphs and headings), each holding ordered inline text nodes. Every
//! node carries a stable [`NodeKey`] that is independent of its position and
//! travels through the canonical JSON, so replicas can address nodes by
//! identity rather than by index.

use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

/// Stable node identity, independent of tree position.
pub type NodeKey = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unsupported node type `{0}`")]
    UnsupportedNode(String),
    #[error("invalid heading tag `{0}`")]
    InvalidHeadingTag(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
}

impl BlockKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading { .. } => "heading",
        }
    }

    /// Same node type, ignoring heading level.
    pub fn same_type(&self, other: &BlockKind) -> bool {
        self.type_name() == other.type_name()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineNode {
    pub key: NodeKey,
    pub text: String,
}

impl InlineNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            key: Uuid::new_v4(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub key: NodeKey,
    pub kind: BlockKind,
    pub children: Vec<InlineNode>,
}

impl BlockNode {
    pub fn paragraph(children: Vec<InlineNode>) -> Self {
        Self {
            key: Uuid::new_v4(),
            kind: BlockKind::Paragraph,
            children,
        }
    }

    pub fn heading(level: u8, children: Vec<InlineNode>) -> Self {
        Self {
            key: Uuid::new_v4(),
            kind: BlockKind::Heading { level },
            children,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentTree {
    pub blocks: Vec<BlockNode>,
}

impl DocumentTree {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Look up an inline text node anywhere in the tree by its key.
    pub fn find_text_node(&self, key: NodeKey) -> Option<&InlineNode> {
        self.blocks
            .iter()
            .flat_map(|block| block.children.iter())
            .find(|inline| inline.key == key)
    }

    pub fn find_block(&self, key: NodeKey) -> Option<&BlockNode> {
        self.blocks.iter().find(|block| block.key == key)
    }

    /// Serialize to the canonical JSON text.
    ///
    /// Object keys are emitted in sorted order, so two structurally equal
    /// trees always produce byte-identical output.
    pub fn to_canonical_json(&self) -> String {
        let children: Vec<Value> = self.blocks.iter().map(block_to_value).collect();
        let root = serde_json::json!({
            "root": {
                "type": "root",
                "children": children,
            }
        });
        root.to_string()
    }

    /// Parse the canonical JSON text back into a tree.
    ///
    /// Node keys are preserved when present and freshly generated when
    /// absent, so documents produced by foreign editors still load.
    pub fn from_canonical_json(text: &str) -> Result<Self, ParseError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let root = value
            .get("root")
            .and_then(Value::as_object)
            .ok_or(ParseError::MissingField("root"))?;
        let children = root
            .get("children")
            .and_then(Value::as_array)
            .ok_or(ParseError::MissingField("children"))?;

        let mut blocks = Vec::with_capacity(children.len());
        for child in children {
            blocks.push(block_from_value(child)?);
        }
        Ok(Self { blocks })
    }
}

/// The document every fresh replica starts from: one paragraph reading "hello".
pub fn default_document() -> DocumentTree {
    DocumentTree {
        blocks: vec![BlockNode::paragraph(vec![InlineNode::new("hello")])],
    }
}

fn block_to_value(block: &BlockNode) -> Value {
    let children: Vec<Value> = block
        .children
        .iter()
        .map(|inline| {
            serde_json::json!({
                "type": "text",
                "key": inline.key.to_string(),
                "text": inline.text,
            })
        })
        .collect();

    match block.kind {
        BlockKind::Paragraph => serde_json::json!({
            "type": "paragraph",
            "key": block.key.to_string(),
            "children": children,
        }),
        BlockKind::Heading { level } => serde_json::json!({
            "type": "heading",
            "tag": format!("h{level}"),
            "key": block.key.to_string(),
            "children": children,
        }),
    }
}

fn block_from_value(value: &Value) -> Result<BlockNode, ParseError> {
    let node_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("type"))?;

    let kind = match node_type {
        "paragraph" => BlockKind::Paragraph,
        "heading" => {
            let tag = value
                .get("tag")
                .and_then(Value::as_str)
                .ok_or(ParseError::MissingField("tag"))?;
            let level = tag
                .strip_prefix('h')
                .and_then(|digits| digits.parse::<u8>().ok())
                .filter(|level| (1..=6).contains(level))
                .ok_or_else(|| ParseError::InvalidHeadingTag(tag.to_string()))?;
            BlockKind::Heading { level }
        }
        other => return Err(ParseError::UnsupportedNode(other.to_string())),
    };

    let mut children = Vec::new();
    if let Some(inlines) = value.get("children").and_then(Value::as_array) {
        for inline in inlines {
            children.push(inline_from_value(inline)?);
        }
    }

    Ok(BlockNode {
        key: parse_key(value),
        kind,
        children,
    })
}

fn inline_from_value(value: &Value) -> Result<InlineNode, ParseError> {
    let node_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("type"))?;
    if node_type != "text" {
        return Err(ParseError::UnsupportedNode(node_type.to_string()));
    }
    let text = value
        .get("text")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("text"))?;
    Ok(InlineNode {
        key: parse_key(value),
        text: text.to_string(),
    })
}

fn parse_key(value: &Value) -> NodeKey {
    value
        .get("key")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .unwrap_or_else(Uuid::new_v4)
}

/// Number of grapheme clusters in `text`.
pub fn grapheme_len(text: &str) -> usize {
    text.graphemes(true).count()
}

/// Clamp a cursor offset to the grapheme length of `text`.
pub fn clamp_grapheme_offset(text: &str, offset: usize) -> usize {
    offset.min(grapheme_len(text))
}
