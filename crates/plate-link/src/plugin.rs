use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::command::{AttributeCommand, LINK_ATTRIBUTE};
use crate::core::{
    Document, Node, Position, Range, Selection, Slot, clamp_to_char_boundary, locate,
};
use crate::ops::Op;
use crate::schema::{ChildConstraint, NodeSpec, Schema, TextAttrPolicy};

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub handler: std::sync::Arc<
        dyn Fn(&mut crate::core::Editor, Option<serde_json::Value>) -> Result<(), CommandError>
            + Send
            + Sync,
    >,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(
            &mut crate::core::Editor,
            Option<serde_json::Value>,
        ) -> Result<(), CommandError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            handler: std::sync::Arc::new(handler),
        }
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: std::sync::Arc<
        dyn Fn(
                &crate::core::Editor,
                Option<serde_json::Value>,
            ) -> Result<serde_json::Value, QueryError>
            + Send
            + Sync,
    >,
}

pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op>;
}

pub trait PlatePlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }
    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    schema: Schema,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
}

impl PluginRegistry {
    pub fn new(plugins: impl IntoIterator<Item = Box<dyn PlatePlugin>>) -> Result<Self, String> {
        let mut registry = Self::default();
        for plugin in plugins {
            registry.register_plugin(plugin)?;
        }
        Ok(registry)
    }

    pub fn core() -> Self {
        let plugins: Vec<Box<dyn PlatePlugin>> = vec![
            Box::new(CoreParagraphPlugin),
            Box::new(CoreDividerPlugin),
            Box::new(CoreNormalizePlugin),
            Box::new(LinkPlugin),
        ];
        Self::new(plugins).expect("core registry must be valid")
    }

    pub fn richtext() -> Self {
        let plugins: Vec<Box<dyn PlatePlugin>> = vec![
            Box::new(CoreParagraphPlugin),
            Box::new(CoreDividerPlugin),
            Box::new(CoreNormalizePlugin),
            Box::new(LinkPlugin),
            Box::new(CodeBlockPlugin),
            Box::new(ImagePlugin),
            Box::new(MentionPlugin),
        ];
        Self::new(plugins).expect("richtext registry must be valid")
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn PlatePlugin>) -> Result<(), String> {
        for spec in plugin.node_specs() {
            self.schema.register(spec)?;
        }

        self.normalize_passes.extend(plugin.normalize_passes());

        for cmd in plugin.commands() {
            if self.commands.contains_key(&cmd.id) {
                return Err(format!("Duplicate command id: {}", cmd.id));
            }
            self.commands.insert(cmd.id.clone(), cmd);
        }

        for query in plugin.queries() {
            if self.queries.contains_key(&query.id) {
                return Err(format!("Duplicate query id: {}", query.id));
            }
            self.queries.insert(query.id.clone(), query);
        }

        tracing::trace!(plugin = plugin.id(), "registered plugin");
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn normalize_passes(&self) -> &[Box<dyn NormalizePass>] {
        &self.normalize_passes
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    /// Clamps every range end to an existing container and orders the ranges.
    pub fn normalize_selection(&self, doc: &Document, selection: &Selection) -> Selection {
        let fallback = doc
            .text_containers()
            .into_iter()
            .next()
            .map(|path| Position::new(path, 0))
            .unwrap_or_else(|| Position::new(Vec::new(), 0));

        let mut ranges: Vec<Range> = selection
            .ranges
            .iter()
            .map(|range| {
                let start = clamp_position(doc, &range.start).unwrap_or_else(|| fallback.clone());
                let end = clamp_position(doc, &range.end).unwrap_or_else(|| start.clone());
                if doc.compare_positions(&start, &end) == Ordering::Greater {
                    Range {
                        start: end,
                        end: start,
                    }
                } else {
                    Range { start, end }
                }
            })
            .collect();

        if ranges.is_empty() {
            ranges.push(Range::collapsed(fallback));
        }
        ranges.sort_by(|a, b| doc.compare_positions(&a.start, &b.start));
        ranges.dedup();

        Selection { ranges }
    }
}

fn clamp_position(doc: &Document, position: &Position) -> Option<Position> {
    let children = doc.children_at(&position.path)?;
    let width: usize = children.iter().map(Node::width).sum();
    let mut offset = position.offset.min(width);
    if let Slot::Inside {
        index,
        offset: inner,
    } = locate(children, offset)
        && let Some(Node::Text(text)) = children.get(index)
    {
        offset -= inner - clamp_to_char_boundary(&text.text, inner);
    }
    Some(Position::new(position.path.clone(), offset))
}

struct CoreParagraphPlugin;

impl PlatePlugin for CoreParagraphPlugin {
    fn id(&self) -> &'static str {
        "core.paragraph"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "paragraph".to_string(),
            children: ChildConstraint::InlineOnly,
            text_attrs: TextAttrPolicy::Any,
        }]
    }
}

struct CoreDividerPlugin;

impl PlatePlugin for CoreDividerPlugin {
    fn id(&self) -> &'static str {
        "core.divider"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "divider".to_string(),
            children: ChildConstraint::None,
            text_attrs: TextAttrPolicy::Nothing,
        }]
    }
}

struct CoreNormalizePlugin;

impl PlatePlugin for CoreNormalizePlugin {
    fn id(&self) -> &'static str {
        "core.normalize"
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![
            Box::new(EnsureNonEmptyDocument),
            Box::new(EnsureTextBlockHasTextLeaf),
            Box::new(RemoveEmptyTextLeaves),
            Box::new(MergeAdjacentTextLeaves),
        ]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "core.ensure_non_empty_document"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        if doc.children.is_empty() {
            return vec![Op::InsertNode {
                path: vec![0],
                node: Node::paragraph(""),
            }];
        }
        Vec::new()
    }
}

struct EnsureTextBlockHasTextLeaf;

impl NormalizePass for EnsureTextBlockHasTextLeaf {
    fn id(&self) -> &'static str {
        "core.ensure_text_block_has_text_leaf"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        registry
            .schema()
            .text_blocks_in_order(doc)
            .into_iter()
            .filter(|block| !block.el.children.iter().any(|n| matches!(n, Node::Text(_))))
            .map(|block| {
                let mut path = block.path;
                path.push(0);
                Op::InsertNode {
                    path,
                    node: Node::text(""),
                }
            })
            .collect()
    }
}

/// Drops empty text leaves, keeping one when a block has no other text.
struct RemoveEmptyTextLeaves;

impl NormalizePass for RemoveEmptyTextLeaves {
    fn id(&self) -> &'static str {
        "core.remove_empty_text_leaves"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for block in registry.schema().text_blocks_in_order(doc) {
            let has_content = block
                .el
                .children
                .iter()
                .any(|n| matches!(n, Node::Text(t) if !t.text.is_empty()));
            let empties: Vec<usize> = block
                .el
                .children
                .iter()
                .enumerate()
                .filter(|(_, n)| matches!(n, Node::Text(t) if t.text.is_empty()))
                .map(|(ix, _)| ix)
                .collect();
            let keep = usize::from(!has_content);

            for &ix in empties.iter().skip(keep).rev() {
                let mut path = block.path.clone();
                path.push(ix);
                ops.push(Op::RemoveNode { path });
            }
        }
        ops
    }
}

struct MergeAdjacentTextLeaves;

impl NormalizePass for MergeAdjacentTextLeaves {
    fn id(&self) -> &'static str {
        "core.merge_adjacent_text_leaves"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();
        for block in registry.schema().text_blocks_in_order(doc) {
            let children = &block.el.children;
            for ix in (0..children.len().saturating_sub(1)).rev() {
                let (Node::Text(left), Node::Text(right)) = (&children[ix], &children[ix + 1])
                else {
                    continue;
                };
                if left.attrs != right.attrs {
                    continue;
                }
                let mut path = block.path.clone();
                path.push(ix);
                ops.push(Op::MergeText { path });
            }
        }
        ops
    }
}

struct LinkPlugin;

impl PlatePlugin for LinkPlugin {
    fn id(&self) -> &'static str {
        "link"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("link.set", |editor, args| {
                let href = args
                    .as_ref()
                    .and_then(|v| v.get("href"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CommandError::new("Missing args.href"))?
                    .to_string();

                let mut command = AttributeCommand::link();
                command.refresh(editor);
                if !command.is_enabled() {
                    tracing::debug!("link.set skipped: link is not allowed in the selection");
                    return Ok(());
                }
                command
                    .execute(editor, &href)
                    .map_err(|e| CommandError::new(format!("Failed to set link: {e}")))
            }),
            CommandSpec::new("link.unset", |editor, _args| {
                let mut command = AttributeCommand::link();
                command.refresh(editor);
                if !command.is_enabled() {
                    tracing::debug!("link.unset skipped: link is not allowed in the selection");
                    return Ok(());
                }
                command
                    .clear(editor)
                    .map_err(|e| CommandError::new(format!("Failed to unset link: {e}")))
            }),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec {
                id: "link.value".to_string(),
                handler: std::sync::Arc::new(|editor, _args| {
                    let mut command = AttributeCommand::link();
                    command.refresh(editor);
                    Ok(command
                        .value()
                        .map(|href| Value::String(href.to_string()))
                        .unwrap_or(Value::Null))
                }),
            },
            QuerySpec {
                id: "link.is_enabled".to_string(),
                handler: std::sync::Arc::new(|editor, _args| {
                    let mut command = AttributeCommand::link();
                    command.refresh(editor);
                    Ok(Value::Bool(command.is_enabled()))
                }),
            },
        ]
    }
}

struct CodeBlockPlugin;

impl PlatePlugin for CodeBlockPlugin {
    fn id(&self) -> &'static str {
        "code_block"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "code_block".to_string(),
            children: ChildConstraint::InlineOnly,
            text_attrs: TextAttrPolicy::Except(vec![LINK_ATTRIBUTE.to_string()]),
        }]
    }
}

struct ImagePlugin;

impl PlatePlugin for ImagePlugin {
    fn id(&self) -> &'static str {
        "image"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "image".to_string(),
            children: ChildConstraint::None,
            text_attrs: TextAttrPolicy::Nothing,
        }]
    }
}

struct MentionPlugin;

impl PlatePlugin for MentionPlugin {
    fn id(&self) -> &'static str {
        "mention"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "mention".to_string(),
            children: ChildConstraint::None,
            text_attrs: TextAttrPolicy::Nothing,
        }]
    }
}
