use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::batch::Batch;
use crate::ops::{Op, Path, Transaction};
use crate::plugin::{CommandError, PluginRegistry, QueryError};
use crate::schema::Schema;

pub type Attrs = BTreeMap<String, serde_json::Value>;
pub type TextAttrs = BTreeMap<String, String>;
pub type ElementKind = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
    Void(VoidNode),
}

impl Node {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::element("paragraph", vec![Self::text(text)])
    }

    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element(ElementNode {
            kind: kind.into(),
            attrs: Attrs::default(),
            children,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode::new(text))
    }

    pub fn text_with_attr(
        text: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Node::Text(TextNode::new(text).with_attr(name, value))
    }

    pub fn divider() -> Self {
        Node::Void(VoidNode {
            kind: "divider".to_string(),
            attrs: Attrs::default(),
        })
    }

    pub fn image(src: impl Into<String>, alt: Option<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("src".to_string(), Value::String(src.into()));
        if let Some(alt) = alt {
            attrs.insert("alt".to_string(), Value::String(alt));
        }
        Node::Void(VoidNode {
            kind: "image".to_string(),
            attrs,
        })
    }

    pub fn mention(label: impl Into<String>) -> Self {
        let mut attrs = Attrs::default();
        attrs.insert("label".to_string(), Value::String(label.into()));
        Node::Void(VoidNode {
            kind: "mention".to_string(),
            attrs,
        })
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            Node::Element(el) => Some(&el.kind),
            Node::Void(v) => Some(&v.kind),
            Node::Text(_) => None,
        }
    }

    /// Number of offset units the node occupies inside its parent.
    pub fn width(&self) -> usize {
        match self {
            Node::Text(t) => t.text.len(),
            Node::Element(_) | Node::Void(_) => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub kind: ElementKind,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidNode {
    pub kind: ElementKind,
    #[serde(default)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: TextAttrs,
}

impl TextNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attrs: TextAttrs::default(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// A location inside a container element.
///
/// `path` addresses the container (the empty path is the document root) and
/// `offset` counts text bytes plus one unit for every non-text child before the
/// location. Splitting or merging text nodes never moves a position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Position {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    /// Builds a range, swapping the ends when both sit in one container in reverse order.
    pub fn new(start: Position, end: Position) -> Self {
        if start.path == end.path && end.offset < start.offset {
            return Self {
                start: end,
                end: start,
            };
        }
        Self { start, end }
    }

    pub fn collapsed(position: Position) -> Self {
        Self {
            start: position.clone(),
            end: position,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }

    pub fn is_flat(&self) -> bool {
        self.start.path == self.end.path
    }
}

/// Disjoint ranges kept in document order by [`Editor::set_selection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub ranges: Vec<Range>,
}

impl Selection {
    pub fn collapsed(position: Position) -> Self {
        Self::from_range(Range::collapsed(position))
    }

    pub fn from_range(range: Range) -> Self {
        Self {
            ranges: vec![range],
        }
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = Range>) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    pub fn is_collapsed(&self) -> bool {
        matches!(self.ranges.as_slice(), [range] if range.is_collapsed())
    }

    pub fn first_range(&self) -> Option<&Range> {
        self.ranges.first()
    }

    pub fn first_position(&self) -> Option<&Position> {
        self.ranges.first().map(|range| &range.start)
    }
}

pub(crate) enum Slot {
    /// Strictly inside the text child at `index`.
    Inside { index: usize, offset: usize },
    /// Right before the child at `index` (or at the end when `index == len`).
    Between { index: usize },
}

pub(crate) fn locate(children: &[Node], offset: usize) -> Slot {
    let mut cursor = 0usize;
    for (index, node) in children.iter().enumerate() {
        if offset == cursor {
            return Slot::Between { index };
        }
        let end = cursor + node.width();
        if offset < end {
            return Slot::Inside {
                index,
                offset: offset - cursor,
            };
        }
        cursor = end;
    }
    Slot::Between {
        index: children.len(),
    }
}

pub(crate) fn offset_of_child(children: &[Node], index: usize) -> usize {
    children.iter().take(index).map(Node::width).sum()
}

impl Document {
    pub fn node(&self, path: &[usize]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.children.get(*first)?;
        for &ix in rest {
            node = match node {
                Node::Element(el) => el.children.get(ix)?,
                Node::Void(_) | Node::Text(_) => return None,
            };
        }
        Some(node)
    }

    /// Children of the container at `path`; the empty path is the document root.
    pub fn children_at(&self, path: &[usize]) -> Option<&[Node]> {
        if path.is_empty() {
            return Some(&self.children);
        }
        match self.node(path)? {
            Node::Element(el) => Some(&el.children),
            Node::Void(_) | Node::Text(_) => None,
        }
    }

    pub fn width_of(&self, path: &[usize]) -> Option<usize> {
        self.children_at(path)
            .map(|children| children.iter().map(Node::width).sum())
    }

    /// The text node a position falls strictly inside of, with its child index.
    pub fn text_at(&self, position: &Position) -> Option<(usize, &TextNode)> {
        let children = self.children_at(&position.path)?;
        match locate(children, position.offset) {
            Slot::Inside { index, .. } => match children.get(index) {
                Some(Node::Text(text)) => Some((index, text)),
                _ => None,
            },
            Slot::Between { .. } => None,
        }
    }

    pub fn node_before(&self, position: &Position) -> Option<(usize, &Node)> {
        let children = self.children_at(&position.path)?;
        match locate(children, position.offset) {
            Slot::Inside { .. } => None,
            Slot::Between { index } => {
                let index = index.checked_sub(1)?;
                children.get(index).map(|node| (index, node))
            }
        }
    }

    pub fn node_after(&self, position: &Position) -> Option<(usize, &Node)> {
        let children = self.children_at(&position.path)?;
        match locate(children, position.offset) {
            Slot::Inside { .. } => None,
            Slot::Between { index } => children.get(index).map(|node| (index, node)),
        }
    }

    pub fn compare_positions(&self, a: &Position, b: &Position) -> Ordering {
        let common = a
            .path
            .iter()
            .zip(&b.path)
            .take_while(|(x, y)| x == y)
            .count();
        match (a.path.len() == common, b.path.len() == common) {
            (true, true) => a.offset.cmp(&b.offset),
            (true, false) => self.compare_with_child(a, b.path[common]),
            (false, true) => self.compare_with_child(b, a.path[common]).reverse(),
            (false, false) => a.path[common].cmp(&b.path[common]),
        }
    }

    fn compare_with_child(&self, position: &Position, child_ix: usize) -> Ordering {
        let child_start = self
            .children_at(&position.path)
            .map(|children| offset_of_child(children, child_ix))
            .unwrap_or(child_ix);
        if position.offset <= child_start {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// The part of `range` that lies inside the container at `container`, in its offsets.
    pub fn span_in(&self, range: &Range, container: &[usize]) -> Option<std::ops::Range<usize>> {
        let width = self.width_of(container)?;
        let container_start = Position::new(container.to_vec(), 0);
        let container_end = Position::new(container.to_vec(), width);
        if self.compare_positions(&range.start, &container_end) != Ordering::Less
            || self.compare_positions(&range.end, &container_start) != Ordering::Greater
        {
            return None;
        }

        let start = if range.start.path == container {
            range.start.offset.min(width)
        } else {
            0
        };
        let end = if range.end.path == container {
            range.end.offset.min(width)
        } else {
            width
        };
        (start < end).then_some(start..end)
    }

    /// Value of attribute `name` as seen by the selection.
    ///
    /// A caret reads the text node it sits in, otherwise the text node before it,
    /// otherwise the text node after it. An expanded selection reads the first
    /// non-empty text node of its first range.
    pub fn selection_attribute(&self, selection: &Selection, name: &str) -> Option<&str> {
        if selection.is_collapsed() {
            let position = selection.first_position()?;
            if let Some((_, text)) = self.text_at(position) {
                return text.attr(name);
            }
            let before = match self.node_before(position) {
                Some((_, Node::Text(text))) => Some(text),
                _ => None,
            };
            let after = match self.node_after(position) {
                Some((_, Node::Text(text))) => Some(text),
                _ => None,
            };
            return before.or(after).and_then(|text| text.attr(name));
        }

        let range = selection.first_range()?;
        for container in self.text_containers() {
            let Some(span) = self.span_in(range, &container) else {
                continue;
            };
            let children = self.children_at(&container)?;
            let mut cursor = 0usize;
            for node in children {
                let start = cursor;
                cursor += node.width();
                let Node::Text(text) = node else {
                    continue;
                };
                if cursor > span.start && start < span.end && !text.text.is_empty() {
                    return text.attr(name);
                }
            }
        }
        None
    }

    /// The single non-text node a selection spans exactly, if any.
    pub fn selected_element(&self, selection: &Selection) -> Option<&Node> {
        let [range] = selection.ranges.as_slice() else {
            return None;
        };
        if !range.is_flat() || range.end.offset != range.start.offset + 1 {
            return None;
        }
        match self.node_after(&range.start)? {
            (_, Node::Text(_)) => None,
            (_, node) => Some(node),
        }
    }

    /// Paths of every element holding at least one text child, in document order.
    pub fn text_containers(&self) -> Vec<Path> {
        fn walk(children: &[Node], path: &mut Vec<usize>, out: &mut Vec<Path>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if el.children.iter().any(|n| matches!(n, Node::Text(_))) {
                    out.push(path.clone());
                }
                walk(&el.children, path, out);
                path.pop();
            }
        }

        let mut out = Vec::new();
        walk(&self.children, &mut Vec::new(), &mut out);
        out
    }
}

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub inverse_ops: Vec<Op>,
    pub selection_before: Selection,
    pub selection_after: Selection,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub max_undo: usize,
    pub max_normalize_iterations: usize,
}

impl EditorConfig {
    fn with_defaults(mut self) -> Self {
        if self.max_undo == 0 {
            self.max_undo = 200;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 100;
        }
        self
    }
}

pub struct Editor {
    doc: Document,
    selection: Selection,
    registry: PluginRegistry,
    config: EditorConfig,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: PluginRegistry) -> Self {
        Self::with_config(doc, selection, registry, EditorConfig::default())
    }

    pub fn with_config(
        doc: Document,
        selection: Selection,
        registry: PluginRegistry,
        config: EditorConfig,
    ) -> Self {
        let mut editor = Self {
            doc,
            selection,
            registry,
            config: config.with_defaults(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        };
        editor.normalize_in_place();
        editor
    }

    pub fn with_core_plugins() -> Self {
        Self::empty(PluginRegistry::core())
    }

    pub fn with_richtext_plugins() -> Self {
        Self::empty(PluginRegistry::richtext())
    }

    fn empty(registry: PluginRegistry) -> Self {
        let doc = Document {
            children: vec![Node::paragraph("")],
        };
        let selection = Selection::collapsed(Position::new(vec![0], 0));
        Self::new(doc, selection, registry)
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = selection;
        self.normalize_selection_in_place();
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &Schema {
        self.registry.schema()
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn last_undo_source(&self) -> Option<&str> {
        self.undo_stack.last()?.source.as_deref()
    }

    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
            source,
        } = record;

        let redo_ops = match self.replay(inverse_ops) {
            Ok(ops) => ops,
            Err(err) => {
                tracing::warn!(?source, error = %err, "dropping undo entry that no longer applies");
                return false;
            }
        };

        self.selection = selection_before.clone();
        self.normalize_in_place();

        self.redo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: redo_ops,
            source,
        });
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
            source,
        } = record;

        let undo_ops = match self.replay(inverse_ops) {
            Ok(ops) => ops,
            Err(err) => {
                tracing::warn!(?source, error = %err, "dropping redo entry that no longer applies");
                return false;
            }
        };

        self.selection = selection_after.clone();
        self.normalize_in_place();

        self.undo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: undo_ops,
            source,
        });
        true
    }

    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let Transaction {
            ops,
            selection_after,
            meta,
        } = tx;
        let source = meta.source.unwrap_or_else(|| "transaction".to_string());

        self.enqueue_changes(&source, |batch| {
            for op in ops {
                batch.apply_op(op)?;
            }
            if let Some(selection) = selection_after {
                batch.set_selection(selection);
            }
            Ok(())
        })
    }

    /// Runs `change` as one atomic change block.
    ///
    /// Everything the block mutates becomes a single undo step. When the block
    /// returns an error its mutations are reverted and the selection is restored.
    pub fn enqueue_changes<T>(
        &mut self,
        source: &str,
        change: impl FnOnce(&mut Batch<'_>) -> Result<T, ApplyError>,
    ) -> Result<T, ApplyError> {
        let selection_before = self.selection.clone();

        let mut batch = Batch::new(&mut self.doc, &mut self.selection, &self.registry);
        let result = change(&mut batch);
        let mut inverse_ops = batch.into_inverse_ops();

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(source, error = %err, "rolling back change block");
                self.rollback(inverse_ops, selection_before);
                return Err(err);
            }
        };

        if inverse_ops.is_empty() {
            tracing::trace!(source, "change block left the document untouched");
            self.normalize_selection_in_place();
            return Ok(value);
        }

        if let Err(err) = self.normalize_with_inverse_ops(&mut inverse_ops) {
            tracing::warn!(source, error = %err, "rolling back change block after normalization");
            self.rollback(inverse_ops, selection_before);
            return Err(err);
        }
        inverse_ops.reverse();

        self.normalize_selection_in_place();

        let selection_after = self.selection.clone();
        tracing::debug!(source, ops = inverse_ops.len(), "committed change block");

        self.undo_stack.push(UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
            source: Some(source.to_string()),
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }

        Ok(value)
    }

    pub fn run_command(
        &mut self,
        id: &str,
        args: Option<serde_json::Value>,
    ) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    fn normalize_in_place(&mut self) {
        let selection = self.selection.clone();
        let mut inverse_ops = Vec::new();
        if let Err(err) = self.normalize_with_inverse_ops(&mut inverse_ops) {
            tracing::warn!(error = %err, "normalization reverted");
            self.rollback(inverse_ops, selection);
        }
        self.normalize_selection_in_place();
    }

    fn normalize_selection_in_place(&mut self) {
        self.selection = self
            .registry
            .normalize_selection(&self.doc, &self.selection);
    }

    /// Runs the normalize passes until a full round emits no ops, appending inverses.
    ///
    /// Up to `max_normalize_iterations` rounds may change the document; the round
    /// that confirms convergence is not counted.
    fn normalize_with_inverse_ops(
        &mut self,
        inverse_ops: &mut Vec<Op>,
    ) -> Result<(), ApplyError> {
        for _ in 0..=self.config.max_normalize_iterations {
            let mut changed = false;
            // Each pass sees the document as left by the previous one.
            for pass in self.registry.normalize_passes() {
                let ops = pass.run(&self.doc, &self.registry);
                if !ops.is_empty() {
                    tracing::trace!(pass = pass.id(), ops = ops.len(), "normalize pass");
                    changed = true;
                }
                for op in ops {
                    let inv = apply_op_to(&mut self.doc, &mut self.selection, op)?;
                    inverse_ops.push(inv);
                }
            }
            if !changed {
                return Ok(());
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    /// Applies `ops` in order and returns their inverses, last first.
    ///
    /// When an op fails the ones already applied are reverted and the selection
    /// is restored, so the document is left as it was.
    fn replay(&mut self, ops: Vec<Op>) -> Result<Vec<Op>, ApplyError> {
        let selection = self.selection.clone();
        let mut inverse_ops = Vec::with_capacity(ops.len());
        for op in ops {
            match apply_op_to(&mut self.doc, &mut self.selection, op) {
                Ok(inv) => inverse_ops.push(inv),
                Err(err) => {
                    self.rollback(inverse_ops, selection);
                    return Err(err);
                }
            }
        }
        inverse_ops.reverse();
        Ok(inverse_ops)
    }

    /// Reverts `inverse_ops`, given in application order, and restores `selection`.
    fn rollback(&mut self, inverse_ops: Vec<Op>, selection: Selection) {
        for op in inverse_ops.into_iter().rev() {
            if let Err(err) = apply_op_to(&mut self.doc, &mut self.selection, op) {
                tracing::error!(error = %err, "rollback stopped early");
                break;
            }
        }
        self.selection = selection;
    }
}

pub(crate) fn apply_op_to(
    doc: &mut Document,
    selection: &mut Selection,
    op: Op,
) -> Result<Op, ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let (parent, index) = split_parent(&path)?;
            let child_start = child_offset(doc, parent, index)?;
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            text_node.text.insert_str(offset, &text);
            for position in positions_mut(selection) {
                shift_on_text_insert(position, parent, child_start + offset, text.len());
            }
            Ok(Op::RemoveText {
                range: offset..offset + text.len(),
                path,
            })
        }
        Op::RemoveText { path, range } => {
            let (parent, index) = split_parent(&path)?;
            let child_start = child_offset(doc, parent, index)?;
            let text_node = node_text_mut(doc, &path)?;
            let start =
                clamp_to_char_boundary(&text_node.text, range.start.min(text_node.text.len()));
            let end = clamp_to_char_boundary(&text_node.text, range.end.min(text_node.text.len()));
            if start >= end {
                return Ok(Op::InsertText {
                    path,
                    offset: start,
                    text: String::new(),
                });
            }
            let removed = text_node.text[start..end].to_string();
            text_node.text.replace_range(start..end, "");
            for position in positions_mut(selection) {
                shift_on_remove(position, parent, None, child_start + start, end - start);
            }
            Ok(Op::InsertText {
                path,
                offset: start,
                text: removed,
            })
        }
        Op::InsertNode { path, node } => {
            let (parent, index) = split_parent(&path)?;
            let width = node.width();
            let children = children_mut(doc, parent)?;
            if index > children.len() {
                return Err(PathError(format!(
                    "Insert index out of bounds: {index} > {}",
                    children.len()
                ))
                .into());
            }
            let child_start = offset_of_child(children, index);
            children.insert(index, node);
            for position in positions_mut(selection) {
                shift_on_node_insert(position, parent, index, child_start, width);
            }
            Ok(Op::RemoveNode { path })
        }
        Op::RemoveNode { path } => {
            let (parent, index) = split_parent(&path)?;
            let children = children_mut(doc, parent)?;
            if index >= children.len() {
                return Err(PathError(format!(
                    "Remove index out of bounds: {index} >= {}",
                    children.len()
                ))
                .into());
            }
            let child_start = offset_of_child(children, index);
            let removed = children.remove(index);
            for position in positions_mut(selection) {
                shift_on_remove(position, parent, Some(index), child_start, removed.width());
            }
            Ok(Op::InsertNode {
                path,
                node: removed,
            })
        }
        Op::SetNodeAttrs { path, attrs } => {
            let old = match node_mut(doc, &path)? {
                Node::Element(el) => std::mem::replace(&mut el.attrs, attrs),
                Node::Void(v) => std::mem::replace(&mut v.attrs, attrs),
                Node::Text(_) => {
                    return Err(PathError("Expected Element or Void node".into()).into());
                }
            };
            Ok(Op::SetNodeAttrs { path, attrs: old })
        }
        Op::SetTextAttrs { path, attrs } => {
            let text_node = node_text_mut(doc, &path)?;
            let old = std::mem::replace(&mut text_node.attrs, attrs);
            Ok(Op::SetTextAttrs { path, attrs: old })
        }
        Op::SplitText { path, offset } => {
            let (parent, index) = split_parent(&path)?;
            let children = children_mut(doc, parent)?;
            let Some(Node::Text(left)) = children.get_mut(index) else {
                return Err(PathError("Expected Text node".into()).into());
            };
            let offset = clamp_to_char_boundary(&left.text, offset);
            let right = TextNode {
                text: left.text.split_off(offset),
                attrs: left.attrs.clone(),
            };
            children.insert(index + 1, Node::Text(right));
            Ok(Op::MergeText { path })
        }
        Op::MergeText { path } => {
            let (parent, index) = split_parent(&path)?;
            let children = children_mut(doc, parent)?;
            let right = match children.get(index + 1) {
                Some(Node::Text(right)) => right.clone(),
                _ => return Err(ApplyError::InvalidMerge(index)),
            };
            let Some(Node::Text(left)) = children.get_mut(index) else {
                return Err(ApplyError::InvalidMerge(index));
            };
            if left.attrs != right.attrs {
                return Err(ApplyError::InvalidMerge(index));
            }
            let offset = left.text.len();
            left.text.push_str(&right.text);
            children.remove(index + 1);
            Ok(Op::SplitText { path, offset })
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("cannot merge text node {0} with its next sibling")]
    InvalidMerge(usize),
    #[error("normalization did not converge")]
    NormalizeDidNotConverge,
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PathError(pub String);

pub(crate) fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

fn positions_mut(selection: &mut Selection) -> impl Iterator<Item = &mut Position> {
    selection
        .ranges
        .iter_mut()
        .flat_map(|range| [&mut range.start, &mut range.end])
}

fn shift_on_text_insert(position: &mut Position, parent: &[usize], at: usize, len: usize) {
    if position.path == parent && position.offset >= at {
        position.offset += len;
    }
}

fn shift_on_node_insert(
    position: &mut Position,
    parent: &[usize],
    index: usize,
    at: usize,
    width: usize,
) {
    if position.path == parent {
        if position.offset >= at {
            position.offset += width;
        }
        return;
    }

    let depth = parent.len();
    if position.path.len() > depth
        && position.path.starts_with(parent)
        && position.path[depth] >= index
    {
        position.path[depth] += 1;
    }
}

fn shift_on_remove(
    position: &mut Position,
    parent: &[usize],
    index: Option<usize>,
    at: usize,
    width: usize,
) {
    if position.path == parent {
        if position.offset >= at + width {
            position.offset -= width;
        } else if position.offset > at {
            position.offset = at;
        }
        return;
    }

    let Some(index) = index else {
        return;
    };
    let depth = parent.len();
    if position.path.len() <= depth || !position.path.starts_with(parent) {
        return;
    }
    let ix = position.path[depth];
    if ix > index {
        position.path[depth] = ix - 1;
    } else if ix == index {
        // Position was inside the removed subtree. Map it to the removal point.
        position.path = parent.to_vec();
        position.offset = at;
    }
}

fn split_parent(path: &[usize]) -> Result<(&[usize], usize), PathError> {
    match path.split_last() {
        Some((index, parent)) => Ok((parent, *index)),
        None => Err(PathError("Empty path".into())),
    }
}

fn child_offset(doc: &Document, parent: &[usize], index: usize) -> Result<usize, PathError> {
    doc.children_at(parent)
        .map(|children| offset_of_child(children, index))
        .ok_or_else(|| PathError(format!("No container at {parent:?}")))
}

fn node_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Node, PathError> {
    let Some((first, rest)) = path.split_first() else {
        return Err(PathError("Empty path".into()));
    };

    let len = doc.children.len();
    let mut node = doc
        .children
        .get_mut(*first)
        .ok_or_else(|| PathError(format!("Path out of bounds at depth 0: {first} >= {len}")))?;

    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Element(el) => {
                let len = el.children.len();
                el.children.get_mut(ix).ok_or_else(|| {
                    PathError(format!(
                        "Path out of bounds at depth {}: {ix} >= {len}",
                        depth + 1
                    ))
                })?
            }
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

fn node_text_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut TextNode, PathError> {
    match node_mut(doc, path)? {
        Node::Text(t) => Ok(t),
        _ => Err(PathError("Expected Text node".into())),
    }
}

fn children_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Vec<Node>, PathError> {
    if path.is_empty() {
        return Ok(&mut doc.children);
    }
    match node_mut(doc, path)? {
        Node::Element(el) => Ok(&mut el.children),
        Node::Void(_) | Node::Text(_) => Err(PathError("Parent is not a container".into())),
    }
}
