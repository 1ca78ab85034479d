use crate::core::{
    ApplyError, Document, Node, PathError, Position, Range, Selection, Slot, apply_op_to, locate,
    offset_of_child,
};
use crate::ops::{Op, Path};
use crate::plugin::PluginRegistry;
use crate::schema::Schema;

/// Mutation handle for one change block opened by [`crate::Editor::enqueue_changes`].
///
/// Every mutation is applied right away and its inverse is recorded so the block
/// can be committed as one undo step or rolled back as a whole.
pub struct Batch<'a> {
    doc: &'a mut Document,
    selection: &'a mut Selection,
    registry: &'a PluginRegistry,
    inverse_ops: Vec<Op>,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(
        doc: &'a mut Document,
        selection: &'a mut Selection,
        registry: &'a PluginRegistry,
    ) -> Self {
        Self {
            doc,
            selection,
            registry,
            inverse_ops: Vec::new(),
        }
    }

    pub(crate) fn into_inverse_ops(self) -> Vec<Op> {
        self.inverse_ops
    }

    pub fn doc(&self) -> &Document {
        &*self.doc
    }

    pub fn selection(&self) -> &Selection {
        &*self.selection
    }

    pub fn schema(&self) -> &Schema {
        self.registry.schema()
    }

    pub fn apply_op(&mut self, op: Op) -> Result<(), ApplyError> {
        let inverse = apply_op_to(&mut *self.doc, &mut *self.selection, op)?;
        self.inverse_ops.push(inverse);
        Ok(())
    }

    pub fn set_selection(&mut self, selection: Selection) {
        *self.selection = selection;
    }

    /// Sets `name = value` on all text inside `range`.
    ///
    /// Text nodes already holding `value` are left alone, so applying the same
    /// value twice records no operations the second time.
    pub fn set_attribute(&mut self, range: &Range, name: &str, value: &str) -> Result<(), ApplyError> {
        self.retag_range(range, name, Some(value))
    }

    pub fn remove_attribute(&mut self, range: &Range, name: &str) -> Result<(), ApplyError> {
        self.retag_range(range, name, None)
    }

    /// Inserts `node` at `position`, splitting a text node when the position falls inside one.
    ///
    /// Returns the range spanning exactly the inserted node.
    pub fn insert(&mut self, position: &Position, node: Node) -> Result<Range, ApplyError> {
        let width = node.width();
        let slot = self
            .doc
            .children_at(&position.path)
            .map(|children| locate(children, position.offset))
            .ok_or_else(|| PathError(format!("No container at {:?}", position.path)))?;

        let index = match slot {
            Slot::Between { index } => index,
            Slot::Inside { index, offset } => {
                let mut path = position.path.clone();
                path.push(index);
                self.apply_op(Op::SplitText { path, offset })?;
                index + 1
            }
        };

        let mut path = position.path.clone();
        path.push(index);
        self.apply_op(Op::InsertNode { path, node })?;

        let start = self
            .doc
            .children_at(&position.path)
            .map(|children| offset_of_child(children, index))
            .unwrap_or(position.offset);
        Ok(Range::new(
            Position::new(position.path.clone(), start),
            Position::new(position.path.clone(), start + width),
        ))
    }

    fn retag_range(
        &mut self,
        range: &Range,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), ApplyError> {
        let targets: Vec<(Path, Vec<(usize, std::ops::Range<usize>)>)> = self
            .registry
            .schema()
            .text_blocks_in_order(&*self.doc)
            .into_iter()
            .filter_map(|block| {
                let span = self.doc.span_in(range, &block.path)?;
                let pieces = differing_text(&block.el.children, span, name, value);
                (!pieces.is_empty()).then_some((block.path, pieces))
            })
            .collect();

        for (block_path, pieces) in targets {
            // Back to front so splits never shift a piece still waiting to be handled.
            for (index, local) in pieces.into_iter().rev() {
                self.retag_text(&block_path, index, local, name, value)?;
            }
        }
        Ok(())
    }

    fn retag_text(
        &mut self,
        block_path: &[usize],
        index: usize,
        local: std::ops::Range<usize>,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), ApplyError> {
        let mut path = block_path.to_vec();
        path.push(index);

        let len = match self.doc.node(&path) {
            Some(Node::Text(text)) => text.text.len(),
            _ => return Err(PathError(format!("Expected Text node at {path:?}")).into()),
        };

        if local.end < len {
            self.apply_op(Op::SplitText {
                path: path.clone(),
                offset: local.end,
            })?;
        }
        if local.start > 0 {
            self.apply_op(Op::SplitText {
                path: path.clone(),
                offset: local.start,
            })?;
            if let Some(last) = path.last_mut() {
                *last += 1;
            }
        }

        let mut attrs = match self.doc.node(&path) {
            Some(Node::Text(text)) => text.attrs.clone(),
            _ => return Err(PathError(format!("Expected Text node at {path:?}")).into()),
        };
        match value {
            Some(value) => {
                attrs.insert(name.to_string(), value.to_string());
            }
            None => {
                attrs.remove(name);
            }
        }
        self.apply_op(Op::SetTextAttrs { path, attrs })
    }
}

/// Text children overlapping `span` whose `name` attribute differs from `value`,
/// each with the overlapped part in node-local offsets.
fn differing_text(
    children: &[Node],
    span: std::ops::Range<usize>,
    name: &str,
    value: Option<&str>,
) -> Vec<(usize, std::ops::Range<usize>)> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    for (index, node) in children.iter().enumerate() {
        let start = cursor;
        let end = cursor + node.width();
        cursor = end;

        let Node::Text(text) = node else {
            continue;
        };
        if end <= span.start || start >= span.end || text.attr(name) == value {
            continue;
        }
        let local_start = span.start.max(start) - start;
        let local_end = span.end.min(end) - start;
        out.push((index, local_start..local_end));
    }
    out
}
