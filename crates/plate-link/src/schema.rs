use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{Document, ElementNode, Node, Position, Range, Selection};
use crate::ops::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildConstraint {
    None,
    InlineOnly,
}

/// Which text attributes may appear on text inside an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextAttrPolicy {
    Any,
    Only(Vec<String>),
    Except(Vec<String>),
    Nothing,
}

impl TextAttrPolicy {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            TextAttrPolicy::Any => true,
            TextAttrPolicy::Only(names) => names.iter().any(|n| n == name),
            TextAttrPolicy::Except(names) => !names.iter().any(|n| n == name),
            TextAttrPolicy::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: String,
    pub children: ChildConstraint,
    pub text_attrs: TextAttrPolicy,
}

pub struct TextBlock<'a> {
    pub path: Path,
    pub el: &'a ElementNode,
}

/// Node specs contributed by plugins, plus the legality queries built on them.
///
/// Elements of unknown kind are treated permissively: they count as text blocks
/// when they hold inline content and accept every text attribute.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    specs: HashMap<String, NodeSpec>,
}

impl Schema {
    pub(crate) fn register(&mut self, spec: NodeSpec) -> Result<(), String> {
        if self.specs.contains_key(&spec.kind) {
            return Err(format!("Duplicate node spec kind: {}", spec.kind));
        }
        self.specs.insert(spec.kind.clone(), spec);
        Ok(())
    }

    pub fn is_text_block(&self, el: &ElementNode) -> bool {
        match self.specs.get(&el.kind).map(|s| &s.children) {
            Some(ChildConstraint::InlineOnly) => true,
            Some(ChildConstraint::None) => false,
            None => el
                .children
                .iter()
                .any(|n| matches!(n, Node::Text(_) | Node::Void(_))),
        }
    }

    pub fn allows_text_attr(&self, el: &ElementNode, name: &str) -> bool {
        self.specs
            .get(&el.kind)
            .is_none_or(|spec| spec.text_attrs.allows(name))
    }

    pub fn text_blocks_in_order<'a>(&self, doc: &'a Document) -> Vec<TextBlock<'a>> {
        fn walk<'a>(
            nodes: &'a [Node],
            path: &mut Vec<usize>,
            schema: &Schema,
            out: &mut Vec<TextBlock<'a>>,
        ) {
            for (ix, node) in nodes.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };

                path.push(ix);

                if schema.is_text_block(el) {
                    out.push(TextBlock {
                        path: path.clone(),
                        el,
                    });
                } else {
                    walk(&el.children, path, schema, out);
                }

                path.pop();
            }
        }

        let mut out = Vec::new();
        walk(&doc.children, &mut Vec::new(), self, &mut out);
        out
    }

    /// Whether text carrying `name` may live at `position`.
    pub fn check_text_attribute_at(&self, doc: &Document, position: &Position, name: &str) -> bool {
        match doc.node(&position.path) {
            Some(Node::Element(el)) => self.is_text_block(el) && self.allows_text_attr(el, name),
            _ => false,
        }
    }

    pub fn check_attribute_in_selection(
        &self,
        doc: &Document,
        selection: &Selection,
        name: &str,
    ) -> bool {
        if selection.is_collapsed() {
            return selection
                .first_position()
                .is_some_and(|position| self.check_text_attribute_at(doc, position, name));
        }
        !self.valid_ranges(doc, &selection.ranges, name).is_empty()
    }

    /// Narrows `ranges` to the maximal sub-ranges whose text may carry `name`.
    ///
    /// Text blocks that forbid the attribute are skipped and non-text inline
    /// children split a block's span into separate runs. Every returned range
    /// lies inside a single text block and is never collapsed.
    pub fn valid_ranges(&self, doc: &Document, ranges: &[Range], name: &str) -> Vec<Range> {
        let blocks = self.text_blocks_in_order(doc);
        let mut out = Vec::new();
        for range in ranges {
            for block in &blocks {
                if !self.allows_text_attr(block.el, name) {
                    continue;
                }
                let Some(span) = doc.span_in(range, &block.path) else {
                    continue;
                };
                for run in text_runs(&block.el.children, span) {
                    out.push(Range::new(
                        Position::new(block.path.clone(), run.start),
                        Position::new(block.path.clone(), run.end),
                    ));
                }
            }
        }
        out
    }
}

fn text_runs(children: &[Node], span: std::ops::Range<usize>) -> Vec<std::ops::Range<usize>> {
    let mut runs = Vec::new();
    let mut current: Option<std::ops::Range<usize>> = None;
    let mut cursor = 0usize;

    for node in children {
        let start = cursor;
        let end = cursor + node.width();
        cursor = end;

        if !matches!(node, Node::Text(_)) {
            runs.extend(current.take());
            continue;
        }

        let from = start.max(span.start);
        let to = end.min(span.end);
        if from >= to {
            continue;
        }
        match current.as_mut() {
            Some(run) if run.end == from => run.end = to,
            _ => {
                runs.extend(current.take());
                current = Some(from..to);
            }
        }
    }

    runs.extend(current);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_runs_break_at_non_text_children() {
        let children = vec![
            Node::text("ab"),
            Node::text("cd"),
            Node::mention("x"),
            Node::text("ef"),
        ];

        assert_eq!(text_runs(&children, 1..7), vec![1..4, 5..7]);
        assert_eq!(text_runs(&children, 4..5), Vec::<std::ops::Range<usize>>::new());
    }

    #[test]
    fn policies() {
        let only = TextAttrPolicy::Only(vec!["bold".to_string()]);
        assert!(only.allows("bold"));
        assert!(!only.allows("link"));
        assert!(!TextAttrPolicy::Except(vec!["link".to_string()]).allows("link"));
        assert!(TextAttrPolicy::Any.allows("link"));
        assert!(!TextAttrPolicy::Nothing.allows("bold"));
    }
}
