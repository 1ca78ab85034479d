use crate::core::{Document, Node, Position, Range, Slot, locate, offset_of_child};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Backward,
    Forward,
}

/// Finds the widest run of sibling text nodes around `position` whose `name`
/// attribute equals `value`.
///
/// The walk starts from the text node containing `position`, or from the node
/// before (backward) and after (forward) when `position` sits on a boundary. It
/// stops at the first sibling that is not text or holds another value, and at
/// the edges of the containing element. A side on which nothing matched keeps
/// `position` as its bound.
pub fn expand_attribute_range(
    doc: &Document,
    position: &Position,
    name: &str,
    value: &str,
) -> Range {
    Range::new(
        find_bound(doc, position, name, value, Direction::Backward),
        find_bound(doc, position, name, value, Direction::Forward),
    )
}

fn find_bound(
    doc: &Document,
    position: &Position,
    name: &str,
    value: &str,
    direction: Direction,
) -> Position {
    let Some(children) = doc.children_at(&position.path) else {
        return position.clone();
    };

    let first = match locate(children, position.offset) {
        Slot::Inside { index, .. } => Some(index),
        Slot::Between { index } => match direction {
            Direction::Backward => index.checked_sub(1),
            Direction::Forward => (index < children.len()).then_some(index),
        },
    };

    let mut last_match = None;
    let mut next = first;
    while let Some(ix) = next {
        let Some(Node::Text(text)) = children.get(ix) else {
            break;
        };
        if text.attr(name) != Some(value) {
            break;
        }
        last_match = Some(ix);
        next = match direction {
            Direction::Backward => ix.checked_sub(1),
            Direction::Forward => Some(ix + 1),
        };
    }

    let Some(ix) = last_match else {
        return position.clone();
    };
    let start = offset_of_child(children, ix);
    let offset = match direction {
        Direction::Backward => start,
        Direction::Forward => start + children[ix].width(),
    };
    Position::new(position.path.clone(), offset)
}
