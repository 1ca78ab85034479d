use serde::{Deserialize, Serialize};

use crate::attribute_range::expand_attribute_range;
use crate::batch::Batch;
use crate::core::{ApplyError, Editor, Node, Position, Range, Selection};

pub const LINK_ATTRIBUTE: &str = "link";

/// Element kind that is always selected as a whole and never takes the attribute.
const ATOMIC_ELEMENT_KIND: &str = "image";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandState {
    pub value: Option<String>,
    pub is_enabled: bool,
}

type ChangeListener = Box<dyn FnMut(&CommandState) + Send>;

/// Applies a single-valued text attribute (a link target by default) to the selection.
///
/// The command observes two values, refreshed by [`AttributeCommand::refresh`]:
/// the attribute value at the selection and whether the command can run.
/// Calling [`AttributeCommand::execute`] while the command is disabled is a
/// caller error; the result is unspecified.
pub struct AttributeCommand {
    attribute: String,
    state: CommandState,
    listeners: Vec<ChangeListener>,
}

#[derive(Debug)]
enum Strategy {
    /// Caret inside a tagged run: rewrite the whole run.
    Retarget(Range),
    /// Caret outside any tagged run, where tagged text is allowed.
    InsertAtCaret(Position),
    /// Expanded selection narrowed to the sub-ranges that may carry the attribute.
    Ranges(Vec<Range>),
    Skip,
}

impl AttributeCommand {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            state: CommandState::default(),
            listeners: Vec::new(),
        }
    }

    pub fn link() -> Self {
        Self::new(LINK_ATTRIBUTE)
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn value(&self) -> Option<&str> {
        self.state.value.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled
    }

    pub fn state(&self) -> &CommandState {
        &self.state
    }

    /// Registers a listener called whenever `refresh` changes the observed state.
    pub fn on_change(&mut self, listener: impl FnMut(&CommandState) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn refresh(&mut self, editor: &Editor) {
        let next = CommandState {
            value: editor
                .doc()
                .selection_attribute(editor.selection(), &self.attribute)
                .map(str::to_owned),
            is_enabled: self.check_enabled(editor),
        };
        if next == self.state {
            return;
        }
        self.state = next;
        for listener in &mut self.listeners {
            listener(&self.state);
        }
    }

    fn check_enabled(&self, editor: &Editor) -> bool {
        let doc = editor.doc();
        let selection = editor.selection();
        if doc
            .selected_element(selection)
            .is_some_and(|node| node.kind() == Some(ATOMIC_ELEMENT_KIND))
        {
            return false;
        }
        editor
            .schema()
            .check_attribute_in_selection(doc, selection, &self.attribute)
    }

    /// Sets the attribute to `value` as one undoable change.
    ///
    /// - caret inside a tagged run: the whole run gets `value`;
    /// - caret elsewhere: `value` is inserted as tagged text, when the schema allows
    ///   tagged text there;
    /// - expanded selection: every legal sub-range gets `value`, the selection stays.
    ///
    /// In the caret cases the selection ends up on all text carrying `value` around
    /// the change, so repeating the call from the same caret selects the same span.
    pub fn execute(&mut self, editor: &mut Editor, value: &str) -> Result<(), ApplyError> {
        let name = self.attribute.clone();
        let source = format!("command:{name}.set");

        editor.enqueue_changes(&source, |batch| {
            let strategy = plan(batch, &name);
            tracing::debug!(attribute = %name, ?strategy, "setting attribute");
            match strategy {
                Strategy::Retarget(range) => {
                    batch.set_attribute(&range, &name, value)?;
                    select_run(batch, &range.start, &name, value);
                }
                Strategy::InsertAtCaret(position) => {
                    if value.is_empty() {
                        return Ok(());
                    }
                    let inserted =
                        batch.insert(&position, Node::text_with_attr(value, name.as_str(), value))?;
                    select_run(batch, &inserted.start, &name, value);
                }
                Strategy::Ranges(ranges) => {
                    for range in &ranges {
                        batch.set_attribute(range, &name, value)?;
                    }
                }
                Strategy::Skip => {}
            }
            Ok(())
        })?;

        self.refresh(editor);
        Ok(())
    }

    /// Removes the attribute as one undoable change.
    ///
    /// A caret inside a tagged run clears and selects the whole run; a caret
    /// elsewhere does nothing; an expanded selection clears every legal sub-range.
    pub fn clear(&mut self, editor: &mut Editor) -> Result<(), ApplyError> {
        let name = self.attribute.clone();
        let source = format!("command:{name}.unset");

        editor.enqueue_changes(&source, |batch| {
            let strategy = plan(batch, &name);
            tracing::debug!(attribute = %name, ?strategy, "clearing attribute");
            match strategy {
                Strategy::Retarget(range) => {
                    batch.remove_attribute(&range, &name)?;
                    batch.set_selection(Selection::from_range(range));
                }
                Strategy::Ranges(ranges) => {
                    for range in &ranges {
                        batch.remove_attribute(range, &name)?;
                    }
                }
                Strategy::InsertAtCaret(_) | Strategy::Skip => {}
            }
            Ok(())
        })?;

        self.refresh(editor);
        Ok(())
    }
}

/// Selects the whole run holding `value` at `position`, including neighbours that
/// already held it and will be merged with the changed text.
fn select_run(batch: &mut Batch<'_>, position: &Position, name: &str, value: &str) {
    let run = expand_attribute_range(batch.doc(), position, name, value);
    batch.set_selection(Selection::from_range(run));
}

fn plan(batch: &Batch<'_>, name: &str) -> Strategy {
    let doc = batch.doc();
    let selection = batch.selection();

    if !selection.is_collapsed() {
        return Strategy::Ranges(batch.schema().valid_ranges(doc, &selection.ranges, name));
    }

    let Some(position) = selection.first_position() else {
        return Strategy::Skip;
    };
    if let Some(current) = doc.selection_attribute(selection, name) {
        return Strategy::Retarget(expand_attribute_range(doc, position, name, current));
    }
    if batch.schema().check_text_attribute_at(doc, position, name) {
        return Strategy::InsertAtCaret(position.clone());
    }
    Strategy::Skip
}
