use std::sync::{Arc, Mutex};

use gpui_plate_link::{
    AttributeCommand, CommandState, Document, Editor, Node, PluginRegistry, Position, Range,
    Selection, TextNode,
};

type Run = (String, Option<String>);

fn runs(editor: &Editor, block: usize) -> Vec<Run> {
    let Node::Element(el) = &editor.doc().children[block] else {
        panic!("expected element at {block}");
    };
    el.children
        .iter()
        .map(|node| match node {
            Node::Text(t) => (t.text.clone(), t.attr("link").map(str::to_owned)),
            Node::Void(v) => (format!("<{}>", v.kind), None),
            Node::Element(el) => (format!("<{}>", el.kind), None),
        })
        .collect()
}

fn run(text: &str, href: Option<&str>) -> Run {
    (text.to_string(), href.map(str::to_owned))
}

fn linked(text: &str, href: &str) -> Node {
    Node::text_with_attr(text, "link", href)
}

fn at(block: usize, offset: usize) -> Position {
    Position::new(vec![block], offset)
}

fn span(block: usize, start: usize, end: usize) -> Range {
    Range::new(at(block, start), at(block, end))
}

fn editor_with(children: Vec<Node>, selection: Selection, registry: PluginRegistry) -> Editor {
    Editor::new(Document { children }, selection, registry)
}

#[test]
fn caret_inside_link_retargets_the_whole_run() {
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![Node::text("ab"), linked("cdefg", "url1"), Node::text("hi")],
        )],
        Selection::collapsed(at(0, 4)),
        PluginRegistry::core(),
    );

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert_eq!(command.value(), Some("url1"));
    assert!(command.is_enabled());

    command.execute(&mut editor, "url2").unwrap();

    assert_eq!(
        runs(&editor, 0),
        vec![
            run("ab", None),
            run("cdefg", Some("url2")),
            run("hi", None)
        ]
    );
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 2, 7)));
    assert_eq!(command.value(), Some("url2"));
    assert_eq!(editor.undo_depth(), 1);
    assert_eq!(editor.last_undo_source(), Some("command:link.set"));
}

#[test]
fn retarget_keeps_other_attributes_of_each_node() {
    let bold = Node::Text(TextNode::new("cd").with_attr("link", "u1").with_attr("bold", "true"));
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![bold, linked("efg", "u1"), Node::text("h")],
        )],
        Selection::collapsed(at(0, 3)),
        PluginRegistry::core(),
    );

    AttributeCommand::link().execute(&mut editor, "u2").unwrap();

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph");
    };
    let attrs: Vec<_> = paragraph
        .children
        .iter()
        .map(|n| match n {
            Node::Text(t) => (t.text.as_str(), t.attr("link"), t.attr("bold")),
            _ => ("", None, None),
        })
        .collect();
    assert_eq!(
        attrs,
        vec![
            ("cd", Some("u2"), Some("true")),
            ("efg", Some("u2"), None),
            ("h", None, None),
        ]
    );
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 0, 5)));
}

#[test]
fn caret_at_the_end_of_a_link_still_targets_it() {
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![linked("ab", "u"), Node::text("cd")],
        )],
        Selection::collapsed(at(0, 2)),
        PluginRegistry::core(),
    );

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert_eq!(command.value(), Some("u"));

    command.execute(&mut editor, "v").unwrap();
    assert_eq!(runs(&editor, 0), vec![run("ab", Some("v")), run("cd", None)]);
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 0, 2)));
}

#[test]
fn caret_outside_links_inserts_the_value_as_linked_text() {
    let mut editor = editor_with(
        vec![Node::paragraph("abcdefgh")],
        Selection::collapsed(at(0, 4)),
        PluginRegistry::core(),
    );

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert_eq!(command.value(), None);
    assert!(command.is_enabled());

    command.execute(&mut editor, "href1").unwrap();

    assert_eq!(
        runs(&editor, 0),
        vec![
            run("abcd", None),
            run("href1", Some("href1")),
            run("efgh", None)
        ]
    );
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 4, 9)));
    assert_eq!(editor.undo_depth(), 1);
}

#[test]
fn inserting_into_an_empty_paragraph_replaces_the_placeholder_leaf() {
    let mut editor = Editor::with_core_plugins();

    AttributeCommand::link()
        .execute(&mut editor, "https://example.com")
        .unwrap();

    assert_eq!(
        runs(&editor, 0),
        vec![run("https://example.com", Some("https://example.com"))]
    );
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 0, 19)));
}

#[test]
fn inserting_an_empty_value_does_nothing() {
    let mut editor = editor_with(
        vec![Node::paragraph("abc")],
        Selection::collapsed(at(0, 1)),
        PluginRegistry::core(),
    );
    let doc_before = editor.doc().clone();

    AttributeCommand::link().execute(&mut editor, "").unwrap();

    assert_eq!(editor.doc(), &doc_before);
    assert!(!editor.can_undo());
}

#[test]
fn applying_the_same_value_twice_changes_nothing_the_second_time() {
    let mut editor = editor_with(
        vec![Node::paragraph("abcdefgh")],
        Selection::from_range(span(0, 1, 5)),
        PluginRegistry::core(),
    );
    let mut command = AttributeCommand::link();

    command.execute(&mut editor, "u").unwrap();
    let doc_once = editor.doc().clone();
    assert_eq!(
        runs(&editor, 0),
        vec![run("a", None), run("bcde", Some("u")), run("fgh", None)]
    );

    command.execute(&mut editor, "u").unwrap();
    assert_eq!(editor.doc(), &doc_once);
    assert_eq!(editor.undo_depth(), 1);
}

#[test]
fn expanded_selection_only_touches_ranges_that_allow_links() {
    let mut editor = editor_with(
        vec![
            Node::element(
                "paragraph",
                vec![Node::text("ab"), Node::mention("bob"), Node::text("cd")],
            ),
            Node::element("code_block", vec![Node::text("code")]),
            Node::paragraph("ef"),
        ],
        Selection::from_range(Range::new(at(0, 1), at(2, 1))),
        PluginRegistry::richtext(),
    );
    let selection_before = editor.selection().clone();

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert!(command.is_enabled());

    command.execute(&mut editor, "u").unwrap();

    assert_eq!(
        runs(&editor, 0),
        vec![
            run("a", None),
            run("b", Some("u")),
            run("<mention>", None),
            run("cd", Some("u")),
        ]
    );
    assert_eq!(runs(&editor, 1), vec![run("code", None)]);
    assert_eq!(runs(&editor, 2), vec![run("e", Some("u")), run("f", None)]);
    assert_eq!(editor.selection(), &selection_before);
    assert_eq!(editor.undo_depth(), 1);
}

#[test]
fn every_range_of_a_multi_range_selection_is_linked() {
    let mut editor = editor_with(
        vec![Node::paragraph("abcdef"), Node::paragraph("ghij")],
        Selection::from_ranges([span(0, 0, 2), span(1, 1, 3)]),
        PluginRegistry::core(),
    );

    AttributeCommand::link().execute(&mut editor, "u").unwrap();

    assert_eq!(
        runs(&editor, 0),
        vec![run("ab", Some("u")), run("cdef", None)]
    );
    assert_eq!(
        runs(&editor, 1),
        vec![run("g", None), run("hi", Some("u")), run("j", None)]
    );
    assert_eq!(editor.undo_depth(), 1);
}

#[test]
fn selection_inside_code_block_disables_the_command() {
    let mut editor = editor_with(
        vec![Node::element("code_block", vec![Node::text("let x = 1;")])],
        Selection::from_range(span(0, 0, 3)),
        PluginRegistry::richtext(),
    );

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert!(!command.is_enabled());

    editor.set_selection(Selection::collapsed(at(0, 2)));
    command.refresh(&editor);
    assert!(!command.is_enabled());
}

#[test]
fn selected_image_disables_the_command_even_when_the_schema_allows_links() {
    // Without an image spec the element is an ordinary text container.
    let mut editor = editor_with(
        vec![
            Node::paragraph("ab"),
            Node::element("image", vec![Node::text("caption")]),
            Node::element("figure", vec![Node::text("caption")]),
        ],
        Selection::from_range(Range::new(
            Position::new(vec![], 1),
            Position::new(vec![], 2),
        )),
        PluginRegistry::core(),
    );
    assert!(editor.schema().check_attribute_in_selection(
        editor.doc(),
        editor.selection(),
        "link"
    ));

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert!(!command.is_enabled());

    editor.set_selection(Selection::from_range(Range::new(
        Position::new(vec![], 2),
        Position::new(vec![], 3),
    )));
    command.refresh(&editor);
    assert!(command.is_enabled());
}

#[test]
fn selected_void_image_disables_the_command() {
    let mut editor = editor_with(
        vec![
            Node::paragraph("ab"),
            Node::image("cat.png", None),
            Node::paragraph("cd"),
        ],
        Selection::from_range(Range::new(
            Position::new(vec![], 1),
            Position::new(vec![], 2),
        )),
        PluginRegistry::richtext(),
    );

    let mut command = AttributeCommand::link();
    command.refresh(&editor);
    assert!(!command.is_enabled());

    editor.set_selection(Selection::collapsed(at(2, 1)));
    command.refresh(&editor);
    assert!(command.is_enabled());
}

#[test]
fn listeners_fire_only_when_the_state_changes() {
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![linked("ab", "u"), Node::text(" cd")],
        )],
        Selection::collapsed(at(0, 1)),
        PluginRegistry::core(),
    );

    let seen: Arc<Mutex<Vec<CommandState>>> = Arc::default();
    let mut command = AttributeCommand::link();
    command.on_change({
        let seen = seen.clone();
        move |state| seen.lock().unwrap().push(state.clone())
    });

    command.refresh(&editor);
    command.refresh(&editor);
    editor.set_selection(Selection::collapsed(at(0, 4)));
    command.refresh(&editor);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            CommandState {
                value: Some("u".to_string()),
                is_enabled: true,
            },
            CommandState {
                value: None,
                is_enabled: true,
            },
        ]
    );
}

#[test]
fn clear_removes_the_link_under_the_caret() {
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![Node::text("ab"), linked("cde", "u"), Node::text("f")],
        )],
        Selection::collapsed(at(0, 3)),
        PluginRegistry::core(),
    );

    let mut command = AttributeCommand::link();
    command.clear(&mut editor).unwrap();

    assert_eq!(runs(&editor, 0), vec![run("abcdef", None)]);
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 2, 5)));
    assert_eq!(command.value(), None);
    assert_eq!(editor.last_undo_source(), Some("command:link.unset"));
}

#[test]
fn clear_on_an_expanded_selection_unlinks_only_the_selected_part() {
    let mut editor = editor_with(
        vec![Node::element("paragraph", vec![linked("abcdef", "u")])],
        Selection::from_range(span(0, 2, 4)),
        PluginRegistry::core(),
    );

    AttributeCommand::link().clear(&mut editor).unwrap();

    assert_eq!(
        runs(&editor, 0),
        vec![run("ab", Some("u")), run("cd", None), run("ef", Some("u"))]
    );
}

#[test]
fn clear_with_a_caret_outside_links_does_nothing() {
    let mut editor = editor_with(
        vec![Node::paragraph("abc")],
        Selection::collapsed(at(0, 1)),
        PluginRegistry::core(),
    );

    AttributeCommand::link().clear(&mut editor).unwrap();

    assert_eq!(runs(&editor, 0), vec![run("abc", None)]);
    assert!(!editor.can_undo());
}

#[test]
fn retarget_selects_neighbours_that_already_held_the_value() {
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![linked("ab", "x"), linked("cd", "y")],
        )],
        Selection::collapsed(at(0, 1)),
        PluginRegistry::core(),
    );
    let mut command = AttributeCommand::link();

    command.execute(&mut editor, "y").unwrap();
    assert_eq!(runs(&editor, 0), vec![run("abcd", Some("y"))]);
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 0, 4)));

    editor.set_selection(Selection::collapsed(at(0, 1)));
    command.execute(&mut editor, "y").unwrap();
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 0, 4)));
    assert_eq!(editor.undo_depth(), 1);
}

#[test]
fn inserted_text_is_selected_together_with_the_run_it_joins() {
    let mut editor = editor_with(
        vec![Node::element(
            "paragraph",
            vec![Node::text("ab"), linked("cd", "y")],
        )],
        Selection::collapsed(at(0, 2)),
        PluginRegistry::core(),
    );

    AttributeCommand::link().execute(&mut editor, "y").unwrap();

    assert_eq!(runs(&editor, 0), vec![run("ab", None), run("ycd", Some("y"))]);
    assert_eq!(editor.selection(), &Selection::from_range(span(0, 2, 5)));
}

#[test]
fn caret_where_links_are_forbidden_inserts_nothing() {
    let mut editor = editor_with(
        vec![
            Node::paragraph("intro"),
            Node::element("code_block", vec![Node::text("let x = 1;")]),
        ],
        Selection::collapsed(at(1, 2)),
        PluginRegistry::richtext(),
    );
    let doc_before = editor.doc().clone();
    let selection_before = editor.selection().clone();

    AttributeCommand::link()
        .execute(&mut editor, "https://example.com")
        .unwrap();

    assert_eq!(editor.doc(), &doc_before);
    assert_eq!(editor.selection(), &selection_before);
    assert!(!editor.can_undo());
}
