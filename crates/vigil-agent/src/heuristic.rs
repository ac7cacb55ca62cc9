//! Source → test plan, with no text emission. Rendering lives in
//! [`crate::render`].

use std::cell::RefCell;
use std::collections::HashSet;

use thiserror::Error;
use tree_sitter::{Node, Parser};

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A language error surfaces as a failed parse below.
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// One test to emit for a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestSpec {
    /// Call with one `0` per positional parameter; any exception fails.
    Smoke { function: String, arity: usize },
    /// Call across arbitrary integers; only raising fails.
    Property { function: String },
}

impl TestSpec {
    pub fn function(&self) -> &str {
        match self {
            Self::Smoke { function, .. } | Self::Property { function } => function,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("source could not be parsed")]
pub struct ParseFailure;

/// Plan tests for every public top-level function, in source order.
///
/// Decorated functions count. Nested functions and methods do not. A name
/// defined twice is planned once.
pub fn plan_tests(source: &str) -> Result<Vec<TestSpec>, ParseFailure> {
    let tree = PYTHON_PARSER
        .with(|p| p.borrow_mut().parse(source, None))
        .ok_or(ParseFailure)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(ParseFailure);
    }

    let src = source.as_bytes();
    let mut seen = HashSet::new();
    let mut specs = Vec::new();
    let mut cursor = root.walk();
    for node in root.named_children(&mut cursor) {
        let Some(func) = function_node(node) else {
            continue;
        };
        let Some(name) = func
            .child_by_field_name("name")
            .and_then(|n| n.utf8_text(src).ok())
        else {
            continue;
        };
        if name.starts_with('_') || !seen.insert(name.to_string()) {
            continue;
        }

        let arity = positional_arity(func, src);
        specs.push(TestSpec::Smoke {
            function: name.to_string(),
            arity,
        });
        if arity == 1 {
            specs.push(TestSpec::Property {
                function: name.to_string(),
            });
        }
    }
    Ok(specs)
}

fn function_node(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "function_definition" => Some(node),
        "decorated_definition" => node
            .child_by_field_name("definition")
            .filter(|d| d.kind() == "function_definition"),
        _ => None,
    }
}

/// Positional parameters other than `self`, up to the first `*`, `*args`
/// or `**kwargs`.
fn positional_arity(func: Node<'_>, src: &[u8]) -> usize {
    let Some(params) = func.child_by_field_name("parameters") else {
        return 0;
    };
    let mut cursor = params.walk();
    let mut count = 0;
    for param in params.named_children(&mut cursor) {
        let name_node = match param.kind() {
            "identifier" => Some(param),
            "default_parameter" | "typed_default_parameter" => param.child_by_field_name("name"),
            "typed_parameter" => param.named_child(0),
            "positional_separator" | "comment" => continue,
            _ => break,
        };
        let Some(name_node) = name_node else {
            continue;
        };
        // `*args: int` is a typed_parameter wrapping a splat
        if name_node.kind() != "identifier" {
            break;
        }
        if name_node.utf8_text(src).ok() == Some("self") {
            continue;
        }
        count += 1;
    }
    count
}
