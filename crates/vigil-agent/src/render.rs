//! Deterministic `TestSpec` → pytest source.

use crate::heuristic::TestSpec;

pub const GENERATED_DIR: &str = "tests/generated";

/// `pkg/sub/mod.py` → `tests/generated/test_pkg_sub_mod.py`.
pub fn destination_path(source_path: &str) -> String {
    format!("{GENERATED_DIR}/test_{}", source_path.replace('/', "_"))
}

/// Dotted import path for a workspace-relative source file.
pub fn module_path(source_path: &str) -> String {
    let stem = source_path.strip_suffix(".py").unwrap_or(source_path);
    let stem = stem.strip_suffix("/__init__").unwrap_or(stem);
    stem.replace('/', ".")
}

/// A Python string literal for `s`.
fn py_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

pub fn render_tests(module: &str, specs: &[TestSpec]) -> String {
    let mut out = String::new();
    out.push_str("import pytest\n");
    out.push_str("from hypothesis import given, strategies as st\n");
    out.push_str(&format!("import {module} as module\n"));

    for spec in specs {
        out.push_str("\n\n");
        match spec {
            TestSpec::Smoke { function, arity } => {
                let args = vec!["0"; *arity].join(", ");
                out.push_str(&format!("def test_{function}_smoke():\n"));
                out.push_str("    try:\n");
                out.push_str(&format!("        _ = module.{function}({args})\n"));
                out.push_str("    except Exception as e:\n");
                out.push_str("        pytest.fail(f'unexpected error: {e}')\n");
            }
            TestSpec::Property { function } => {
                out.push_str("@given(st.integers())\n");
                out.push_str(&format!("def test_{function}_property(x):\n"));
                out.push_str(&format!("    module.{function}(x)\n"));
            }
        }
    }
    out
}

/// Stand-in for a source that could not be parsed: valid, collectable,
/// skipped, and without importing the broken module.
pub fn render_skeleton(source_path: &str) -> String {
    format!(
        "import pytest\n\n\n@pytest.mark.skip(reason={})\ndef test_placeholder():\n    pass\n",
        py_str(&format!("could not parse {source_path}"))
    )
}
