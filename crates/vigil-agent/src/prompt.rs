const PROMPT_TEMPLATE: &str = "\
You are an expert test generator. Given Python source code, write focused pytest tests.
Aim for:
- deterministic unit tests
- property-based tests using hypothesis for pure functions
- edge cases and error handling

Return only test file content without explanations.
Source:
{code}
";

/// Fill the generation prompt with at most `max_chars` characters of `source`.
pub fn build_prompt(source: &str, max_chars: usize) -> String {
    let code = match source.char_indices().nth(max_chars) {
        Some((idx, _)) => &source[..idx],
        None => source,
    };
    PROMPT_TEMPLATE.replace("{code}", code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeds_source_after_instructions() {
        let prompt = build_prompt("def f():\n    return 1\n", 8000);
        assert!(prompt.starts_with("You are an expert test generator."));
        assert!(prompt.contains("Source:\ndef f():\n    return 1\n"));
    }

    #[test]
    fn truncates_to_char_budget() {
        let source = "é".repeat(10_000);
        let prompt = build_prompt(&source, 8000);
        assert_eq!(prompt.matches('é').count(), 8000);
    }

    #[test]
    fn braces_in_source_are_left_alone() {
        let prompt = build_prompt("x = {'code': 1}", 100);
        assert!(prompt.contains("x = {'code': 1}"));
    }
}
