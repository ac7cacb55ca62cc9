use crate::types::{FailureRecord, PatchSuggestion};

/// Illustrative diff attached whenever a run has failures.
pub const CANNED_DIFF: &str = "\
diff --git a/example.py b/example.py
index 000000..111111 100644
--- a/example.py
+++ b/example.py
@@ -1,4 +1,4 @@
-def add(a,b):return a+b
+def add(a, b):
+    # fix: ensure ints
+    return int(a) + int(b)
";

pub const CANNED_RATIONALE: &str = "Auto-fix formatting/types (example)";

/// Exactly one suggestion when there is at least one failure, none otherwise.
pub fn suggest_patches(failures: &[FailureRecord]) -> Vec<PatchSuggestion> {
    if failures.is_empty() {
        return Vec::new();
    }
    vec![PatchSuggestion {
        diff: CANNED_DIFF.to_string(),
        rationale: CANNED_RATIONALE.to_string(),
        applied: false,
    }]
}
