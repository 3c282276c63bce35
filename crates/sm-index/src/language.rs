//! Extension-based language tagging.

use std::path::Path;

/// Language tag for a file path, by extension. Unknown extensions come
/// back as `"text"` so the chunker still has something to key on.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "rs" => "rust",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" | "pyi" => "python",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" | "zsh" => "shell",
        "sql" => "sql",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" | "markdown" => "markdown",
        "html" | "htm" => "html",
        "css" => "css",
        _ => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_extensions() {
        assert_eq!(language_for_path("src/lib.rs"), "rust");
        assert_eq!(language_for_path("src/Trace.ts"), "typescript");
        assert_eq!(language_for_path("app/views.py"), "python");
        assert_eq!(language_for_path("main.go"), "go");
    }

    #[test]
    fn test_unknown_extension_is_text() {
        assert_eq!(language_for_path("README"), "text");
        assert_eq!(language_for_path("data.xyz"), "text");
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(language_for_path("Main.RS"), "rust");
    }
}
