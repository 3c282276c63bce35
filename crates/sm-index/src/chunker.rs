//! Line- and symbol-based chunking.
//!
//! A chunk is a contiguous line span of one file. Line chunking cuts
//! fixed-size windows; symbol chunking finds declaration boundaries with
//! regex tables per language family and cuts there, splitting oversized
//! symbols back into line windows. Identical input always produces the
//! identical chunk list.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Chunking strategy requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkMode {
    Lines,
    HeuristicSymbols,
    /// AST-precise chunking. No syntax-tree parser is compiled into this
    /// build, so it resolves to the heuristic chunker; callers record the
    /// strategy that actually ran.
    TreesitterAst,
}

/// Per-chunk metadata emitted alongside the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Repo-relative path, forward slashes.
    pub file: String,
    pub language: String,
    /// 1-based inclusive line span.
    pub line_start: u32,
    pub line_end: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_type: Option<String>,
}

/// One chunk: text plus location metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub meta: ChunkMeta,
}

/// Chunk a file's text. `max_lines` is clamped to at least 1; the caller
/// validates user input before it gets here.
pub fn chunk_file(rel_path: &str, language: &str, text: &str, mode: ChunkMode, max_lines: usize) -> Vec<Chunk> {
    let max_lines = max_lines.max(1);
    match mode {
        ChunkMode::Lines => chunk_by_lines(rel_path, language, text, max_lines),
        ChunkMode::HeuristicSymbols | ChunkMode::TreesitterAst => {
            chunk_by_symbols(rel_path, language, text, max_lines)
        }
    }
}

fn chunk_by_lines(rel_path: &str, language: &str, text: &str, max_lines: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + max_lines).min(lines.len());
        push_chunk(&mut chunks, rel_path, language, &lines, start, end, None, None);
        start = end;
    }
    chunks
}

fn chunk_by_symbols(rel_path: &str, language: &str, text: &str, max_lines: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    let patterns = patterns_for(language);
    if patterns.is_empty() {
        return chunk_by_lines(rel_path, language, text, max_lines);
    }

    // Symbol start lines, in order.
    let mut starts: Vec<(usize, String, &'static str)> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some((symbol, symbol_type)) = match_symbol(patterns, line) {
            starts.push((idx, symbol, symbol_type));
        }
    }
    if starts.is_empty() {
        return chunk_by_lines(rel_path, language, text, max_lines);
    }

    let mut chunks = Vec::new();

    // Preamble (imports, file docs) before the first symbol.
    if starts[0].0 > 0 {
        emit_span(&mut chunks, rel_path, language, &lines, 0, starts[0].0, None, None, max_lines);
    }

    for (i, (start_idx, symbol, symbol_type)) in starts.iter().enumerate() {
        let end_idx = starts
            .get(i + 1)
            .map(|(next, _, _)| *next)
            .unwrap_or(lines.len());
        emit_span(
            &mut chunks,
            rel_path,
            language,
            &lines,
            *start_idx,
            end_idx,
            Some(symbol.clone()),
            Some(symbol_type),
            max_lines,
        );
    }
    chunks
}

/// Emit a line span, splitting into windows when it exceeds `max_lines`.
/// Split parts keep the owning symbol's metadata.
#[allow(clippy::too_many_arguments)]
fn emit_span(
    chunks: &mut Vec<Chunk>,
    rel_path: &str,
    language: &str,
    lines: &[&str],
    start: usize,
    end: usize,
    symbol: Option<String>,
    symbol_type: Option<&'static str>,
    max_lines: usize,
) {
    let mut cursor = start;
    while cursor < end {
        let piece_end = (cursor + max_lines).min(end);
        push_chunk(
            chunks,
            rel_path,
            language,
            lines,
            cursor,
            piece_end,
            symbol.clone(),
            symbol_type,
        );
        cursor = piece_end;
    }
}

#[allow(clippy::too_many_arguments)]
fn push_chunk(
    chunks: &mut Vec<Chunk>,
    rel_path: &str,
    language: &str,
    lines: &[&str],
    start: usize,
    end: usize,
    symbol: Option<String>,
    symbol_type: Option<&'static str>,
) {
    let text = lines[start..end].join("\n");
    if text.trim().is_empty() {
        return;
    }
    chunks.push(Chunk {
        text,
        meta: ChunkMeta {
            file: rel_path.to_string(),
            language: language.to_string(),
            line_start: (start + 1) as u32,
            line_end: end as u32,
            symbol,
            symbol_type: symbol_type.map(|s| s.to_string()),
        },
    });
}

struct SymbolPattern {
    regex: Regex,
    symbol_type: &'static str,
}

fn match_symbol(patterns: &[SymbolPattern], line: &str) -> Option<(String, &'static str)> {
    for pattern in patterns {
        if let Some(caps) = pattern.regex.captures(line) {
            let name = caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "anonymous".to_string());
            return Some((name, pattern.symbol_type));
        }
    }
    None
}

macro_rules! patterns {
    ($(($re:expr, $ty:expr)),* $(,)?) => {
        vec![$(SymbolPattern {
            regex: Regex::new($re).expect("static pattern compiles"),
            symbol_type: $ty,
        }),*]
    };
}

static RUST_PATTERNS: Lazy<Vec<SymbolPattern>> = Lazy::new(|| {
    patterns![
        (r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_]\w*)", "function"),
        (r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z_]\w*)", "struct"),
        (r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z_]\w*)", "enum"),
        (r"^\s*(?:pub(?:\([^)]*\))?\s+)?trait\s+([A-Za-z_]\w*)", "interface"),
        (r"^\s*impl(?:\s*<[^>]*>)?\s+(?:[\w:]+\s+for\s+)?([A-Za-z_][\w:]*)", "impl"),
    ]
});

static TS_PATTERNS: Lazy<Vec<SymbolPattern>> = Lazy::new(|| {
    patterns![
        (r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)", "function"),
        (r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)", "class"),
        (r"^\s*(?:export\s+)?interface\s+([A-Za-z_$][\w$]*)", "interface"),
        (r"^\s*(?:export\s+)?(?:const\s+)?enum\s+([A-Za-z_$][\w$]*)", "enum"),
        (r"^\s*(?:export\s+)?const\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?\(", "function"),
    ]
});

static PYTHON_PATTERNS: Lazy<Vec<SymbolPattern>> = Lazy::new(|| {
    patterns![
        (r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)", "function"),
        (r"^\s*class\s+([A-Za-z_]\w*)", "class"),
    ]
});

static GO_PATTERNS: Lazy<Vec<SymbolPattern>> = Lazy::new(|| {
    patterns![
        (r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)", "function"),
        (r"^type\s+([A-Za-z_]\w*)\s+struct\b", "struct"),
        (r"^type\s+([A-Za-z_]\w*)\s+interface\b", "interface"),
    ]
});

static CLIKE_PATTERNS: Lazy<Vec<SymbolPattern>> = Lazy::new(|| {
    patterns![
        (r"^\s*(?:public\s+|private\s+|protected\s+|static\s+|final\s+|abstract\s+)*class\s+([A-Za-z_]\w*)", "class"),
        (r"^\s*(?:typedef\s+)?struct\s+([A-Za-z_]\w*)", "struct"),
        (r"^\s*enum\s+(?:class\s+)?([A-Za-z_]\w*)", "enum"),
        (r"^\s*(?:public\s+|private\s+|protected\s+|static\s+|final\s+|virtual\s+|inline\s+)*[\w<>\[\],\s*&:]+\s+([A-Za-z_]\w*)\s*\([^;]*$", "function"),
    ]
});

fn patterns_for(language: &str) -> &'static [SymbolPattern] {
    static EMPTY: Vec<SymbolPattern> = Vec::new();
    match language {
        "rust" => &RUST_PATTERNS,
        "typescript" | "javascript" => &TS_PATTERNS,
        "python" => &PYTHON_PATTERNS,
        "go" => &GO_PATTERNS,
        "java" | "kotlin" | "c" | "cpp" | "csharp" | "scala" | "swift" => &CLIKE_PATTERNS,
        _ => &EMPTY,
    }
}
