//! Feature extraction and the embedder itself.
//!
//! Token hashing uses FNV-1a (64-bit) implemented inline: the hash is part
//! of the embedding definition, so it must be stable across platforms and
//! Rust releases. Each feature family hashes with its own salt so families
//! land in independent bucket patterns.

use serde::{Deserialize, Serialize};

/// Per-family feature weights. The embedding contract does not fix these;
/// changing them changes vectors, so treat them as frozen once a project
/// has stored its first vector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureWeights {
    pub term_frequency: f32,
    pub char_trigrams: f32,
    pub word_bigrams: f32,
    pub categories: f32,
    pub structural: f32,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        FeatureWeights {
            term_frequency: 1.0,
            char_trigrams: 0.6,
            word_bigrams: 0.8,
            categories: 1.2,
            structural: 0.5,
        }
    }
}

/// Semantic category vocabulary: (category salt, member terms).
///
/// Counts of member terms feed one hashed bucket per category, which gives
/// conceptually related texts overlap even with disjoint surface tokens.
const CATEGORIES: &[(&str, &[&str])] = &[
    ("cat:error", &["error", "fail", "failure", "panic", "exception", "invalid", "bug", "crash"]),
    ("cat:io", &["file", "read", "write", "path", "directory", "stream", "buffer", "disk"]),
    ("cat:net", &["http", "socket", "request", "response", "url", "server", "client", "port"]),
    ("cat:data", &["json", "parse", "serialize", "schema", "format", "encode", "decode", "field"]),
    ("cat:store", &["database", "query", "table", "index", "cache", "insert", "delete", "row"]),
    ("cat:auth", &["auth", "token", "key", "sign", "verify", "password", "secret", "trust"]),
    ("cat:test", &["test", "assert", "mock", "fixture", "expect", "verify", "check", "spec"]),
    ("cat:conc", &["thread", "lock", "mutex", "async", "await", "spawn", "channel", "atomic"]),
    ("cat:search", &["search", "match", "find", "rank", "score", "filter", "relevance", "result"]),
    ("cat:config", &["config", "option", "setting", "default", "flag", "env", "policy", "profile"]),
];

/// Deterministic text embedder with a fixed output dimension.
#[derive(Debug, Clone)]
pub struct Embedder {
    dim: usize,
    weights: FeatureWeights,
}

impl Default for Embedder {
    fn default() -> Self {
        Embedder::new(crate::DEFAULT_DIM)
    }
}

impl Embedder {
    /// Create an embedder with the given output dimension.
    pub fn new(dim: usize) -> Self {
        Embedder {
            dim: dim.max(8),
            weights: FeatureWeights::default(),
        }
    }

    /// Output dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Embed `text` into an L2-normalized vector of `dim()` floats.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dim];
        let lowered = text.to_lowercase();
        let tokens = tokenize(&lowered);

        // Term-frequency bag.
        for tok in &tokens {
            self.bump(&mut acc, "tf", tok, self.weights.term_frequency);
        }

        // Character 3-grams over the raw (lowered) text, whitespace folded.
        let folded: Vec<char> = lowered
            .chars()
            .map(|c| if c.is_whitespace() { ' ' } else { c })
            .collect();
        for window in folded.windows(3) {
            let gram: String = window.iter().collect();
            self.bump(&mut acc, "3g", &gram, self.weights.char_trigrams);
        }

        // Word bigrams.
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.bump(&mut acc, "bg", &bigram, self.weights.word_bigrams);
        }

        // Semantic category counts.
        for (salt, members) in CATEGORIES {
            let count = tokens
                .iter()
                .filter(|t| members.contains(&t.as_str()))
                .count();
            if count > 0 {
                self.bump(&mut acc, salt, "", self.weights.categories * count as f32);
            }
        }

        // Structural features: shape signals that survive renaming.
        for (name, value) in structural_features(text, &tokens) {
            if value > 0.0 {
                self.bump(&mut acc, "st", name, self.weights.structural * value);
            }
        }

        // Empty input still yields a unit vector (a fixed basis direction),
        // so downstream magnitude invariants hold unconditionally.
        if acc.iter().all(|&x| x == 0.0) {
            acc[0] = 1.0;
            return acc;
        }

        l2_normalize(&mut acc);
        acc
    }

    fn bump(&self, acc: &mut [f32], family: &str, feature: &str, weight: f32) {
        let mut h = fnv1a64(family.as_bytes());
        h = fnv1a64_continue(h, &[0x1f]);
        h = fnv1a64_continue(h, feature.as_bytes());
        let bucket = (h % self.dim as u64) as usize;
        acc[bucket] += weight;
    }
}

/// Lowercased word tokens: runs of alphanumerics and underscores.
fn tokenize(lowered: &str) -> Vec<String> {
    lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Shape features scaled into small integral magnitudes.
fn structural_features(text: &str, tokens: &[String]) -> Vec<(&'static str, f32)> {
    let len = text.len().max(1) as f32;
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count() as f32;
    let brackets = text
        .chars()
        .filter(|c| matches!(c, '(' | ')' | '{' | '}' | '[' | ']'))
        .count() as f32;
    let lines = text.lines().count() as f32;
    let avg_token = if tokens.is_empty() {
        0.0
    } else {
        tokens.iter().map(|t| t.len()).sum::<usize>() as f32 / tokens.len() as f32
    };
    let code_keywords = tokens
        .iter()
        .filter(|t| {
            matches!(
                t.as_str(),
                "fn" | "def" | "class" | "struct" | "enum" | "impl" | "interface" | "function"
                    | "return" | "import" | "use" | "let" | "const" | "var" | "pub"
            )
        })
        .count() as f32;

    vec![
        ("len_log", (len.ln_1p() / 2.0).min(8.0)),
        ("digit_ratio", (digits / len * 10.0).min(10.0)),
        ("bracket_ratio", (brackets / len * 10.0).min(10.0)),
        ("line_count_log", lines.ln_1p()),
        ("avg_token_len", (avg_token / 2.0).min(10.0)),
        ("code_keywords", code_keywords.min(16.0)),
    ]
}

fn l2_normalize(v: &mut [f32]) {
    let mag = v
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt();
    if mag > 0.0 {
        for x in v.iter_mut() {
            *x = (f64::from(*x) / mag) as f32;
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a64_continue(FNV_OFFSET, bytes)
}

fn fnv1a64_continue(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
