//! Block IR: the unit of data flowing through the optimization pipeline.
//!
//! A block is one independently keepable, droppable, or compressible piece of
//! a prompt — a chat message, a tool schema, a retrieved document, or an
//! extracted constraint. The pipeline never mutates content without
//! recomputing `token_count` and `fingerprint`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role a block plays in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    System,
    Developer,
    User,
    Assistant,
    Tool,
    Doc,
    Constraint,
}

impl BlockKind {
    /// Stable lowercase name, used for kind filters and per-kind budgets.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Doc => "doc",
            Self::Constraint => "constraint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "developer" => Some(Self::Developer),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            "doc" => Some(Self::Doc),
            "constraint" => Some(Self::Constraint),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One block of prompt content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub kind: BlockKind,
    pub content: String,
    pub token_count: usize,
    /// When true the content must appear byte-for-byte in the final output.
    pub must_keep: bool,
    /// Tie-breaker for selection, in [0, 1].
    pub priority: f64,
    /// Logical position; strictly monotonic over the canonicalized input.
    /// Blocks pulled from the vector store sit below the conversation.
    pub timestamp: i64,
    pub compressed: bool,
    /// Pre-compression text, present iff `compressed` is true.
    pub original_content: Option<String>,
    /// Pre-compression token count, present iff `compressed` is true.
    pub original_token_count: Option<usize>,
    /// Digest of normalized content; a function of `content` only.
    pub fingerprint: String,
    /// Provenance tag, e.g. `system`, `retrieved:<docid>`, `tool-schema`.
    pub source: String,
}

impl Block {
    pub fn new(
        kind: BlockKind,
        content: impl Into<String>,
        token_count: usize,
        timestamp: i64,
        source: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let fingerprint = fingerprint(&content);
        Self {
            id: Uuid::new_v4(),
            kind,
            content,
            token_count,
            must_keep: false,
            priority: 0.5,
            timestamp,
            compressed: false,
            original_content: None,
            original_token_count: None,
            fingerprint,
            source: source.into(),
        }
    }

    pub fn must_keep(mut self, must_keep: bool) -> Self {
        self.must_keep = must_keep;
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority.clamp(0.0, 1.0);
        self
    }

    /// Replace the content, recomputing token count and fingerprint.
    pub fn set_content(&mut self, content: String, token_count: usize) {
        self.content = content;
        self.token_count = token_count;
        self.fingerprint = fingerprint(&self.content);
    }

    /// Record an accepted compression: the new text replaces `content`, the
    /// original is retained for fallback undo.
    pub fn apply_compression(&mut self, compressed: String, compressed_tokens: usize) {
        self.original_content = Some(std::mem::take(&mut self.content));
        self.original_token_count = Some(self.token_count);
        self.content = compressed;
        self.token_count = compressed_tokens;
        self.fingerprint = fingerprint(&self.content);
        self.compressed = true;
    }

    /// Undo a compression, restoring the original content and counts.
    pub fn undo_compression(&mut self) {
        if let (Some(original), Some(tokens)) =
            (self.original_content.take(), self.original_token_count.take())
        {
            self.content = original;
            self.token_count = tokens;
            self.fingerprint = fingerprint(&self.content);
            self.compressed = false;
        }
    }

    /// Whether normalized content is empty.
    pub fn is_blank(&self) -> bool {
        normalize(&self.content).is_empty()
    }
}

/// Normalize content for fingerprinting: lowercase, whitespace collapsed.
pub fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut pending_space = false;
    for ch in content.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }
    out
}

/// Stable digest of normalized content.
pub fn fingerprint(content: &str) -> String {
    blake3::hash(normalize(content).as_bytes()).to_hex().to_string()
}

/// Sum of token counts over a block list.
pub fn total_tokens(blocks: &[Block]) -> usize {
    blocks.iter().map(|b| b.token_count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_case_and_whitespace() {
        let a = fingerprint("Hello   World\n");
        let b = fingerprint("hello world");
        assert_eq!(a, b);
        assert_ne!(a, fingerprint("hello worlds"));
    }

    #[test]
    fn compression_roundtrip_restores_original() {
        let mut block = Block::new(BlockKind::Assistant, "a long answer here", 5, 3, "message");
        let original_fp = block.fingerprint.clone();
        block.apply_compression("long answer".into(), 2);
        assert!(block.compressed);
        assert_eq!(block.token_count, 2);
        assert_ne!(block.fingerprint, original_fp);

        block.undo_compression();
        assert!(!block.compressed);
        assert_eq!(block.content, "a long answer here");
        assert_eq!(block.token_count, 5);
        assert_eq!(block.fingerprint, original_fp);
    }

    #[test]
    fn blank_detection_handles_whitespace_only() {
        let block = Block::new(BlockKind::Assistant, "  \n\t ", 0, 0, "message");
        assert!(block.is_blank());
    }
}
