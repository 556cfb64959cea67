//! Deterministic block transforms.
//!
//! Seven transforms run in a fixed order: junk removal, deduplication,
//! tool-schema minimization, JSON table compaction, log trimming,
//! keep-last-N-turns, constraint extraction. Each is pure with respect to the
//! block list; mutated blocks get their token count and fingerprint
//! recomputed before the next step sees them.

use std::collections::{BTreeSet, HashMap, HashSet};

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::block::{fingerprint, Block, BlockKind};
use crate::config::{DedupeNormalize, OptimizeConfig};
use crate::tokenizer::BoundCounter;

/// Case-sensitive keywords whose presence marks a line as a constraint.
pub const CONSTRAINT_KEYWORDS: [&str; 7] =
    ["MUST NOT", "MUST", "ALWAYS", "NEVER", "FORMAT", "JSON", "DEADLINE"];

static SENTENCE_SPLIT: Lazy<FancyRegex> =
    Lazy::new(|| FancyRegex::new(r"(?<=[.!?])\s+").expect("sentence split regex"));

static LOG_ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ERROR|Exception|Traceback").expect("log error regex"));

/// Run all seven transforms in order.
pub fn apply_heuristics(
    mut blocks: Vec<Block>,
    config: &OptimizeConfig,
    tokens: &BoundCounter,
) -> Vec<Block> {
    blocks = remove_junk(blocks, config);
    blocks = deduplicate(blocks, &config.dedupe_normalize);
    blocks = minimize_tool_schemas(blocks, config, tokens);
    blocks = compact_json_arrays(blocks, config, tokens);
    blocks = trim_logs(blocks, config, tokens);
    mark_last_turns(&mut blocks, config.keep_last_n_turns);
    extract_constraints(&mut blocks, tokens);
    blocks
}

/// (a) Drop non-must-keep blocks whose normalized content is empty, and
/// assistant blocks outside the protected last-N window whose whole content
/// matches a junk pattern.
pub fn remove_junk(blocks: Vec<Block>, config: &OptimizeConfig) -> Vec<Block> {
    let patterns: Vec<Regex> = config
        .junk_patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, "skipping invalid junk pattern: {e}");
                None
            }
        })
        .collect();

    let protected = last_turn_block_ids(&blocks, config.keep_last_n_turns);

    blocks
        .into_iter()
        .filter(|b| {
            if b.must_keep {
                return true;
            }
            if b.is_blank() {
                return false;
            }
            if b.kind == BlockKind::Assistant && !protected.contains(&b.id) {
                let content = b.content.trim();
                if patterns.iter().any(|re| re.is_match(content)) {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// (b) Group non-must-keep blocks by normalized-content key; within each
/// group keep the one with the greatest timestamp. Order of survivors is
/// unchanged.
pub fn deduplicate(blocks: Vec<Block>, norm: &DedupeNormalize) -> Vec<Block> {
    let mut latest: HashMap<String, i64> = HashMap::new();
    for b in blocks.iter().filter(|b| !b.must_keep) {
        let key = dedup_key(b, norm);
        let entry = latest.entry(key).or_insert(b.timestamp);
        if b.timestamp > *entry {
            *entry = b.timestamp;
        }
    }
    let keep: HashSet<Uuid> = blocks
        .iter()
        .filter(|b| b.must_keep || latest.get(&dedup_key(b, norm)) == Some(&b.timestamp))
        .map(|b| b.id)
        .collect();
    blocks.into_iter().filter(|b| keep.contains(&b.id)).collect()
}

/// With both flags on (the default) the key is exactly the block fingerprint;
/// turning a flag off makes dedup sensitive to case or spacing.
fn dedup_key(block: &Block, norm: &DedupeNormalize) -> String {
    if norm.lowercase && norm.collapse_whitespace {
        return block.fingerprint.clone();
    }
    let mut text = block.content.trim().to_string();
    if norm.lowercase {
        text = text.to_lowercase();
    }
    if norm.collapse_whitespace {
        text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// (c) Strip tool schemas down to {name, parameters, required} and apply the
/// allowlist.
pub fn minimize_tool_schemas(
    blocks: Vec<Block>,
    config: &OptimizeConfig,
    tokens: &BoundCounter,
) -> Vec<Block> {
    let allow_all = config.tool_allowlist.is_empty()
        || config.tool_allowlist.iter().any(|t| t == "*");

    blocks
        .into_iter()
        .filter_map(|mut b| {
            if b.kind != BlockKind::Tool || b.source != "tool-schema" {
                return Some(b);
            }
            let Ok(Value::Object(schema)) = serde_json::from_str::<Value>(&b.content) else {
                return Some(b);
            };
            let name = schema.get("name").and_then(Value::as_str).unwrap_or("");
            if !allow_all && !config.tool_allowlist.iter().any(|t| t == name) {
                return None;
            }
            let mut minimal = serde_json::Map::new();
            for field in ["name", "parameters", "required"] {
                if let Some(v) = schema.get(field) {
                    minimal.insert(field.to_string(), v.clone());
                }
            }
            let body = Value::Object(minimal).to_string();
            if body != b.content {
                let count = tokens.count(&body);
                b.set_content(body, count);
            }
            Some(b)
        })
        .collect()
}

/// (d) Rewrite large uniform JSON arrays into a pipe-delimited table:
/// one header line of keys, one record per line, with an explicit elision
/// marker past `json_truncate_items`.
pub fn compact_json_arrays(
    blocks: Vec<Block>,
    config: &OptimizeConfig,
    tokens: &BoundCounter,
) -> Vec<Block> {
    blocks
        .into_iter()
        .map(|mut b| {
            if b.must_keep || b.content.len() <= config.json_truncate_chars {
                return b;
            }
            if let Some(table) = tabularize(&b.content, config.json_truncate_items) {
                let count = tokens.count(&table);
                b.set_content(table, count);
            }
            b
        })
        .collect()
}

/// Produce the tabular encoding when the content is a JSON array of uniform
/// objects; `None` otherwise.
fn tabularize(content: &str, max_items: usize) -> Option<String> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(content) else {
        return None;
    };
    if items.len() < 2 {
        return None;
    }

    let first_keys: BTreeSet<String> = match &items[0] {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => return None,
    };
    if first_keys.is_empty() {
        return None;
    }
    for item in &items {
        match item {
            Value::Object(map) => {
                let keys: BTreeSet<String> = map.keys().cloned().collect();
                if keys != first_keys {
                    return None;
                }
            }
            _ => return None,
        }
    }

    let keys: Vec<&String> = first_keys.iter().collect();
    let mut out = keys
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join("|");
    let shown = items.len().min(max_items.max(1));
    for item in items.iter().take(shown) {
        let Value::Object(map) = item else { unreachable!() };
        let row = keys
            .iter()
            .map(|k| cell(&map[k.as_str()]))
            .collect::<Vec<_>>()
            .join("|");
        out.push('\n');
        out.push_str(&row);
    }
    if items.len() > shown {
        out.push_str(&format!("\n... ({} more records)", items.len() - shown));
    }
    Some(out)
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.replace('\n', " "),
        other => other.to_string(),
    }
}

/// (e) For log-tagged blocks, keep error lines with surrounding context plus
/// the final tail; collapse gaps with an explicit elision marker.
pub fn trim_logs(
    blocks: Vec<Block>,
    config: &OptimizeConfig,
    tokens: &BoundCounter,
) -> Vec<Block> {
    blocks
        .into_iter()
        .map(|mut b| {
            if b.must_keep || !is_log_source(&b.source) {
                return b;
            }
            let trimmed = trim_log_text(
                &b.content,
                config.log_error_window_lines,
                config.log_tail_lines,
            );
            if trimmed != b.content {
                let count = tokens.count(&trimmed);
                b.set_content(trimmed, count);
            }
            b
        })
        .collect()
}

fn is_log_source(source: &str) -> bool {
    source == "log" || source.ends_with(":log")
}

fn trim_log_text(content: &str, window: usize, tail: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= tail {
        return content.to_string();
    }

    let mut keep = vec![false; lines.len()];
    for (i, line) in lines.iter().enumerate() {
        if LOG_ERROR_LINE.is_match(line) {
            let start = i.saturating_sub(window);
            let end = (i + window + 1).min(lines.len());
            for flag in keep.iter_mut().take(end).skip(start) {
                *flag = true;
            }
        }
    }
    for flag in keep.iter_mut().skip(lines.len() - tail) {
        *flag = true;
    }

    let mut out: Vec<String> = Vec::new();
    let mut elided = 0usize;
    for (i, line) in lines.iter().enumerate() {
        if keep[i] {
            if elided > 0 {
                out.push(format!("... ({elided} lines elided)"));
                elided = 0;
            }
            out.push((*line).to_string());
        } else {
            elided += 1;
        }
    }
    if elided > 0 {
        out.push(format!("... ({elided} lines elided)"));
    }
    out.join("\n")
}

/// (f) Mark every block in the last N conversation turns as must-keep.
pub fn mark_last_turns(blocks: &mut [Block], n: usize) {
    let protected = last_turn_block_ids(blocks, n);
    for b in blocks.iter_mut() {
        if protected.contains(&b.id) {
            b.must_keep = true;
            if b.priority < 0.9 {
                b.priority = 0.9;
            }
        }
    }
}

/// Ids of the user/assistant blocks belonging to the last `n` turns. A turn
/// starts at each user block and carries the assistant blocks that follow it.
fn last_turn_block_ids(blocks: &[Block], n: usize) -> HashSet<Uuid> {
    if n == 0 {
        return HashSet::new();
    }
    let mut ordered: Vec<&Block> = blocks
        .iter()
        .filter(|b| matches!(b.kind, BlockKind::User | BlockKind::Assistant))
        .collect();
    ordered.sort_by_key(|b| b.timestamp);

    let mut turns: Vec<Vec<Uuid>> = Vec::new();
    for b in ordered {
        if b.kind == BlockKind::User {
            turns.push(vec![b.id]);
        } else if let Some(current) = turns.last_mut() {
            current.push(b.id);
        } else {
            turns.push(vec![b.id]);
        }
    }

    let skip = turns.len().saturating_sub(n);
    turns.into_iter().skip(skip).flatten().collect()
}

/// (g) Collect constraint sentences from system, developer, and user blocks
/// into a single must-keep constraint block placed right after the last
/// system block. Skipped when an identical constraint block already exists,
/// so re-running the pipeline over its own output changes nothing.
pub fn extract_constraints(blocks: &mut Vec<Block>, tokens: &BoundCounter) {
    let mut collected: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for b in blocks.iter() {
        if !matches!(
            b.kind,
            BlockKind::System | BlockKind::Developer | BlockKind::User
        ) {
            continue;
        }
        for line in b.content.lines() {
            for segment in split_sentences(line) {
                let segment = segment.trim();
                if !segment.is_empty()
                    && CONSTRAINT_KEYWORDS.iter().any(|kw| segment.contains(kw))
                    && seen.insert(segment.to_string())
                {
                    collected.push(segment.to_string());
                }
            }
        }
    }
    if collected.is_empty() {
        return;
    }

    let content = collected.join("\n");
    let fp = fingerprint(&content);
    if blocks
        .iter()
        .any(|b| b.kind == BlockKind::Constraint && b.fingerprint == fp)
    {
        return;
    }

    let insert_at = blocks
        .iter()
        .rposition(|b| b.kind == BlockKind::System)
        .map(|i| i + 1)
        .unwrap_or(0);
    // Share the neighbouring timestamp; a stable sort on timestamp then keeps
    // the constraint right where it was inserted.
    let ts = if insert_at > 0 {
        blocks[insert_at - 1].timestamp
    } else {
        blocks.first().map(|b| b.timestamp).unwrap_or(0)
    };

    let count = tokens.count(&content);
    let constraint = Block::new(
        BlockKind::Constraint,
        content,
        count,
        ts,
        "extracted-constraints",
    )
    .must_keep(true)
    .priority(1.0);
    blocks.insert(insert_at, constraint);
}

/// Sentence segmentation: split after terminal punctuation followed by
/// whitespace, keeping the punctuation with its sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut last = 0usize;
    let mut finder = SENTENCE_SPLIT.find_iter(text);
    while let Some(Ok(m)) = finder.next() {
        if m.start() > last {
            out.push(&text[last..m.start()]);
        }
        last = m.end();
    }
    if last < text.len() {
        out.push(&text[last..]);
    }
    out
}
