//! Extraction of structured payloads from free-form model output.
//!
//! Models wrap answers in markdown fences, prefix them with prose, or emit
//! bare text. The helpers here pull out either a JSON object (syllabus) or a
//! source file (scene code).

use regex::Regex;

/// A fenced markdown block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// Language tag after the opening fence, lowercased; empty when absent.
    pub lang: String,
    /// Block body without the fences.
    pub body: String,
}

/// Return every fenced block in `content`, in order of appearance.
///
/// An unterminated final fence yields its remaining body, since truncated
/// completions are common.
pub fn fenced_blocks(content: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => {
                    current = Some(FencedBlock {
                        lang: rest.trim().to_lowercase(),
                        body: String::new(),
                    });
                }
            }
            continue;
        }
        if let Some(block) = current.as_mut() {
            block.body.push_str(line);
            block.body.push('\n');
        }
    }

    if let Some(block) = current {
        if !block.body.trim().is_empty() {
            blocks.push(block);
        }
    }

    blocks
}

/// Find the index of the brace closing the object that starts at `s[0]`.
///
/// String literals and escapes are honoured so braces inside values do not
/// count.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Extract the first JSON object from a response and parse it.
///
/// Tries fenced blocks first, then the first balanced object in the raw
/// text. Returns `None` when nothing parses.
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    for block in fenced_blocks(trimmed) {
        if let Some(value) = first_object(&block.body) {
            return Some(value);
        }
    }

    first_object(trimmed)
}

fn first_object(text: &str) -> Option<serde_json::Value> {
    let mut offset = 0;
    while let Some(start) = text[offset..].find('{') {
        let start = offset + start;
        if let Some(end) = find_matching_brace(&text[start..]) {
            let candidate = &text[start..=start + end];
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
        offset = start + 1;
    }
    None
}

/// Extract source code from a model response.
///
/// Preference order:
/// 1. a fenced block containing one of `markers`,
/// 2. the raw text from the first line matching `start_line` onward,
/// 3. the first fenced block of any kind.
///
/// Returns an empty string when nothing looks like code.
pub fn extract_code(content: &str, markers: &[&str], start_line: &Regex) -> String {
    let blocks = fenced_blocks(content);

    if let Some(block) = blocks
        .iter()
        .find(|b| markers.iter().any(|m| b.body.contains(m)))
    {
        return block.body.trim_end().to_string();
    }

    let lines: Vec<&str> = content.lines().collect();
    if let Some(start) = lines.iter().position(|l| start_line.is_match(l)) {
        let code: Vec<&str> = lines[start..]
            .iter()
            .copied()
            .take_while(|l| !l.trim_start().starts_with("```"))
            .collect();
        return code.join("\n").trim_end().to_string();
    }

    blocks
        .into_iter()
        .next()
        .map(|b| b.body.trim_end().to_string())
        .unwrap_or_default()
}
