//! Structural and safety checks for generated scene source.
//!
//! The contract for a scene file:
//! - `from manim import *`
//! - `class Lesson(Scene):` at module level
//! - `def construct(self):` calling `self.play`, `self.add` or `self.wait`
//! - `def show_caption(self, text, duration=2.0):` with exactly that signature
//! - at least one `self.play(` somewhere in the class
//! - no imports from the heavy or unsafe module denylist
//!
//! There is no Python parser in the dependency tree, so [`check_syntax`]
//! performs the structural subset of parsing that generated code usually
//! gets wrong: string termination, bracket balance, block colons and
//! indentation.

use regex::Regex;

use super::error::CodeValidationError;

/// Top-level modules that generated scenes must not import.
pub const DENYLIST: &[&str] = &[
    "numpy",
    "scipy",
    "torch",
    "tensorflow",
    "pandas",
    "matplotlib",
    "cv2",
    "sklearn",
    "requests",
    "subprocess",
    "socket",
    "urllib",
    "multiprocessing",
    "ctypes",
];

/// Markers identifying a block of scene code inside a response.
pub const ENTRY_MARKERS: &[&str] = &["from manim import", "class Lesson"];

/// Canonical helper header with whitespace removed.
const HELPER_SIGNATURE: &str = "defshow_caption(self,text,duration=2.0):";

/// Statement keywords whose logical line must contain a top-level colon.
const BLOCK_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "with", "try", "except", "finally", "def", "class",
];

/// Checks scene source against the contract.
#[derive(Debug, Clone)]
pub struct SceneValidator {
    import_line: Regex,
    from_line: Regex,
    dunder_import: Regex,
    entry_import: Regex,
    entry_class: Regex,
    construct_def: Regex,
    render_call: Regex,
    play_call: Regex,
    helper_def: Regex,
    code_start: Regex,
}

impl SceneValidator {
    /// Compile the validator's patterns.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            import_line: Regex::new(r"^\s*import\s+(.+)$")?,
            from_line: Regex::new(r"^\s*from\s+([\w.]+)\s+import\b")?,
            dunder_import: Regex::new(r#"__import__\(\s*['"]([\w.]+)"#)?,
            entry_import: Regex::new(r"(?m)^from\s+manim\s+import\s+\*\s*(#.*)?$")?,
            entry_class: Regex::new(r"^class\s+Lesson\s*\(\s*Scene\s*\)\s*:")?,
            construct_def: Regex::new(r"^\s+def\s+construct\s*\(\s*self\s*\)\s*(->\s*None\s*)?:")?,
            render_call: Regex::new(r"self\.(play|add|wait)\s*\(")?,
            play_call: Regex::new(r"self\.play\s*\(")?,
            helper_def: Regex::new(r"^\s+def\s+show_caption\b")?,
            code_start: Regex::new(r"^\s*(from\s+\w+\s+import\b|import\s+\w+|class\s+\w+)")?,
        })
    }

    /// Pattern for the first line of code in unfenced text.
    pub fn code_start(&self) -> &Regex {
        &self.code_start
    }

    /// Run every check. An empty result means the source is valid.
    ///
    /// Checks run in order and stop at the first failing group: denylist,
    /// then syntax, then structure, then the animation heuristic.
    pub fn validate(&self, source: &str) -> Vec<CodeValidationError> {
        if source.trim().is_empty() {
            return vec![CodeValidationError::NoCode];
        }

        let denied = self.denied_imports(source);
        if !denied.is_empty() {
            return denied
                .into_iter()
                .map(|module| CodeValidationError::DeniedImport { module })
                .collect();
        }

        if let Err(err) = check_syntax(source) {
            return vec![err];
        }

        let structural = self.structural_violations(source);
        if !structural.is_empty() {
            return structural;
        }

        let class_body = self.class_body(source).unwrap_or_default();
        if !self.play_call.is_match(&class_body) {
            return vec![CodeValidationError::NoAnimation];
        }

        Vec::new()
    }

    /// Denylisted top-level modules imported by `source`, deduplicated.
    pub fn denied_imports(&self, source: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut note = |module: &str| {
            let top = module.split('.').next().unwrap_or(module).trim();
            if DENYLIST.contains(&top) && !found.iter().any(|f| f == top) {
                found.push(top.to_string());
            }
        };

        for line in source.lines() {
            let code = strip_comment(line);
            if let Some(caps) = self.from_line.captures(code) {
                note(&caps[1]);
            } else if let Some(caps) = self.import_line.captures(code) {
                for item in caps[1].split(',') {
                    let name = item.split_whitespace().next().unwrap_or("");
                    note(name);
                }
            }
            for caps in self.dunder_import.captures_iter(code) {
                note(&caps[1]);
            }
        }

        found
    }

    fn structural_violations(&self, source: &str) -> Vec<CodeValidationError> {
        let mut violations = Vec::new();

        if !self.entry_import.is_match(source) {
            violations.push(CodeValidationError::MissingEntryImport);
        }

        let Some(class_body) = self.class_body(source) else {
            violations.push(CodeValidationError::MissingEntryClass);
            return violations;
        };

        match method_body(&class_body, &self.construct_def) {
            Some(body) => {
                if !self.render_call.is_match(&body) {
                    violations.push(CodeValidationError::MissingRenderCall);
                }
            }
            None => violations.push(CodeValidationError::MissingConstruct),
        }

        let helper_ok = class_body
            .lines()
            .filter(|l| self.helper_def.is_match(l))
            .any(|l| {
                let normalized: String = strip_comment(l).chars().filter(|c| !c.is_whitespace()).collect();
                normalized == HELPER_SIGNATURE
            });
        if !helper_ok {
            violations.push(CodeValidationError::HelperSignature);
        }

        violations
    }

    /// Lines belonging to the module-level `Lesson` class, header excluded.
    fn class_body(&self, source: &str) -> Option<String> {
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.iter().position(|l| self.entry_class.is_match(l))?;
        let body: Vec<&str> = lines[start + 1..]
            .iter()
            .copied()
            .take_while(|l| {
                let t = l.trim();
                t.is_empty() || t.starts_with('#') || indent_width(l) > 0
            })
            .collect();
        Some(body.join("\n"))
    }
}

/// Body of the first method in `class_body` whose header matches `header`.
fn method_body(class_body: &str, header: &Regex) -> Option<String> {
    let lines: Vec<&str> = class_body.lines().collect();
    let start = lines.iter().position(|l| header.is_match(l))?;
    let def_indent = indent_width(lines[start]);
    let body: Vec<&str> = lines[start + 1..]
        .iter()
        .copied()
        .take_while(|l| l.trim().is_empty() || indent_width(l) > def_indent)
        .collect();
    Some(body.join("\n"))
}

/// Drop a trailing `#` comment. Ignores `#` inside simple string literals.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Indentation width in columns; tabs advance to the next multiple of 8.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

/// One logical line as seen by the syntax check.
#[derive(Debug)]
struct LogicalLine {
    line: usize,
    indent: usize,
    /// Code with string contents and comments removed.
    text: String,
    has_top_colon: bool,
    ends_with_colon: bool,
}

#[derive(Debug, Clone, Copy)]
struct OpenString {
    quote: char,
    triple: bool,
    line: usize,
}

fn syntax_error(line: usize, message: impl Into<String>) -> CodeValidationError {
    CodeValidationError::Syntax {
        line,
        message: message.into(),
    }
}

/// Split `source` into logical lines, checking strings and brackets.
fn logical_lines(source: &str) -> Result<Vec<LogicalLine>, CodeValidationError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = Vec::new();
    let mut brackets: Vec<(char, usize)> = Vec::new();
    let mut string: Option<OpenString> = None;
    let mut current: Option<LogicalLine> = None;
    let mut last_sig: Option<char> = None;
    let mut line = 1usize;
    let mut at_line_start = true;
    let mut saw_tab_indent = false;
    let mut saw_space_indent = false;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];

        if let Some(open) = string {
            if c == '\\' {
                if chars.get(i + 1) == Some(&'\n') {
                    line += 1;
                }
                i += 2;
                continue;
            }
            if open.triple {
                if c == open.quote
                    && chars.get(i + 1) == Some(&open.quote)
                    && chars.get(i + 2) == Some(&open.quote)
                {
                    string = None;
                    i += 3;
                    continue;
                }
                if c == '\n' {
                    line += 1;
                }
            } else if c == open.quote {
                string = None;
            } else if c == '\n' {
                return Err(syntax_error(open.line, "unterminated string literal"));
            }
            i += 1;
            continue;
        }

        if at_line_start && current.is_none() {
            at_line_start = false;
            let mut j = i;
            let mut has_tab = false;
            let mut has_space = false;
            while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
                if chars[j] == '\t' {
                    has_tab = true;
                } else {
                    has_space = true;
                }
                j += 1;
            }
            let rest_starts_blank = j >= chars.len() || chars[j] == '\n' || chars[j] == '\r' || chars[j] == '#';
            if !rest_starts_blank {
                let physical: String = chars[i..j].iter().collect();
                if chars[j..].starts_with(&['`', '`', '`']) {
                    return Err(syntax_error(line, "stray markdown fence"));
                }
                saw_tab_indent |= has_tab;
                saw_space_indent |= has_space;
                if saw_tab_indent && saw_space_indent {
                    return Err(syntax_error(
                        line,
                        "inconsistent use of tabs and spaces in indentation",
                    ));
                }
                current = Some(LogicalLine {
                    line,
                    indent: indent_width(&physical),
                    text: String::new(),
                    has_top_colon: false,
                    ends_with_colon: false,
                });
                last_sig = None;
            }
            i = j;
            continue;
        }

        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '"' | '\'' => {
                let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                string = Some(OpenString {
                    quote: c,
                    triple,
                    line,
                });
                if let Some(logical) = current.as_mut() {
                    logical.text.push_str("\"\"");
                }
                last_sig = Some(c);
                i += if triple { 3 } else { 1 };
                continue;
            }
            '(' | '[' | '{' => brackets.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(syntax_error(
                            line,
                            format!(
                                "closing '{}' does not match '{}' opened on line {}",
                                c, open, open_line
                            ),
                        ));
                    }
                    None => return Err(syntax_error(line, format!("unmatched '{}'", c))),
                }
            }
            ':' if brackets.is_empty() => {
                if let Some(logical) = current.as_mut() {
                    logical.has_top_colon = true;
                }
            }
            '\\' if chars.get(i + 1) == Some(&'\n') => {
                line += 1;
                i += 2;
                continue;
            }
            '\n' => {
                line += 1;
                if brackets.is_empty() {
                    if let Some(mut logical) = current.take() {
                        logical.ends_with_colon = last_sig == Some(':');
                        out.push(logical);
                    }
                    at_line_start = true;
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        if let Some(logical) = current.as_mut() {
            logical.text.push(c);
        }
        if !c.is_whitespace() {
            last_sig = Some(c);
        }
        i += 1;
    }

    if let Some(open) = string {
        let message = if open.triple {
            "unterminated triple-quoted string literal"
        } else {
            "unterminated string literal"
        };
        return Err(syntax_error(open.line, message));
    }
    if let Some((open, open_line)) = brackets.pop() {
        return Err(syntax_error(open_line, format!("'{}' was never closed", open)));
    }
    if let Some(mut logical) = current.take() {
        logical.ends_with_colon = last_sig == Some(':');
        out.push(logical);
    }

    Ok(out)
}

fn first_word(text: &str) -> &str {
    let trimmed = text.trim_start();
    let end = trimmed
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

/// Structural syntax check for Python source.
///
/// Catches unterminated strings, unbalanced brackets, block headers
/// without a colon, malformed `def`/`class` headers, stray markdown fences
/// and indentation errors. It does not validate expressions.
pub fn check_syntax(source: &str) -> Result<(), CodeValidationError> {
    let lines = logical_lines(source)?;
    let mut indents: Vec<usize> = vec![0];
    let mut expect_block: Option<usize> = None;

    for logical in &lines {
        let top = indents.last().copied().unwrap_or(0);

        if let Some(header_line) = expect_block.take() {
            if logical.indent <= top {
                return Err(syntax_error(
                    logical.line,
                    format!("expected an indented block after line {}", header_line),
                ));
            }
            indents.push(logical.indent);
        } else if logical.indent > top {
            return Err(syntax_error(logical.line, "unexpected indent"));
        } else if logical.indent < top {
            while indents.last().is_some_and(|&i| i > logical.indent) {
                indents.pop();
            }
            if indents.last() != Some(&logical.indent) {
                return Err(syntax_error(
                    logical.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }

        let mut word = first_word(&logical.text);
        let mut rest = logical.text.trim_start()[word.len()..].trim_start();
        if word == "async" {
            word = first_word(rest);
            rest = rest[word.len()..].trim_start();
        }

        if BLOCK_KEYWORDS.contains(&word) && !logical.has_top_colon {
            return Err(syntax_error(logical.line, format!("expected ':' after '{}'", word)));
        }
        if word == "def" && !is_def_header(rest) {
            return Err(syntax_error(logical.line, "invalid function definition"));
        }
        if word == "class" && !is_class_header(rest) {
            return Err(syntax_error(logical.line, "invalid class definition"));
        }

        if logical.ends_with_colon {
            expect_block = Some(logical.line);
        }
    }

    if let Some(header_line) = expect_block {
        return Err(syntax_error(
            header_line,
            format!("expected an indented block after line {}", header_line),
        ));
    }

    Ok(())
}

fn is_identifier_then(rest: &str, allowed_next: &[char]) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    let after = rest.trim_start_matches(|c: char| c.is_alphanumeric() || c == '_');
    after
        .trim_start()
        .chars()
        .next()
        .is_some_and(|c| allowed_next.contains(&c))
}

fn is_def_header(rest: &str) -> bool {
    is_identifier_then(rest, &['('])
}

fn is_class_header(rest: &str) -> bool {
    is_identifier_then(rest, &['(', ':'])
}
