//! Header match patterns for the metadata parser

use regex::Regex;

/// One recognizable header style: how it starts, how its body continues or
/// ends, and how comment markers are stripped from body lines.
#[derive(Debug, Clone)]
pub struct MatchPattern {
    pub name: String,
    pub comment_prefix: String,
    pub is_block: bool,
    start: Regex,
    end: Option<Regex>,
    continuation: Option<Regex>,
    strip: Option<Regex>,
}

impl MatchPattern {
    /// The built-in styles, in priority order.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::delimited("yaml", r"^---\s*$", r"^---\s*$"),
            Self::line("javascript", r"^/{2,}\s*config", "//"),
            Self::block("javascript_block", r"^/\*\*\s*config(.*)$", r"^\*/", "*"),
            Self::line("shell", r"^#+\s*config", "#"),
            Self::line("sql", r"^-{2,}\s*config", "--"),
        ]
    }

    /// A style delimited by the same start and end marker with no comment
    /// prefix (YAML front-matter).
    pub fn delimited(name: &str, start: &str, end: &str) -> Self {
        Self {
            name: name.to_string(),
            comment_prefix: String::new(),
            is_block: false,
            start: compile(start),
            end: Some(compile(end)),
            continuation: None,
            strip: None,
        }
    }

    /// A line-comment style: body lines must keep repeating the marker.
    pub fn line(name: &str, start: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            comment_prefix: prefix.to_string(),
            is_block: false,
            start: compile(start),
            end: None,
            continuation: Some(continuation_regex(prefix)),
            strip: Some(strip_regex(prefix)),
        }
    }

    /// A block-comment style: body runs until the closing marker.
    pub fn block(name: &str, start: &str, end: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            comment_prefix: prefix.to_string(),
            is_block: true,
            start: compile(start),
            end: Some(compile(end)),
            continuation: None,
            strip: Some(strip_regex(prefix)),
        }
    }

    pub fn matches_start(&self, line: &str) -> bool {
        self.start.is_match(line)
    }

    /// Text captured by the start pattern's first group, when present
    /// (block style allows config on the opening line).
    pub fn start_capture(&self, line: &str) -> Option<String> {
        self.start
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn matches_end(&self, line: &str) -> bool {
        self.end.as_ref().is_some_and(|re| re.is_match(line))
    }

    /// Whether a trimmed body line still belongs to a line-comment header.
    pub fn matches_continuation(&self, line: &str) -> bool {
        self.continuation
            .as_ref()
            .is_some_and(|re| re.is_match(line))
    }

    /// Remove the repeated comment marker and one optional following space.
    pub fn strip_prefix(&self, line: &str) -> String {
        match &self.strip {
            Some(re) => re.replace(line, "").into_owned(),
            None => line.to_string(),
        }
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("header pattern must compile")
}

fn all_same_char(prefix: &str) -> Option<char> {
    let mut chars = prefix.chars();
    let first = chars.next()?;
    chars.all(|c| c == first).then_some(first)
}

/// For a marker like `//` the continuation is "two or more slashes"; for a
/// mixed marker it is the exact prefix.
fn continuation_regex(prefix: &str) -> Regex {
    match all_same_char(prefix) {
        Some(c) => compile(&format!(
            "^{}{{{},}}",
            regex::escape(&c.to_string()),
            prefix.len()
        )),
        None => compile(&format!("^{}", regex::escape(prefix))),
    }
}

fn strip_regex(prefix: &str) -> Regex {
    match all_same_char(prefix) {
        Some(c) => compile(&format!(
            "^{}{{{},}}\\s?",
            regex::escape(&c.to_string()),
            prefix.len()
        )),
        None => compile(&format!("^{}\\s?", regex::escape(prefix))),
    }
}
