//! Slack mrkdwn format converter.
//!
//! Converts standard Markdown to Slack-compatible mrkdwn format.
//! Slack uses a custom format called "mrkdwn" with different syntax:
//!
//! - Uses `*bold*` instead of `**bold**`
//! - Uses `_italic_` instead of `*italic*`
//! - Uses `~strikethrough~` instead of `~~strikethrough~~`
//! - Code blocks use triple backticks (same as standard)
//! - Links use `<url|text>` format

use regex::Regex;
use std::sync::LazyLock;

/// Maximum characters posted in a single Slack message.
pub const MAX_CHUNK_CHARS: usize = 3000;

/// Stand-in for a bold marker while italics are converted.
const BOLD_MARK: char = '\u{1}';

static H12_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,2} (.+)$").unwrap());
static H3456_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{3,6} (.+)$").unwrap());
static BOLD_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static STRIKETHROUGH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~~(.+?)~~").unwrap());
static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());
static LIST_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\s*)[-*] (.*)$").unwrap());
static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*```[\w+-]*\s*$").unwrap());

/// Convert standard Markdown to Slack mrkdwn format.
///
/// | Input                | Output              |
/// |----------------------|---------------------|
/// | `# Title`            | `*Title*` (bold)    |
/// | `### Section`        | `_Section_` (italic)|
/// | `**bold**`           | `*bold*`            |
/// | `*italic*`           | `_italic_`          |
/// | `~~strike~~`         | `~strike~`          |
/// | `[text](url)`        | `<url\|text>`       |
/// | `- item`             | `• item`            |
/// | Code                 | Preserved           |
pub fn convert_to_slack_mrkdwn(input: &str) -> String {
    let mut in_code_block = false;
    input
        .lines()
        .map(|line| {
            if CODE_FENCE.is_match(line) {
                in_code_block = !in_code_block;
                return line.to_string();
            }
            if in_code_block {
                return line.to_string();
            }
            convert_line(line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convert a single line outside code blocks.
fn convert_line(line: &str) -> String {
    let line = if let Some(caps) = H12_PATTERN.captures(line) {
        format!("{BOLD_MARK}{}{BOLD_MARK}", &caps[1])
    } else if let Some(caps) = H3456_PATTERN.captures(line) {
        format!("_{}_", &caps[1])
    } else if let Some(caps) = LIST_PATTERN.captures(line) {
        format!("{}• {}", &caps[1], &caps[2])
    } else {
        line.to_string()
    };

    // Inline code spans sit at odd positions between backticks.
    line.split('`')
        .enumerate()
        .map(|(i, part)| {
            if i % 2 == 1 {
                part.to_string()
            } else {
                convert_inline_formatting(part)
            }
        })
        .collect::<Vec<_>>()
        .join("`")
        .replace(BOLD_MARK, "*")
}

/// Convert inline formatting elements.
fn convert_inline_formatting(text: &str) -> String {
    let result = BOLD_PATTERN.replace_all(text, format!("{BOLD_MARK}$1{BOLD_MARK}").as_str());
    let result = convert_italic(&result);
    let result = STRIKETHROUGH_PATTERN.replace_all(&result, "~$1~");
    LINK_PATTERN.replace_all(&result, "<$2|$1>").into_owned()
}

/// Convert `*text*` spans to `_text_`.
///
/// Bold spans were already swapped out for [`BOLD_MARK`], so every remaining
/// asterisk pair is an italic candidate. Spans with padding inside the markers
/// (`* not italic *`) are left alone, matching how Markdown treats them.
fn convert_italic(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '*' {
            if let Some(end) = find_closing_asterisk(&chars, i + 1) {
                let content: String = chars[i + 1..end].iter().collect();
                if !content.starts_with(' ') && !content.ends_with(' ') {
                    result.push('_');
                    result.push_str(&content);
                    result.push('_');
                    i = end + 1;
                    continue;
                }
            }
        }
        result.push(chars[i]);
        i += 1;
    }

    result
}

/// Find the closing asterisk of a non-empty span.
fn find_closing_asterisk(chars: &[char], start: usize) -> Option<usize> {
    (start + 1..chars.len()).find(|&i| chars[i] == '*' && chars[i - 1] != '\\')
}

/// Split a message into chunks of at most `max_chars` characters.
///
/// Splits at line breaks where possible, then at spaces, and only as a last
/// resort inside a word. Never splits inside a multi-byte character. A code
/// block cut by a chunk boundary is closed at the end of one chunk and
/// reopened at the start of the next.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunker = Chunker::new(max_chars);
    for line in text.lines() {
        chunker.push_line(line);
    }
    chunker.finish()
}

const FENCE: &str = "```";

/// Packs lines into chunks while tracking open code blocks.
struct Chunker {
    max_chars: usize,
    repair_fences: bool,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
    current_lines: usize,
    /// Nothing besides a reopened fence was added since the last flush.
    fresh: bool,
    in_fence: bool,
    /// Byte offset where the last line and its separator begin.
    tail_start: usize,
    tail_opens_fence: bool,
}

impl Chunker {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            // Closing and reopening a block costs two fence lines per chunk.
            repair_fences: max_chars > 2 * (FENCE.len() + 1),
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
            current_lines: 0,
            fresh: true,
            in_fence: false,
            tail_start: 0,
            tail_opens_fence: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        let is_fence = self.repair_fences && CODE_FENCE.is_match(line);
        let opens = is_fence && !self.in_fence;
        let inside_after = if is_fence { opens } else { self.in_fence };
        let reserve = if inside_after { FENCE.len() + 1 } else { 0 };

        let mut remaining = line;
        loop {
            let sep = usize::from(self.current_lines > 0);
            let remaining_len = remaining.chars().count();
            let used = self.current_len + sep + reserve;

            if used + remaining_len <= self.max_chars {
                self.append(remaining, remaining_len);
                break;
            }
            if !self.fresh {
                self.flush();
                continue;
            }

            let room = self.max_chars.saturating_sub(used).max(1);
            let split_point = find_split_point(remaining, room);
            let piece = &remaining[..split_point];
            self.append(piece, piece.chars().count());
            remaining = &remaining[split_point..];
            self.flush();
        }

        if is_fence {
            self.in_fence = opens;
        }
        self.tail_opens_fence = opens;
    }

    fn append(&mut self, piece: &str, len: usize) {
        self.tail_start = self.current.len();
        if self.current_lines > 0 {
            self.current.push('\n');
            self.current_len += 1;
        }
        self.current.push_str(piece);
        self.current_len += len;
        self.current_lines += 1;
        self.fresh = false;
        self.tail_opens_fence = false;
    }

    fn flush(&mut self) {
        if self.in_fence {
            if self.tail_opens_fence {
                // Move a dangling opening fence to the next chunk.
                self.current.truncate(self.tail_start);
                self.current_lines -= 1;
            } else {
                self.current.push('\n');
                self.current.push_str(FENCE);
            }
        }
        self.push_current();

        if self.in_fence {
            self.current.push_str(FENCE);
            self.current_len = FENCE.len();
            self.current_lines = 1;
        }
        self.fresh = true;
        self.tail_opens_fence = false;
    }

    fn push_current(&mut self) {
        let chunk = std::mem::take(&mut self.current);
        if self.current_lines > 0 && !chunk.trim().is_empty() {
            self.chunks.push(chunk);
        }
        self.current_len = 0;
        self.current_lines = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.push_current();
        self.chunks
    }
}

/// Byte offset to split `text` at, keeping at most `max_chars` characters
/// before it and preferring the last space.
fn find_split_point(text: &str, max_chars: usize) -> usize {
    let limit = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(idx, _)| idx);

    match text[..limit].rfind(' ') {
        Some(pos) => pos + 1,
        None => limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_headers() {
        assert_eq!(convert_to_slack_mrkdwn("# Title"), "*Title*");
        assert_eq!(convert_to_slack_mrkdwn("## Subtitle"), "*Subtitle*");
        assert_eq!(convert_to_slack_mrkdwn("### Section"), "_Section_");
    }

    #[test]
    fn convert_bold_and_italic() {
        assert_eq!(convert_to_slack_mrkdwn("**bold text**"), "*bold text*");
        assert_eq!(convert_to_slack_mrkdwn("an *italic* word"), "an _italic_ word");
        assert_eq!(
            convert_to_slack_mrkdwn("**bold** and *italic*"),
            "*bold* and _italic_"
        );
    }

    #[test]
    fn padded_asterisks_untouched() {
        assert_eq!(convert_to_slack_mrkdwn("2 * 3 * 4"), "2 * 3 * 4");
    }

    #[test]
    fn convert_strikethrough() {
        assert_eq!(convert_to_slack_mrkdwn("~~deleted~~"), "~deleted~");
    }

    #[test]
    fn convert_link() {
        assert_eq!(
            convert_to_slack_mrkdwn("[Click here](https://example.com)"),
            "<https://example.com|Click here>"
        );
    }

    #[test]
    fn convert_list() {
        assert_eq!(convert_to_slack_mrkdwn("- Item 1"), "• Item 1");
        assert_eq!(convert_to_slack_mrkdwn("  * nested"), "  • nested");
    }

    #[test]
    fn preserve_code() {
        let input = "```rust\nlet x = **y**;\n```\n**after**";
        assert_eq!(
            convert_to_slack_mrkdwn(input),
            "```rust\nlet x = **y**;\n```\n*after*"
        );
        assert_eq!(
            convert_to_slack_mrkdwn("run `a*b*c` now"),
            "run `a*b*c` now"
        );
    }

    #[test]
    fn mixed_content() {
        let input = "## Summary\n- Point 1\n- Point 2";
        assert_eq!(convert_to_slack_mrkdwn(input), "*Summary*\n• Point 1\n• Point 2");
    }

    #[test]
    fn multibyte_content() {
        assert_eq!(convert_to_slack_mrkdwn("## 总结\n- 第一项"), "*总结*\n• 第一项");
    }

    #[test]
    fn split_short_message() {
        assert_eq!(split_message("Short message", MAX_CHUNK_CHARS), vec!["Short message"]);
    }

    #[test]
    fn split_on_lines() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(split_message(text, 9), vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn split_long_line_on_spaces() {
        let chunks = split_message("one two three four", 8);
        assert_eq!(chunks, vec!["one two ", "three ", "four"]);
    }

    #[test]
    fn split_keeps_blank_lines() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let chunks = split_message(text, 10);
        assert_eq!(chunks, vec!["aaaa\n\nbbbb", "\ncccc"]);
        assert_eq!(chunks.join("\n"), text);
    }

    #[test]
    fn split_reopens_code_block() {
        let text = "intro\n```\nline one\nline two\nline three\n```\nafter";
        let chunks = split_message(text, 20);
        assert_eq!(
            chunks,
            vec![
                "intro",
                "```\nline one\n```",
                "```\nline two\n```",
                "```\nline three\n```",
                "after",
            ]
        );
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
    }

    #[test]
    fn split_long_line_inside_code_block() {
        let text = format!("```\n{}\n```", "x".repeat(30));
        let chunks = split_message(&text, 16);
        assert!(chunks.iter().all(|c| c.chars().count() <= 16));
        assert!(chunks.iter().all(|c| c.starts_with(FENCE) && c.ends_with(FENCE)));
        let body: String = chunks
            .iter()
            .map(|c| c.trim_start_matches("```\n").trim_end_matches("\n```"))
            .collect();
        assert_eq!(body, "x".repeat(30));
    }

    #[test]
    fn split_respects_char_boundaries() {
        let text = "é".repeat(10);
        let chunks = split_message(&text, 3);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
        assert_eq!(chunks.concat(), text);
    }
}
