/// One recognized revision from the bridge tool's streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub revision: u64,
    pub is_new_commit: bool,
    pub raw_line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    /// An `rN = <sha> (<ref>)` commit line.
    Progress(ProgressEvent),
    /// Ancillary bridge status markers worth surfacing verbatim.
    Status(String),
    /// Anything else passes through as log-only; never an error.
    Log(String),
}

const STATUS_MARKERS: &[&str] = &["checking out", "initialized empty"];

/// Stateful line-buffered parser over raw output chunks. Lines split across
/// chunk boundaries are reassembled before classification, so feeding the
/// same bytes in one chunk or many yields the same events.
#[derive(Debug, Default)]
pub struct RevisionProgressParser {
    buffer: String,
}

impl RevisionProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedLine> {
        self.buffer.push_str(chunk);
        let mut parsed = Vec::new();
        while let Some(newline_index) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_index).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                parsed.push(classify(line));
            }
        }
        parsed
    }

    /// Flushes a trailing partial line once the stream is exhausted.
    pub fn finish(&mut self) -> Option<ParsedLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            None
        } else {
            Some(classify(line))
        }
    }
}

fn classify(line: &str) -> ParsedLine {
    if let Some(event) = parse_revision_line(line) {
        return ParsedLine::Progress(event);
    }
    let lowered = line.to_ascii_lowercase();
    if STATUS_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return ParsedLine::Status(line.to_owned());
    }
    ParsedLine::Log(line.to_owned())
}

/// Matches the bridge tool's `rN = <sha> (<ref>)` commit mapping lines.
fn parse_revision_line(line: &str) -> Option<ProgressEvent> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix('r')?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit())?;
    if digits_end == 0 {
        return None;
    }
    let (digits, remainder) = rest.split_at(digits_end);
    if !remainder.trim_start().starts_with('=') {
        return None;
    }
    let revision = digits.parse::<u64>().ok()?;
    let sha = remainder.trim_start().trim_start_matches('=').trim_start();
    Some(ProgressEvent {
        revision,
        is_new_commit: !sha.is_empty(),
        raw_line: line.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::{ParsedLine, RevisionProgressParser};

    fn progress_revisions(parsed: &[ParsedLine]) -> Vec<u64> {
        parsed
            .iter()
            .filter_map(|line| match line {
                ParsedLine::Progress(event) => Some(event.revision),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn revision_line_yields_exactly_one_event() {
        let mut parser = RevisionProgressParser::new();
        let parsed = parser.feed("r42 = abc123 (refs/remotes/origin/trunk)\n");

        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            ParsedLine::Progress(event) => {
                assert_eq!(event.revision, 42);
                assert!(event.is_new_commit);
                assert_eq!(event.raw_line, "r42 = abc123 (refs/remotes/origin/trunk)");
            }
            other => panic!("expected progress, got {other:?}"),
        }
        assert!(parser.finish().is_none());
    }

    #[test]
    fn line_split_across_two_chunks_yields_the_same_single_event() {
        let mut parser = RevisionProgressParser::new();
        let mut parsed = parser.feed("r42 = abc123 (refs/re");
        assert!(parsed.is_empty());
        parsed.extend(parser.feed("motes/origin/trunk)\n"));

        assert_eq!(progress_revisions(&parsed), vec![42]);
    }

    #[test]
    fn multiple_lines_in_one_chunk_each_classify() {
        let mut parser = RevisionProgressParser::new();
        let parsed = parser.feed(
            "Initialized empty Git repository in /tmp/ws/.git/\nr1 = aaa (refs/remotes/origin/trunk)\nW: ignoring empty symlink\nr2 = bbb (refs/remotes/origin/trunk)\n",
        );

        assert_eq!(parsed.len(), 4);
        assert!(matches!(parsed[0], ParsedLine::Status(_)));
        assert_eq!(progress_revisions(&parsed), vec![1, 2]);
        assert!(matches!(parsed[2], ParsedLine::Log(_)));
    }

    #[test]
    fn checking_out_marker_is_a_status_line() {
        let mut parser = RevisionProgressParser::new();
        let parsed = parser.feed("Checking out files: 100% (5/5), done.\n");
        assert!(matches!(parsed[0], ParsedLine::Status(_)));
    }

    #[test]
    fn unrecognized_lines_pass_through_without_error() {
        let mut parser = RevisionProgressParser::new();
        let parsed = parser.feed("rN is not a number\nnothing to see\nrate limit\n");

        assert_eq!(parsed.len(), 3);
        assert!(parsed
            .iter()
            .all(|line| matches!(line, ParsedLine::Log(_))));
    }

    #[test]
    fn finish_flushes_a_trailing_partial_line() {
        let mut parser = RevisionProgressParser::new();
        assert!(parser.feed("r7 = ccc (refs/remotes/origin/trunk)").is_empty());

        match parser.finish() {
            Some(ParsedLine::Progress(event)) => assert_eq!(event.revision, 7),
            other => panic!("expected trailing progress, got {other:?}"),
        }
        assert!(parser.finish().is_none());
    }

    #[test]
    fn crlf_lines_are_trimmed() {
        let mut parser = RevisionProgressParser::new();
        let parsed = parser.feed("r9 = ddd (refs/remotes/origin/trunk)\r\n");
        assert_eq!(progress_revisions(&parsed), vec![9]);
    }
}
