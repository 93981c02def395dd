//! Regex-backed [`Reporter`] with a small built-in table of kernel oops
//! signatures.

use regex::bytes::Regex;

use super::{CrashType, Report, Reporter};

/// Crash signatures recognised by [`PatternReporter::new`], in priority order.
///
/// When several signatures match, the one that starts earliest in the output
/// wins; ties go to the entry listed first.
pub const DEFAULT_CRASH_PATTERNS: &[(&str, CrashType)] = &[
    (r"BUG: KASAN: [^\r\n]*", CrashType::MemorySafety),
    (r"BUG: KFENCE: [^\r\n]*", CrashType::MemorySafety),
    (r"BUG: unable to handle [^\r\n]*", CrashType::MemorySafety),
    (r"general protection fault[^\r\n]*", CrashType::MemorySafety),
    (r"Unable to handle kernel [^\r\n]*", CrashType::MemorySafety),
    (r"UBSAN: [^\r\n]*", CrashType::Bug),
    (r"INFO: task [^\r\n]* blocked for more than [^\r\n]*", CrashType::Hang),
    (r"INFO: rcu_(?:preempt|sched|bh) (?:self-)?detected[^\r\n]*", CrashType::Hang),
    (r"rcu: INFO: rcu_(?:preempt|sched|bh) (?:self-)?detected[^\r\n]*", CrashType::Hang),
    (r"BUG: [^\r\n]*", CrashType::Bug),
    (r"WARNING: [^\r\n]*", CrashType::Warning),
    (r"Kernel panic[^\r\n]*", CrashType::Panic),
];

/// Output fragments that mark a crash as uninteresting.
pub const DEFAULT_SUPPRESSIONS: &[&str] = &[
    r"Out of memory: Kill(?:ed)? process",
    r"fatal error: runtime: out of memory",
    r"INFO: lockdep is turned off",
];

#[derive(Clone, Debug)]
struct CrashPattern {
    regex: Regex,
    crash_type: CrashType,
}

/// Matches console output against a fixed list of regular expressions.
///
/// Titles are the matched text with trailing whitespace removed; the crash
/// extent is the full console line holding the match.
#[derive(Clone, Debug)]
pub struct PatternReporter {
    crashes: Vec<CrashPattern>,
    suppressions: Vec<Regex>,
}

impl PatternReporter {
    /// Builds a reporter from [`DEFAULT_CRASH_PATTERNS`] and
    /// [`DEFAULT_SUPPRESSIONS`].
    ///
    /// # Errors
    ///
    /// Returns [`regex::Error`] if a built-in pattern fails to compile.
    pub fn new() -> Result<Self, regex::Error> {
        Self::with_patterns(DEFAULT_CRASH_PATTERNS, DEFAULT_SUPPRESSIONS)
    }

    /// Builds a reporter from caller-supplied signature and suppression lists.
    ///
    /// # Errors
    ///
    /// Returns [`regex::Error`] when any pattern fails to compile.
    pub fn with_patterns(
        crashes: &[(&str, CrashType)],
        suppressions: &[&str],
    ) -> Result<Self, regex::Error> {
        let crashes = crashes
            .iter()
            .map(|&(pattern, crash_type)| {
                Regex::new(pattern).map(|regex| CrashPattern { regex, crash_type })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let suppressions = suppressions
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            crashes,
            suppressions,
        })
    }

    fn first_match<'p>(&'p self, window: &[u8]) -> Option<(&'p CrashPattern, usize, usize)> {
        self.crashes
            .iter()
            .filter_map(|pattern| {
                pattern
                    .regex
                    .find(window)
                    .map(|found| (pattern, found.start(), found.end()))
            })
            .min_by_key(|&(_, start, _)| start)
    }
}

impl Reporter for PatternReporter {
    fn contains_crash(&self, output: &[u8]) -> bool {
        self.crashes
            .iter()
            .any(|pattern| pattern.regex.is_match(output))
    }

    fn parse_from(&self, output: &[u8], offset: usize) -> Option<Report> {
        let window = output.get(offset..)?;
        let (pattern, start, end) = self.first_match(window)?;
        let match_start = offset + start;
        let match_end = offset + end;

        let line_start = output
            .get(..match_start)
            .and_then(|head| head.iter().rposition(|&byte| byte == b'\n'))
            .map_or(0, |newline| newline + 1);
        let line_end = output
            .get(match_end..)
            .and_then(|tail| tail.iter().position(|&byte| byte == b'\n'))
            .map_or(output.len(), |newline| match_end + newline);

        let title = output
            .get(match_start..match_end)
            .map(|matched| String::from_utf8_lossy(matched).trim_end().to_owned())
            .unwrap_or_default();

        Some(Report {
            title,
            crash_type: pattern.crash_type,
            output: output.to_vec(),
            start_pos: line_start,
            end_pos: line_end,
            suppressed: self.is_suppressed(output),
        })
    }

    fn is_suppressed(&self, output: &[u8]) -> bool {
        self.suppressions.iter().any(|regex| regex.is_match(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn reporter() -> PatternReporter {
        PatternReporter::new().expect("built-in patterns compile")
    }

    #[rstest]
    #[case(b"[   12.5] BUG: KASAN: use-after-free in foo\n".as_slice(), CrashType::MemorySafety, "BUG: KASAN: use-after-free in foo")]
    #[case(b"[    1.0] WARNING: CPU: 0 PID: 1 at mm/slab.c:42\n".as_slice(), CrashType::Warning, "WARNING: CPU: 0 PID: 1 at mm/slab.c:42")]
    #[case(b"Kernel panic - not syncing: Fatal exception\n".as_slice(), CrashType::Panic, "Kernel panic - not syncing: Fatal exception")]
    #[case(b"INFO: task syz:42 blocked for more than 143 seconds.\n".as_slice(), CrashType::Hang, "INFO: task syz:42 blocked for more than 143 seconds.")]
    fn parse_from_classifies_known_signatures(
        reporter: PatternReporter,
        #[case] output: &[u8],
        #[case] crash_type: CrashType,
        #[case] title: &str,
    ) {
        let report = reporter.parse_from(output, 0).expect("crash should parse");

        assert_eq!(report.crash_type, crash_type);
        assert_eq!(report.title, title);
    }

    #[rstest]
    fn parse_from_covers_the_whole_console_line(reporter: PatternReporter) {
        let output = b"boot ok\n[ 3.1] BUG: sleeping function called\nmore\n";
        let report = reporter.parse_from(output, 0).expect("crash should parse");

        let line = output
            .get(report.start_pos..report.end_pos)
            .expect("offsets within output");
        assert_eq!(line, b"[ 3.1] BUG: sleeping function called");
    }

    #[rstest]
    fn parse_from_ignores_crashes_before_offset(reporter: PatternReporter) {
        let output = b"WARNING: old splat\nclean line\n";
        let offset = output.len() - b"clean line\n".len();

        assert!(reporter.parse_from(output, offset).is_none());
    }

    #[rstest]
    fn earliest_match_wins(reporter: PatternReporter) {
        let output = b"WARNING: first\nBUG: KASAN: second\n";
        let report = reporter.parse_from(output, 0).expect("crash should parse");

        assert_eq!(report.title, "WARNING: first");
    }

    #[rstest]
    fn suppressions_mark_reports(reporter: PatternReporter) {
        let output = b"Out of memory: Killed process 12\nBUG: bad page state\n";
        let report = reporter.parse_from(output, 0).expect("crash should parse");

        assert!(report.suppressed);
        assert!(!reporter.is_suppressed(b"BUG: bad page state\n"));
    }

    #[rstest]
    fn contains_crash_ignores_clean_output(reporter: PatternReporter) {
        assert!(!reporter.contains_crash(b"executing program 1\nok\n"));
        assert!(reporter.contains_crash(b"executing program 1\nBUG: spinlock bad magic\n"));
    }

    #[test]
    fn with_patterns_rejects_invalid_regex() {
        assert!(PatternReporter::with_patterns(&[("(", CrashType::Bug)], &[]).is_err());
    }
}
