//! Detail-panel core for Markwhen timelines embedded in notes.
//! The core locates one event's body inside a note, renders it with interactive
//! checkboxes, and writes single-checkbox edits back without disturbing the rest
//! of the note. Host plumbing (views, iframes, timers) stays behind the `storage`
//! and `monitor` seams.

pub mod model {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- Paths ------------------------------- */

    /// A POSIX-like document path as the host store names it (no leading '/').
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocPath(pub String);

    impl DocPath {
        pub fn new(path: impl AsRef<str>) -> Self {
            Self(
                path.as_ref()
                    .trim()
                    .replace('\\', "/")
                    .trim_matches('/')
                    .to_string(),
            )
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn file_name(&self) -> Option<&str> {
            if self.0.is_empty() {
                None
            } else {
                self.0.rsplit('/').next()
            }
        }

        /// File name without its last extension.
        pub fn stem(&self) -> Option<&str> {
            let name = self.file_name()?;
            match name.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => Some(stem),
                _ => Some(name),
            }
        }
    }

    impl fmt::Display for DocPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ----------------------------- Selection ----------------------------- */

    /// What the timeline reported when the user clicked an event.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EventSelection {
        pub title: String,
        pub date: String,
    }

    impl EventSelection {
        pub fn new(title: impl Into<String>, date: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                date: date.into(),
            }
        }

        pub fn id(&self) -> String {
            format!("{}-{}", self.date, self.title)
        }
    }

    /* ------------------------------ Checkbox ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum CheckState {
        Unchecked, // [ ]
        Checked,   // [x] or [X]
    }

    impl CheckState {
        pub fn from_marker(b: u8) -> Option<Self> {
            match b {
                b' ' => Some(Self::Unchecked),
                b'x' | b'X' => Some(Self::Checked),
                _ => None,
            }
        }

        pub fn from_checked(checked: bool) -> Self {
            if checked { Self::Checked } else { Self::Unchecked }
        }

        pub fn is_checked(self) -> bool {
            matches!(self, Self::Checked)
        }

        pub fn marker(self) -> char {
            match self {
                Self::Unchecked => ' ',
                Self::Checked => 'x',
            }
        }
    }

    /* ------------------------------- Record ------------------------------- */

    /// The event currently shown in the panel.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EventRecord {
        pub id: String,
        pub title: String,
        pub date: String,
        pub file_path: DocPath,

        /// Verbatim body as it appears in the document; the anchor for write-back.
        pub raw_content: String,

        /// What the panel renders. Same line count as `raw_content`.
        pub display_content: String,

        /// Byte offset of `raw_content` in the document when it was last read or written.
        #[serde(skip)]
        pub anchor_offset: Option<usize>,

        /// Checkbox ordinals per display line, rebuilt on every render.
        #[serde(skip)]
        pub checkbox_positions: Vec<Vec<usize>>,
    }

    impl EventRecord {
        pub fn new(
            selection: &EventSelection,
            file_path: DocPath,
            raw_content: String,
            anchor_offset: Option<usize>,
        ) -> Self {
            Self {
                id: selection.id(),
                title: selection.title.clone(),
                date: selection.date.clone(),
                file_path,
                display_content: raw_content.clone(),
                raw_content,
                anchor_offset,
                checkbox_positions: vec![],
            }
        }

        pub fn replace_content(&mut self, raw: String, display: String, offset: Option<usize>) {
            self.raw_content = raw;
            self.display_content = display;
            self.anchor_offset = offset;
            self.checkbox_positions.clear();
        }

        pub fn raw_lines(&self) -> Vec<&str> {
            self.raw_content.split('\n').collect()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("unsupported date format: {0:?}")]
        UnparsableDate(String),
        #[error("event content is no longer present verbatim in {0}")]
        StaleAnchor(DocPath),
        #[error("document {0} does not resolve to a file")]
        MissingBackingFile(DocPath),
        #[error("no event is selected")]
        NoActiveEvent,
        #[error("line {line} is outside the event body ({len} lines)")]
        LineOutOfRange { line: usize, len: usize },
        #[error("line {line} has no checkbox #{ordinal}")]
        NoSuchCheckbox { line: usize, ordinal: usize },
    }
}

pub mod config {
    //! Panel settings. Every field has a default, so an empty JSON object is a
    //! valid configuration file.

    use crate::classify::LineClassifier;
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use serde_with::{DurationMilliSeconds, serde_as};
    use std::{fs, path::Path, time::Duration};

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PanelConfig {
        /// Info strings that mark a fenced block as timeline source.
        pub fence_tags: Vec<String>,

        /// Keywords that start a structural line in addition to the built-in ones.
        pub extra_keywords: Vec<String>,

        /// File suffixes (without the dot) that mark a whole document as a timeline.
        pub timeline_extensions: Vec<String>,

        /// Selections arriving closer together than this are dropped.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub debounce: Duration,

        /// Retry period while the timeline surface is not subscribed.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub attach_poll: Duration,

        /// Liveness check period once subscribed.
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        pub monitor_interval: Duration,
    }

    impl Default for PanelConfig {
        fn default() -> Self {
            Self {
                fence_tags: vec!["markwhen".into(), "mw".into()],
                extra_keywords: vec![],
                timeline_extensions: vec!["mw".into()],
                debounce: Duration::from_millis(300),
                attach_poll: Duration::from_millis(1000),
                monitor_interval: Duration::from_millis(5000),
            }
        }
    }

    impl PanelConfig {
        pub fn from_json_str(text: &str) -> Result<Self> {
            serde_json::from_str(text).context("parsing panel configuration")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json_str(&text).with_context(|| format!("loading {:?}", path))
        }

        pub fn classifier(&self) -> LineClassifier {
            self.extra_keywords
                .iter()
                .fold(LineClassifier::default(), |c, kw| c.with_keyword(kw.as_str()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_object_yields_defaults() {
            let cfg = PanelConfig::from_json_str("{}").expect("parse");
            assert_eq!(cfg, PanelConfig::default());
        }

        #[test]
        fn durations_are_milliseconds() {
            let cfg = PanelConfig::from_json_str(
                r#"{"debounce": 0, "monitor_interval": 250, "extra_keywords": ["milestone"]}"#,
            )
            .expect("parse");
            assert_eq!(cfg.debounce, Duration::ZERO);
            assert_eq!(cfg.monitor_interval, Duration::from_millis(250));
            assert!(cfg.classifier().is_structure_start("milestone: launch"));
        }

        #[test]
        fn load_reports_the_path() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("panel.json");
            fs::write(&path, "{ not json").expect("write");
            let err = PanelConfig::load(&path).expect_err("invalid json");
            assert!(format!("{err:#}").contains("panel.json"));
        }
    }
}

pub mod classify {
    //! Line classification for the timeline format.
    //!
    //! The locator only needs to know where an event, section or group starts;
    //! everything else is body text. Rules are tried in order and match a prefix
    //! of the line after leading whitespace, ignoring case.

    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag_no_case, take_while, take_while1, take_while_m_n},
        character::complete::{char, one_of},
        combinator::{opt, recognize},
        error::VerboseError,
        sequence::tuple,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub const STRUCTURE_KEYWORDS: [&str; 5] =
        ["section", "endSection", "group", "endGroup", "timeline"];

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LineKind {
        /// `2024-01-31`, `2024/1/31`
        IsoDate,
        /// `Jan 31, 2024`, `september 3 2023`
        MonthDate,
        /// Events anchored at `now`.
        Now,
        Keyword(String),
    }

    impl LineKind {
        fn matches_prefix(&self, s: &str) -> bool {
            match self {
                LineKind::IsoDate => iso_date_prefix(s).is_ok(),
                LineKind::MonthDate => month_date_prefix(s).is_ok(),
                LineKind::Now => keyword_prefix("now", s).is_ok(),
                LineKind::Keyword(kw) => keyword_prefix(kw, s).is_ok(),
            }
        }
    }

    /// Ordered set of structural-line rules.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LineClassifier {
        rules: Vec<LineKind>,
    }

    impl Default for LineClassifier {
        fn default() -> Self {
            let mut rules = vec![LineKind::IsoDate, LineKind::MonthDate, LineKind::Now];
            rules.extend(
                STRUCTURE_KEYWORDS
                    .iter()
                    .map(|kw| LineKind::Keyword(kw.to_string())),
            );
            Self { rules }
        }
    }

    impl LineClassifier {
        /// Add a structural keyword; blank and duplicate keywords are ignored.
        pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
            let keyword = keyword.into();
            let keyword = keyword.trim();
            let exists = self.rules.iter().any(
                |r| matches!(r, LineKind::Keyword(k) if k.eq_ignore_ascii_case(keyword)),
            );
            if !keyword.is_empty() && !exists {
                self.rules.push(LineKind::Keyword(keyword.to_string()));
            }
            self
        }

        pub fn rules(&self) -> &[LineKind] {
            &self.rules
        }

        pub fn classify(&self, line: &str) -> Option<&LineKind> {
            let rest = line.trim_start();
            self.rules.iter().find(|rule| rule.matches_prefix(rest))
        }

        pub fn is_structure_start(&self, line: &str) -> bool {
            self.classify(line).is_some()
        }
    }

    /* ------------------------------ Parsers ------------------------------ */

    fn keyword_prefix<'a>(kw: &'a str, i: &'a str) -> PResult<'a, &'a str> {
        tag_no_case(kw)(i)
    }

    fn digits(m: usize, n: usize) -> impl Fn(&str) -> PResult<'_, &str> {
        move |i: &str| take_while_m_n(m, n, |c: char| c.is_ascii_digit())(i)
    }

    fn iso_date_prefix(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            digits(4, 4),
            one_of("-/"),
            digits(1, 2),
            one_of("-/"),
            digits(1, 2),
        )))(i)
    }

    fn month_name(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            alt((
                tag_no_case("jan"),
                tag_no_case("feb"),
                tag_no_case("mar"),
                tag_no_case("apr"),
                tag_no_case("may"),
                tag_no_case("jun"),
                tag_no_case("jul"),
                tag_no_case("aug"),
                tag_no_case("sep"),
                tag_no_case("oct"),
                tag_no_case("nov"),
                tag_no_case("dec"),
            )),
            take_while(|c: char| c.is_ascii_alphabetic()),
        )))(i)
    }

    fn month_date_prefix(i: &str) -> PResult<'_, &str> {
        let (i, _) = month_name(i)?;
        let (i, _) = take_while1(char::is_whitespace)(i)?;
        // A two-digit day is tried first; `Jan 12024` still reads as day 1, year 2024.
        alt((day_then_year(2), day_then_year(1)))(i)
    }

    fn day_then_year(width: usize) -> impl Fn(&str) -> PResult<'_, &str> {
        move |i: &str| {
            recognize(tuple((
                digits(width, width),
                opt(char(',')),
                take_while(char::is_whitespace),
                digits(4, 4),
            )))(i)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn dates_start_events() {
            let c = LineClassifier::default();
            assert_eq!(c.classify("2024-01-31: Launch"), Some(&LineKind::IsoDate));
            assert_eq!(c.classify("  2024/1/3 / 2024/2/1: Trip"), Some(&LineKind::IsoDate));
            assert_eq!(c.classify("Jan 5, 2024: Party"), Some(&LineKind::MonthDate));
            assert_eq!(c.classify("september 12 2023: Move"), Some(&LineKind::MonthDate));
            assert_eq!(c.classify("Jan 12024: odd"), Some(&LineKind::MonthDate));
            assert_eq!(c.classify("now: Ongoing"), Some(&LineKind::Now));
        }

        #[test]
        fn keywords_match_as_prefixes() {
            let c = LineClassifier::default();
            assert!(matches!(c.classify("section Work"), Some(LineKind::Keyword(k)) if k == "section"));
            assert!(matches!(c.classify("\tendSection"), Some(LineKind::Keyword(k)) if k == "endSection"));
            assert!(matches!(c.classify("GROUP Travel"), Some(LineKind::Keyword(k)) if k == "group"));
            assert!(c.is_structure_start("timeline"));
            assert!(c.is_structure_start("nowhere to go"));
        }

        #[test]
        fn body_lines_are_not_structural() {
            let c = LineClassifier::default();
            for line in [
                "",
                "- [ ] pack bags",
                "Notes about 2024-01-01",
                "title: Trips",
                "20245-1-1",
                "January",
                "Jan 5",
            ] {
                assert!(!c.is_structure_start(line), "{line:?}");
            }
        }

        #[test]
        fn extra_keywords_extend_the_rule_list() {
            let c = LineClassifier::default()
                .with_keyword("milestone")
                .with_keyword("Milestone")
                .with_keyword("  ");
            assert_eq!(c.rules().len(), LineClassifier::default().rules().len() + 1);
            assert!(c.is_structure_start("  Milestone v1"));
        }
    }
}

pub mod checkbox {
    //! Checkbox tokens: `[ ]`, `[x]` and `[X]`.
    //!
    //! Rendering and patching both walk a line through `tokens`, so the ordinal
    //! a rendered checkbox carries is the ordinal the patcher rewrites.

    use crate::model::CheckState;

    pub const TOKEN_LEN: usize = 3;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CheckboxToken {
        /// Byte offset of the opening bracket.
        pub start: usize,
        pub state: CheckState,
    }

    /// Left-to-right, non-overlapping scan for checkbox tokens.
    #[derive(Debug, Clone)]
    pub struct Tokens<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    pub fn tokens(line: &str) -> Tokens<'_> {
        Tokens {
            bytes: line.as_bytes(),
            pos: 0,
        }
    }

    impl Iterator for Tokens<'_> {
        type Item = CheckboxToken;

        fn next(&mut self) -> Option<CheckboxToken> {
            while self.pos + TOKEN_LEN <= self.bytes.len() {
                let at = self.pos;
                if self.bytes[at] == b'[' && self.bytes[at + 2] == b']' {
                    if let Some(state) = CheckState::from_marker(self.bytes[at + 1]) {
                        self.pos = at + TOKEN_LEN;
                        return Some(CheckboxToken { start: at, state });
                    }
                }
                self.pos += 1;
            }
            None
        }
    }

    pub fn count(line: &str) -> usize {
        tokens(line).count()
    }

    /// Rewrite checkbox `ordinal` of `line` to `state`. Every byte outside that
    /// token is preserved; an ordinal past the last token returns the line as is.
    pub fn toggle(line: &str, ordinal: usize, state: CheckState) -> String {
        let Some(token) = tokens(line).nth(ordinal) else {
            return line.to_string();
        };
        let mut out = String::with_capacity(line.len());
        out.push_str(&line[..token.start]);
        out.push('[');
        out.push(state.marker());
        out.push(']');
        out.push_str(&line[token.start + TOKEN_LEN..]);
        out
    }

}

pub mod locate {
    //! Event locator: finds the body of one event inside a timeline document.
    //!
    //! Strategy:
    //! - Restrict the search to the first tagged fence, or to the whole document
    //!   when it looks like timeline source on its own.
    //! - Primary scan: the first structural line matching the title pattern opens
    //!   the block; the next structural line closes it.
    //! - Fallback scan: the first line containing the title verbatim opens the
    //!   block; a structural line or a blank line after some body closes it.
    //! - The header line is dropped; callers get the trimmed body.

    use crate::classify::LineClassifier;
    use crate::config::PanelConfig;
    use regex::{Captures, Regex};
    use std::sync::LazyLock;
    use tracing::debug;

    const DEFAULT_FENCE_TAGS: [&str; 2] = ["markwhen", "mw"];

    static DEFAULT_FENCE: LazyLock<Regex> =
        LazyLock::new(|| fence_regex(&DEFAULT_FENCE_TAGS).expect("valid fence regex"));

    static IMPLICIT_DATE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"[0-9]{4}[-/][0-9]{1,2}[-/][0-9]{1,2}").expect("valid date regex")
    });

    static MONTH_WORD: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?i)\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\b",
        )
        .expect("valid month regex")
    });

    const MONTH_NAMES: [(&str, &str); 12] = [
        ("jan", "january"),
        ("feb", "february"),
        ("mar", "march"),
        ("apr", "april"),
        ("may", "may"),
        ("jun", "june"),
        ("jul", "july"),
        ("aug", "august"),
        ("sep", "september"),
        ("oct", "october"),
        ("nov", "november"),
        ("dec", "december"),
    ];

    /// The body of one event as found in a document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LocatedBlock {
        /// Trimmed body, header line removed.
        pub body: String,
        /// Byte offset of `body` inside the searched document.
        pub offset: usize,
    }

    #[derive(Debug, Clone)]
    pub struct Locator {
        classifier: LineClassifier,
        fence: Regex,
    }

    impl Default for Locator {
        fn default() -> Self {
            Self {
                classifier: LineClassifier::default(),
                fence: DEFAULT_FENCE.clone(),
            }
        }
    }

    impl Locator {
        pub fn new<S: AsRef<str>>(
            classifier: LineClassifier,
            fence_tags: &[S],
        ) -> Result<Self, regex::Error> {
            let tags: Vec<&str> = fence_tags
                .iter()
                .map(|t| t.as_ref().trim())
                .filter(|t| !t.is_empty())
                .collect();
            let fence = if tags.is_empty() {
                debug!("no fence tags configured; using the defaults");
                DEFAULT_FENCE.clone()
            } else {
                fence_regex(&tags)?
            };
            Ok(Self { classifier, fence })
        }

        pub fn from_config(config: &PanelConfig) -> Result<Self, regex::Error> {
            Self::new(config.classifier(), &config.fence_tags)
        }

        pub fn classifier(&self) -> &LineClassifier {
            &self.classifier
        }

        pub fn has_fence(&self, text: &str) -> bool {
            self.fence.is_match(text)
        }

        /// The part of `document` holding timeline source, with its byte offset.
        pub fn searchable_region<'a>(&self, document: &'a str) -> Option<(usize, &'a str)> {
            if let Some(inner) = self.fence.captures(document).and_then(|c| c.get(1)) {
                return Some((inner.start(), inner.as_str()));
            }
            if looks_like_timeline(document) {
                Some((0, document))
            } else {
                None
            }
        }

        pub fn locate(&self, document: &str, title: &str) -> Option<String> {
            self.locate_block(document, title).map(|b| b.body)
        }

        pub fn locate_block(&self, document: &str, title: &str) -> Option<LocatedBlock> {
            let Some((region_offset, region)) = self.searchable_region(document) else {
                debug!("document has no timeline region");
                return None;
            };
            let lines = split_lines(region);

            let (first, last) = match self.primary_scan(&lines, title) {
                Some(span) => span,
                None => match self.fallback_scan(&lines, title) {
                    Some(span) => {
                        debug!(title, "title pattern missed; using verbatim match");
                        span
                    }
                    None => {
                        debug!(title, "event not found");
                        return None;
                    }
                },
            };

            let start = lines[first].0;
            let end = lines[last].0 + lines[last].1.len();
            let (rel, body) = body_of(&region[start..end])?;
            Some(LocatedBlock {
                body: body.to_string(),
                offset: region_offset + start + rel,
            })
        }

        fn primary_scan(&self, lines: &[(usize, &str)], title: &str) -> Option<(usize, usize)> {
            let pattern = title_pattern(title)?;
            let mut span: Option<(usize, usize)> = None;
            for (idx, (_, line)) in lines.iter().enumerate() {
                if self.classifier.is_structure_start(line) {
                    if span.is_some() {
                        break;
                    }
                    if pattern.is_match(line) {
                        span = Some((idx, idx));
                        continue;
                    }
                }
                if let Some((_, last)) = span.as_mut() {
                    *last = idx;
                }
            }
            span
        }

        fn fallback_scan(&self, lines: &[(usize, &str)], title: &str) -> Option<(usize, usize)> {
            let title = title.trim();
            if title.is_empty() {
                return None;
            }
            let header = lines.iter().position(|(_, line)| line.contains(title))?;
            let mut last = header;
            for (idx, (_, line)) in lines.iter().enumerate().skip(header + 1) {
                if self.classifier.is_structure_start(line) {
                    break;
                }
                if line.trim().is_empty() && last > header {
                    break;
                }
                last = idx;
            }
            Some((header, last))
        }
    }

    /// Locate with the default fence tags and structural keywords.
    pub fn locate(document: &str, title: &str) -> Option<String> {
        Locator::default().locate(document, title)
    }

    /// Case-insensitive pattern requiring the title's words in order, with
    /// anything (newlines included) between them. `None` for a blank title.
    pub fn title_pattern(title: &str) -> Option<Regex> {
        let parts: Vec<String> = title.split_whitespace().map(escape_part).collect();
        if parts.is_empty() {
            return None;
        }
        match Regex::new(&format!("(?i){}", parts.join("(?s:.*?)"))) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                debug!(title, error = %err, "title pattern rejected; only the verbatim scan applies");
                None
            }
        }
    }

    fn escape_part(part: &str) -> String {
        let escaped = regex::escape(part);
        MONTH_WORD
            .replace_all(&escaped, |caps: &Captures| {
                let word = caps[1].to_ascii_lowercase();
                MONTH_NAMES
                    .iter()
                    .find(|(abbr, _)| word.starts_with(abbr))
                    .map(|(abbr, full)| format!("(?:{full}|{abbr})"))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn fence_regex<S: AsRef<str>>(tags: &[S]) -> Result<Regex, regex::Error> {
        let alternatives = tags
            .iter()
            .map(|t| regex::escape(t.as_ref()))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"(?is)```(?:{alternatives})\s+(.*?)\s*```"))
    }

    fn looks_like_timeline(document: &str) -> bool {
        document.trim().starts_with("section:") || IMPLICIT_DATE.is_match(document)
    }

    fn split_lines(text: &str) -> Vec<(usize, &str)> {
        let mut offset = 0;
        text.split('\n')
            .map(|line| {
                let at = offset;
                offset += line.len() + 1;
                (at, line)
            })
            .collect()
    }

    /// Drop the header line of `block`; returns the trimmed body and its offset.
    fn body_of(block: &str) -> Option<(usize, &str)> {
        let lead = block.len() - block.trim_start().len();
        let (header, rest) = block.trim().split_once('\n')?;
        let body = rest.trim();
        if body.is_empty() {
            return None;
        }
        let body_at = lead + header.len() + 1 + (rest.len() - rest.trim_start().len());
        Some((body_at, body))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const TRIPS: &str = "# Travel\n\n```markwhen\ntitle: Trips\n\n2024-01-01 / 2024-01-05: Trip A\n  - [ ] pack bags\n  - [x] book hotel\n2024-02-01 / 2024-02-03: Trip B\n  - [ ] rent car\n  - [ ] call [[Bob]]\n```\n\nAfter the fence.\n";

        fn assert_anchored(doc: &str, block: &LocatedBlock) {
            assert_eq!(&doc[block.offset..block.offset + block.body.len()], block.body);
        }

        #[test]
        fn finds_only_the_selected_event() {
            let a = Locator::default().locate_block(TRIPS, "Trip A").expect("trip a");
            assert_eq!(a.body, "- [ ] pack bags\n  - [x] book hotel");
            assert_anchored(TRIPS, &a);

            let b = Locator::default().locate_block(TRIPS, "Trip B").expect("trip b");
            assert_eq!(b.body, "- [ ] rent car\n  - [ ] call [[Bob]]");
            assert_anchored(TRIPS, &b);
        }

        #[test]
        fn title_words_may_be_separated() {
            assert_eq!(
                locate(TRIPS, "trip b").as_deref(),
                Some("- [ ] rent car\n  - [ ] call [[Bob]]")
            );
            let doc = "2024-03-01: Kickoff (phase 1) of the big project\n  notes\n";
            assert_eq!(locate(doc, "Kickoff project").as_deref(), Some("notes"));
            assert_eq!(locate(doc, "Kickoff (phase").as_deref(), Some("notes"));
        }

        #[test]
        fn month_words_match_either_form() {
            let doc = "section: Trips\nJan 5, 2024: Ski week\n  bring gloves\nendSection\n";
            assert_eq!(locate(doc, "January 5 Ski").as_deref(), Some("bring gloves"));
            let pattern = title_pattern("Sept").expect("pattern");
            assert!(pattern.is_match("2024-09-01: september review"));
        }

        #[test]
        fn section_markers_close_the_block() {
            let doc = "section Work\n2024-05-01: Release\n  ship it\n  [ ] tag\nendSection\nleftover\n";
            assert_eq!(locate(doc, "Release").as_deref(), Some("ship it\n  [ ] tag"));
        }

        #[test]
        fn whole_document_needs_a_timeline_signal() {
            assert_eq!(locate("Plain note\nTrip A\n  body\n", "Trip A"), None);
            let doc = "section: Plans\nTrip A idea\n  body line\n";
            assert_eq!(locate(doc, "Trip A").as_deref(), Some("body line"));
        }

        #[test]
        fn fallback_stops_at_a_blank_line_after_body() {
            let doc = "```mw\n2024-01-01: Start\nAgenda: Trip A\n\n  first\n  second\n\n  unrelated\n```";
            // The header is not structural, so only the verbatim fallback finds it.
            assert_eq!(locate(doc, "Agenda: Trip A").as_deref(), Some("first\n  second"));
        }

        #[test]
        fn header_only_events_are_not_found() {
            let doc = "2024-01-01: Lonely\n2024-01-02: Next\n  body\n";
            assert_eq!(locate(doc, "Lonely"), None);
            assert_eq!(locate(doc, "   "), None);
            assert_eq!(locate(doc, "Missing"), None);
        }

        #[test]
        fn custom_fence_tags() {
            let locator =
                Locator::new(LineClassifier::default(), &["timeline"]).expect("locator");
            let doc = "```timeline\n2024-01-01: Alpha\n  one\n```\n";
            assert_eq!(locator.locate(doc, "Alpha").as_deref(), Some("one"));
            assert!(locator.has_fence(doc));
            assert!(!Locator::default().has_fence(doc));
        }

        #[test]
        fn blank_fence_tags_fall_back_to_the_defaults() {
            let none: [&str; 0] = [];
            for tags in [&none[..], &["", "  "][..]] {
                let locator = Locator::new(LineClassifier::default(), tags).expect("locator");
                assert!(!locator.has_fence("```\n2024-01-01: Alpha\n  one\n```\n"));
                assert!(!locator.has_fence("```rust\nfn main() {}\n```\n"));
                assert!(locator.has_fence("```mw\n2024-01-01: Alpha\n  one\n```\n"));
            }
        }

        #[test]
        fn oversized_title_still_gets_the_verbatim_scan() {
            let title = format!("Big {}", "word ".repeat(200_000));
            let title = title.trim();
            assert!(title_pattern(title).is_none());
            let doc = format!("```mw\n2024-01-01: Start\nAgenda {title}\n  item\n```");
            assert_eq!(locate(&doc, title).as_deref(), Some("item"));
        }
    }
}

pub mod reconcile {
    //! Write-back of an edited event body into the full document text.

    /// Replace the first verbatim occurrence of `previous` in `document` with
    /// `replacement`. `None` when `previous` is empty or no longer present.
    pub fn reconcile(document: &str, previous: &str, replacement: &str) -> Option<String> {
        reconcile_at(document, previous, replacement, None).map(|(text, _)| text)
    }

    /// Like [`reconcile`], but prefers the occurrence starting at `hint` when it
    /// still holds `previous`. Returns the new text and the offset used.
    pub fn reconcile_at(
        document: &str,
        previous: &str,
        replacement: &str,
        hint: Option<usize>,
    ) -> Option<(String, usize)> {
        if previous.is_empty() {
            return None;
        }
        let at = hint
            .filter(|&o| document.get(o..).is_some_and(|rest| rest.starts_with(previous)))
            .or_else(|| document.find(previous))?;
        let mut out = String::with_capacity(document.len() - previous.len() + replacement.len());
        out.push_str(&document[..at]);
        out.push_str(replacement);
        out.push_str(&document[at + previous.len()..]);
        Some((out, at))
    }

    /// Strip the smallest leading-whitespace width of the non-blank lines from
    /// every line.
    pub fn remove_common_indent(content: &str) -> String {
        let indent = content
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.chars().take_while(|c| c.is_whitespace()).count())
            .min();
        content
            .split('\n')
            .map(|line| match indent {
                Some(n) => line.char_indices().nth(n).map_or("", |(at, _)| &line[at..]),
                None => "",
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

}

pub mod duration {
    //! Event duration text for date expressions such as `2024-01-01 / now`.

    use crate::model::DomainError;
    use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_while1, take_while_m_n},
        character::complete::char,
        combinator::{all_consuming, map_res, verify},
        error::VerboseError,
        sequence::tuple,
    };
    use tracing::warn;

    pub const UNKNOWN: &str = "Duration: Unknown";

    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Duration of `expr` relative to the local clock.
    pub fn duration(expr: &str) -> String {
        duration_at(expr, Local::now().naive_local())
    }

    /// Inclusive day count: `ceil(|end - start| in days) + 1`. A single bound is
    /// one day; unparsable bounds count as `now`.
    pub fn duration_at(expr: &str, now: NaiveDateTime) -> String {
        if expr.trim().is_empty() {
            return UNKNOWN.to_string();
        }
        let mut parts = expr.split('/');
        let start = resolve(parts.next().unwrap_or_default(), now);
        let end = match parts.next() {
            None => return "1 day".to_string(),
            Some(p) if p.trim().eq_ignore_ascii_case("now") => now,
            Some(p) => resolve(p, now),
        };
        let millis = (end - start).num_milliseconds().unsigned_abs();
        let days = millis.div_ceil(86_400_000) + 1;
        format!("{days} day{}", if days == 1 { "" } else { "s" })
    }

    fn resolve(part: &str, now: NaiveDateTime) -> NaiveDateTime {
        match parse_date(part) {
            Ok(date) => date.and_time(NaiveTime::MIN),
            Err(err) => {
                warn!(error = %err, "using the current moment");
                now
            }
        }
    }

    /// Accepts `YYYY-M-D` and `D Mon YYYY`.
    pub fn parse_date(s: &str) -> Result<NaiveDate, DomainError> {
        all_consuming(alt((iso_date, day_month_year)))(s.trim())
            .map(|(_, date)| date)
            .map_err(|_| DomainError::UnparsableDate(s.trim().to_string()))
    }

    fn number<T: std::str::FromStr>(
        m: usize,
        n: usize,
    ) -> impl Fn(&str) -> PResult<'_, T> {
        move |i: &str| {
            map_res(take_while_m_n(m, n, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<T>()
            })(i)
        }
    }

    fn iso_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((number::<i32>(4, 4), char('-'), number::<u32>(1, 2), char('-'), number::<u32>(1, 2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn day_month_year(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                number::<u32>(1, 2),
                take_while1(char::is_whitespace),
                verify(take_while1(|c: char| c.is_ascii_alphabetic()), |s: &str| s.len() >= 3),
                take_while1(char::is_whitespace),
                number::<i32>(4, 4),
            )),
            |(d, _, month, _, y)| {
                let month = month[..3].to_ascii_lowercase();
                let m = MONTHS.iter().position(|m| *m == month).ok_or("unknown month")?;
                NaiveDate::from_ymd_opt(y, m as u32 + 1, d).ok_or("invalid date")
            },
        )(i)
    }

}

pub mod markup {
    //! Display markup for event bodies: plain text, `[[links]]` and checkboxes.

    use crate::checkbox;
    use regex::Regex;
    use serde::Serialize;
    use std::{fmt::Write, sync::LazyLock};

    static WIKI_LINK: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("valid wiki link regex"));

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Segment {
        Text { text: String },
        Link { target: String },
        /// `line` and `index` route a toggle back to the raw line and ordinal.
        Checkbox { line: usize, index: usize, checked: bool },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct RenderedLine {
        pub index: usize,
        pub segments: Vec<Segment>,
    }

    pub fn render_content(content: &str) -> Vec<RenderedLine> {
        if content.is_empty() {
            return vec![];
        }
        content
            .split('\n')
            .enumerate()
            .map(|(idx, line)| render_line(line, idx))
            .collect()
    }

    pub fn render_line(line: &str, index: usize) -> RenderedLine {
        let mut segments = Vec::new();
        let mut cursor = 0;
        for (ordinal, token) in checkbox::tokens(line).enumerate() {
            push_text(&line[cursor..token.start], &mut segments);
            segments.push(Segment::Checkbox {
                line: index,
                index: ordinal,
                checked: token.state.is_checked(),
            });
            cursor = token.start + checkbox::TOKEN_LEN;
        }
        push_text(&line[cursor..], &mut segments);
        RenderedLine { index, segments }
    }

    /// Checkbox ordinals per rendered line.
    pub fn checkbox_positions(lines: &[RenderedLine]) -> Vec<Vec<usize>> {
        lines
            .iter()
            .map(|line| {
                line.segments
                    .iter()
                    .filter_map(|s| match s {
                        Segment::Checkbox { index, .. } => Some(*index),
                        _ => None,
                    })
                    .collect()
            })
            .collect()
    }

    // Links are only recognised between checkboxes, never across one.
    fn push_text(text: &str, out: &mut Vec<Segment>) {
        let mut cursor = 0;
        for caps in WIKI_LINK.captures_iter(text) {
            let (Some(whole), Some(target)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            push_plain(&text[cursor..whole.start()], out);
            out.push(Segment::Link {
                target: target.as_str().to_string(),
            });
            cursor = whole.end();
        }
        push_plain(&text[cursor..], out);
    }

    fn push_plain(text: &str, out: &mut Vec<Segment>) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Text { text: prev }) = out.last_mut() {
            prev.push_str(text);
        } else {
            out.push(Segment::Text {
                text: text.to_string(),
            });
        }
    }

    impl RenderedLine {
        pub fn plain_text(&self) -> String {
            let mut s = String::new();
            for seg in &self.segments {
                match seg {
                    Segment::Text { text } => s.push_str(text),
                    Segment::Link { target } => s.push_str(target),
                    Segment::Checkbox { checked, .. } => {
                        s.push_str(if *checked { "[x]" } else { "[ ]" })
                    }
                }
            }
            s
        }

        pub fn to_html(&self) -> String {
            let mut out = format!(r#"<div class="markwhen-line" data-index="{}">"#, self.index);
            for seg in &self.segments {
                match seg {
                    Segment::Text { text } => out.push_str(&escape_html(text)),
                    Segment::Link { target } => {
                        let target = escape_html(target);
                        let _ = write!(
                            out,
                            r##"<a href="#" class="internal-link" data-note="{target}">{target}</a>"##
                        );
                    }
                    Segment::Checkbox {
                        line,
                        index,
                        checked,
                    } => {
                        let _ = write!(
                            out,
                            r#"<input type="checkbox"{} data-line="{line}" data-index="{index}">"#,
                            if *checked { " checked" } else { "" }
                        );
                    }
                }
            }
            out.push_str("</div>");
            out
        }
    }

    pub fn escape_html(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for ch in s.chars() {
            match ch {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                '\'' => out.push_str("&#39;"),
                _ => out.push(ch),
            }
        }
        out
    }

}

pub mod storage {
    //! Host document store seam.

    use crate::model::DocPath;
    use anyhow::{Context, Result, anyhow, bail};
    use indexmap::IndexMap;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::warn;

    /// Reads and writes whole documents by path.
    pub trait DocumentStore {
        fn read(&self, path: &DocPath) -> Result<String>;

        fn write(&mut self, path: &DocPath, text: &str) -> Result<()>;

        /// Whether `path` currently names a real document.
        fn exists(&self, path: &DocPath) -> bool;

        /// Resolve the target of an internal `[[link]]` to a document path.
        fn resolve_link(&self, name: &str) -> Option<DocPath>;
    }

    /* ---------------------------- Filesystem ---------------------------- */

    /// Documents under a root directory; paths are relative to the root.
    #[derive(Debug, Clone)]
    pub struct FsDocumentStore {
        root: PathBuf,
    }

    impl FsDocumentStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn abs_path(&self, path: &DocPath) -> PathBuf {
            if path.0.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&path.0)
            }
        }

        pub fn doc_path(&self, abs: &Path) -> Option<DocPath> {
            abs.strip_prefix(&self.root)
                .ok()
                .map(|rel| DocPath::new(rel.to_string_lossy()))
        }
    }

    impl DocumentStore for FsDocumentStore {
        fn read(&self, path: &DocPath) -> Result<String> {
            let abs = self.abs_path(path);
            fs::read_to_string(&abs).with_context(|| format!("reading {:?}", abs))
        }

        fn write(&mut self, path: &DocPath, text: &str) -> Result<()> {
            let abs = self.abs_path(path);
            fs::write(&abs, text.as_bytes()).with_context(|| format!("writing {:?}", abs))
        }

        fn exists(&self, path: &DocPath) -> bool {
            self.abs_path(path).is_file()
        }

        fn resolve_link(&self, name: &str) -> Option<DocPath> {
            let target = link_target(name)?;
            if let Some(hit) = link_candidates(&target).into_iter().find(|p| self.exists(p)) {
                return Some(hit);
            }
            let wanted = target.file_name()?;
            let mut files = Vec::new();
            if let Err(err) = visit_dir(&self.root, &mut files) {
                warn!(error = %err, "scanning for link targets");
            }
            files.sort();
            files
                .into_iter()
                .filter_map(|abs| self.doc_path(&abs))
                .find(|p| link_matches(p, wanted))
        }
    }

    fn visit_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("listing {:?}", dir))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_symlink() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if file_type.is_dir() {
                visit_dir(&entry.path(), out)?;
            } else if file_type.is_file() {
                out.push(entry.path());
            }
        }
        Ok(())
    }

    /* ------------------------------ Memory ------------------------------ */

    /// In-memory documents, kept in insertion order.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryDocumentStore {
        docs: IndexMap<DocPath, String>,
    }

    impl MemoryDocumentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, path: impl AsRef<str>, text: impl Into<String>) -> DocPath {
            let path = DocPath::new(path);
            self.docs.insert(path.clone(), text.into());
            path
        }

        pub fn get(&self, path: &DocPath) -> Option<&str> {
            self.docs.get(path).map(String::as_str)
        }

        pub fn remove(&mut self, path: &DocPath) -> Option<String> {
            self.docs.shift_remove(path)
        }
    }

    impl DocumentStore for MemoryDocumentStore {
        fn read(&self, path: &DocPath) -> Result<String> {
            self.get(path)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("document {} not found", path))
        }

        fn write(&mut self, path: &DocPath, text: &str) -> Result<()> {
            match self.docs.get_mut(path) {
                Some(slot) => {
                    *slot = text.to_string();
                    Ok(())
                }
                None => bail!("document {} not found", path),
            }
        }

        fn exists(&self, path: &DocPath) -> bool {
            self.docs.contains_key(path)
        }

        fn resolve_link(&self, name: &str) -> Option<DocPath> {
            let target = link_target(name)?;
            if let Some(hit) = link_candidates(&target).into_iter().find(|p| self.exists(p)) {
                return Some(hit);
            }
            let wanted = target.file_name()?;
            self.docs.keys().find(|p| link_matches(p, wanted)).cloned()
        }
    }

    /* ------------------------------ Links ------------------------------ */

    /// `Note#Heading|Alias` → `Note`.
    fn link_target(name: &str) -> Option<DocPath> {
        let target = name.split(['|', '#']).next().unwrap_or_default().trim();
        if target.is_empty() {
            None
        } else {
            Some(DocPath::new(target))
        }
    }

    fn link_candidates(target: &DocPath) -> [DocPath; 3] {
        [
            target.clone(),
            DocPath(format!("{}.md", target.0)),
            DocPath(format!("{}.mw", target.0)),
        ]
    }

    fn link_matches(path: &DocPath, wanted: &str) -> bool {
        path.file_name() == Some(wanted) || path.stem() == Some(wanted)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn memory_store_round_trip_and_links() {
            let mut store = MemoryDocumentStore::new();
            let plan = store.insert("notes/Plan.md", "```mw\n```");
            store.insert("people/Bob.md", "Bob");

            assert!(store.exists(&plan));
            store.write(&plan, "changed").expect("write");
            assert_eq!(store.read(&plan).expect("read"), "changed");
            assert!(store.write(&DocPath::new("ghost.md"), "x").is_err());
            assert!(store.read(&DocPath::new("ghost.md")).is_err());

            assert_eq!(store.resolve_link("Bob"), Some(DocPath::new("people/Bob.md")));
            assert_eq!(store.resolve_link("Bob#Phone|call him"), Some(DocPath::new("people/Bob.md")));
            assert_eq!(store.resolve_link("notes/Plan"), Some(plan));
            assert_eq!(store.resolve_link("Alice"), None);
            assert_eq!(store.resolve_link("|alias only"), None);
        }

        #[test]
        fn fs_store_reads_writes_and_resolves() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("people")).expect("mkdir people");
            fs::create_dir_all(root.join(".trash")).expect("mkdir trash");
            fs::write(root.join("plan.md"), "2024-01-01: A\n  b\n").expect("write plan");
            fs::write(root.join("people/Bob.md"), "Bob").expect("write bob");
            fs::write(root.join(".trash/Alice.md"), "gone").expect("write alice");

            let mut store = FsDocumentStore::new(root);
            let plan = DocPath::new("plan.md");
            assert!(store.exists(&plan));
            assert!(!store.exists(&DocPath::new("people")));
            store.write(&plan, "new").expect("write");
            assert_eq!(store.read(&plan).expect("read"), "new");

            assert_eq!(store.resolve_link("plan"), Some(plan));
            assert_eq!(store.resolve_link("Bob"), Some(DocPath::new("people/Bob.md")));
            assert_eq!(store.resolve_link("Alice"), None);

            let err = store.read(&DocPath::new("missing.md")).expect_err("missing");
            assert!(format!("{err:#}").contains("missing.md"));
        }
    }
}

pub mod selection {
    //! Selection signal cleanup: ellipsis stripping, debounce and dedupe.

    use crate::model::EventSelection;
    use std::time::{Duration, Instant};
    use tracing::debug;

    /// Drop truncation markers the timeline adds to long titles.
    pub fn clean_title(raw: &str) -> String {
        raw.replace('\u{2026}', "").replace("...", "").trim().to_string()
    }

    pub type SelectionCallback = Box<dyn FnMut(&EventSelection)>;

    /// Turns raw clicks into accepted selections and fans them out.
    pub struct SelectionHub {
        debounce: Duration,
        last_click: Option<Instant>,
        last_id: Option<String>,
        callbacks: Vec<SelectionCallback>,
    }

    impl SelectionHub {
        pub fn new(debounce: Duration) -> Self {
            Self {
                debounce,
                last_click: None,
                last_id: None,
                callbacks: vec![],
            }
        }

        pub fn on_event_selected(&mut self, callback: impl FnMut(&EventSelection) + 'static) {
            self.callbacks.push(Box::new(callback));
        }

        /// Accept or drop one click. Clicks inside the debounce window, blank
        /// titles and repeats of the last accepted event are dropped.
        pub fn dispatch(&mut self, raw_title: &str, raw_date: &str, at: Instant) -> Option<EventSelection> {
            if let Some(prev) = self.last_click {
                if at.saturating_duration_since(prev) < self.debounce {
                    debug!("selection debounced");
                    return None;
                }
            }
            self.last_click = Some(at);

            let title = clean_title(raw_title);
            if title.is_empty() {
                return None;
            }
            let selection = EventSelection::new(title, raw_date.trim());
            let id = selection.id();
            if self.last_id.as_deref() == Some(id.as_str()) {
                debug!(%id, "selection unchanged");
                return None;
            }
            self.last_id = Some(id);

            for callback in &mut self.callbacks {
                callback(&selection);
            }
            Some(selection)
        }

        /// Let the next selection through even if it repeats the last one.
        pub fn forget_last(&mut self) {
            self.last_id = None;
        }
    }

}

pub mod monitor {
    //! Liveness supervision for the timeline rendering surface.
    //!
    //! The surface (an embedded renderer with its own lifecycle) can disappear
    //! and come back at any time. `SurfaceMonitor` keeps a subscription alive:
    //! it retries while detached, checks liveness while attached, and feeds raw
    //! clicks through a `SelectionHub`. Time is passed in by the host, so the
    //! monitor owns no timers.

    use crate::config::PanelConfig;
    use crate::model::EventSelection;
    use crate::selection::SelectionHub;
    use anyhow::Result;
    use std::time::{Duration, Instant};
    use tracing::{debug, info, warn};

    /// A click as the surface reported it, before cleanup.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RawSelection {
        pub title: String,
        pub date: String,
        pub at: Instant,
    }

    /// Capability handle for the rendering surface.
    pub trait SelectionSurface {
        /// The surface is present in the host UI.
        fn is_live(&self) -> bool;

        /// The surface finished loading and can take a subscription.
        fn is_ready(&self) -> bool;

        fn subscribe(&mut self) -> Result<()>;

        /// Clicks received since the previous call.
        fn drain(&mut self) -> Vec<RawSelection>;
    }

    pub struct SurfaceMonitor<S> {
        surface: S,
        hub: SelectionHub,
        attach_poll: Duration,
        monitor_interval: Duration,
        attached: bool,
        last_attempt: Option<Instant>,
        last_check: Option<Instant>,
        subscriptions: u64,
    }

    impl<S: SelectionSurface> SurfaceMonitor<S> {
        pub fn new(surface: S, config: &PanelConfig) -> Self {
            Self {
                surface,
                hub: SelectionHub::new(config.debounce),
                attach_poll: config.attach_poll,
                monitor_interval: config.monitor_interval,
                attached: false,
                last_attempt: None,
                last_check: None,
                subscriptions: 0,
            }
        }

        pub fn on_event_selected(&mut self, callback: impl FnMut(&EventSelection) + 'static) {
            self.hub.on_event_selected(callback);
        }

        pub fn is_attached(&self) -> bool {
            self.attached
        }

        /// Number of successful subscriptions so far.
        pub fn subscriptions(&self) -> u64 {
            self.subscriptions
        }

        pub fn surface(&self) -> &S {
            &self.surface
        }

        pub fn surface_mut(&mut self) -> &mut S {
            &mut self.surface
        }

        pub fn hub_mut(&mut self) -> &mut SelectionHub {
            &mut self.hub
        }

        /// Drop the current subscription; the next tick subscribes again.
        pub fn reattach(&mut self) {
            self.attached = false;
            self.last_attempt = None;
        }

        /// Advance the monitor to `now` and return the selections accepted.
        pub fn tick(&mut self, now: Instant) -> Vec<EventSelection> {
            if self.attached && is_due(self.last_check, now, self.monitor_interval) {
                self.last_check = Some(now);
                if !self.surface.is_live() {
                    warn!("timeline surface went away; re-subscribing");
                    self.reattach();
                }
            }

            if !self.attached {
                if !is_due(self.last_attempt, now, self.attach_poll) {
                    return vec![];
                }
                self.last_attempt = Some(now);
                if !self.try_attach(now) {
                    return vec![];
                }
            }

            let raw = self.surface.drain();
            raw.into_iter()
                .filter_map(|r| self.hub.dispatch(&r.title, &r.date, r.at))
                .collect()
        }

        fn try_attach(&mut self, now: Instant) -> bool {
            if !self.surface.is_live() {
                debug!("timeline surface not present");
                return false;
            }
            if !self.surface.is_ready() {
                debug!("timeline surface still loading");
                return false;
            }
            match self.surface.subscribe() {
                Ok(()) => {
                    self.attached = true;
                    self.last_check = Some(now);
                    self.subscriptions += 1;
                    info!(subscriptions = self.subscriptions, "subscribed to timeline surface");
                    true
                }
                Err(err) => {
                    warn!(error = %err, "subscribing to timeline surface");
                    false
                }
            }
        }
    }

    fn is_due(last: Option<Instant>, now: Instant, period: Duration) -> bool {
        last.is_none_or(|t| now.saturating_duration_since(t) >= period)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use anyhow::bail;

        #[derive(Default)]
        struct FakeSurface {
            live: bool,
            ready: bool,
            refuse: bool,
            subscribe_calls: usize,
            pending: Vec<RawSelection>,
        }

        impl SelectionSurface for FakeSurface {
            fn is_live(&self) -> bool {
                self.live
            }
            fn is_ready(&self) -> bool {
                self.ready
            }
            fn subscribe(&mut self) -> Result<()> {
                self.subscribe_calls += 1;
                if self.refuse {
                    bail!("surface refused");
                }
                Ok(())
            }
            fn drain(&mut self) -> Vec<RawSelection> {
                std::mem::take(&mut self.pending)
            }
        }

        fn config() -> PanelConfig {
            PanelConfig {
                debounce: Duration::ZERO,
                attach_poll: Duration::from_secs(1),
                monitor_interval: Duration::from_secs(5),
                ..PanelConfig::default()
            }
        }

        fn click(title: &str, at: Instant) -> RawSelection {
            RawSelection {
                title: title.into(),
                date: "2024-01-01".into(),
                at,
            }
        }

        #[test]
        fn waits_for_a_ready_surface_at_the_poll_rate() {
            let t0 = Instant::now();
            let mut m = SurfaceMonitor::new(FakeSurface { live: true, ..Default::default() }, &config());
            assert!(m.tick(t0).is_empty());
            m.surface_mut().ready = true;
            m.tick(t0 + Duration::from_millis(500));
            assert!(!m.is_attached());
            m.tick(t0 + Duration::from_secs(1));
            assert!(m.is_attached());
            assert_eq!(m.surface().subscribe_calls, 1);
        }

        #[test]
        fn resubscribes_after_the_surface_returns() {
            let t0 = Instant::now();
            let surface = FakeSurface { live: true, ready: true, ..Default::default() };
            let mut m = SurfaceMonitor::new(surface, &config());
            m.tick(t0);
            assert_eq!(m.subscriptions(), 1);

            m.surface_mut().live = false;
            m.tick(t0 + Duration::from_secs(2));
            assert!(m.is_attached(), "liveness is only checked every monitor interval");
            m.tick(t0 + Duration::from_secs(5));
            assert!(!m.is_attached());

            m.surface_mut().live = true;
            m.tick(t0 + Duration::from_secs(6));
            assert!(m.is_attached());
            assert_eq!(m.subscriptions(), 2);
        }

        #[test]
        fn clicks_flow_to_callbacks_only_while_attached() {
            let t0 = Instant::now();
            let surface = FakeSurface { live: true, ready: true, refuse: true, ..Default::default() };
            let mut m = SurfaceMonitor::new(surface, &config());
            let hits = std::rc::Rc::new(std::cell::Cell::new(0));
            let counter = std::rc::Rc::clone(&hits);
            m.on_event_selected(move |_| counter.set(counter.get() + 1));

            m.surface_mut().pending.push(click("Early", t0));
            assert!(m.tick(t0).is_empty());
            assert!(!m.is_attached());

            m.surface_mut().refuse = false;
            m.surface_mut().pending.push(click("Trip A\u{2026}", t0 + Duration::from_secs(1)));
            let got = m.tick(t0 + Duration::from_secs(1));
            assert_eq!(got.len(), 2);
            assert_eq!(got[1].title, "Trip A");
            assert_eq!(hits.get(), 2);
        }
    }
}

pub mod panel {
    //! The detail panel: owns the selected event and routes edits back to the
    //! backing document.

    use crate::checkbox;
    use crate::config::PanelConfig;
    use crate::duration;
    use crate::locate::Locator;
    use crate::markup::{self, RenderedLine};
    use crate::model::{CheckState, DocPath, DomainError, EventRecord, EventSelection};
    use crate::reconcile::{reconcile_at, remove_common_indent};
    use crate::storage::DocumentStore;
    use anyhow::Result;
    use chrono::{Local, NaiveDateTime};
    use serde::Serialize;
    use tracing::{debug, info, warn};

    pub const EMPTY_MESSAGE: &str = "Select an event in MarkWhen timeline";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "state", rename_all = "snake_case")]
    pub enum DetailView {
        Empty {
            message: String,
        },
        Event {
            title: String,
            date: String,
            duration: String,
            lines: Vec<RenderedLine>,
        },
    }

    impl DetailView {
        pub fn to_text(&self) -> String {
            match self {
                Self::Empty { message } => message.clone(),
                Self::Event {
                    title,
                    date,
                    duration,
                    lines,
                } => {
                    let mut out = format!("{title}\n{date}\n{duration}\n");
                    for line in lines {
                        out.push('\n');
                        out.push_str(&line.plain_text());
                    }
                    out
                }
            }
        }

        pub fn to_html(&self) -> String {
            match self {
                Self::Empty { message } => format!(
                    r#"<div class="markwhen-empty">{}</div>"#,
                    markup::escape_html(message)
                ),
                Self::Event {
                    title,
                    date,
                    duration,
                    lines,
                } => {
                    let mut out = format!(
                        r#"<div class="markwhen-event"><h3>{}</h3><div class="markwhen-date">{}</div><div class="markwhen-duration">{}</div><div class="markwhen-content">"#,
                        markup::escape_html(title),
                        markup::escape_html(date),
                        markup::escape_html(duration),
                    );
                    for line in lines {
                        out.push_str(&line.to_html());
                    }
                    out.push_str("</div></div>");
                    out
                }
            }
        }
    }

    /// Result of a checkbox toggle that did not fail on I/O.
    #[derive(Debug)]
    pub enum ToggleOutcome {
        /// The document was rewritten; `line` is the patched raw line.
        Applied { line: String },
        /// Nothing was written.
        Skipped(DomainError),
    }

    impl ToggleOutcome {
        pub fn is_applied(&self) -> bool {
            matches!(self, Self::Applied { .. })
        }
    }

    pub struct Panel {
        locator: Locator,
        timeline_extensions: Vec<String>,
        record: Option<EventRecord>,
    }

    impl Panel {
        pub fn new(config: &PanelConfig) -> Result<Self> {
            Ok(Self {
                locator: Locator::from_config(config)?,
                timeline_extensions: config.timeline_extensions.clone(),
                record: None,
            })
        }

        pub fn record(&self) -> Option<&EventRecord> {
            self.record.as_ref()
        }

        pub fn clear(&mut self) {
            self.record = None;
        }

        /// Show `selection` from the document at `path`. A title that is not
        /// found still produces a record, with an empty body.
        pub fn select_event<S: DocumentStore + ?Sized>(
            &mut self,
            store: &S,
            path: &DocPath,
            selection: &EventSelection,
        ) -> Result<&EventRecord> {
            let text = store.read(path)?;
            let (body, offset) = match self.locator.locate_block(&text, &selection.title) {
                Some(block) => (block.body, Some(block.offset)),
                None => {
                    info!(title = %selection.title, %path, "event body not found");
                    (String::new(), None)
                }
            };
            let mut record = EventRecord::new(selection, path.clone(), body, offset);
            record.checkbox_positions =
                markup::checkbox_positions(&markup::render_content(&record.display_content));
            Ok(&*self.record.insert(record))
        }

        pub fn on_document_opened(&mut self, path: &DocPath) {
            if self.record.take().is_some() {
                debug!(%path, "document opened; clearing event");
            }
        }

        /// Re-extract the current event after its document changed outside the panel.
        pub fn on_document_modified<S: DocumentStore + ?Sized>(
            &mut self,
            store: &S,
            path: &DocPath,
        ) -> Result<()> {
            let Some(record) = self.record.as_mut() else {
                return Ok(());
            };
            if record.file_path != *path {
                return Ok(());
            }
            if !store.exists(path) {
                debug!(%path, "modified document is gone; ignoring");
                return Ok(());
            }
            let text = store.read(path)?;
            match self.locator.locate_block(&text, &record.title) {
                Some(block) => {
                    if block.body != record.raw_content {
                        debug!(%path, title = %record.title, "event changed on disk");
                    }
                    record.replace_content(block.body.clone(), block.body, Some(block.offset));
                    record.checkbox_positions = markup::checkbox_positions(&markup::render_content(
                        &record.display_content,
                    ));
                }
                None => {
                    info!(%path, title = %record.title, "event no longer in document; clearing");
                    self.record = None;
                }
            }
            Ok(())
        }

        /// Set checkbox `ordinal` on body line `line` and save the document.
        pub fn toggle_checkbox<S: DocumentStore + ?Sized>(
            &mut self,
            store: &mut S,
            line: usize,
            ordinal: usize,
            state: CheckState,
        ) -> Result<ToggleOutcome> {
            let Some(record) = self.record.as_mut() else {
                return Ok(ToggleOutcome::Skipped(DomainError::NoActiveEvent));
            };
            let mut lines: Vec<String> = record.raw_lines().into_iter().map(str::to_string).collect();
            let len = lines.len();
            let Some(target) = lines.get_mut(line) else {
                return Ok(ToggleOutcome::Skipped(DomainError::LineOutOfRange { line, len }));
            };
            if ordinal >= checkbox::count(target) {
                return Ok(ToggleOutcome::Skipped(DomainError::NoSuchCheckbox { line, ordinal }));
            }
            *target = checkbox::toggle(target, ordinal, state);
            let patched = target.clone();
            let replacement = lines.join("\n");

            let path = record.file_path.clone();
            if !store.exists(&path) {
                warn!(%path, "backing document missing; toggle skipped");
                return Ok(ToggleOutcome::Skipped(DomainError::MissingBackingFile(path)));
            }
            let text = store.read(&path)?;
            let Some((updated, at)) =
                reconcile_at(&text, &record.raw_content, &replacement, record.anchor_offset)
            else {
                warn!(%path, line, ordinal, "event content changed; toggle dropped");
                return Ok(ToggleOutcome::Skipped(DomainError::StaleAnchor(path)));
            };
            store.write(&path, &updated)?;
            info!(%path, line, ordinal, checked = state.is_checked(), "checkbox saved");

            let display = remove_common_indent(&replacement);
            record.replace_content(replacement, display, Some(at));
            record.checkbox_positions =
                markup::checkbox_positions(&markup::render_content(&record.display_content));
            Ok(ToggleOutcome::Applied { line: patched })
        }

        /// Resolve an internal link target to a document.
        pub fn follow_link<S: DocumentStore + ?Sized>(&self, store: &S, name: &str) -> Option<DocPath> {
            let hit = store.resolve_link(name);
            if hit.is_none() {
                debug!(name, "link target not found");
            }
            hit
        }

        pub fn view(&self) -> DetailView {
            self.view_at(Local::now().naive_local())
        }

        pub fn view_at(&self, now: NaiveDateTime) -> DetailView {
            match &self.record {
                None => DetailView::Empty {
                    message: EMPTY_MESSAGE.to_string(),
                },
                Some(record) => DetailView::Event {
                    title: record.title.clone(),
                    date: record.date.clone(),
                    duration: duration::duration_at(&record.date, now),
                    lines: markup::render_content(&record.display_content),
                },
            }
        }

        /// Whether a document should be searched for timeline events at all.
        pub fn is_timeline_document(&self, path: &DocPath, text: &str) -> bool {
            let by_name = path
                .file_name()
                .and_then(|name| name.rsplit_once('.'))
                .is_some_and(|(_, ext)| {
                    self.timeline_extensions
                        .iter()
                        .any(|e| e.eq_ignore_ascii_case(ext))
                });
            by_name || self.locator.has_fence(text)
        }
    }

}

pub use checkbox::toggle;
pub use duration::duration;
pub use locate::{Locator, locate};
pub use panel::Panel;
pub use reconcile::{reconcile, remove_common_indent};
