//! Keeps a Markdown checklist and a directory of iCalendar tasks in step.
//! The engine (parse, extract, reconcile, patch) is pure; filesystem access lives in
//! `storage` and `sync`, so every stage can be exercised on in-memory text.

pub mod core {
    use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Number of identifier characters embedded in the document.
    pub const TAG_LEN: usize = 8;

    /// Short identifier linking a checklist line to its record: the first eight
    /// hex characters of the record id. Displays as `#xxxxxxxx`.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(String);

    impl Tag {
        /// Accepts exactly eight lowercase hex characters.
        pub fn parse(s: &str) -> Option<Self> {
            let valid = s.len() == TAG_LEN
                && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
            valid.then(|| Self(s.to_string()))
        }

        /// Tag of a full identifier, if it starts with eight hex characters.
        pub fn of(id: &str) -> Option<Self> {
            id.get(..TAG_LEN)
                .and_then(|prefix| Self::parse(&prefix.to_ascii_lowercase()))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        /// True when `id` starts with this tag (ASCII case-insensitive).
        pub fn matches(&self, id: &str) -> bool {
            id.get(..TAG_LEN)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&self.0))
        }
    }

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "#{}", self.0)
        }
    }

    /// Source of fresh record identifiers.
    pub trait IdGenerator {
        fn generate(&mut self) -> String;

        /// A fresh identifier that starts with `tag`, used when a tagged line lost
        /// its record and the embedded tag must stay valid.
        fn generate_with_prefix(&mut self, tag: &Tag) -> String {
            let fresh = self.generate();
            format!("{}{}", tag.as_str(), fresh.get(TAG_LEN..).unwrap_or_default())
        }
    }

    /// Random v4 UUIDs in hyphenated lowercase form.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn generate(&mut self) -> String {
            Uuid::new_v4().to_string()
        }
    }

    /* ----------------------------- Byte ranges ----------------------------- */

    /// Half-open byte range into the original document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct SourceRange {
        pub start: usize,
        pub end: usize,
    }

    impl SourceRange {
        pub fn new(start: usize, end: usize) -> Self {
            Self { start, end }
        }

        pub fn slice<'a>(&self, source: &'a str) -> &'a str {
            &source[self.start..self.end]
        }

        pub fn len(&self) -> usize {
            self.end - self.start
        }

        pub fn is_empty(&self) -> bool {
            self.start == self.end
        }
    }

    /* ------------------------------ Time zones ------------------------------ */

    /// Zone in which wall-clock dates written in the document are read and rendered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DocumentZone {
        /// System zone, resolved per date so daylight-saving changes apply.
        Local,
        Fixed(FixedOffset),
    }

    impl DocumentZone {
        pub fn to_utc(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
            match self {
                DocumentZone::Fixed(offset) => offset
                    .from_local_datetime(&naive)
                    .single()
                    .map(|dt| dt.with_timezone(&Utc)),
                DocumentZone::Local => match Local.from_local_datetime(&naive).earliest() {
                    Some(dt) => Some(dt.with_timezone(&Utc)),
                    // Skipped by a forward transition: read with the offset in force around it.
                    None => Local
                        .offset_from_utc_datetime(&naive)
                        .from_local_datetime(&naive)
                        .single()
                        .map(|dt| dt.with_timezone(&Utc)),
                },
            }
        }

        pub fn format(&self, at: DateTime<Utc>, fmt: &str) -> String {
            match self {
                DocumentZone::Fixed(offset) => at.with_timezone(offset).format(fmt).to_string(),
                DocumentZone::Local => at.with_timezone(&Local).format(fmt).to_string(),
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum SyncError {
        #[error("checklist item {summary:?} has no identifier after reconciliation")]
        MissingIdentifier { summary: String },
        #[error("identifier {id:?} does not start with {len} hex characters", len = TAG_LEN)]
        InvalidIdentifier { id: String },
        #[error("edit at byte {position} overlaps the previous edit ending at byte {previous_end}")]
        OverlappingEdits {
            position: usize,
            previous_end: usize,
        },
        #[error("edit {position}..{end} does not fit the {len}-byte document")]
        EditOutOfBounds {
            position: usize,
            end: usize,
            len: usize,
        },
    }

}

mod lex {
    //! nom helpers shared by the date grammars.

    use nom::{IResult, bytes::complete::take_while_m_n, combinator::map_res, error::VerboseError};
    use std::str::FromStr;

    pub(crate) type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// `min..=max` ASCII digits parsed as `T`.
    pub(crate) fn number<'a, T: FromStr>(
        min: usize,
        max: usize,
    ) -> impl FnMut(&'a str) -> PResult<'a, T> {
        map_res(
            take_while_m_n(min, max, |c: char| c.is_ascii_digit()),
            |s: &'a str| s.parse::<T>(),
        )
    }
}

pub mod markdown {
    //! Structural Markdown parser for checklist documents.
    //!
    //! Only the shape the sync engine needs is recognised:
    //! - ATX headings (`#` to `######`), each opening a top-level `Section`;
    //! - list items (`-`, `*`, `+`, `1.`, `1)`) with an optional task marker;
    //! - lazy continuation lines of a list item;
    //! - fenced code blocks, kept opaque so their content never yields tasks.
    //!
    //! Any other non-blank line becomes a `Paragraph` block. Every node carries
    //! its byte range in the source, which is what edits are keyed on.

    use crate::core::SourceRange;
    use crate::lex::PResult;
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{digit1, one_of, space0, space1},
        combinator::{eof, map, recognize},
        sequence::{pair, preceded},
    };
    use serde::Serialize;
    use std::borrow::Cow;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum NodeKind {
        Document,
        Section,
        Heading,
        HeadingMarker,
        HeadingContent,
        List,
        ListItem,
        ListMarker,
        TaskMarkerChecked,
        TaskMarkerUnchecked,
        Paragraph,
        CodeBlock,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Node {
        pub kind: NodeKind,
        pub range: SourceRange,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub children: Vec<Node>,
    }

    impl Node {
        pub fn new(kind: NodeKind, start: usize, end: usize) -> Self {
            Self {
                kind,
                range: SourceRange::new(start, end),
                children: vec![],
            }
        }

        pub fn is(&self, kind: NodeKind) -> bool {
            self.kind == kind
        }

        pub fn text<'a>(&self, source: &'a str) -> &'a str {
            self.range.slice(source)
        }
    }

    /* ------------------------ Public entry point ------------------------ */

    /// Parse `input` into a `Document` node whose children are `Section`s.
    ///
    /// Never fails: lines that match no construct become paragraph blocks.
    pub fn parse_document(input: &str) -> Node {
        let mut builder = TreeBuilder::default();
        let mut rest = input;
        while !rest.is_empty() {
            let start = input.len() - rest.len();
            let (line, next) = split_line(rest);
            let end = input.len() - next.len();
            builder.line(start, line, end);
            rest = next;
        }
        builder.finish(input.len())
    }

    /// Line terminator of a document; its first line break decides.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum LineEnding {
        #[default]
        Lf,
        CrLf,
    }

    impl LineEnding {
        pub fn detect(source: &str) -> Self {
            match source.find('\n') {
                Some(n) if source[..n].ends_with('\r') => LineEnding::CrLf,
                _ => LineEnding::Lf,
            }
        }

        pub fn as_str(self) -> &'static str {
            match self {
                LineEnding::Lf => "\n",
                LineEnding::CrLf => "\r\n",
            }
        }
    }

    /// Prefixes a backslash when `line`, written under a list item, would open a
    /// list item or a code fence of its own. Lines already starting with
    /// backslashes before such a construct gain one more.
    pub fn escape_continuation(line: &str) -> Cow<'_, str> {
        if opens_block(line.trim_start_matches('\\')) {
            Cow::Owned(format!("\\{line}"))
        } else {
            Cow::Borrowed(line)
        }
    }

    /// Inverse of [`escape_continuation`].
    pub fn unescape_continuation(line: &str) -> &str {
        match line.strip_prefix('\\') {
            Some(rest) if opens_block(rest.trim_start_matches('\\')) => rest,
            _ => line,
        }
    }

    fn opens_block(line: &str) -> bool {
        list_item(line, 0, line.len()).is_some() || fence_open(line).is_some()
    }

    /// Splits off one line; the returned line excludes its terminator.
    fn split_line(i: &str) -> (&str, &str) {
        let (raw, rest) = match i.find('\n') {
            Some(n) => (&i[..n], &i[n + 1..]),
            None => (i, ""),
        };
        (raw.strip_suffix('\r').unwrap_or(raw), rest)
    }

    /* ---------------------------- Tree building ---------------------------- */

    #[derive(Default)]
    struct TreeBuilder {
        sections: Vec<Node>,
        section: Option<Node>,
        list: Option<Node>,
        fence: Option<(Node, char, usize)>,
        /// Set while the last list item may absorb continuation lines.
        item_open: bool,
    }

    impl TreeBuilder {
        fn line(&mut self, start: usize, line: &str, end: usize) {
            if let Some((mut block, ch, len)) = self.fence.take() {
                block.range.end = end;
                if is_fence_close(line, ch, len) {
                    self.section_at(block.range.start).children.push(block);
                } else {
                    self.fence = Some((block, ch, len));
                }
                return;
            }

            if let Some((ch, len)) = fence_open(line) {
                self.close_list();
                self.section_at(start);
                self.fence = Some((Node::new(NodeKind::CodeBlock, start, end), ch, len));
                return;
            }

            if let Ok((_, (marker, content))) = atx_heading(line) {
                self.close_section(start);
                let mut heading = Node::new(NodeKind::Heading, start, start + line.len());
                heading.children.push(Node::new(
                    NodeKind::HeadingMarker,
                    start,
                    start + marker.len(),
                ));
                let content_start = start + line.len() - content.len();
                heading.children.push(Node::new(
                    NodeKind::HeadingContent,
                    content_start,
                    start + line.len(),
                ));
                let mut section = Node::new(NodeKind::Section, start, end);
                section.children.push(heading);
                self.section = Some(section);
                return;
            }

            if let Some(item) = list_item(line, start, end) {
                self.section_at(start);
                self.list
                    .get_or_insert_with(|| Node::new(NodeKind::List, start, end))
                    .children
                    .push(item);
                self.item_open = true;
                return;
            }

            if line.trim().is_empty() {
                self.close_list();
                return;
            }

            if self.item_open {
                if let Some(item) = self.list.as_mut().and_then(|l| l.children.last_mut()) {
                    continue_item(item, line, start, end);
                    return;
                }
            }

            self.close_list();
            let text_start = start + line.len() - line.trim_start().len();
            let text_end = start + line.trim_end().len();
            self.section_at(start)
                .children
                .push(Node::new(NodeKind::Paragraph, text_start, text_end));
        }

        /// The open section, opening an implicit (heading-less) one at `start` if needed.
        fn section_at(&mut self, start: usize) -> &mut Node {
            self.section
                .get_or_insert_with(|| Node::new(NodeKind::Section, start, start))
        }

        fn close_list(&mut self) {
            self.item_open = false;
            if let Some(mut list) = self.list.take() {
                if let Some(last) = list.children.last() {
                    list.range.end = last.range.end;
                }
                let start = list.range.start;
                self.section_at(start).children.push(list);
            }
        }

        fn close_section(&mut self, end: usize) {
            self.close_list();
            if let Some((block, _, _)) = self.fence.take() {
                self.section_at(block.range.start).children.push(block);
            }
            if let Some(mut section) = self.section.take() {
                section.range.end = end;
                self.sections.push(section);
            }
        }

        fn finish(mut self, len: usize) -> Node {
            self.close_section(len);
            let mut document = Node::new(NodeKind::Document, 0, len);
            document.children = self.sections;
            document
        }
    }

    fn continue_item(item: &mut Node, line: &str, start: usize, end: usize) {
        let text_start = start + line.len() - line.trim_start().len();
        let text_end = start + line.trim_end().len();
        match item.children.last_mut() {
            Some(last) if last.is(NodeKind::Paragraph) => last.range.end = text_end,
            _ => item
                .children
                .push(Node::new(NodeKind::Paragraph, text_start, text_end)),
        }
        item.range.end = end;
    }

    /* ------------------------------ Line grammar ------------------------------ */

    /// `## Title` → (`##`, `Title`). Headings must start in column zero.
    fn atx_heading(line: &str) -> PResult<'_, (&str, &str)> {
        let (content, (marker, _)) = pair(take_while_m_n(1, 6, |c: char| c == '#'), gap)(line)?;
        Ok(("", (marker, content)))
    }

    fn gap(i: &str) -> PResult<'_, &str> {
        alt((space1, eof))(i)
    }

    fn bullet(i: &str) -> PResult<'_, &str> {
        alt((recognize(one_of("-*+")), recognize(pair(digit1, one_of(".)")))))(i)
    }

    fn task_marker(i: &str) -> PResult<'_, bool> {
        alt((
            map(tag("[ ]"), |_| false),
            map(tag("[x]"), |_| true),
            map(tag("[X]"), |_| true),
        ))(i)
    }

    /// `- [ ] text` → ListItem[ListMarker, TaskMarker*, Paragraph?].
    fn list_item(line: &str, start: usize, end: usize) -> Option<Node> {
        let at = |rest: &str| start + line.len() - rest.len();
        let (i, _) = space0::<_, nom::error::VerboseError<&str>>(line).ok()?;
        let marker_start = at(i);
        let (i, _) = bullet(i).ok()?;
        let marker_end = at(i);
        let (i, _) = gap(i).ok()?;

        let mut item = Node::new(NodeKind::ListItem, start, end);
        item.children
            .push(Node::new(NodeKind::ListMarker, marker_start, marker_end));

        let mut text = i;
        if let Ok((after, checked)) = task_marker(i) {
            if let Ok((rest, _)) = gap(after) {
                let kind = if checked {
                    NodeKind::TaskMarkerChecked
                } else {
                    NodeKind::TaskMarkerUnchecked
                };
                item.children.push(Node::new(kind, at(i), at(after)));
                text = rest;
            }
        }

        let body = text.trim_end();
        if !body.is_empty() {
            let body_start = at(text);
            item.children.push(Node::new(
                NodeKind::Paragraph,
                body_start,
                body_start + body.len(),
            ));
        }
        Some(item)
    }

    fn fence_run(i: &str) -> PResult<'_, &str> {
        preceded(
            take_while_m_n(0, 3, |c: char| c == ' '),
            alt((take_while1(|c: char| c == '`'), take_while1(|c: char| c == '~'))),
        )(i)
    }

    fn fence_open(line: &str) -> Option<(char, usize)> {
        let (_, run) = fence_run(line).ok()?;
        let ch = run.chars().next()?;
        (run.len() >= 3).then_some((ch, run.len()))
    }

    fn is_fence_close(line: &str, ch: char, len: usize) -> bool {
        let trimmed = line.trim();
        trimmed.len() >= len && trimmed.chars().all(|c| c == ch)
    }

}

pub mod extract {
    //! Walks the document tree and produces checklist items.
    //!
    //! Item text is tokenized into whitespace-separated words; a date token
    //! (`YYYY-MM-DD` plus an optional `H:MM`) and a trailing tag token
    //! (`#` + eight hex characters) are recognised and the rest is the summary.

    use crate::core::{DocumentZone, SourceRange, Tag};
    use crate::lex::{PResult, number};
    use crate::markdown::{LineEnding, Node, NodeKind, unescape_continuation};
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
    use nom::{character::complete::char, combinator::eof, sequence::tuple};
    use serde::Serialize;
    use tracing::debug;

    /// Time of day assumed for a date token written without one.
    pub const DEFAULT_TIME: (u32, u32) = (10, 0);

    /// Write targets for one item, as offsets into the original document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct ItemSpans {
        /// The three-byte `[ ]` / `[x]` token.
        pub marker: SourceRange,
        pub content_start: usize,
        /// End of the item text before the trailing tag; `content_end` when untagged.
        pub body_end: usize,
        /// End of the item text, excluding trailing whitespace and the line break.
        pub content_end: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ChecklistItem {
        pub tag: Option<Tag>,
        pub summary: String,
        pub starts_on: Option<DateTime<Utc>>,
        pub category: String,
        pub checked: bool,
        pub spans: ItemSpans,
        /// Terminator of the document the item was read from.
        pub line_ending: LineEnding,
    }

    /// Collect every checklist item of `document` in document order.
    ///
    /// Inline dates are read as wall-clock time in `zone`.
    pub fn extract_items(document: &Node, source: &str, zone: DocumentZone) -> Vec<ChecklistItem> {
        let line_ending = LineEnding::detect(source);
        let mut items = Vec::new();
        for section in document.children.iter().filter(|n| n.is(NodeKind::Section)) {
            walk_section(section, source, zone, &mut items);
        }
        for item in &mut items {
            item.line_ending = line_ending;
        }
        items
    }

    /// Canonical summary form: lines trimmed, blank lines dropped.
    pub fn normalize_summary(text: &str) -> String {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn walk_section(section: &Node, source: &str, zone: DocumentZone, out: &mut Vec<ChecklistItem>) {
        let (category, rest) = match section.children.split_first() {
            Some((first, rest)) if first.is(NodeKind::Heading) => (
                first
                    .children
                    .get(1)
                    .map(|content| content.text(source).trim().to_string())
                    .unwrap_or_default(),
                rest,
            ),
            _ => (String::new(), section.children.as_slice()),
        };

        for list in rest.iter().filter(|n| n.is(NodeKind::List)) {
            for item in &list.children {
                if let Some(item) = read_item(item, &category, source, zone) {
                    out.push(item);
                }
            }
        }
    }

    fn read_item(item: &Node, category: &str, source: &str, zone: DocumentZone) -> Option<ChecklistItem> {
        let mut children = item.children.iter();
        children.next()?;
        let marker = children.next()?;
        let checked = match marker.kind {
            NodeKind::TaskMarkerChecked => true,
            NodeKind::TaskMarkerUnchecked => false,
            _ => return None,
        };

        let content: Vec<&Node> = children.collect();
        let (Some(first), Some(last)) = (content.first(), content.last()) else {
            debug!(at = item.range.start, "skipping task item without text");
            return None;
        };
        let content_start = first.range.start;
        let content_end = last.range.end;
        let text = &source[content_start..content_end];

        let tokens = scan(text);
        let mut cuts: Vec<SourceRange> = Vec::new();
        let starts_on = tokens.date.and_then(|date| {
            cuts.push(date.range);
            let time = date.time.unwrap_or_else(|| {
                NaiveTime::from_hms_opt(DEFAULT_TIME.0, DEFAULT_TIME.1, 0).unwrap_or_default()
            });
            zone.to_utc(date.day.and_time(time))
        });
        let body_end = match &tokens.tag {
            Some((range, _)) => {
                cuts.push(*range);
                content_start + text[..range.start].trim_end().len()
            }
            None => content_end,
        };

        Some(ChecklistItem {
            tag: tokens.tag.map(|(_, tag)| tag),
            summary: unescape_continuations(&summary_without(text, &cuts)),
            starts_on,
            category: category.to_string(),
            checked,
            spans: ItemSpans {
                marker: marker.range,
                content_start,
                body_end,
                content_end,
            },
            line_ending: LineEnding::default(),
        })
    }

    /* ------------------------------- Tokens ------------------------------- */

    #[derive(Debug, Clone, Copy)]
    struct Word<'a> {
        text: &'a str,
        start: usize,
        end: usize,
    }

    #[derive(Debug, Clone, Copy)]
    struct DateToken {
        range: SourceRange,
        day: NaiveDate,
        time: Option<NaiveTime>,
    }

    #[derive(Debug, Default)]
    struct Tokens {
        date: Option<DateToken>,
        tag: Option<(SourceRange, Tag)>,
    }

    fn words(text: &str) -> Vec<Word<'_>> {
        let mut out = Vec::new();
        let mut start = None;
        for (idx, ch) in text.char_indices() {
            match (ch.is_whitespace(), start) {
                (true, Some(s)) => {
                    out.push(Word {
                        text: &text[s..idx],
                        start: s,
                        end: idx,
                    });
                    start = None;
                }
                (false, None) => start = Some(idx),
                _ => {}
            }
        }
        if let Some(s) = start {
            out.push(Word {
                text: &text[s..],
                start: s,
                end: text.len(),
            });
        }
        out
    }

    fn scan(text: &str) -> Tokens {
        let words = words(text);
        let mut tokens = Tokens::default();

        // Only the first date-shaped word is considered; an invalid one means no date.
        if let Some(pos) = words.iter().position(|w| date_token(w.text).is_ok()) {
            let word = words[pos];
            let day = date_token(word.text)
                .ok()
                .and_then(|(_, (y, m, d))| NaiveDate::from_ymd_opt(y, m, d));
            match day {
                Some(day) => {
                    let time = words
                        .get(pos + 1)
                        .filter(|next| !text[word.end..next.start].contains('\n'))
                        .and_then(|next| {
                            let (_, (h, m)) = time_token(next.text).ok()?;
                            NaiveTime::from_hms_opt(h, m, 0).map(|t| (next.end, t))
                        });
                    tokens.date = Some(DateToken {
                        range: SourceRange::new(word.start, time.map_or(word.end, |(end, _)| end)),
                        day,
                        time: time.map(|(_, t)| t),
                    });
                }
                None => debug!(token = word.text, "ignoring unparsable date"),
            }
        }

        let date_end = tokens.date.map_or(0, |d| d.range.end);
        tokens.tag = words
            .last()
            .filter(|w| w.start >= date_end)
            .and_then(|w| {
                let tag = Tag::parse(w.text.strip_prefix('#')?)?;
                Some((SourceRange::new(w.start, w.end), tag))
            });
        tokens
    }

    fn summary_without(text: &str, cuts: &[SourceRange]) -> String {
        let mut parts = Vec::with_capacity(cuts.len() + 1);
        let mut cursor = 0;
        for cut in cuts {
            parts.push(&text[cursor..cut.start]);
            cursor = cut.end;
        }
        parts.push(&text[cursor..]);
        let joined = parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        normalize_summary(&joined)
    }

    /// Drops the escape written in front of continuation lines that would open a block.
    fn unescape_continuations(summary: &str) -> String {
        summary
            .split('\n')
            .enumerate()
            .map(|(n, line)| if n == 0 { line } else { unescape_continuation(line) })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// A whole word of the form `YYYY-MM-DD`.
    fn date_token(i: &str) -> PResult<'_, (i32, u32, u32)> {
        let (i, (year, _, month, _, day, _)) = tuple((
            number::<i32>(4, 4),
            char('-'),
            number::<u32>(2, 2),
            char('-'),
            number::<u32>(2, 2),
            eof,
        ))(i)?;
        Ok((i, (year, month, day)))
    }

    /// A whole word of the form `H:MM` or `HH:MM`.
    fn time_token(i: &str) -> PResult<'_, (u32, u32)> {
        let (i, (hour, _, minute, _)) =
            tuple((number::<u32>(1, 2), char(':'), number::<u32>(2, 2), eof))(i)?;
        Ok((i, (hour, minute)))
    }

}

pub mod record {
    //! iCalendar `VTODO` codec for one-task-per-file calendar directories.

    use crate::core::Tag;
    use crate::lex::{PResult, number};
    use chrono::{DateTime, NaiveDate, Utc};
    use nom::{
        character::complete::char,
        combinator::{eof, opt},
        sequence::{preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use tracing::warn;

    pub const PRODUCT_ID: &str = "-//todosync//EN";
    /// Basic ISO-8601 UTC form used for `DUE` and `DTSTAMP`.
    pub const DUE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum TaskStatus {
        NeedsAction,
        Completed,
        InProcess,
        Cancelled,
        Other(String),
    }

    impl TaskStatus {
        pub fn parse(value: &str) -> Self {
            const KNOWN: [(&str, TaskStatus); 4] = [
                ("NEEDS-ACTION", TaskStatus::NeedsAction),
                ("COMPLETED", TaskStatus::Completed),
                ("IN-PROCESS", TaskStatus::InProcess),
                ("CANCELLED", TaskStatus::Cancelled),
            ];
            KNOWN
                .into_iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(value))
                .map(|(_, status)| status)
                .unwrap_or_else(|| TaskStatus::Other(value.to_string()))
        }

        pub fn as_str(&self) -> &str {
            match self {
                TaskStatus::NeedsAction => "NEEDS-ACTION",
                TaskStatus::Completed => "COMPLETED",
                TaskStatus::InProcess => "IN-PROCESS",
                TaskStatus::Cancelled => "CANCELLED",
                TaskStatus::Other(s) => s,
            }
        }

        pub fn from_checked(checked: bool) -> Self {
            if checked {
                TaskStatus::Completed
            } else {
                TaskStatus::NeedsAction
            }
        }

        /// Only `COMPLETED` shows as a checked box.
        pub fn is_completed(&self) -> bool {
            matches!(self, TaskStatus::Completed)
        }

        pub fn checkbox(&self) -> &'static str {
            if self.is_completed() { "[x]" } else { "[ ]" }
        }
    }

    /// One persisted task. Fields stay unset when the file lacks them.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CalendarRecord {
        pub id: Option<String>,
        pub due: Option<DateTime<Utc>>,
        pub summary: Option<String>,
        pub category: Option<String>,
        pub status: Option<TaskStatus>,
    }

    impl CalendarRecord {
        pub fn tag(&self) -> Option<Tag> {
            self.id.as_deref().and_then(Tag::of)
        }
    }

    /* ------------------------------- Parsing ------------------------------- */

    /// Parse a calendar blob. Never fails: unknown properties are ignored and
    /// malformed values leave their field unset.
    pub fn parse_record(text: &str) -> CalendarRecord {
        let mut record = CalendarRecord::default();
        for line in unfold(text) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.split(';').next().unwrap_or(name);
            if name.eq_ignore_ascii_case("UID") {
                record.id = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("DUE") {
                record.due = parse_due(value);
                if record.due.is_none() {
                    warn!(value, "ignoring malformed DUE");
                }
            } else if name.eq_ignore_ascii_case("SUMMARY") {
                record.summary = Some(unescape_text(value));
            } else if name.eq_ignore_ascii_case("CATEGORIES") {
                record.category = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("STATUS") {
                record.status = Some(TaskStatus::parse(value));
            }
        }
        record
    }

    /// Joins folded continuation lines (leading space or tab) onto their predecessor.
    fn unfold(text: &str) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for raw in text.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if let Some(continued) = line.strip_prefix([' ', '\t']) {
                if let Some(previous) = lines.last_mut() {
                    previous.push_str(continued);
                    continue;
                }
            }
            lines.push(line.to_string());
        }
        lines
    }

    /// `YYYYMMDDTHHMMSS[Z]` or a date-only `YYYYMMDD` (midnight). Always UTC.
    pub fn parse_due(value: &str) -> Option<DateTime<Utc>> {
        let (_, ((year, month, day), time)) = due_fields(value.trim()).ok()?;
        let (hour, minute, second) = time.unwrap_or((0, 0, 0));
        NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(hour, minute, second)
            .map(|naive| naive.and_utc())
    }

    fn due_fields(i: &str) -> PResult<'_, ((i32, u32, u32), Option<(u32, u32, u32)>)> {
        let (i, (date, time, _, _)) = tuple((
            tuple((
                number::<i32>(4, 4),
                number::<u32>(2, 2),
                number::<u32>(2, 2),
            )),
            opt(preceded(
                char('T'),
                tuple((
                    number::<u32>(2, 2),
                    number::<u32>(2, 2),
                    number::<u32>(2, 2),
                )),
            )),
            opt(char('Z')),
            eof,
        ))(i)?;
        Ok((i, (date, time)))
    }

    fn unescape_text(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        let mut chars = value.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n' | 'N') => out.push('\n'),
                Some(escaped @ ('\\' | ',' | ';')) => out.push(escaped),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        out
    }

    /* ----------------------------- Serializing ----------------------------- */

    pub fn format_due(due: DateTime<Utc>) -> String {
        due.format(DUE_FORMAT).to_string()
    }

    fn escape_text(value: &str) -> String {
        value.replace('\\', "\\\\").replace('\n', "\\n")
    }

    /// Render the fixed `VTODO` template. Unset fields omit their line.
    pub fn serialize_record(record: &CalendarRecord) -> String {
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            format!("PRODID:{PRODUCT_ID}"),
            "BEGIN:VTODO".to_string(),
        ];
        if let Some(id) = &record.id {
            lines.push(format!("UID:{id}"));
        }
        if let Some(due) = record.due {
            let stamp = format_due(due);
            lines.push(format!("DTSTAMP:{stamp}"));
            lines.push(format!("DUE:{stamp}"));
        }
        if let Some(summary) = &record.summary {
            lines.push(format!("SUMMARY:{}", escape_text(summary)));
        }
        if let Some(status) = &record.status {
            lines.push(format!("STATUS:{}", status.as_str()));
        }
        if let Some(category) = &record.category {
            lines.push(format!("CATEGORIES:{category}"));
        }
        lines.push("END:VTODO".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut out = lines.join("\r\n");
        out.push_str("\r\n");
        out
    }

    /// Listing order: open tasks first, then by due date (undated last), then by id.
    pub fn listing_order(a: &CalendarRecord, b: &CalendarRecord) -> Ordering {
        let done = |r: &CalendarRecord| r.status.as_ref().is_some_and(TaskStatus::is_completed);
        done(a)
            .cmp(&done(b))
            .then_with(|| match (a.due, b.due) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.id.cmp(&b.id))
    }

}

pub mod patch {
    //! Applies edits keyed to original-document offsets.

    use crate::core::{SourceRange, SyncError};
    use serde::Serialize;

    /// At byte `position` of the pristine document, remove `remove` bytes and insert `insert`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct EditOperation {
        pub insert: String,
        pub position: usize,
        pub remove: usize,
    }

    impl EditOperation {
        pub fn replace(range: SourceRange, text: impl Into<String>) -> Self {
            Self {
                insert: text.into(),
                position: range.start,
                remove: range.len(),
            }
        }

        pub fn insert(position: usize, text: impl Into<String>) -> Self {
            Self {
                insert: text.into(),
                position,
                remove: 0,
            }
        }

        pub fn end(&self) -> usize {
            self.position + self.remove
        }
    }

    /// Owns the output buffer and the running length delta for one patch pass.
    #[derive(Debug)]
    pub struct Patcher<'a> {
        original: &'a str,
        buffer: String,
        offset: isize,
    }

    impl<'a> Patcher<'a> {
        pub fn new(original: &'a str) -> Self {
            Self {
                original,
                buffer: original.to_string(),
                offset: 0,
            }
        }

        /// Apply one edit. Edits must arrive in non-decreasing, non-overlapping order.
        pub fn apply(&mut self, edit: &EditOperation) -> Result<(), SyncError> {
            let out_of_bounds = || SyncError::EditOutOfBounds {
                position: edit.position,
                end: edit.end(),
                len: self.original.len(),
            };
            if edit.end() > self.original.len()
                || !self.original.is_char_boundary(edit.position)
                || !self.original.is_char_boundary(edit.end())
            {
                return Err(out_of_bounds());
            }

            let cut_at = edit
                .position
                .checked_add_signed(self.offset)
                .ok_or_else(out_of_bounds)?;
            let cut_end = cut_at + edit.remove;
            if cut_end > self.buffer.len()
                || !self.buffer.is_char_boundary(cut_at)
                || !self.buffer.is_char_boundary(cut_end)
            {
                return Err(out_of_bounds());
            }

            self.buffer.replace_range(cut_at..cut_end, &edit.insert);
            self.offset += edit.insert.len() as isize - edit.remove as isize;
            Ok(())
        }

        pub fn finish(self) -> String {
            self.buffer
        }
    }

    /// Sort `edits` by position (stable), reject overlaps, and apply them to `original`.
    pub fn apply_edits(original: &str, edits: &[EditOperation]) -> Result<String, SyncError> {
        let mut ordered: Vec<&EditOperation> = edits.iter().collect();
        ordered.sort_by_key(|edit| edit.position);

        let mut previous_end = 0;
        for edit in &ordered {
            if edit.position < previous_end {
                return Err(SyncError::OverlappingEdits {
                    position: edit.position,
                    previous_end,
                });
            }
            previous_end = previous_end.max(edit.end());
        }

        let mut patcher = Patcher::new(original);
        for edit in ordered {
            patcher.apply(edit)?;
        }
        Ok(patcher.finish())
    }

}

pub mod reconcile {
    //! Matches checklist items to records and decides which side wins per field.
    //!
    //! Field authority is one-directional:
    //! - status and summary flow from the record into the document;
    //! - the due date flows from the document into the record;
    //! - the category always comes from the enclosing heading.

    use crate::core::{DocumentZone, IdGenerator, SourceRange, SyncError, Tag};
    use crate::extract::{ChecklistItem, normalize_summary};
    use crate::markdown::{LineEnding, escape_continuation};
    use crate::patch::EditOperation;
    use crate::record::{CalendarRecord, TaskStatus};
    use chrono::{DateTime, Timelike, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    /// Date prefix written in front of a summary.
    pub const BODY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

    /// What an item without a tag is matched against.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
    )]
    #[serde(rename_all = "kebab-case")]
    pub enum UntaggedPolicy {
        /// Untagged items never match; each becomes a new record.
        #[default]
        CreateNew,
        /// Every record is a candidate and the last one enumerated wins.
        LastRecordWins,
    }

    #[derive(Debug, Clone, Default)]
    pub struct Reconciliation {
        /// Document edits in non-decreasing position order.
        pub edits: Vec<EditOperation>,
        /// Records to persist, keyed by id, in document order.
        pub records: IndexMap<String, CalendarRecord>,
        /// Ids minted during this pass.
        pub created: Vec<String>,
    }

    #[derive(Debug, Clone)]
    pub struct Reconciler {
        zone: DocumentZone,
        now: DateTime<Utc>,
        untagged: UntaggedPolicy,
    }

    impl Reconciler {
        /// `now` is truncated to the minute so that an undated item renders and
        /// persists the same instant.
        pub fn new(zone: DocumentZone, now: DateTime<Utc>) -> Self {
            let now = now
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            Self {
                zone,
                now,
                untagged: UntaggedPolicy::default(),
            }
        }

        pub fn untagged(mut self, policy: UntaggedPolicy) -> Self {
            self.untagged = policy;
            self
        }

        pub fn zone(&self) -> DocumentZone {
            self.zone
        }

        pub fn reconcile(
            &self,
            items: &[ChecklistItem],
            records: &[CalendarRecord],
            ids: &mut dyn IdGenerator,
        ) -> Result<Reconciliation, SyncError> {
            let mut out = Reconciliation::default();
            for item in items {
                self.resolve(item, records, ids, &mut out)?;
            }
            debug_assert!(out.edits.windows(2).all(|w| w[0].end() <= w[1].position));
            Ok(out)
        }

        /// `<date> <time> <summary>`. Continuation lines are indented under the item
        /// and escaped where they would otherwise open a block of their own.
        pub fn render_body(&self, due: DateTime<Utc>, summary: &str, line_ending: LineEnding) -> String {
            let mut lines = summary.split('\n');
            let mut body = format!(
                "{} {}",
                self.zone.format(due, BODY_DATE_FORMAT),
                lines.next().unwrap_or_default()
            );
            for line in lines {
                body.push_str(line_ending.as_str());
                body.push_str("  ");
                body.push_str(&escape_continuation(line));
            }
            body.trim_end().to_string()
        }

        fn candidates<'r>(&self, item: &ChecklistItem, records: &'r [CalendarRecord]) -> Vec<(&'r str, &'r CalendarRecord)> {
            records
                .iter()
                .filter_map(|record| record.id.as_deref().map(|id| (id, record)))
                .filter(|(id, _)| match (&item.tag, self.untagged) {
                    (Some(tag), _) => tag.matches(id),
                    (None, UntaggedPolicy::CreateNew) => false,
                    (None, UntaggedPolicy::LastRecordWins) => Tag::of(id).is_some(),
                })
                .collect()
        }

        fn resolve(
            &self,
            item: &ChecklistItem,
            records: &[CalendarRecord],
            ids: &mut dyn IdGenerator,
            out: &mut Reconciliation,
        ) -> Result<(), SyncError> {
            let mut id: Option<String> = None;
            let mut status = TaskStatus::from_checked(item.checked);
            let mut summary = item.summary.clone();
            let mut summary_due = None;
            let mut record_due = None;

            // Later candidates overwrite earlier ones.
            for (candidate_id, candidate) in self.candidates(item, records) {
                id = Some(candidate_id.to_string());
                if let Some(candidate_status) = &candidate.status {
                    status = candidate_status.clone();
                }
                if let Some(candidate_summary) = candidate.summary.as_deref().map(normalize_summary) {
                    if candidate_summary != summary {
                        summary = candidate_summary;
                        summary_due = candidate.due;
                    }
                }
                record_due = candidate.due.or(record_due);
            }

            let mut edits = Vec::new();
            if status.is_completed() != item.checked {
                debug!(summary = %item.summary, status = status.as_str(), "record status wins");
                edits.push(EditOperation::replace(item.spans.marker, status.checkbox()));
            }

            let fresh = id.is_none() && item.tag.is_none();
            let due = if fresh || summary != item.summary {
                let due = summary_due.or(item.starts_on).unwrap_or(self.now);
                let mut body = self.render_body(due, &summary, item.line_ending);
                if item.spans.body_end == item.spans.content_start && item.tag.is_some() {
                    body.push(' ');
                }
                debug!(from = %item.summary, to = %summary, "rewriting item text");
                edits.push(EditOperation::replace(
                    SourceRange::new(item.spans.content_start, item.spans.body_end),
                    body,
                ));
                due
            } else {
                item.starts_on.or(record_due).unwrap_or(self.now)
            };

            if id.is_none() {
                let minted = match &item.tag {
                    Some(tag) => ids.generate_with_prefix(tag),
                    None => ids.generate(),
                };
                debug!(id = %minted, summary = %summary, "minting identifier");
                out.created.push(minted.clone());
                id = Some(minted);
            }
            let id = id
                .filter(|id| !id.is_empty())
                .ok_or_else(|| SyncError::MissingIdentifier {
                    summary: summary.clone(),
                })?;

            if item.tag.is_none() {
                let tag = Tag::of(&id).ok_or_else(|| SyncError::InvalidIdentifier { id: id.clone() })?;
                edits.push(EditOperation::insert(item.spans.content_end, format!(" {tag}")));
            }

            out.edits.extend(edits);
            out.records.insert(
                id.clone(),
                CalendarRecord {
                    id: Some(id),
                    due: Some(due),
                    summary: Some(summary),
                    category: Some(item.category.clone()),
                    status: Some(status),
                },
            );
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::extract::extract_items;
        use crate::markdown::parse_document;
        use crate::patch::apply_edits;
        use chrono::{FixedOffset, TimeZone};

        struct Sequential(u32);

        impl IdGenerator for Sequential {
            fn generate(&mut self) -> String {
                self.0 += 1;
                format!("{:08x}-0000-4000-8000-000000000000", self.0)
            }
        }

        struct Blank;

        impl IdGenerator for Blank {
            fn generate(&mut self) -> String {
                String::new()
            }
        }

        fn utc() -> DocumentZone {
            DocumentZone::Fixed(FixedOffset::east_opt(0).unwrap())
        }

        fn reconciler(policy: UntaggedPolicy) -> Reconciler {
            Reconciler::new(utc(), Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap()).untagged(policy)
        }

        fn run_with(text: &str, records: &[CalendarRecord], policy: UntaggedPolicy) -> (String, Reconciliation) {
            let items = extract_items(&parse_document(text), text, utc());
            let rec = reconciler(policy)
                .reconcile(&items, records, &mut Sequential(0))
                .unwrap();
            let patched = apply_edits(text, &rec.edits).unwrap();
            (patched, rec)
        }

        fn run(text: &str, records: &[CalendarRecord]) -> (String, Reconciliation) {
            run_with(text, records, UntaggedPolicy::CreateNew)
        }

        fn record(id: &str, summary: &str, status: TaskStatus) -> CalendarRecord {
            CalendarRecord {
                id: Some(id.into()),
                due: Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()),
                summary: Some(summary.into()),
                category: Some("Home".into()),
                status: Some(status),
            }
        }

        const TAGGED: &str = "# Home\n- [ ] 2024-01-05 10:00 Buy milk #0badcafe\n";
        const CAFE: &str = "0badcafe-1111-4222-8333-444455556666";

        #[test]
        fn new_item_gets_canonical_text_and_tag() {
            let (patched, rec) = run("# Home\n- [ ] Buy milk 2024-01-05\n", &[]);
            assert_eq!(patched, "# Home\n- [ ] 2024-01-05 10:00 Buy milk #00000001\n");
            let id = "00000001-0000-4000-8000-000000000000";
            assert_eq!(rec.created, [id]);
            assert_eq!(
                rec.records[id],
                CalendarRecord {
                    id: Some(id.into()),
                    due: Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()),
                    summary: Some("Buy milk".into()),
                    category: Some("Home".into()),
                    status: Some(TaskStatus::NeedsAction),
                }
            );
        }

        #[test]
        fn completed_record_checks_the_box() {
            let (patched, rec) = run(TAGGED, &[record(CAFE, "Buy milk", TaskStatus::Completed)]);
            assert_eq!(patched, "# Home\n- [x] 2024-01-05 10:00 Buy milk #0badcafe\n");
            assert_eq!(rec.edits.len(), 1);
            assert_eq!(rec.records[CAFE].status, Some(TaskStatus::Completed));
            assert!(rec.created.is_empty());
        }

        #[test]
        fn record_summary_replaces_text_but_not_tag() {
            let mut changed = record(CAFE, "Buy oat milk", TaskStatus::NeedsAction);
            changed.due = Some(Utc.with_ymd_and_hms(2024, 1, 6, 8, 15, 0).unwrap());
            let (patched, rec) = run(TAGGED, &[changed.clone()]);
            assert_eq!(patched, "# Home\n- [ ] 2024-01-06 08:15 Buy oat milk #0badcafe\n");
            assert_eq!(rec.records[CAFE], changed);
        }

        #[test]
        fn new_items_in_separate_sections_get_distinct_ids() {
            let text = "# Home\n- [ ] Buy milk\n\n# Work\n- [ ] Send report\n";
            let (patched, rec) = run(text, &[]);
            assert_eq!(
                patched,
                "# Home\n- [ ] 2024-06-01 12:34 Buy milk #00000001\n\n\
                 # Work\n- [ ] 2024-06-01 12:34 Send report #00000002\n"
            );
            assert!(rec.edits.windows(2).all(|w| w[0].position < w[1].position));
            assert!(rec.edits.windows(2).all(|w| w[0].end() <= w[1].position));
            assert_eq!(rec.records.len(), 2);
            assert_eq!(rec.records[1].category.as_deref(), Some("Work"));
        }

        #[test]
        fn untagged_items_ignore_existing_records_by_default() {
            let existing = record(CAFE, "Something else", TaskStatus::Completed);
            let (patched, rec) = run("- [ ] 2024-01-05 10:00 Fresh\n", &[existing]);
            assert_eq!(patched, "- [ ] 2024-01-05 10:00 Fresh #00000001\n");
            assert!(!rec.records.contains_key(CAFE));
        }

        #[test]
        fn last_record_wins_policy_absorbs_the_last_candidate() {
            let records = [
                record("0000000a-0000-4000-8000-000000000000", "First", TaskStatus::NeedsAction),
                record("0000000b-0000-4000-8000-000000000000", "Second", TaskStatus::Completed),
                CalendarRecord { id: Some("phone-uid@example".into()), ..Default::default() },
            ];
            let (patched, rec) = run_with(
                "- [ ] 2024-01-05 10:00 Second\n",
                &records,
                UntaggedPolicy::LastRecordWins,
            );
            assert_eq!(patched, "- [x] 2024-01-05 10:00 Second #0000000b\n");
            assert!(rec.created.is_empty());
            assert_eq!(rec.records.len(), 1);
        }

        #[test]
        fn tag_survives_a_vanished_record() {
            let (patched, rec) = run(TAGGED, &[]);
            assert_eq!(patched, TAGGED);
            assert!(rec.edits.is_empty());
            let (id, kept) = rec.records.first().unwrap();
            assert!(id.starts_with("0badcafe"));
            assert_eq!(kept.summary.as_deref(), Some("Buy milk"));
        }

        #[test]
        fn second_pass_is_quiet() {
            let text = "# Home\n- [ ] Buy milk 2024-01-05\n- [x] Undated\n\n# Work\n- [ ] multi\n  line\n";
            let (patched, first) = run(text, &[]);
            let records: Vec<_> = first.records.values().cloned().collect();
            let (again, second) = run(&patched, &records);
            assert!(second.edits.is_empty(), "{:?}", second.edits);
            assert_eq!(again, patched);
            assert_eq!(second.records, first.records);
        }

        #[test]
        fn multi_line_record_summary_is_indented() {
            let changed = record(CAFE, "Buy milk\nand bread", TaskStatus::NeedsAction);
            let (patched, _) = run(TAGGED, &[changed.clone()]);
            assert_eq!(
                patched,
                "# Home\n- [ ] 2024-01-05 10:00 Buy milk\n  and bread #0badcafe\n"
            );
            let (_, again) = run(&patched, &[changed]);
            assert!(again.edits.is_empty());
        }

        #[test]
        fn block_like_summary_lines_keep_the_item_whole() {
            let text = "- [ ] 2024-01-05 10:00 Buy milk #0badcafe\n- [ ] Other #00000099\n";
            let other = record("00000099-0000-4000-8000-000000000000", "Other", TaskStatus::NeedsAction);
            for summary in ["Buy\n- [ ] eggs", "Buy\n```", "Buy\n1. first\n~~~\n\\- kept"] {
                let records = [record(CAFE, summary, TaskStatus::NeedsAction), other.clone()];
                let (patched, first) = run(text, &records);
                assert!(first.created.is_empty());
                assert_eq!(extract_items(&parse_document(&patched), &patched, utc()).len(), 2);

                let stored: Vec<_> = first.records.values().cloned().collect();
                let (again, second) = run(&patched, &stored);
                assert!(second.edits.is_empty(), "{summary:?}: {:?}", second.edits);
                assert!(second.created.is_empty());
                assert_eq!(again, patched);
                assert_eq!(second.records[CAFE].summary.as_deref(), Some(summary));
            }

            let (patched, _) = run(text, &[record(CAFE, "Buy\n- [ ] eggs", TaskStatus::NeedsAction), other]);
            assert_eq!(
                patched,
                "- [ ] 2024-01-05 10:00 Buy\n  \\- [ ] eggs #0badcafe\n- [ ] Other #00000099\n"
            );
        }

        #[test]
        fn multi_line_summary_uses_the_document_line_ending() {
            let text = "# Home\r\n- [ ] 2024-01-05 10:00 Buy milk #0badcafe\r\n";
            let changed = record(CAFE, "Buy milk\nand bread", TaskStatus::NeedsAction);
            let (patched, _) = run(text, &[changed.clone()]);
            assert_eq!(
                patched,
                "# Home\r\n- [ ] 2024-01-05 10:00 Buy milk\r\n  and bread #0badcafe\r\n"
            );
            let (_, again) = run(&patched, &[changed]);
            assert!(again.edits.is_empty());
        }

        #[test]
        fn blank_identifiers_are_fatal() {
            let text = "- [ ] Orphan\n";
            let items = extract_items(&parse_document(text), text, utc());
            let err = reconciler(UntaggedPolicy::CreateNew)
                .reconcile(&items, &[], &mut Blank)
                .unwrap_err();
            assert_eq!(
                err,
                SyncError::MissingIdentifier {
                    summary: "Orphan".into()
                }
            );
        }
    }
}

pub mod storage {
    //! Calendar directory access: one `.ics` file per record.

    use crate::record::{CalendarRecord, parse_record};
    use anyhow::{Context, Result};
    use rayon::prelude::*;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const RECORD_EXTENSION: &str = "ics";

    /// File name for a newly created record.
    pub fn record_file_name(id: &str) -> String {
        format!("{id}.{RECORD_EXTENSION}")
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StoredRecord {
        pub file_name: String,
        /// File contents as read, used to skip rewrites that change nothing.
        pub raw: String,
        pub record: CalendarRecord,
    }

    pub trait RecordStore {
        /// Every record, ordered by file name.
        fn load_all(&self) -> Result<Vec<StoredRecord>>;

        /// Create or overwrite one record file.
        fn write(&self, file_name: &str, contents: &str) -> Result<()>;
    }

    #[derive(Debug, Clone)]
    pub struct DirRecordStore {
        root: PathBuf,
    }

    impl DirRecordStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }
    }

    impl RecordStore for DirRecordStore {
        fn load_all(&self) -> Result<Vec<StoredRecord>> {
            let mut paths = Vec::new();
            for entry in fs::read_dir(&self.root)
                .with_context(|| format!("listing calendar directory {:?}", self.root))?
            {
                let path = entry?.path();
                if path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext == RECORD_EXTENSION)
                {
                    paths.push(path);
                }
            }
            paths.sort();

            let records = paths
                .into_par_iter()
                .map(|path| -> Result<StoredRecord> {
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("reading {:?}", path))?;
                    let file_name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let record = parse_record(&raw);
                    Ok(StoredRecord {
                        file_name,
                        raw,
                        record,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            debug!(count = records.len(), root = ?self.root, "loaded records");
            Ok(records)
        }

        fn write(&self, file_name: &str, contents: &str) -> Result<()> {
            let path = self.root.join(file_name);
            fs::write(&path, contents.as_bytes()).with_context(|| format!("writing {:?}", path))
        }
    }

}

pub mod sync {
    //! One run: read, extract, reconcile, patch, persist.

    use crate::core::{IdGenerator, SyncError};
    use crate::extract::{ChecklistItem, extract_items};
    use crate::markdown::parse_document;
    use crate::patch::apply_edits;
    use crate::reconcile::{Reconciler, Reconciliation};
    use crate::record::{CalendarRecord, serialize_record};
    use crate::storage::{RecordStore, StoredRecord, record_file_name};
    use anyhow::{Context, Result};
    use serde::Serialize;
    use std::{collections::HashMap, fs, path::PathBuf};
    use tracing::{debug, info};

    /// Everything a run decides, before anything is written.
    #[derive(Debug, Clone)]
    pub struct Plan {
        pub items: Vec<ChecklistItem>,
        pub reconciliation: Reconciliation,
        /// The patched document text.
        pub document: String,
    }

    pub fn plan(
        source: &str,
        records: &[CalendarRecord],
        reconciler: &Reconciler,
        ids: &mut dyn IdGenerator,
    ) -> Result<Plan, SyncError> {
        let tree = parse_document(source);
        let items = extract_items(&tree, source, reconciler.zone());
        let reconciliation = reconciler.reconcile(&items, records, ids)?;
        let document = apply_edits(source, &reconciliation.edits)?;
        Ok(Plan {
            items,
            reconciliation,
            document,
        })
    }

    #[derive(Debug, Clone)]
    pub struct SyncOptions {
        pub document: PathBuf,
        /// Compute everything but write nothing.
        pub dry_run: bool,
    }

    #[derive(Debug, Clone, Default, Serialize)]
    pub struct SyncReport {
        pub items: usize,
        pub edits: usize,
        pub created: usize,
        pub document_changed: bool,
        /// Record files written (or, in a dry run, that would be written).
        pub records_written: Vec<String>,
        pub records_unchanged: usize,
        #[serde(skip)]
        pub document: String,
    }

    pub fn sync(
        options: &SyncOptions,
        reconciler: &Reconciler,
        store: &dyn RecordStore,
        ids: &mut dyn IdGenerator,
    ) -> Result<SyncReport> {
        let source = fs::read_to_string(&options.document)
            .with_context(|| format!("reading {:?}", options.document))?;
        let stored = store.load_all().context("loading calendar records")?;
        let records: Vec<CalendarRecord> = stored.iter().map(|s| s.record.clone()).collect();

        let plan = plan(&source, &records, reconciler, ids)
            .with_context(|| format!("reconciling {:?}", options.document))?;

        let mut by_id: HashMap<&str, &StoredRecord> = HashMap::new();
        for entry in &stored {
            if let Some(id) = entry.record.id.as_deref() {
                by_id.entry(id).or_insert(entry);
            }
        }

        let mut report = SyncReport {
            items: plan.items.len(),
            edits: plan.reconciliation.edits.len(),
            created: plan.reconciliation.created.len(),
            document_changed: plan.document != source,
            ..SyncReport::default()
        };

        let mut pending = Vec::new();
        for (id, record) in &plan.reconciliation.records {
            let text = serialize_record(record);
            match by_id.get(id.as_str()) {
                Some(existing) if existing.raw == text => report.records_unchanged += 1,
                Some(existing) => pending.push((existing.file_name.clone(), text)),
                None => pending.push((record_file_name(id), text)),
            }
        }

        if options.dry_run {
            debug!("dry run; nothing written");
        } else {
            if report.document_changed {
                fs::write(&options.document, plan.document.as_bytes())
                    .with_context(|| format!("writing {:?}", options.document))?;
            }
            for (file_name, text) in &pending {
                store.write(file_name, text)?;
            }
        }

        report.records_written = pending.into_iter().map(|(name, _)| name).collect();
        report.document = plan.document;
        info!(
            items = report.items,
            edits = report.edits,
            created = report.created,
            written = report.records_written.len(),
            unchanged = report.records_unchanged,
            "sync finished"
        );
        Ok(report)
    }
}

pub mod config {
    //! Optional JSON configuration file; command-line flags take precedence.

    use crate::core::DocumentZone;
    use crate::reconcile::UntaggedPolicy;
    use anyhow::{Context, Result, anyhow};
    use chrono::FixedOffset;
    use serde::{Deserialize, Serialize};
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    pub const DEFAULT_FILE_NAME: &str = ".todosync.json";

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct Config {
        /// Checklist document to sync.
        pub document: Option<PathBuf>,
        /// Directory holding one `.ics` file per task.
        pub calendar: Option<PathBuf>,
        pub untagged: Option<UntaggedPolicy>,
        /// Fixed offset for inline document dates, e.g. `+02:00`. Defaults to the system zone.
        pub utc_offset: Option<String>,
    }

    impl Config {
        pub fn default_path() -> Option<PathBuf> {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEFAULT_FILE_NAME))
        }

        pub fn from_json(text: &str) -> Result<Self> {
            serde_json::from_str(text).context("parsing configuration")
        }

        /// An explicitly named file must exist; the default file is optional.
        pub fn load(explicit: Option<&Path>) -> Result<Self> {
            let path = match explicit {
                Some(path) => path.to_path_buf(),
                None => match Self::default_path() {
                    Some(path) if path.is_file() => path,
                    _ => return Ok(Self::default()),
                },
            };
            let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            Self::from_json(&text).with_context(|| format!("loading {:?}", path))
        }

        pub fn zone(&self) -> Result<DocumentZone> {
            match &self.utc_offset {
                Some(raw) => raw
                    .parse::<FixedOffset>()
                    .map(DocumentZone::Fixed)
                    .map_err(|e| anyhow!("invalid utc_offset {raw:?}: {e}")),
                None => Ok(DocumentZone::Local),
            }
        }
    }

    /// Expands a leading `~/` to `$HOME`.
    pub fn expand_home(path: &Path) -> PathBuf {
        match (path.strip_prefix("~"), std::env::var_os("HOME")) {
            (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
            _ => path.to_path_buf(),
        }
    }

}

pub use crate::core::{DocumentZone, IdGenerator, SyncError, Tag, UuidGenerator};
pub use crate::reconcile::{Reconciler, UntaggedPolicy};
pub use crate::sync::{SyncOptions, SyncReport, plan, sync};
