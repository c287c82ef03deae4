use chrono::{FixedOffset, TimeZone, Utc};
use proptest::prelude::*;
use todosync::record::{CalendarRecord, TaskStatus, parse_record, serialize_record};
use todosync::{DocumentZone, IdGenerator, Reconciler, plan};

struct Sequential(u32);

impl IdGenerator for Sequential {
    fn generate(&mut self) -> String {
        self.0 += 1;
        format!("{:08x}-0000-4000-8000-000000000000", self.0)
    }
}

fn reconciler() -> Reconciler {
    Reconciler::new(
        DocumentZone::Fixed(FixedOffset::east_opt(0).unwrap()),
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 34, 56).unwrap(),
    )
}

fn status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::NeedsAction),
        Just(TaskStatus::Completed),
        Just(TaskStatus::InProcess),
        Just(TaskStatus::Cancelled),
        Just(TaskStatus::Other("X-WAITING".into())),
    ]
}

fn record() -> impl Strategy<Value = CalendarRecord> {
    (
        proptest::option::of("[0-9a-f]{8}-[0-9a-z-]{0,24}"),
        proptest::option::of(0i64..4_000_000_000),
        proptest::option::of("[A-Za-z0-9 ,;:\\\\]{0,24}(\n[A-Za-z0-9 ]{1,12}){0,2}"),
        proptest::option::of("[A-Za-z ]{0,12}"),
        proptest::option::of(status()),
    )
        .prop_map(|(id, due, summary, category, status)| CalendarRecord {
            id,
            due: due.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            summary,
            category,
            status,
        })
}

/// `(checked, words, optional day in January 2024)` per item.
fn items() -> impl Strategy<Value = Vec<(bool, String, Option<u32>)>> {
    proptest::collection::vec(
        (
            any::<bool>(),
            "[a-z]{1,8}( [a-z]{1,8}){0,3}",
            proptest::option::of(1u32..=28),
        ),
        1..6,
    )
}

fn render(items: &[(bool, String, Option<u32>)]) -> String {
    let mut out = String::from("# Inbox\n");
    for (i, (checked, words, day)) in items.iter().enumerate() {
        if i == 3 {
            out.push_str("\n## Later\n");
        }
        let mark = if *checked { "x" } else { " " };
        match day {
            Some(day) => out.push_str(&format!("- [{mark}] {words} 2024-01-{day:02}\n")),
            None => out.push_str(&format!("- [{mark}] {words}\n")),
        }
    }
    out
}

#[derive(Debug, Clone)]
enum Block {
    Prose(String),
    /// An item with no tag yet.
    Fresh { checked: bool, words: String },
    /// A tagged item whose record may disagree on status and summary.
    Matched {
        checked: bool,
        words: String,
        completed: bool,
        summary: String,
    },
    /// A tagged item whose record is gone.
    Vanished { checked: bool, words: String },
}

/// Summary lines other clients may write, including ones that look like Markdown blocks.
fn summary() -> impl Strategy<Value = String> {
    let continuation = prop_oneof![
        "[a-z]{1,8}( [a-z]{1,8}){0,2}".boxed(),
        Just("- [ ] eggs".to_string()).boxed(),
        Just("* note".to_string()).boxed(),
        Just("1. step".to_string()).boxed(),
        Just("```".to_string()).boxed(),
        Just("~~~".to_string()).boxed(),
        Just("\\- literal".to_string()).boxed(),
    ];
    (
        "[a-z]{1,8}( [a-z]{1,8}){0,2}",
        proptest::collection::vec(continuation, 0..3),
    )
        .prop_map(|(first, rest)| {
            std::iter::once(first).chain(rest).collect::<Vec<_>>().join("\n")
        })
}

fn blocks() -> impl Strategy<Value = Vec<Block>> {
    let words = "[a-z]{1,8}( [a-z]{1,8}){0,3}";
    let block = prop_oneof![
        "[a-z][a-z ]{0,29}".prop_map(Block::Prose),
        (any::<bool>(), words).prop_map(|(checked, words)| Block::Fresh { checked, words }),
        (any::<bool>(), words, any::<bool>(), summary()).prop_map(
            |(checked, words, completed, summary)| Block::Matched {
                checked,
                words,
                completed,
                summary,
            }
        ),
        (any::<bool>(), words).prop_map(|(checked, words)| Block::Vanished { checked, words }),
    ];
    proptest::collection::vec(block, 1..8)
}

/// Blocks separated by blank lines under one heading, plus the records of matched items.
fn render_blocks(blocks: &[Block]) -> (String, Vec<CalendarRecord>) {
    let mut out = String::from("# Inbox\n");
    let mut records = Vec::new();
    let mark = |checked: bool| if checked { "x" } else { " " };
    for (i, block) in blocks.iter().enumerate() {
        out.push('\n');
        match block {
            Block::Prose(line) => out.push_str(line),
            Block::Fresh { checked, words } => {
                out.push_str(&format!("- [{}] {words}", mark(*checked)));
            }
            Block::Matched {
                checked,
                words,
                completed,
                summary,
            } => {
                let prefix = 0xa000_0000u32 + i as u32;
                out.push_str(&format!("- [{}] {words} #{prefix:08x}", mark(*checked)));
                records.push(CalendarRecord {
                    id: Some(format!("{prefix:08x}-1111-4222-8333-444455556666")),
                    due: Some(Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()),
                    summary: Some(summary.clone()),
                    category: Some("Inbox".into()),
                    status: Some(if *completed {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::NeedsAction
                    }),
                });
            }
            Block::Vanished { checked, words } => {
                let prefix = 0xb000_0000u32 + i as u32;
                out.push_str(&format!("- [{}] {words} #{prefix:08x}", mark(*checked)));
            }
        }
        out.push('\n');
    }
    (out, records)
}

proptest! {
    #[test]
    fn serialized_records_parse_back(record in record()) {
        prop_assert_eq!(parse_record(&serialize_record(&record)), record);
    }

    #[test]
    fn surrounding_prose_is_untouched(blocks in blocks()) {
        let (source, records) = render_blocks(&blocks);
        let mut ids = Sequential(0);
        let first = plan(&source, &records, &reconciler(), &mut ids).expect("plan");
        prop_assert_eq!(first.items.len(), blocks.iter().filter(|b| !matches!(b, Block::Prose(_))).count());

        for edit in &first.reconciliation.edits {
            prop_assert!(
                first.items.iter().any(|item| {
                    edit.position >= item.spans.marker.start && edit.end() <= item.spans.content_end
                }),
                "edit {:?} reaches outside every item",
                edit
            );
        }

        // Every byte between edits is carried over at its shifted position.
        let mut edits = first.reconciliation.edits.clone();
        edits.sort_by_key(|e| e.position);
        let mut cursor = 0;
        let mut delta = 0isize;
        for edit in &edits {
            let kept = &source[cursor..edit.position];
            let at = (cursor as isize + delta) as usize;
            prop_assert_eq!(&first.document[at..at + kept.len()], kept);
            delta += edit.insert.len() as isize - edit.remove as isize;
            cursor = edit.end();
        }
        let at = (cursor as isize + delta) as usize;
        prop_assert_eq!(&first.document[at..], &source[cursor..]);

        let mut rest = first.document.as_str();
        for block in &blocks {
            if let Block::Prose(line) = block {
                let line = format!("\n{line}\n");
                let found = rest.find(&line);
                prop_assert!(found.is_some(), "prose {:?} lost", line);
                rest = &rest[found.unwrap_or_default() + line.len() - 1..];
            }
        }

        let settled: Vec<CalendarRecord> =
            first.reconciliation.records.values().cloned().collect();
        let second = plan(&first.document, &settled, &reconciler(), &mut ids).expect("second plan");
        prop_assert!(second.reconciliation.edits.is_empty());
        prop_assert_eq!(&second.document, &first.document);
        prop_assert_eq!(second.items.len(), first.items.len());
    }

    #[test]
    fn second_plan_is_a_no_op(items in items()) {
        let source = render(&items);
        let mut ids = Sequential(0);
        let first = plan(&source, &[], &reconciler(), &mut ids).expect("first plan");
        let records: Vec<CalendarRecord> =
            first.reconciliation.records.values().cloned().collect();
        prop_assert_eq!(records.len(), items.len());

        let second = plan(&first.document, &records, &reconciler(), &mut ids).expect("second plan");
        prop_assert!(second.reconciliation.edits.is_empty());
        prop_assert_eq!(&second.document, &first.document);
        prop_assert_eq!(second.reconciliation.records, first.reconciliation.records);
    }
}
