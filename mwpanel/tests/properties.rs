use chrono::{Duration, NaiveDate};
use mwpanel::checkbox;
use mwpanel::model::CheckState;
use mwpanel::{duration, locate, reconcile, toggle};
use proptest::prelude::*;

const TITLES: [&str; 10] = [
    "Alpha", "Bravo", "Delta", "Echo", "Kilo", "Lima", "Oscar", "Papa", "Quebec", "Romeo",
];

fn line_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            "[a-z -]{0,6}",
            Just("[ ]".to_string()),
            Just("[x]".to_string()),
            Just("[X]".to_string()),
            Just("[y]".to_string()),
        ],
        0..8,
    )
    .prop_map(|pieces| pieces.concat())
}

fn events_strategy() -> impl Strategy<Value = Vec<Vec<String>>> {
    prop::collection::vec(prop::collection::vec("[a-z]{1,8}", 1..4), 1..TITLES.len())
}

fn fenced_document(events: &[Vec<String>]) -> String {
    let mut doc = String::from("# Notes\n\n```markwhen\ntitle: Plans\n\n");
    for (idx, words) in events.iter().enumerate() {
        doc.push_str(&format!("2024-01-{:02}: {}\n", idx + 1, TITLES[idx]));
        for word in words {
            doc.push_str(&format!("  - [ ] {word}\n"));
        }
    }
    doc.push_str("```\n\ntrailing prose\n");
    doc
}

proptest! {
    #[test]
    fn unchecking_restores_the_line(line in line_strategy(), pick in 0usize..8) {
        let unchecked: Vec<usize> = checkbox::tokens(&line)
            .enumerate()
            .filter(|(_, t)| t.state == CheckState::Unchecked)
            .map(|(ordinal, _)| ordinal)
            .collect();
        prop_assume!(!unchecked.is_empty());
        let ordinal = unchecked[pick % unchecked.len()];

        let checked = toggle(&line, ordinal, CheckState::Checked);
        prop_assert_eq!(checked.len(), line.len());
        prop_assert_eq!(checkbox::count(&checked), checkbox::count(&line));
        prop_assert_eq!(toggle(&checked, ordinal, CheckState::Unchecked), line);
    }

    #[test]
    fn ordinals_past_the_end_leave_the_line_alone(line in line_strategy()) {
        let past = checkbox::count(&line);
        prop_assert_eq!(toggle(&line, past, CheckState::Checked), line);
    }

    #[test]
    fn reconciling_with_itself_is_identity(doc in "[a-z \n]{1,40}", start in 0usize..40, len in 1usize..10) {
        let start = start % doc.len();
        let end = (start + len).min(doc.len());
        let anchor = &doc[start..end];
        prop_assert_eq!(reconcile(&doc, anchor, anchor), Some(doc.clone()));
    }

    #[test]
    fn absent_anchor_is_no_match(doc in "[a-z \n]{0,40}", anchor in "#[a-z]{0,5}", new in "[a-z]{0,5}") {
        prop_assert_eq!(reconcile(&doc, &anchor, &new), None);
    }

    #[test]
    fn located_body_belongs_to_one_event(events in events_strategy(), pick in 0usize..10) {
        let doc = fenced_document(&events);
        let idx = pick % events.len();
        let body = locate(&doc, TITLES[idx]);

        let expected = events[idx]
            .iter()
            .map(|w| format!("  - [ ] {w}"))
            .collect::<Vec<_>>()
            .join("\n");
        prop_assert_eq!(body.as_deref(), Some(expected.trim()));
        let body = body.unwrap_or_default();
        prop_assert!(body.lines().all(|l| !l.trim_start().starts_with("2024-")));
    }

    #[test]
    fn durations_count_days_inclusively(offset in 0i64..3650, span in 0i64..400) {
        let base = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let start = base + Duration::days(offset);
        let end = start + Duration::days(span);
        let n = span + 1;
        let expected = if n == 1 { "1 day".to_string() } else { format!("{n} days") };
        prop_assert_eq!(duration(&format!("{start} / {end}")), expected.clone());
        prop_assert_eq!(duration(&format!("{end} / {start}")), expected);
    }
}
