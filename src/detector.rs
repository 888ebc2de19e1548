use memchr::memmem;
use regex::Regex;

use crate::dump_parser::{Page, Revision, Text};

/// Label attached to a detected transition, named after the values the
/// downstream quality pipeline consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// The stub template showed up in this revision ("E" in the output).
    Appeared,
    /// The stub template was removed in this revision ("D" in the output).
    Removed,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Appeared => "E",
            Label::Removed => "D",
        }
    }
}

/// One detected transition in a page's revision history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelEvent {
    pub rev_id: i32,
    pub label: Label,
}

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("template name must not be empty")]
    EmptyTemplateName,
    #[error("template name produced an invalid pattern")]
    Pattern(#[from] regex::Error),
}

/// Decides whether a revision's text contains the opening of the tracked
/// template, e.g. `{{beginnetje` or `{{ Beginnetje`.
///
/// This is a deliberate substring-level approximation, matching what the
/// template looks like in wikitext rather than parsing it: template arguments
/// are not inspected, aliases and redirects of the template are not resolved,
/// and an occurrence inside a comment or nowiki block still counts. Matching
/// is case-insensitive since MediaWiki resolves template names that way.
///
/// Stateless apart from the compiled pattern, so one instance is shared
/// read-only across all workers.
#[derive(Debug)]
pub struct MarkerMatcher {
    // cheap scan for any template syntax at all before running the regex
    prefilter: memmem::Finder<'static>,
    pattern: Regex,
}

impl MarkerMatcher {
    pub fn new(template_name: &str) -> Result<Self, MatcherError> {
        if template_name.trim().is_empty() {
            return Err(MatcherError::EmptyTemplateName);
        }

        let pattern = format!(r"(?i)\{{\{{\s*{}", regex::escape(template_name.trim()));

        Ok(Self {
            prefilter: memmem::Finder::new("{{").into_owned(),
            pattern: Regex::new(&pattern)?,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.prefilter.find(text.as_bytes()).is_some() && self.pattern.is_match(text)
    }

    /// A revision whose text was suppressed is treated as template-absent,
    /// never as an error.
    pub fn matches_text(&self, text: &Text) -> bool {
        match text {
            Text::Normal(text) => self.matches(text),
            Text::Deleted => false,
        }
    }
}

/// Detection state of a single page scan.
///
/// `Done` is terminal: once the template has appeared and disappeared again,
/// later revisions of the page are not examined, so a template that is
/// reintroduced (e.g. by a revert) yields no second pair of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Absent,
    Present,
    Done,
}

impl ScanState {
    /// Advances the state machine by one revision and returns the label to
    /// emit for it, if any.
    pub fn step(self, marker_present: bool) -> (ScanState, Option<Label>) {
        match (self, marker_present) {
            (ScanState::Absent, true) => (ScanState::Present, Some(Label::Appeared)),
            (ScanState::Absent, false) => (ScanState::Absent, None),
            (ScanState::Present, false) => (ScanState::Done, Some(Label::Removed)),
            (ScanState::Present, true) => (ScanState::Present, None),
            (ScanState::Done, _) => (ScanState::Done, None),
        }
    }
}

/// Lazy scan over one page's revisions, oldest first.
///
/// Yields at most two events: an `Appeared` for the first revision containing
/// the template and a `Removed` for the first later revision without it. The
/// iterator is single-use; state does not carry over between pages.
pub struct ScanEvents<'a, I> {
    matcher: &'a MarkerMatcher,
    revisions: I,
    state: ScanState,
}

impl<'a, 'r, I> Iterator for ScanEvents<'a, I>
where
    I: Iterator<Item = &'r Revision>,
{
    type Item = LabelEvent;

    fn next(&mut self) -> Option<LabelEvent> {
        while self.state != ScanState::Done {
            let revision = self.revisions.next()?;

            let (state, label) = self.state.step(self.matcher.matches_text(&revision.text));
            self.state = state;

            if let Some(label) = label {
                return Some(LabelEvent {
                    rev_id: revision.id,
                    label,
                });
            }
        }

        None
    }
}

pub fn scan_revisions<'a, 'r, I>(
    matcher: &'a MarkerMatcher,
    revisions: I,
) -> ScanEvents<'a, I::IntoIter>
where
    I: IntoIterator<Item = &'r Revision>,
{
    ScanEvents {
        matcher,
        revisions: revisions.into_iter(),
        state: ScanState::Absent,
    }
}

pub fn scan_page<'a, 'r>(
    matcher: &'a MarkerMatcher,
    page: &'r Page,
) -> ScanEvents<'a, std::slice::Iter<'r, Revision>> {
    scan_revisions(matcher, &page.revisions)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use proptest::prelude::*;

    use super::*;

    fn matcher() -> MarkerMatcher {
        MarkerMatcher::new("beginnetje").unwrap()
    }

    fn revision(id: i32, text: &str) -> Revision {
        Revision {
            id,
            timestamp: DateTime::from_timestamp_nanos(id as i64),
            text: Text::Normal(text.into()),
        }
    }

    fn scan(revisions: &[Revision]) -> Vec<LabelEvent> {
        scan_revisions(&matcher(), revisions).collect()
    }

    #[test]
    fn matcher_accepts_common_spellings() {
        let matcher = matcher();

        assert!(matcher.matches("{{beginnetje}}"));
        assert!(matcher.matches("{{Beginnetje}}"));
        assert!(matcher.matches("{{BEGINNETJE}}"));
        assert!(matcher.matches("{{ beginnetje }}"));
        assert!(matcher.matches("{{\n  beginnetje|onderwerp}}"));
        assert!(matcher.matches("intro text {{beginnetje|datum=2004}} more text"));
    }

    #[test]
    fn matcher_rejects_other_templates_and_plain_text() {
        let matcher = matcher();

        assert!(!matcher.matches(""));
        assert!(!matcher.matches("beginnetje"));
        assert!(!matcher.matches("{{infobox plant}}"));
        assert!(!matcher.matches("{beginnetje}"));
        assert!(!matcher.matches_text(&Text::Deleted));
    }

    #[test]
    fn matcher_rejects_empty_template_name() {
        assert!(matches!(
            MarkerMatcher::new("  "),
            Err(MatcherError::EmptyTemplateName)
        ));
    }

    #[test]
    fn appear_then_remove_emits_both_labels() {
        let revisions = [
            revision(1, "no marker"),
            revision(2, "{{Beginnetje}} text"),
            revision(3, "{{Beginnetje}} text"),
            revision(4, "full text, no marker"),
        ];

        assert_eq!(
            scan(&revisions),
            vec![
                LabelEvent {
                    rev_id: 2,
                    label: Label::Appeared
                },
                LabelEvent {
                    rev_id: 4,
                    label: Label::Removed
                },
            ]
        );
    }

    #[test]
    fn marker_in_first_revision_emits_appeared() {
        let revisions = [revision(1, "{{Beginnetje}}")];

        assert_eq!(
            scan(&revisions),
            vec![LabelEvent {
                rev_id: 1,
                label: Label::Appeared
            }]
        );
    }

    #[test]
    fn page_without_marker_emits_nothing() {
        let revisions = [revision(1, "plain text")];

        assert_eq!(scan(&revisions), vec![]);
    }

    #[test]
    fn marker_never_removed_emits_only_appeared() {
        let revisions = [
            revision(1, "stub? {{beginnetje}}"),
            revision(2, "still a stub {{beginnetje}}"),
        ];

        assert_eq!(
            scan(&revisions),
            vec![LabelEvent {
                rev_id: 1,
                label: Label::Appeared
            }]
        );
    }

    #[test]
    fn scan_stops_after_first_removal() {
        // the template coming back later (revert, re-tagging) is out of scope,
        // only the first episode is reported
        let revisions = [
            revision(1, "{{beginnetje}}"),
            revision(2, "expanded"),
            revision(3, "{{beginnetje}} again"),
            revision(4, "expanded again"),
        ];

        assert_eq!(
            scan(&revisions),
            vec![
                LabelEvent {
                    rev_id: 1,
                    label: Label::Appeared
                },
                LabelEvent {
                    rev_id: 2,
                    label: Label::Removed
                },
            ]
        );
    }

    #[test]
    fn deleted_text_counts_as_absent() {
        let mut revisions = vec![revision(1, "{{beginnetje}}")];
        revisions.push(Revision {
            id: 2,
            timestamp: DateTime::from_timestamp_nanos(2),
            text: Text::Deleted,
        });

        assert_eq!(
            scan(&revisions),
            vec![
                LabelEvent {
                    rev_id: 1,
                    label: Label::Appeared
                },
                LabelEvent {
                    rev_id: 2,
                    label: Label::Removed
                },
            ]
        );
    }

    #[test]
    fn state_machine_transitions() {
        assert_eq!(
            ScanState::Absent.step(true),
            (ScanState::Present, Some(Label::Appeared))
        );
        assert_eq!(ScanState::Absent.step(false), (ScanState::Absent, None));
        assert_eq!(ScanState::Present.step(true), (ScanState::Present, None));
        assert_eq!(
            ScanState::Present.step(false),
            (ScanState::Done, Some(Label::Removed))
        );
        assert_eq!(ScanState::Done.step(true), (ScanState::Done, None));
        assert_eq!(ScanState::Done.step(false), (ScanState::Done, None));
    }

    proptest! {
        /// For any sequence of match/no-match revisions: at most one episode is
        /// reported, `Appeared` strictly precedes `Removed`, and nothing is
        /// emitted past the first removal.
        #[test]
        fn scan_invariants(matches in proptest::collection::vec(any::<bool>(), 0..64)) {
            let revisions: Vec<Revision> = matches
                .iter()
                .enumerate()
                .map(|(i, &matched)| {
                    revision(i as i32 + 1, if matched { "{{beginnetje}}" } else { "text" })
                })
                .collect();

            let events = scan(&revisions);

            let appeared: Vec<_> = events.iter().filter(|e| e.label == Label::Appeared).collect();
            let removed: Vec<_> = events.iter().filter(|e| e.label == Label::Removed).collect();

            prop_assert!(appeared.len() <= 1);
            prop_assert!(removed.len() <= appeared.len());

            if let Some(first_match) = matches.iter().position(|&m| m) {
                prop_assert_eq!(appeared[0].rev_id, first_match as i32 + 1);

                if let Some(removal) =
                    matches[first_match..].iter().position(|&m| !m)
                {
                    prop_assert_eq!(removed[0].rev_id, (first_match + removal) as i32 + 1);
                    prop_assert!(removed[0].rev_id > appeared[0].rev_id);
                } else {
                    prop_assert!(removed.is_empty());
                }
            } else {
                prop_assert!(events.is_empty());
            }
        }
    }
}
