use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::TranscriptFragment;
use crate::config::SignalConfig;

/// Commitment verbs that usually open an action item.
const ACTION_VERBS: &[&str] = &[
    "send", "sends", "schedule", "create", "update", "finish", "complete", "prepare", "review",
    "write", "call", "email", "deliver", "fix", "implement", "draft", "share", "book", "organize",
    "ship", "deploy", "submit", "assign",
];

const ACTION_PHRASES: &[&str] = &["follow up", "set up", "take care of", "circle back"];

/// Words that anchor an utterance in time.
const TIME_WORDS: &[&str] = &[
    "today", "tomorrow", "tonight", "monday", "tuesday", "wednesday", "thursday", "friday",
    "saturday", "sunday", "january", "february", "march", "april", "may", "june", "july", "august",
    "september", "october", "november", "december", "deadline", "eod", "eow", "asap", "q1", "q2",
    "q3", "q4",
];

const TIME_PHRASES: &[&str] = &[
    "next week", "next month", "this week", "end of day", "end of week", "end of month", "by the",
];

const INTERROGATIVES: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "which", "can", "could", "should", "would",
    "will", "is", "are", "do", "does", "did", "any",
];

const DECISION_WORDS: &[&str] = &[
    "decided", "decision", "agreed", "agreement", "final", "finalize", "finalized", "approved",
    "settled", "conclusion", "consensus",
];

const DECISION_PHRASES: &[&str] = &["go with", "we'll use", "let's use", "signed off"];

const ASSIGNMENT_WORDS: &[&str] = &[
    "assign", "assigned", "owner", "owns", "responsible", "handle", "handles", "takes", "taking",
    "lead", "leads",
];

const ASSIGNMENT_PHRASES: &[&str] = &["will handle", "is on it", "i'll take", "you take"];

const RISK_WORDS: &[&str] = &[
    "risk", "risky", "concern", "concerned", "blocker", "blocked", "worried", "worry", "danger",
    "critical", "urgent", "issue", "problem", "delay", "delayed", "slip", "slipping",
];

/// Low-information filter lexicon. Heavily weighted toward verbal tics.
const FILLER_WORDS: &[&str] = &[
    "um", "uh", "er", "ah", "hmm", "mhm", "mm", "like", "yeah", "okay", "ok", "so", "well", "just",
    "right", "know", "you", "kind", "sort", "basically", "actually", "literally", "anyway",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "if", "then", "is", "are", "was", "were", "be", "been",
    "to", "of", "in", "on", "at", "for", "with", "it", "this", "that", "i", "you", "we", "they",
    "he", "she", "as", "by", "from", "not", "no", "do", "does", "did", "have", "has", "had",
    "will", "would", "can", "could", "should", "about", "into", "over", "so", "just", "than",
    "too", "very",
];

/// Boolean semantic flags plus word count, derived from one fragment.
///
/// Ephemeral: recomputed per fragment, never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SemanticSignals {
    pub word_count: usize,
    pub has_action_verb: bool,
    pub has_time_reference: bool,
    pub has_question_form: bool,
    pub has_decision_language: bool,
    pub has_assignment_language: bool,
    pub has_risk_language: bool,
}

impl SemanticSignals {
    /// Word-count-normalized density of actionable signal.
    ///
    /// Combination precedence: action+time dominates (2.0), then
    /// decision+assignment (1.5); otherwise individual flags sum
    /// (1.0 for question/risk, 0.5 for action/time).
    pub fn density_score(&self) -> f32 {
        if self.word_count < 5 {
            return 0.0;
        }

        let contribution = if self.has_action_verb && self.has_time_reference {
            2.0
        } else if self.has_decision_language && self.has_assignment_language {
            1.5
        } else {
            let mut sum = 0.0;
            if self.has_question_form {
                sum += 1.0;
            }
            if self.has_risk_language {
                sum += 1.0;
            }
            if self.has_action_verb {
                sum += 0.5;
            }
            if self.has_time_reference {
                sum += 0.5;
            }
            sum
        };

        contribution / self.word_count as f32
    }

    pub fn any_signal(&self) -> bool {
        self.has_action_verb
            || self.has_time_reference
            || self.has_question_form
            || self.has_decision_language
            || self.has_assignment_language
            || self.has_risk_language
    }
}

/// Batching urgency derived from a fragment's semantic signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Immediate,
    High,
    Medium,
    /// Reserved for accumulation states; never produced by classification.
    Low,
    Skip,
}

impl Priority {
    /// How many *subsequent* fragments of context to accumulate before acting.
    ///
    /// `None` means the fragment never triggers analysis on its own.
    pub fn required_context(&self) -> Option<usize> {
        match self {
            Priority::Immediate => Some(0),
            Priority::High => Some(2),
            Priority::Medium => Some(3),
            Priority::Low => Some(4),
            Priority::Skip => None,
        }
    }
}

/// Scores transcript fragments for semantic density and classifies batching
/// urgency. Stateless apart from configuration.
#[derive(Debug, Clone)]
pub struct SignalAnalyzer {
    config: SignalConfig,
}

impl SignalAnalyzer {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    /// Derives semantic signal flags from a fragment.
    pub fn analyze(&self, fragment: &TranscriptFragment) -> SemanticSignals {
        let lower = fragment.text.to_lowercase();
        let words = normalized_words(&lower);

        SemanticSignals {
            word_count: words.len(),
            has_action_verb: contains_any_word(&words, ACTION_VERBS)
                || contains_any_phrase(&lower, ACTION_PHRASES),
            has_time_reference: contains_any_word(&words, TIME_WORDS)
                || contains_any_phrase(&lower, TIME_PHRASES)
                || has_clock_reference(&words),
            has_question_form: lower.contains('?')
                || words
                    .first()
                    .is_some_and(|w| INTERROGATIVES.contains(&w.as_str())),
            has_decision_language: contains_any_word(&words, DECISION_WORDS)
                || contains_any_phrase(&lower, DECISION_PHRASES),
            has_assignment_language: contains_any_word(&words, ASSIGNMENT_WORDS)
                || contains_any_phrase(&lower, ASSIGNMENT_PHRASES),
            has_risk_language: contains_any_word(&words, RISK_WORDS),
        }
    }

    /// Whether a fragment's density score clears the configured bar.
    pub fn is_high_density(&self, signals: &SemanticSignals) -> bool {
        signals.density_score() >= self.config.high_density_threshold
    }

    /// Classifies batching urgency from a fragment and its signals.
    pub fn classify(&self, fragment: &TranscriptFragment, signals: &SemanticSignals) -> Priority {
        if signals.word_count < self.config.min_word_count || self.is_low_information(fragment) {
            return Priority::Skip;
        }

        if (signals.has_action_verb && signals.has_time_reference)
            || (signals.has_decision_language && signals.has_assignment_language)
            || signals.has_risk_language
        {
            return Priority::Immediate;
        }

        if signals.has_action_verb
            || signals.has_time_reference
            || signals.has_question_form
            || signals.has_decision_language
        {
            return Priority::High;
        }

        Priority::Medium
    }

    /// Flags fragments that carry no analyzable content (verbal tics,
    /// stuck-key repetition, fragments of pure filler).
    pub fn is_low_information(&self, fragment: &TranscriptFragment) -> bool {
        let lower = fragment.text.to_lowercase();
        let words = normalized_words(&lower);

        if words.len() < 3 {
            return true;
        }

        let distinct: std::collections::HashSet<&str> =
            words.iter().map(|w| w.as_str()).collect();
        if (distinct.len() as f32) / (words.len() as f32) < 0.5 {
            debug!(text = %fragment.text, "Low lexical uniqueness, skipping fragment");
            return true;
        }

        let filler_count = words
            .iter()
            .filter(|w| FILLER_WORDS.contains(&w.as_str()))
            .count();
        if (filler_count as f32) / (words.len() as f32) > 0.6 {
            return true;
        }

        if words.windows(3).any(|w| w[0] == w[1] && w[1] == w[2]) {
            return true;
        }

        let substantive = words
            .iter()
            .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
            .count();
        substantive < 2
    }
}

/// Lowercased words with leading/trailing punctuation stripped.
pub(crate) fn normalized_words(lower_text: &str) -> Vec<String> {
    lower_text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Substantive (non-stopword, length > 2) words of a text, lowercased.
pub(crate) fn substantive_words(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    normalized_words(&lower)
        .into_iter()
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn contains_any_word(words: &[String], lexicon: &[&str]) -> bool {
    words.iter().any(|w| lexicon.contains(&w.as_str()))
}

fn contains_any_phrase(lower_text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| lower_text.contains(p))
}

/// Matches "5pm", "10am", "5:30pm" style words.
fn has_clock_reference(words: &[String]) -> bool {
    words.iter().any(|w| {
        (w.ends_with("am") || w.ends_with("pm"))
            && w.chars().next().is_some_and(|c| c.is_ascii_digit())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(text: &str) -> TranscriptFragment {
        TranscriptFragment::new(0, text, None)
    }

    fn analyzer() -> SignalAnalyzer {
        SignalAnalyzer::new(SignalConfig::default())
    }

    #[test]
    fn short_fragments_score_zero_and_skip() {
        let a = analyzer();
        for text in ["yes", "send tomorrow", "we decided now", "ship it now ok"] {
            let f = fragment(text);
            let signals = a.analyze(&f);
            assert_eq!(signals.density_score(), 0.0, "text: {text}");
            assert_eq!(a.classify(&f, &signals), Priority::Skip, "text: {text}");
        }
    }

    #[test]
    fn density_scales_inversely_with_word_count() {
        let a = analyzer();
        let short = fragment("we must send the report by tomorrow morning");
        let long = fragment(
            "we must send the report by tomorrow morning and also the appendix pages for everyone involved",
        );
        let s_short = a.analyze(&short);
        let s_long = a.analyze(&long);
        assert_eq!(s_long.word_count, s_short.word_count * 2);
        let ratio = s_short.density_score() / s_long.density_score();
        assert!((ratio - 2.0).abs() < 1e-6, "ratio was {ratio}");
    }

    #[test]
    fn action_plus_time_combo_dominates() {
        let a = analyzer();
        let base = fragment("please send the final report by tomorrow morning everyone");
        let loaded = fragment("please send the risky report by tomorrow morning maybe?");
        let s_base = a.analyze(&base);
        let s_loaded = a.analyze(&loaded);
        assert!(s_base.has_action_verb && s_base.has_time_reference);
        assert!(s_loaded.has_risk_language && s_loaded.has_question_form);
        assert_eq!(s_base.word_count, s_loaded.word_count);
        assert_eq!(s_base.density_score(), s_loaded.density_score());
    }

    #[test]
    fn density_bar_tracks_word_count() {
        let a = analyzer();
        let dense = a.analyze(&fragment("send the revised estimates by friday"));
        assert!(a.is_high_density(&dense));

        let diluted = a.analyze(&fragment(
            "send the revised estimates by friday or whenever the team happens to have them ready",
        ));
        assert!(!a.is_high_density(&diluted));
    }

    #[test]
    fn classify_immediate_on_action_and_time() {
        let a = analyzer();
        let f = fragment("we need to send the security report by friday");
        let s = a.analyze(&f);
        assert_eq!(a.classify(&f, &s), Priority::Immediate);
    }

    #[test]
    fn classify_immediate_on_risk() {
        let a = analyzer();
        let f = fragment("there is a serious blocker in the payment integration");
        let s = a.analyze(&f);
        assert!(s.has_risk_language);
        assert_eq!(a.classify(&f, &s), Priority::Immediate);
    }

    #[test]
    fn classify_high_on_question() {
        let a = analyzer();
        let f = fragment("what is the budget for the marketing launch?");
        let s = a.analyze(&f);
        assert!(s.has_question_form);
        assert_eq!(a.classify(&f, &s), Priority::High);
    }

    #[test]
    fn classify_medium_without_signals() {
        let a = analyzer();
        let f = fragment("the new office space has quite nice windows overall");
        let s = a.analyze(&f);
        assert!(!s.any_signal());
        assert_eq!(a.classify(&f, &s), Priority::Medium);
    }

    #[test]
    fn low_information_repetition() {
        let a = analyzer();
        assert!(a.is_low_information(&fragment("test test test something here")));
    }

    #[test]
    fn low_information_filler() {
        let a = analyzer();
        assert!(a.is_low_information(&fragment("um yeah okay so like right")));
    }

    #[test]
    fn low_information_uniqueness() {
        let a = analyzer();
        assert!(a.is_low_information(&fragment("go go stop stop go stop")));
    }

    #[test]
    fn substantial_fragment_is_not_low_information() {
        let a = analyzer();
        assert!(!a.is_low_information(&fragment(
            "the migration plan needs another database review before launch"
        )));
    }

    #[test]
    fn required_context_mapping() {
        assert_eq!(Priority::Immediate.required_context(), Some(0));
        assert_eq!(Priority::High.required_context(), Some(2));
        assert_eq!(Priority::Medium.required_context(), Some(3));
        assert_eq!(Priority::Low.required_context(), Some(4));
        assert_eq!(Priority::Skip.required_context(), None);
    }
}
