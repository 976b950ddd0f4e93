//! Structured-text parsing for model replies
//!
//! The decomposition, evaluation and rebranch prompts ask the model for
//! `SECTION_NAME:` blocks. Everything brittle about reading them back lives
//! here so it can be tested without an orchestrator.
//!
//! Headers are matched case-insensitively and may be wrapped in markdown
//! emphasis (`**PROMPT_SKELETON:**`) or prefixed with `#`, `-` or `>`.
//! A section's body runs from the text after the colon until the next
//! recognised header.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Why a model reply could not be turned into structured data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Missing section {0}")]
    MissingSection(&'static str),

    #[error("Prompt skeleton does not contain the marker {marker}")]
    MissingMarker { marker: String },

    #[error("Prompt skeleton contains the marker {marker} {count} times")]
    DuplicateMarker { marker: String, count: usize },

    #[error("Decomposition produced no injections")]
    NoInjections,

    #[error("Invalid header pattern: {0}")]
    Pattern(String),
}

/// One research angle: a subject label plus the text substituted at the marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub subject: String,
    pub text: String,
}

/// Parsed decomposition reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompositionResult {
    pub summary: String,
    /// Contains the injection marker exactly once
    pub skeleton: String,
    /// Between 1 and max_branches entries
    pub injections: Vec<Injection>,
    /// Whether branch outputs should go through a synthesis call
    pub synthesize: bool,
    pub synthesis_rationale: Option<String>,
}

impl DecompositionResult {
    pub fn subjects(&self) -> Vec<String> {
        self.injections.iter().map(|i| i.subject.clone()).collect()
    }
}

/// Parsed evaluation reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub ready_for_synthesis: bool,
    pub explanation: String,
    pub promising_paths: Vec<String>,
}

/// Parsed rebranch reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebranchResult {
    /// Always > 0
    pub iteration: u32,
    pub rationale: String,
    pub promising_paths: Vec<String>,
    /// Empty means "no further rounds"
    pub new_injections: Vec<Injection>,
}

impl RebranchResult {
    pub fn subjects(&self) -> Vec<String> {
        self.new_injections.iter().map(|i| i.subject.clone()).collect()
    }
}

/// Eval harness judge verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    A,
    B,
    Tie,
}

static HEADER_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[#>*_\-]+\s*)*([A-Za-z][A-Za-z0-9_]*?)[*_]*\s*:[*_]*\s*(.*)$"));

/// Headers of decomposition and rebranch replies
static PLAN_KEY_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^(?:DECOMPOSITION_SUMMARY|PROMPT_SKELETON|INJECTION_COUNT|PARALLEL_TASKS_COUNT|TASK_TYPE|INJECTION_\d+(?:_SUBJECT)?|TASK_\d+_(?:SUBJECT|PROMPT)|SYNTHESIS_RECOMMENDATION|SYNTHESIS_RATIONALE)$",
    )
});

static EVALUATION_KEY_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(?:READY_FOR_SYNTHESIS|EXPLANATION|PROMISING_PATHS)$"));

static VERDICT_KEY_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(?:BETTER|REASONING)$"));

static INJECTION_KEY_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(?:INJECTION_(\d+)(_SUBJECT)?|TASK_(\d+)_(SUBJECT|PROMPT))$"));

static LIST_ITEM_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s+(.*)$"));

fn compiled(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex, ParseError> {
    re.as_ref().map_err(|e| ParseError::Pattern(e.to_string()))
}

/// Split a reply into `(KEY, body)` pairs in order of appearance
///
/// Only labels matched by `keys` start a section; any other `Label:` line
/// stays in the body of the section above it.
fn split_sections(
    text: &str,
    keys: &'static LazyLock<Result<Regex, regex::Error>>,
) -> Result<Vec<(String, String)>, ParseError> {
    let header_re = compiled(&HEADER_RE)?;
    let key_re = compiled(keys)?;

    let mut sections: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let header = header_re.captures(line).and_then(|caps| {
            let key = caps.get(1)?.as_str().trim_end_matches('_').to_ascii_uppercase();
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            key_re.is_match(&key).then(|| (key, rest.trim_end_matches(['*', '_']).to_string()))
        });

        match header {
            Some((key, rest)) => sections.push((key, rest)),
            None => {
                if let Some((_, body)) = sections.last_mut() {
                    body.push('\n');
                    body.push_str(line);
                }
            }
        }
    }

    for (_, body) in sections.iter_mut() {
        *body = body.trim().to_string();
    }
    debug!(section_count = sections.len(), "split_sections: done");
    Ok(sections)
}

/// First occurrence of each section wins
fn section_map(sections: &[(String, String)]) -> HashMap<&str, &str> {
    let mut map = HashMap::new();
    for (key, body) in sections {
        map.entry(key.as_str()).or_insert(body.as_str());
    }
    map
}

fn parse_bool(value: &str, default: bool) -> bool {
    let word = value
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match word.trim_matches(|c: char| !c.is_alphanumeric()) {
        "true" | "yes" => true,
        "false" | "no" => false,
        _ => default,
    }
}

/// Ordered, densely re-indexed injections truncated to `max_branches`
fn collect_injections(sections: &[(String, String)], max_branches: usize) -> Result<Vec<Injection>, ParseError> {
    let injection_re = compiled(&INJECTION_KEY_RE)?;

    let mut texts: BTreeMap<u32, String> = BTreeMap::new();
    let mut subjects: HashMap<u32, String> = HashMap::new();

    for (key, body) in sections {
        let Some(caps) = injection_re.captures(key) else {
            continue;
        };
        let number = caps
            .get(1)
            .or_else(|| caps.get(3))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        let Some(number) = number else {
            continue;
        };
        let is_subject = caps.get(2).is_some() || caps.get(4).is_some_and(|m| m.as_str() == "SUBJECT");

        if body.is_empty() {
            continue;
        }
        if is_subject {
            subjects.entry(number).or_insert_with(|| body.clone());
        } else {
            texts.entry(number).or_insert_with(|| body.clone());
        }
    }

    let injections: Vec<Injection> = texts
        .into_iter()
        .take(max_branches)
        .enumerate()
        .map(|(position, (number, text))| Injection {
            subject: subjects
                .remove(&number)
                .map(|s| s.lines().next().unwrap_or("").trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("Angle {}", position + 1)),
            text,
        })
        .collect();

    Ok(injections)
}

/// Items of a numbered or bulleted list; continuation lines join the item above
fn parse_list(body: &str) -> Result<Vec<String>, ParseError> {
    let item_re = compiled(&LIST_ITEM_RE)?;
    let mut items: Vec<String> = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match item_re.captures(line).and_then(|c| c.get(1)) {
            Some(item) => items.push(item.as_str().trim().to_string()),
            None => match items.last_mut() {
                Some(last) => {
                    last.push(' ');
                    last.push_str(trimmed);
                }
                None => items.push(trimmed.to_string()),
            },
        }
    }

    Ok(items.into_iter().filter(|i| !i.is_empty()).collect())
}

/// Parse a decomposition reply
///
/// Fails closed: a skeleton without exactly one `marker`, or a reply with no
/// injections, is an error rather than a best-effort guess.
pub fn parse_decomposition(text: &str, marker: &str, max_branches: usize) -> Result<DecompositionResult, ParseError> {
    debug!(text_len = text.len(), %marker, max_branches, "parse_decomposition: called");
    let sections = split_sections(text, &PLAN_KEY_RE)?;
    let map = section_map(&sections);

    let skeleton = map
        .get("PROMPT_SKELETON")
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingSection("PROMPT_SKELETON"))?
        .to_string();

    match skeleton.matches(marker).count() {
        0 => {
            return Err(ParseError::MissingMarker {
                marker: marker.to_string(),
            });
        }
        1 => {}
        count => {
            return Err(ParseError::DuplicateMarker {
                marker: marker.to_string(),
                count,
            });
        }
    }

    let injections = collect_injections(&sections, max_branches.max(1))?;
    if injections.is_empty() {
        return Err(ParseError::NoInjections);
    }

    let result = DecompositionResult {
        summary: map.get("DECOMPOSITION_SUMMARY").copied().unwrap_or("").to_string(),
        skeleton,
        injections,
        synthesize: map
            .get("SYNTHESIS_RECOMMENDATION")
            .map(|v| parse_bool(v, true))
            .unwrap_or(true),
        synthesis_rationale: map
            .get("SYNTHESIS_RATIONALE")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
    };
    debug!(injection_count = result.injections.len(), synthesize = result.synthesize, "parse_decomposition: parsed");
    Ok(result)
}

/// Parse an evaluation reply
///
/// An unreadable READY_FOR_SYNTHESIS value counts as ready.
pub fn parse_evaluation(text: &str) -> Result<Evaluation, ParseError> {
    debug!(text_len = text.len(), "parse_evaluation: called");
    let sections = split_sections(text, &EVALUATION_KEY_RE)?;
    let map = section_map(&sections);

    let ready = map
        .get("READY_FOR_SYNTHESIS")
        .ok_or(ParseError::MissingSection("READY_FOR_SYNTHESIS"))?;

    Ok(Evaluation {
        ready_for_synthesis: parse_bool(ready, true),
        explanation: map.get("EXPLANATION").copied().unwrap_or("").to_string(),
        promising_paths: match map.get("PROMISING_PATHS") {
            Some(body) => parse_list(body)?,
            None => Vec::new(),
        },
    })
}

/// Parse a rebranch reply
///
/// The turn's skeleton is reused, so no skeleton is expected. Zero
/// injections is a valid "no further rounds" answer.
pub fn parse_rebranch(
    text: &str,
    iteration: u32,
    promising_paths: &[String],
    max_branches: usize,
) -> Result<RebranchResult, ParseError> {
    debug!(text_len = text.len(), iteration, max_branches, "parse_rebranch: called");
    let sections = split_sections(text, &PLAN_KEY_RE)?;
    let map = section_map(&sections);

    Ok(RebranchResult {
        iteration: iteration.max(1),
        rationale: map.get("DECOMPOSITION_SUMMARY").copied().unwrap_or("").to_string(),
        promising_paths: promising_paths.to_vec(),
        new_injections: collect_injections(&sections, max_branches)?,
    })
}

/// Parse the judge reply of the eval harness
pub fn parse_verdict(text: &str) -> Result<(Verdict, String), ParseError> {
    debug!(text_len = text.len(), "parse_verdict: called");
    let sections = split_sections(text, &VERDICT_KEY_RE)?;
    let map = section_map(&sections);

    let better = map.get("BETTER").ok_or(ParseError::MissingSection("BETTER"))?;
    let verdict = match better
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_ascii_uppercase()
        .as_str()
    {
        "A" => Verdict::A,
        "B" => Verdict::B,
        _ => Verdict::Tie,
    };
    Ok((verdict, map.get("REASONING").copied().unwrap_or("").to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MARKER: &str = "[INJECTION_POINT]";

    const COMPARE_REPLY: &str = "\
DECOMPOSITION_SUMMARY:
Research each option separately.

PROMPT_SKELETON:
Analyse [INJECTION_POINT] in depth.
Cover strengths and weaknesses.

INJECTION_COUNT: 2

INJECTION_1_SUBJECT: Angle: X
INJECTION_1: option X

INJECTION_2_SUBJECT: Angle: Y
INJECTION_2: option Y

SYNTHESIS_RECOMMENDATION: true
SYNTHESIS_RATIONALE: A comparison needs both sides.
";

    #[test]
    fn test_parse_well_formed_decomposition() {
        let result = parse_decomposition(COMPARE_REPLY, MARKER, 4).unwrap();

        assert_eq!(result.summary, "Research each option separately.");
        assert_eq!(result.skeleton, "Analyse [INJECTION_POINT] in depth.\nCover strengths and weaknesses.");
        assert_eq!(result.subjects(), vec!["Angle: X", "Angle: Y"]);
        assert_eq!(result.injections[1].text, "option Y");
        assert!(result.synthesize);
        assert_eq!(result.synthesis_rationale.as_deref(), Some("A comparison needs both sides."));
    }

    #[test]
    fn test_headers_tolerate_case_and_markdown() {
        let reply = "\
## **Decomposition_Summary:** plan
**prompt_skeleton:**
   Look at [INJECTION_POINT]
- __Injection_1_Subject__: First
injection_1:   first text
Synthesis_Recommendation: FALSE
";
        let result = parse_decomposition(reply, MARKER, 4).unwrap();
        assert_eq!(result.summary, "plan");
        assert_eq!(result.skeleton, "Look at [INJECTION_POINT]");
        assert_eq!(result.injections[0].subject, "First");
        assert_eq!(result.injections[0].text, "first text");
        assert!(!result.synthesize);
    }

    #[test]
    fn test_missing_marker_fails_closed() {
        let reply = COMPARE_REPLY.replace("[INJECTION_POINT]", "the option");
        assert_eq!(
            parse_decomposition(&reply, MARKER, 4),
            Err(ParseError::MissingMarker {
                marker: MARKER.to_string()
            })
        );
    }

    #[test]
    fn test_duplicate_marker_fails_closed() {
        let reply = COMPARE_REPLY.replace("in depth.", "in depth, then [INJECTION_POINT] again.");
        assert!(matches!(
            parse_decomposition(&reply, MARKER, 4),
            Err(ParseError::DuplicateMarker { count: 2, .. })
        ));
    }

    #[test]
    fn test_missing_skeleton_section() {
        let reply = "DECOMPOSITION_SUMMARY: x\nINJECTION_1: a\n";
        assert_eq!(
            parse_decomposition(reply, MARKER, 4),
            Err(ParseError::MissingSection("PROMPT_SKELETON"))
        );
    }

    #[test]
    fn test_no_injections_fails() {
        let reply = "PROMPT_SKELETON: Study [INJECTION_POINT]\nINJECTION_COUNT: 0\n";
        assert_eq!(parse_decomposition(reply, MARKER, 4), Err(ParseError::NoInjections));
    }

    #[test]
    fn test_injections_truncated_and_reindexed() {
        let reply = "\
PROMPT_SKELETON: Study [INJECTION_POINT]
INJECTION_7: seventh
INJECTION_2: second
INJECTION_4_SUBJECT: Fourth
INJECTION_4: fourth
";
        let result = parse_decomposition(reply, MARKER, 2).unwrap();
        assert_eq!(result.injections.len(), 2);
        assert_eq!(result.injections[0].text, "second");
        assert_eq!(result.injections[0].subject, "Angle 1");
        assert_eq!(result.injections[1].subject, "Fourth");
    }

    #[test]
    fn test_task_prompt_aliases_accepted() {
        let reply = "\
PROMPT_SKELETON: [INJECTION_POINT]
PARALLEL_TASKS_COUNT: 1
TASK_1_SUBJECT: PostgreSQL
TASK_1_PROMPT: Analyse PostgreSQL
";
        let result = parse_decomposition(reply, MARKER, 4).unwrap();
        assert_eq!(result.injections[0].subject, "PostgreSQL");
        assert_eq!(result.injections[0].text, "Analyse PostgreSQL");
    }

    #[test]
    fn test_unknown_labels_stay_in_body() {
        let reply = "PROMPT_SKELETON:\nNote: be brief.\nFocus on [INJECTION_POINT]\nINJECTION_1: a\n";
        let result = parse_decomposition(reply, MARKER, 4).unwrap();
        assert_eq!(result.skeleton, "Note: be brief.\nFocus on [INJECTION_POINT]");
    }

    #[test]
    fn test_other_reply_labels_stay_in_skeleton() {
        let reply = "\
PROMPT_SKELETON:
Reasoning: be rigorous and cite sources.
Analyse [INJECTION_POINT] in depth.
Explanation: keep it short.
INJECTION_1: option X
";
        let result = parse_decomposition(reply, MARKER, 4).unwrap();
        assert_eq!(
            result.skeleton,
            "Reasoning: be rigorous and cite sources.\nAnalyse [INJECTION_POINT] in depth.\nExplanation: keep it short."
        );
        assert_eq!(result.injections[0].text, "option X");
    }

    #[test]
    fn test_plan_labels_stay_in_evaluation_body() {
        let reply = "READY_FOR_SYNTHESIS: false\nEXPLANATION:\nPrompt_Skeleton: was too broad.\n";
        let eval = parse_evaluation(reply).unwrap();
        assert_eq!(eval.explanation, "Prompt_Skeleton: was too broad.");
    }

    #[test]
    fn test_parse_evaluation_not_ready() {
        let reply = "\
READY_FOR_SYNTHESIS: false

EXPLANATION:
Results contradict each other.

PROMISING_PATHS:
1. Compare benchmarks directly.
2) Look at production case
   studies from 2024.
";
        let eval = parse_evaluation(reply).unwrap();
        assert!(!eval.ready_for_synthesis);
        assert_eq!(eval.explanation, "Results contradict each other.");
        assert_eq!(
            eval.promising_paths,
            vec!["Compare benchmarks directly.", "Look at production case studies from 2024."]
        );
    }

    #[test]
    fn test_parse_evaluation_ready_without_paths() {
        let eval = parse_evaluation("READY_FOR_SYNTHESIS: **true**\nEXPLANATION: fine").unwrap();
        assert!(eval.ready_for_synthesis);
        assert!(eval.promising_paths.is_empty());
    }

    #[test]
    fn test_parse_evaluation_missing_flag() {
        assert_eq!(
            parse_evaluation("EXPLANATION: ?"),
            Err(ParseError::MissingSection("READY_FOR_SYNTHESIS"))
        );
    }

    #[test]
    fn test_parse_rebranch() {
        let reply = "\
DECOMPOSITION_SUMMARY: Dig into benchmarks.
INJECTION_COUNT: 1
INJECTION_1_SUBJECT: Benchmarks
INJECTION_1: published benchmarks of X and Y
";
        let paths = vec!["Compare benchmarks".to_string()];
        let result = parse_rebranch(reply, 1, &paths, 4).unwrap();
        assert_eq!(result.iteration, 1);
        assert_eq!(result.rationale, "Dig into benchmarks.");
        assert_eq!(result.promising_paths, paths);
        assert_eq!(result.subjects(), vec!["Benchmarks"]);
    }

    #[test]
    fn test_parse_rebranch_zero_injections_is_ok() {
        let result = parse_rebranch("DECOMPOSITION_SUMMARY: nothing\nINJECTION_COUNT: 0", 2, &[], 4).unwrap();
        assert!(result.new_injections.is_empty());
    }

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("BETTER: A\nREASONING: deeper").unwrap(), (Verdict::A, "deeper".to_string()));
        assert_eq!(parse_verdict("better: **b**").unwrap().0, Verdict::B);
        assert_eq!(parse_verdict("BETTER: TIE").unwrap().0, Verdict::Tie);
        assert!(parse_verdict("no verdict").is_err());
    }

    #[test]
    fn test_verdict_reasoning_keeps_explanation_line() {
        let (verdict, reasoning) = parse_verdict("BETTER: B\nREASONING:\nExplanation: B cites sources.").unwrap();
        assert_eq!(verdict, Verdict::B);
        assert_eq!(reasoning, "Explanation: B cites sources.");
    }

    fn words() -> impl Strategy<Value = String> {
        "[a-z]{1,8}( [a-z]{1,8}){0,4}"
    }

    proptest! {
        #[test]
        fn prop_well_formed_reply_round_trips(
            summary in words(),
            prefix in words(),
            suffix in words(),
            angles in prop::collection::vec((words(), words()), 1..=5),
            upper in any::<bool>(),
        ) {
            let header = |h: &str| if upper { h.to_string() } else { h.to_lowercase() };
            let mut reply = format!(
                "{}:\n{}\n\n{}:\n{} {} {}\n\n{}: {}\n\n",
                header("DECOMPOSITION_SUMMARY"), summary,
                header("PROMPT_SKELETON"), prefix, MARKER, suffix,
                header("INJECTION_COUNT"), angles.len(),
            );
            for (i, (subject, text)) in angles.iter().enumerate() {
                reply.push_str(&format!(
                    "{}: {}\n{}: {}\n\n",
                    header(&format!("INJECTION_{}_SUBJECT", i + 1)), subject,
                    header(&format!("INJECTION_{}", i + 1)), text,
                ));
            }
            reply.push_str(&format!("{}: true\n", header("SYNTHESIS_RECOMMENDATION")));

            let result = parse_decomposition(&reply, MARKER, 5).unwrap();
            prop_assert_eq!(result.injections.len(), angles.len());
            prop_assert_eq!(result.skeleton.matches(MARKER).count(), 1);
            for (parsed, (subject, text)) in result.injections.iter().zip(angles.iter()) {
                prop_assert_eq!(&parsed.subject, subject);
                prop_assert_eq!(&parsed.text, text);
            }
        }

        #[test]
        fn prop_reply_without_marker_never_parses(
            skeleton in words(),
            angles in prop::collection::vec(words(), 1..=5),
        ) {
            let mut reply = format!("PROMPT_SKELETON:\n{}\n", skeleton);
            for (i, text) in angles.iter().enumerate() {
                reply.push_str(&format!("INJECTION_{}: {}\n", i + 1, text));
            }
            let is_missing_marker = matches!(
                parse_decomposition(&reply, MARKER, 5),
                Err(ParseError::MissingMarker { .. })
            );
            prop_assert!(is_missing_marker);
        }
    }
}
