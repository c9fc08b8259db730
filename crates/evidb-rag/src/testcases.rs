//! Grounded QA test-case generation: prompt assembly, tolerant parsing of
//! the generator's output, and attribution checks against the context.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use evidb_core::{Error, Result};

use crate::grounding::GroundingContext;

/// Leading `1.`, `-` or `*` on a markdown step line.
static STEP_MARKER: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"^(?:\d+\.|[-*])\s*") {
    Ok(regex) => regex,
    Err(err) => panic!("step marker regex is invalid: {err}"),
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(rename = "Test_ID", default)]
    pub test_id: String,
    #[serde(rename = "Feature", default)]
    pub feature: String,
    #[serde(rename = "Scenario", default)]
    pub scenario: String,
    #[serde(rename = "Steps", default, deserialize_with = "steps_from_list_or_text")]
    pub steps: Vec<String>,
    #[serde(rename = "Expected_Result", default)]
    pub expected_result: String,
    #[serde(rename = "Grounded_In", default)]
    pub grounded_in: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Steps {
    List(Vec<String>),
    Text(String),
}

fn steps_from_list_or_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match Steps::deserialize(deserializer)? {
        Steps::List(steps) => steps,
        Steps::Text(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestCaseReport {
    pub grounded: Vec<TestCase>,
    /// Cases whose attribution does not resolve to any supplied citation.
    pub ungrounded: Vec<TestCase>,
}

impl TestCaseReport {
    pub fn all_grounded(&self) -> bool {
        self.ungrounded.is_empty()
    }
}

pub fn build_test_case_prompt(context: &GroundingContext, query: &str) -> String {
    let sources = context.sources().join(", ");
    format!(
        r#"You are a QA test case generation expert. Generate test cases STRICTLY based on the context documents below.

Rules:
1. Every test case MUST be grounded in the provided context.
2. Do not invent features that the context does not mention.
3. Use exact values, rules and specifications from the context.
4. Set Grounded_In to the citation marker (e.g. [1]) or the exact source name ({sources}) the case relies on.

Context:
{context}
User query: {query}

Output ONLY a JSON array, starting with [ and ending with ]. Each element has:
Test_ID, Feature, Scenario, Steps (array of strings), Expected_Result, Grounded_In.
Generate 3-5 test cases."#,
        sources = sources,
        context = context.text,
        query = query,
    )
}

/// Extract test cases from raw generator output.
///
/// Accepts a bare array, an array wrapped in a markdown code fence, an array
/// surrounded by prose, or a single object. When no JSON parses, falls back
/// to labelled markdown (see [`parse_markdown_test_cases`]).
pub fn parse_test_cases(response: &str, sources: &[&str]) -> Result<Vec<TestCase>> {
    let cleaned = strip_code_fence(response.trim());
    if let Some(array) = balanced_span(cleaned, '[', ']') {
        if let Ok(cases) = serde_json::from_str::<Vec<TestCase>>(array) {
            return Ok(cases);
        }
    }
    if let Some(object) = balanced_span(cleaned, '{', '}') {
        if let Ok(case) = serde_json::from_str::<TestCase>(object) {
            return Ok(vec![case]);
        }
    }
    let cases = parse_markdown_test_cases(response, sources);
    if !cases.is_empty() {
        tracing::debug!(cases = cases.len(), "test cases recovered from markdown");
        return Ok(cases);
    }
    let preview: String = cleaned.chars().take(200).collect();
    Err(Error::Generation(format!("no test cases in generator output: {preview}")))
}

/// Read test cases written as labelled markdown lines:
///
/// ```text
/// Test_ID: TC-001
/// Feature: Discount Code
/// Scenario: Apply SAVE15
/// Steps:
/// 1. Add an item
/// - Enter SAVE15
/// Expected Result: 15% off
/// Grounded In: product_specs.md section 2
/// ```
///
/// Each `Test_ID:` line starts a new case; a blank id becomes `TC-<n>`.
/// When `Grounded_In` mentions one of `sources` (case-insensitively) it is
/// normalised to that source name, otherwise it is kept verbatim for the
/// grounding check to judge.
pub fn parse_markdown_test_cases(text: &str, sources: &[&str]) -> Vec<TestCase> {
    let mut cases: Vec<TestCase> = Vec::new();
    let mut current: Option<TestCase> = None;
    let mut in_steps = false;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(id) = labelled(line, &["Test_ID:", "Test ID:"]) {
            cases.extend(current.take());
            current = Some(TestCase { test_id: id.to_string(), ..TestCase::default() });
            in_steps = false;
            continue;
        }
        let case = current.get_or_insert_with(TestCase::default);
        if let Some(feature) = labelled(line, &["Feature:"]) {
            case.feature = feature.to_string();
        } else if let Some(scenario) = labelled(line, &["Scenario:"]) {
            case.scenario = scenario.to_string();
        } else if labelled(line, &["Steps:"]).is_some() {
            case.steps.clear();
            in_steps = true;
        } else if let Some(expected) = labelled(line, &["Expected_Result:", "Expected Result:"]) {
            case.expected_result = expected.to_string();
            in_steps = false;
        } else if let Some(grounded) = labelled(line, &["Grounded_In:", "Grounded In:"]) {
            let lowered = grounded.to_lowercase();
            case.grounded_in = sources
                .iter()
                .find(|source| lowered.contains(&source.to_lowercase()))
                .map_or_else(|| grounded.to_string(), |source| (*source).to_string());
        } else if in_steps && STEP_MARKER.is_match(line) {
            let step = STEP_MARKER.replace(line, "");
            if !step.trim().is_empty() {
                case.steps.push(step.trim().to_string());
            }
        }
    }
    cases.extend(current);

    // prose before the first label opens a case with nothing in it
    cases.retain(|case| !(case.feature.is_empty() && case.scenario.is_empty() && case.steps.is_empty()));
    for (n, case) in cases.iter_mut().enumerate() {
        if case.test_id.is_empty() {
            case.test_id = format!("TC-{:03}", n + 1);
        }
    }
    cases
}

fn labelled<'a>(line: &'a str, labels: &[&str]) -> Option<&'a str> {
    labels.iter().find_map(|label| line.strip_prefix(label)).map(str::trim)
}

/// Split cases by whether every reference in `Grounded_In` resolves.
pub fn check_grounding(cases: Vec<TestCase>, context: &GroundingContext) -> TestCaseReport {
    let mut report = TestCaseReport::default();
    for case in cases {
        let references: Vec<&str> = case
            .grounded_in
            .split([',', ';'])
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect();
        if !references.is_empty() && references.iter().all(|r| context.is_grounded(r)) {
            report.grounded.push(case);
        } else {
            tracing::warn!(test_id = %case.test_id, grounded_in = %case.grounded_in, "test case is not grounded in the context");
            report.ungrounded.push(case);
        }
    }
    report
}

fn strip_code_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // skip a language tag such as `json`
    let body_start = after
        .find('\n')
        .filter(|&i| after[..i].trim().chars().all(char::is_alphanumeric))
        .map_or(0, |i| i + 1);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// First `open`..`close` span with balanced nesting, ignoring delimiters
/// inside JSON strings.
fn balanced_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grounding::GroundingContextBuilder;
    use evidb_core::{CharSpan, Chunk, RetrievalResult};

    const CASES: &str = r#"[
  {
    "Test_ID": "TC-001",
    "Feature": "Discount Code",
    "Scenario": "Apply valid discount code SAVE15 [promo]",
    "Steps": ["Add item", "Enter SAVE15", "Apply"],
    "Expected_Result": "15% discount applied",
    "Grounded_In": "product_specs.md"
  }
]"#;

    fn context() -> GroundingContext {
        let chunk = Chunk::new("product_specs.md", 0, "SAVE15 gives 15% off".into(), CharSpan::new(0, 20));
        GroundingContextBuilder::new(4000).build(&[RetrievalResult { chunk, score: 0.9, rank: 0, position: 0 }])
    }

    #[test]
    fn parses_bare_array() {
        let cases = parse_test_cases(CASES, &[]).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].test_id, "TC-001");
        assert_eq!(cases[0].steps.len(), 3);
    }

    #[test]
    fn parses_fenced_array_with_prose() {
        let response = format!("Here are your test cases:\n```json\n{CASES}\n```\nLet me know!");
        let cases = parse_test_cases(&response, &[]).unwrap();
        assert_eq!(cases[0].grounded_in, "product_specs.md");
    }

    #[test]
    fn brackets_inside_strings_do_not_end_the_array() {
        let cases = parse_test_cases(&format!("prefix {CASES} suffix ]"), &[]).unwrap();
        assert_eq!(cases[0].scenario, "Apply valid discount code SAVE15 [promo]");
    }

    #[test]
    fn single_object_and_text_steps_are_accepted() {
        let response = r#"{"Test_ID": "TC-9", "Steps": "1. Open cart\n2. Pay", "Grounded_In": "[1]"}"#;
        let cases = parse_test_cases(response, &[]).unwrap();
        assert_eq!(cases[0].steps, vec!["1. Open cart", "2. Pay"]);
    }

    #[test]
    fn garbage_is_a_generation_error() {
        assert!(matches!(parse_test_cases("I cannot help with that.", &["product_specs.md"]), Err(Error::Generation(_))));
    }

    const MARKDOWN: &str = "Here are the test cases.

**Case one**
Test_ID: TC-101
Feature: Discount Code
Scenario: Apply valid code SAVE15
Steps:
1. Add an item to the cart
2. Enter SAVE15
- Click Apply
Expected Result: 15% discount applied
Grounded In: Product_Specs.md, discount section

Test_ID:
Feature: Shipping
Scenario: Express shipping costs $10
Steps:
* Choose express
Expected_Result: $10 added
Grounded_In: [1]
";

    #[test]
    fn markdown_cases_are_recovered_when_json_is_absent() {
        let cases = parse_test_cases(MARKDOWN, &["product_specs.md"]).unwrap();
        assert_eq!(cases.len(), 2);

        assert_eq!(cases[0].test_id, "TC-101");
        assert_eq!(cases[0].feature, "Discount Code");
        assert_eq!(cases[0].steps, vec!["Add an item to the cart", "Enter SAVE15", "Click Apply"]);
        assert_eq!(cases[0].expected_result, "15% discount applied");
        assert_eq!(cases[0].grounded_in, "product_specs.md");

        assert_eq!(cases[1].test_id, "TC-002");
        assert_eq!(cases[1].steps, vec!["Choose express"]);
        assert_eq!(cases[1].grounded_in, "[1]");
    }

    #[test]
    fn markdown_case_without_attribution_stays_ungrounded() {
        let text = "Test_ID: TC-7\nFeature: Loyalty\nScenario: Redeem points\nExpected Result: points used";
        let cases = parse_markdown_test_cases(text, &["product_specs.md"]);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].grounded_in, "");
        assert!(cases[0].steps.is_empty());

        let report = check_grounding(cases, &context());
        assert_eq!(report.ungrounded.len(), 1);
    }

    #[test]
    fn valid_json_wins_over_markdown_labels() {
        let response = format!("Test_ID: TC-999\nFeature: ignored\n{CASES}");
        let cases = parse_test_cases(&response, &[]).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].test_id, "TC-001");
    }

    #[test]
    fn ungrounded_cases_are_reported() {
        let ctx = context();
        let mut cases = parse_test_cases(CASES, &[]).unwrap();
        let mut invented = cases[0].clone();
        invented.test_id = "TC-002".into();
        invented.grounded_in = "pricing.md".into();
        let mut by_marker = cases[0].clone();
        by_marker.test_id = "TC-003".into();
        by_marker.grounded_in = "[1]".into();
        let mut blank = cases[0].clone();
        blank.test_id = "TC-004".into();
        blank.grounded_in = String::new();
        cases.extend([invented, by_marker, blank]);

        let report = check_grounding(cases, &ctx);
        let grounded: Vec<&str> = report.grounded.iter().map(|c| c.test_id.as_str()).collect();
        let ungrounded: Vec<&str> = report.ungrounded.iter().map(|c| c.test_id.as_str()).collect();
        assert_eq!(grounded, vec!["TC-001", "TC-003"]);
        assert_eq!(ungrounded, vec!["TC-002", "TC-004"]);
        assert!(!report.all_grounded());
    }

    #[test]
    fn prompt_carries_context_and_sources() {
        let prompt = build_test_case_prompt(&context(), "discount codes");
        assert!(prompt.contains("[1] source: product_specs.md"));
        assert!(prompt.contains("User query: discount codes"));
        assert!(prompt.contains("exact source name (product_specs.md)"));
    }
}
