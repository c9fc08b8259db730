//! Selenium script generation for a grounded test case against a page's
//! markup.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::grounding::GroundingContext;
use crate::testcases::TestCase;

pub const DEFAULT_TEST_URL: &str = "https://example.com/checkout";
pub const FALLBACK_SCRIPT_QUERY: &str = "Selenium automation testing";

const MAX_CLASSES: usize = 20;
const LISTED_PER_KIND: usize = 15;
const LISTED_SELECTORS: usize = 30;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"(?s)<!--.*?-->") {
    Ok(regex) => regex,
    Err(err) => panic!("comment regex is invalid: {err}"),
});

static TAG: LazyLock<Regex> = LazyLock::new(|| match Regex::new(r"<[A-Za-z][^>]*>") {
    Ok(regex) => regex,
    Err(err) => panic!("tag regex is invalid: {err}"),
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r#"(?i)[\s/](id|name|class)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#) {
        Ok(regex) => regex,
        Err(err) => panic!("attribute regex is invalid: {err}"),
    }
});

/// Locator candidates found in a page, deduplicated in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HtmlSelectors {
    pub ids: Vec<String>,
    pub names: Vec<String>,
    /// At most the first 20 distinct classes.
    pub classes: Vec<String>,
}

impl HtmlSelectors {
    /// CSS selector reference lines, ids first, then names, then classes.
    pub fn selectors(&self) -> Vec<String> {
        let ids = self.ids.iter().map(|id| format!("#id: #{id}"));
        let names = self.names.iter().map(|name| format!("#name: [name='{name}']"));
        let classes = self.classes.iter().map(|class| format!("#class: .{class}"));
        ids.chain(names).chain(classes).collect()
    }

    pub fn counts(&self) -> SelectorCounts {
        SelectorCounts { ids: self.ids.len(), names: self.names.len(), classes: self.classes.len() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectorCounts {
    pub ids: usize,
    pub names: usize,
    pub classes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedScript {
    pub test_id: String,
    pub script: String,
    pub language: &'static str,
    pub selectors: SelectorCounts,
    pub sources: Vec<String>,
}

/// Collect `id`, `name` and `class` attribute values from start tags.
/// Markup is scanned, not parsed; comments are skipped.
pub fn extract_html_selectors(html: &str) -> HtmlSelectors {
    let mut selectors = HtmlSelectors::default();
    let mut seen: [HashSet<String>; 3] = Default::default();
    let html = COMMENT.replace_all(html, "");
    for tag in TAG.find_iter(&html) {
        for attr in ATTRIBUTE.captures_iter(tag.as_str()) {
            let Some(value) = attr.get(2).or_else(|| attr.get(3)).or_else(|| attr.get(4)) else {
                continue;
            };
            let kind = attr.get(1).map_or_else(String::new, |k| k.as_str().to_ascii_lowercase());
            let (slot, values) = match kind.as_str() {
                "id" => (0, value.as_str().split_whitespace().take(1).collect::<Vec<_>>()),
                "name" => (1, vec![value.as_str().trim()]),
                _ => (2, value.as_str().split_whitespace().collect()),
            };
            for value in values.into_iter().filter(|v| !v.is_empty()) {
                if !seen[slot].insert(value.to_string()) {
                    continue;
                }
                let target = match slot {
                    0 => &mut selectors.ids,
                    1 => &mut selectors.names,
                    _ => &mut selectors.classes,
                };
                target.push(value.to_string());
            }
        }
    }
    selectors.classes.truncate(MAX_CLASSES);
    selectors
}

/// Retrieval query for a test case: its feature and scenario.
pub fn script_query(case: &TestCase) -> String {
    let query = format!("{} {}", case.feature, case.scenario);
    match query.trim() {
        "" => FALLBACK_SCRIPT_QUERY.to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn listed(values: &[String]) -> String {
    if values.is_empty() {
        return "None found".to_string();
    }
    values.iter().take(LISTED_PER_KIND).map(String::as_str).collect::<Vec<_>>().join(", ")
}

pub fn build_script_prompt(case: &TestCase, selectors: &HtmlSelectors, context: &GroundingContext, url: &str) -> String {
    let test_id = if case.test_id.is_empty() { "TC_001" } else { case.test_id.as_str() };
    let feature = if case.feature.is_empty() { "Checkout" } else { case.feature.as_str() };
    let steps = case.steps.join("; ");
    let reference = selectors.selectors();
    let reference = if reference.is_empty() {
        "No selectors found".to_string()
    } else {
        reference.into_iter().take(LISTED_SELECTORS).collect::<Vec<_>>().join("\n")
    };
    let docs = if context.is_empty() { "No additional documentation provided." } else { context.text.as_str() };
    format!(
        r#"You are an expert Selenium Python automation engineer. Generate a production-quality, fully runnable Selenium script.

Test Case Information:
- Test_ID: {test_id}
- Feature: {feature}
- Scenario: {scenario}
- Steps: {steps}
- Expected_Result: {expected}

HTML Structure Analysis:
Available IDs: {ids}
Available Names: {names}
Available Classes: {classes}

Complete Selector Reference:
{reference}

Relevant Documentation Context:
{docs}

Requirements:
1. Use webdriver.Chrome() for browser initialization.
2. Prefer IDs, then names, then classes, then other CSS selectors.
3. Use only selectors present in the HTML structure above.
4. Import everything the script uses: webdriver, By, WebDriverWait, expected_conditions as EC, Service, Options.
5. Wait with WebDriverWait for dynamic elements; never time.sleep().
6. Wrap the test in try/except/finally.
7. Comment each major step.
8. Assert the expected result of the test case.
9. Close the browser in the finally block.
10. Handle form validation errors the test case mentions.
11. No hardcoded waits.
12. The script must run as is.

Test URL: {url}

Output ONLY the Python code, no explanations:"#,
        scenario = case.scenario,
        expected = case.expected_result,
        ids = listed(&selectors.ids),
        names = listed(&selectors.names),
        classes = listed(&selectors.classes),
    )
}

/// Drop a surrounding markdown fence from generated code.
pub fn clean_script(raw: &str) -> String {
    let mut script = raw.trim();
    if let Some(rest) = script.strip_prefix("```python") {
        script = rest;
    } else if let Some(rest) = script.strip_prefix("```") {
        script = rest;
    }
    script = script.trim();
    if let Some(rest) = script.strip_suffix("```") {
        script = rest.trim_end();
    }
    script.to_string()
}
