//! Test runner report parsers.
//!
//! Both parsers write into a [`ReportCard`] that already carries the run's
//! exit-status verdict; they can only lower it.

use std::sync::LazyLock;
use std::time::Duration;

use daycare_spec::ReportCard;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use regex::Regex;
use serde::Deserialize;

static GTEST_CONTEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(tests/[^:/]*:\d+)").expect("valid regex"));
static PYTHON_CONTEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "[^"]*/([^/]+)", line (\d+)"#).expect("valid regex"));

#[derive(Debug, Default, Deserialize)]
struct XUnitSuites {
    #[serde(rename = "testsuite", default)]
    suites: Vec<XUnitSuite>,
}

#[derive(Debug, Default, Deserialize)]
struct XUnitSuite {
    #[serde(rename = "@tests", default)]
    tests: u32,
    #[serde(rename = "@failures", default)]
    failures: u32,
    #[serde(rename = "@disabled", default)]
    disabled: u32,
    #[serde(rename = "@skipped", default)]
    skipped: u32,
    #[serde(rename = "@errors", default)]
    errors: u32,
    #[serde(rename = "testcase", default)]
    cases: Vec<XUnitCase>,
}

#[derive(Debug, Deserialize)]
struct XUnitCase {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@classname", default)]
    classname: String,
    #[serde(rename = "@status", default)]
    status: String,
    failure: Option<XUnitDetail>,
    error: Option<XUnitDetail>,
    disabled: Option<XUnitDetail>,
    skipped: Option<XUnitDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct XUnitDetail {
    #[serde(rename = "$text", default)]
    body: String,
}

impl XUnitCase {
    fn display_name(&self) -> String {
        if self.classname.is_empty() {
            self.name.clone()
        } else {
            format!("{} -> {}", self.classname, self.name)
        }
    }

    /// Body of the first problem child, or `None` for a passing case.
    fn problem(&self) -> Option<&str> {
        let detail = self
            .failure
            .as_ref()
            .or(self.error.as_ref())
            .or(self.disabled.as_ref())
            .or(self.skipped.as_ref());
        match detail {
            Some(detail) => Some(detail.body.as_str()),
            None if self.status.is_empty() || self.status == "run" => None,
            None => Some(""),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CheckSuites {
    #[serde(rename = "suite", default)]
    suites: Vec<CheckSuite>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckSuite {
    #[serde(rename = "test", default)]
    tests: Vec<CheckTest>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckTest {
    #[serde(rename = "@result", default)]
    result: String,
    #[serde(rename = "fn", default)]
    function: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    message: String,
}

/// Best-effort `file:line` location of a failure.
pub fn failure_context(body: &str) -> String {
    if let Some(groups) = GTEST_CONTEXT.captures(body) {
        return groups[1].to_string();
    }
    if let Some(groups) = PYTHON_CONTEXT.captures(body) {
        return format!("{}:{}", &groups[1], &groups[2]);
    }
    String::new()
}

/// Local name of the document's root element.
fn root_element(contents: &str) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(contents);
    loop {
        match reader.read_event()? {
            XmlEvent::Start(element) | XmlEvent::Empty(element) => {
                return Ok(String::from_utf8_lossy(element.local_name().as_ref()).into_owned());
            }
            XmlEvent::Eof => return Ok(String::new()),
            _ => {}
        }
    }
}

fn decode_xunit(contents: &str) -> Result<Vec<XUnitSuite>, String> {
    let root = root_element(contents).map_err(|e| e.to_string())?;
    match root.as_str() {
        "testsuites" => quick_xml::de::from_str::<XUnitSuites>(contents)
            .map(|doc| doc.suites)
            .map_err(|e| e.to_string()),
        "testsuite" => quick_xml::de::from_str::<XUnitSuite>(contents)
            .map(|suite| vec![suite])
            .map_err(|e| e.to_string()),
        other => Err(format!("unexpected root element <{other}>")),
    }
}

/// Fold an xUnit report into `card`.
pub fn parse_xunit(card: &mut ReportCard, contents: &[u8], elapsed: Duration) {
    if contents.is_empty() {
        card.log_and_fail("No unit test results found");
        return;
    }
    let text = String::from_utf8_lossy(contents);
    let suites = match decode_xunit(&text) {
        Ok(suites) => suites,
        Err(err) => {
            card.log_and_fail(format!("error parsing unit test results: {err}"));
            return;
        }
    };

    let tests: u32 = suites.iter().map(|s| s.tests).sum();
    let fails: u32 = suites
        .iter()
        .map(|s| s.failures + s.disabled + s.skipped + s.errors)
        .sum();
    card.note = format!(
        "Passed {}/{} tests in {:.2?}",
        tests.saturating_sub(fails),
        tests,
        elapsed
    );
    card.passed = card.passed && tests > 0 && fails == 0;

    for case in suites.iter().flat_map(|s| &s.cases) {
        let name = case.display_name();
        match case.problem() {
            None => card.add_passed_result(name, ""),
            Some(body) => card.add_failed_result(name, body, failure_context(body)),
        }
    }
}

/// Fold a libcheck XML report into `card`.
pub fn parse_check(card: &mut ReportCard, contents: &[u8], elapsed: Duration) {
    if contents.is_empty() {
        card.log_and_fail("No unit test results found");
        return;
    }
    let text = String::from_utf8_lossy(contents);
    let decoded = match root_element(&text) {
        Ok(root) if root == "testsuites" => {
            quick_xml::de::from_str::<CheckSuites>(&text).map_err(|e| e.to_string())
        }
        Ok(root) => Err(format!("unexpected root element <{root}>")),
        Err(err) => Err(err.to_string()),
    };
    let doc = match decoded {
        Ok(doc) => doc,
        Err(err) => {
            card.log_and_fail(format!("error parsing unit test results: {err}"));
            return;
        }
    };

    let (mut successes, mut failures) = (0usize, 0usize);
    for test in doc.suites.iter().flat_map(|s| &s.tests) {
        if test.result == "success" {
            successes += 1;
            card.add_passed_result(&test.id, &test.message);
        } else {
            // failure, error, and anything unrecognized
            failures += 1;
            card.add_failed_result(&test.id, &test.message, &test.function);
        }
    }

    card.passed = card.passed && successes > 0 && failures == 0;
    let total = successes + failures;
    card.note = if total == 0 {
        format!("No test results found in {elapsed:.2?}")
    } else {
        format!("Passed {successes}/{total} tests in {elapsed:.2?}")
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use daycare_spec::Outcome;

    const ELAPSED: Duration = Duration::from_millis(1500);

    const GTEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites tests="3" failures="1" disabled="0" errors="0" time="0.01" name="AllTests">
  <testsuite name="Fizz" tests="3" failures="1" disabled="0" errors="0" time="0.01">
    <testcase name="Three" status="run" time="0" classname="Fizz" />
    <testcase name="Five" status="run" time="0" classname="Fizz" />
    <testcase name="Fifteen" status="run" time="0" classname="Fizz">
      <failure message="boom" type=""><![CDATA[tests/fizz.cpp:42
Expected: "FizzBuzz"]]></failure>
    </testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn test_xunit_one_failure() {
        let mut card = ReportCard::new();
        parse_xunit(&mut card, GTEST.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.note, "Passed 2/3 tests in 1.50s");
        let outcomes: Vec<Outcome> = card.results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![Outcome::Passed, Outcome::Passed, Outcome::Failed]
        );
        assert_eq!(card.results[0].name, "Fizz -> Three");
        assert_eq!(card.results[2].context, "tests/fizz.cpp:42");
        assert!(card.results[2].details.contains("FizzBuzz"));
    }

    #[test]
    fn test_xunit_all_pass_keeps_exit_verdict() {
        let xml = r#"<testsuites><testsuite tests="1" failures="0"><testcase name="ok"/></testsuite></testsuites>"#;
        let mut card = ReportCard::new();
        parse_xunit(&mut card, xml.as_bytes(), ELAPSED);
        assert!(card.passed);
        assert_eq!(card.results[0].name, "ok");

        let mut card = ReportCard::new();
        card.passed = false;
        parse_xunit(&mut card, xml.as_bytes(), ELAPSED);
        assert!(!card.passed);
    }

    #[test]
    fn test_xunit_bare_testsuite_root() {
        let xml = r#"<testsuite name="pytest" tests="2" errors="0" failures="0" skipped="1">
  <testcase classname="test_main.TestFizz" name="test_three" time="0.001"/>
  <testcase classname="test_main.TestFizz" name="test_five" time="0.001">
    <skipped message="later"/>
  </testcase>
</testsuite>"#;
        let mut card = ReportCard::new();
        parse_xunit(&mut card, xml.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.results.len(), 2);
        assert_eq!(card.results[1].outcome, Outcome::Failed);
        assert_eq!(card.note, "Passed 1/2 tests in 1.50s");
    }

    #[test]
    fn test_xunit_cases_split_by_other_elements() {
        let xml = r#"<testsuite name="pytest" tests="3" failures="1">
  <properties><property name="python" value="3.12"/></properties>
  <testcase classname="t" name="a"/>
  <system-out>x</system-out>
  <testcase classname="t" name="b"><failure>boom</failure></testcase>
  <system-err>y</system-err>
  <testcase classname="t" name="c"/>
</testsuite>"#;
        let mut card = ReportCard::new();
        parse_xunit(&mut card, xml.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.note, "Passed 2/3 tests in 1.50s");
        let names: Vec<&str> = card.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["t -> a", "t -> b", "t -> c"]);
        assert_eq!(card.results[1].outcome, Outcome::Failed);
    }

    #[test]
    fn test_xunit_zero_tests_fails() {
        let xml = r#"<testsuites><testsuite tests="0"/></testsuites>"#;
        let mut card = ReportCard::new();
        parse_xunit(&mut card, xml.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert!(card.results.is_empty());
    }

    #[test]
    fn test_xunit_empty_file() {
        let mut card = ReportCard::new();
        parse_xunit(&mut card, b"", ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.note, "No unit test results found");
    }

    #[test]
    fn test_xunit_garbage() {
        let mut card = ReportCard::new();
        parse_xunit(&mut card, b"<html><body>oops</body></html>", ELAPSED);
        assert!(!card.passed);
        assert!(card.note.starts_with("error parsing unit test results"));
    }

    #[test]
    fn test_python_failure_context() {
        let body = r#"Traceback (most recent call last):
  File "/home/student/tests/test_main.py", line 12, in test_fifteen
    self.assertEqual(fizz(15), "FizzBuzz")
AssertionError: 15 != 'FizzBuzz'"#;
        assert_eq!(failure_context(body), "test_main.py:12");
        assert_eq!(failure_context("no location here"), "");
    }

    const CHECK: &str = r#"<?xml version="1.0"?>
<testsuites xmlns="http://check.sourceforge.net/ns">
  <datetime>2024-01-15 09:30:00</datetime>
  <suite>
    <title>fizz</title>
    <test result="success">
      <path>.</path>
      <fn>tests.c:10</fn>
      <id>test_three</id>
      <iteration>0</iteration>
      <duration>0.000100</duration>
      <description>core</description>
      <message>Passed</message>
    </test>
    <test result="failure">
      <path>.</path>
      <fn>tests.c:20</fn>
      <id>test_fifteen</id>
      <iteration>0</iteration>
      <duration>0.000100</duration>
      <description>core</description>
      <message>expected FizzBuzz</message>
    </test>
  </suite>
  <duration>0.001</duration>
</testsuites>"#;

    #[test]
    fn test_check_results() {
        let mut card = ReportCard::new();
        parse_check(&mut card, CHECK.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.note, "Passed 1/2 tests in 1.50s");
        assert_eq!(card.results[0].name, "test_three");
        assert_eq!(card.results[0].details, "Passed");
        assert_eq!(card.results[1].context, "tests.c:20");
    }

    #[test]
    fn test_check_unknown_result_is_error() {
        let xml = CHECK.replace("result=\"failure\"", "result=\"timeout\"");
        let mut card = ReportCard::new();
        parse_check(&mut card, xml.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.results[1].outcome, Outcome::Failed);
    }

    #[test]
    fn test_check_no_tests() {
        let xml = r#"<testsuites><suite><title>empty</title></suite></testsuites>"#;
        let mut card = ReportCard::new();
        parse_check(&mut card, xml.as_bytes(), ELAPSED);
        assert!(!card.passed);
        assert_eq!(card.note, "No test results found in 1.50s");
    }
}
