use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::HarnessError;
use crate::runner::{Outcome, RunReport, TestResult};

fn xml_error(e: impl std::fmt::Display) -> HarnessError {
    HarnessError::Internal(format!("writing junit xml: {}", e))
}

fn seconds(d: std::time::Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

/// Render the run as a JUnit XML document.
pub fn render(report: &RunReport) -> Result<String, HarnessError> {
    let mut w = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None))).map_err(xml_error)?;

    let tests = report.results.len().to_string();
    let failures = report.failed().to_string();
    let skipped = report.skipped().to_string();
    let time = seconds(report.duration);
    let timestamp = report.started_at.to_rfc3339();

    w.write_event(Event::Start(BytesStart::new("testsuites").with_attributes([
        ("name", report.suite.as_str()),
        ("tests", tests.as_str()),
        ("failures", failures.as_str()),
        ("skipped", skipped.as_str()),
        ("time", time.as_str()),
    ])))
    .map_err(xml_error)?;
    w.write_event(Event::Start(BytesStart::new("testsuite").with_attributes([
        ("name", report.suite.as_str()),
        ("tests", tests.as_str()),
        ("failures", failures.as_str()),
        ("errors", "0"),
        ("skipped", skipped.as_str()),
        ("time", time.as_str()),
        ("timestamp", timestamp.as_str()),
    ])))
    .map_err(xml_error)?;

    for result in &report.results {
        write_case(&mut w, &report.suite, result)?;
    }

    w.write_event(Event::End(BytesEnd::new("testsuite"))).map_err(xml_error)?;
    w.write_event(Event::End(BytesEnd::new("testsuites"))).map_err(xml_error)?;
    String::from_utf8(w.into_inner().into_inner()).map_err(xml_error)
}

fn write_case(w: &mut Writer<Cursor<Vec<u8>>>, suite: &str, result: &TestResult) -> Result<(), HarnessError> {
    let time = seconds(result.duration);
    let start = BytesStart::new("testcase").with_attributes([
        ("name", result.name.as_str()),
        ("classname", suite),
        ("time", time.as_str()),
    ]);
    if matches!(result.outcome, Outcome::Passed) && result.teardown.is_clean() {
        return w.write_event(Event::Empty(start)).map_err(xml_error);
    }

    w.write_event(Event::Start(start)).map_err(xml_error)?;
    match &result.outcome {
        Outcome::Passed => {}
        Outcome::Failed(message) => {
            let summary = message.lines().next().unwrap_or_default();
            w.write_event(Event::Start(BytesStart::new("failure").with_attributes([("message", summary)])))
                .map_err(xml_error)?;
            w.write_event(Event::Text(BytesText::new(message))).map_err(xml_error)?;
            w.write_event(Event::End(BytesEnd::new("failure"))).map_err(xml_error)?;
        }
        Outcome::Skipped(reason) => {
            w.write_event(Event::Empty(BytesStart::new("skipped").with_attributes([("message", reason.as_str())])))
                .map_err(xml_error)?;
        }
    }
    if !result.teardown.is_clean() {
        let text = format!("teardown errors:\n{}", result.teardown.errors.join("\n"));
        w.write_event(Event::Start(BytesStart::new("system-err"))).map_err(xml_error)?;
        w.write_event(Event::Text(BytesText::new(&text))).map_err(xml_error)?;
        w.write_event(Event::End(BytesEnd::new("system-err"))).map_err(xml_error)?;
    }
    w.write_event(Event::End(BytesEnd::new("testcase"))).map_err(xml_error)
}

pub fn write(path: &Path, report: &RunReport) -> Result<(), HarnessError> {
    let xml = render(report)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
    }
    std::fs::write(path, xml).map_err(|e| HarnessError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TeardownReport;
    use chrono::Utc;
    use std::time::Duration;

    fn result(name: &str, outcome: Outcome) -> TestResult {
        TestResult { name: name.into(), outcome, duration: Duration::from_millis(1500), teardown: TeardownReport::default() }
    }

    fn report() -> RunReport {
        let mut leaky = result("leaky", Outcome::Passed);
        leaky.teardown.errors.push("resource group rg-1: conflict".into());
        RunReport {
            suite:      "critical".into(),
            started_at: Utc::now(),
            duration:   Duration::from_secs(3),
            results:    vec![
                result("ok", Outcome::Passed),
                result("bad", Outcome::Failed("expected <403> got 500\nmore detail".into())),
                result("gated", Outcome::Skipped("IntegrationOnly test skipped in development environment".into())),
                leaky,
            ],
        }
    }

    #[test]
    fn renders_counts_and_cases() {
        let xml = render(&report()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(r#"<testsuite name="critical" tests="4" failures="1" errors="0" skipped="1""#), "{}", xml);
        assert!(xml.contains(r#"<testcase name="ok" classname="critical" time="1.500"/>"#), "{}", xml);
        assert!(xml.contains(r#"<failure message="expected &lt;403&gt; got 500">"#), "{}", xml);
        assert!(xml.contains("<skipped message=\"IntegrationOnly test skipped in development environment\"/>"));
        assert!(xml.contains("resource group rg-1: conflict"));
    }

    #[test]
    fn writes_file_creating_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/junit.xml");
        write(&path, &report()).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("<testsuites"));
    }
}
