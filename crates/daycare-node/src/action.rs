//! Runs an action's command and grades the result.

use std::time::Duration;

use daycare_spec::{OutputParser, ProblemTypeAction, ReportCard, RESULTS_FILE};
use tracing::warn;

use crate::nanny::Nanny;
use crate::parsers::{parse_check, parse_xunit};

type ReportParser = fn(&mut ReportCard, &[u8], Duration);

/// Run `action` in the nanny's container and record the outcome in `card`.
///
/// Failures of the code under test and of the exec plumbing both end up as a
/// failed card; nothing here aborts the session.
pub async fn run_action(nanny: &mut Nanny, action: &ProblemTypeAction, card: &mut ReportCard) {
    let command = action.command_line();
    if command.is_empty() {
        card.log_and_fail("action has no command");
        return;
    }
    match action.output_parser() {
        Ok(OutputParser::XUnit) => run_and_parse(nanny, &command, card, parse_xunit).await,
        Ok(OutputParser::Check) => run_and_parse(nanny, &command, card, parse_check).await,
        Ok(OutputParser::Plain) => run_plain(nanny, &command, card).await,
        Err(err) => card.log_and_fail(err.to_string()),
    }
}

async fn run_plain(nanny: &mut Nanny, command: &[String], card: &mut ReportCard) {
    let line = command.join(" ");
    match nanny.exec(command).await {
        Ok(output) if output.status != 0 => {
            card.log_and_fail(format!("{line:?} failed with exit status {}", output.status));
        }
        Ok(_) => {}
        Err(err) => card.log_and_fail(format!("{line:?} exec error: {err}")),
    }
}

async fn run_and_parse(
    nanny: &mut Nanny,
    command: &[String],
    card: &mut ReportCard,
    parse: ReportParser,
) {
    let output = match nanny.exec(command).await {
        Ok(output) => output,
        Err(err) => {
            card.log_and_fail(format!("Error running unit tests: {err}"));
            return;
        }
    };

    // killed by a signal; whatever XML exists is not trustworthy
    if output.status > 127 {
        card.log_and_fail(format!(
            "Crashed with exit status {} while running unit tests",
            output.status
        ));
        return;
    }
    card.passed = output.status == 0;

    let mut files = match nanny.get_files(&[RESULTS_FILE.to_string()]).await {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %err, "failed to copy unit test results");
            card.log_and_fail("Error getting unit test results");
            return;
        }
    };
    let contents = files.remove(RESULTS_FILE).unwrap_or_default();
    parse(card, &contents, nanny.elapsed());
}
