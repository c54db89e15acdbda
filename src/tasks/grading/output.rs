use std::collections::BTreeMap;

/// Parses the `Label : Status` line protocol. Lines without a colon are dropped;
/// only the first colon splits, so statuses may contain colons themselves.
pub(crate) fn parse_output(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(label, status)| (label.trim().to_string(), status.trim().to_string()))
        .filter(|(label, _)| !label.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_colon_lines_and_trims_both_sides() {
        let parsed = parse_output("GradingCheck1 : Success\nGradingCheck2:Failure\nnoise line");

        assert_eq!(
            parsed,
            BTreeMap::from([
                ("GradingCheck1".to_string(), "Success".to_string()),
                ("GradingCheck2".to_string(), "Failure".to_string()),
            ])
        );
    }

    #[test]
    fn splits_on_first_colon_only() {
        let parsed = parse_output("GradingCheck1: Success -- http://10.0.0.5:8080\r\n");
        assert_eq!(parsed["GradingCheck1"], "Success -- http://10.0.0.5:8080");
    }

    #[test]
    fn later_duplicate_wins() {
        let parsed = parse_output("Q1 : Failure\nQ1 : Success\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["Q1"], "Success");
    }
}
