// Strategy drift detection
//
// Identifies which catalog strategy an already-running winws instance was
// started with. The scoring core is a set of pure functions so the threshold
// can be tuned and tested without a catalog or a process table.

use crate::catalog::Catalog;
use crate::launch::{ResourceLayout, materialize};
use crate::plan::LaunchPlanBuilder;
use crate::script::tokenize;
use std::collections::BTreeSet;

/// Minimum fraction of a candidate's flags that must appear in the process argv
pub const MATCH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct DriftMatch {
    pub id: String,
    /// Matched fraction of the candidate's flag tokens, in `0.0..=1.0`
    pub confidence: f64,
}

/// Canonical form of one argument
///
/// Quotes are removed, backslashes become slashes and a path value is cut
/// down to its file name, so the same flag compares equal regardless of
/// where the winws folder lives.
pub fn normalize_token(token: &str) -> String {
    let token = token.replace('"', "").replace('\\', "/");
    match token.split_once('=') {
        Some((flag, value)) if value.contains('/') => {
            let name = value.rsplit('/').next().unwrap_or(value);
            format!("{}={}", flag, name)
        }
        _ => token,
    }
}

/// Distinct normalized `--flag=value` tokens of an argv
///
/// An argv that arrives as one joined command line is split first.
pub fn flag_tokens<S: AsRef<str>>(argv: &[S]) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for arg in argv {
        let arg = arg.as_ref();
        let pieces = if arg.contains(char::is_whitespace) && arg.contains(" --") {
            tokenize(arg)
        } else {
            vec![arg.to_string()]
        };
        tokens.extend(
            pieces
                .iter()
                .filter(|t| t.starts_with("--") && t.contains('='))
                .map(|t| normalize_token(t)),
        );
    }
    tokens
}

/// Share of `candidate` tokens present in `process`
pub fn score(candidate: &BTreeSet<String>, process: &BTreeSet<String>) -> f64 {
    if candidate.is_empty() {
        return 0.0;
    }
    let matches = candidate.iter().filter(|t| process.contains(*t)).count();
    matches as f64 / candidate.len() as f64
}

/// Highest scoring candidate at or above `threshold`
///
/// Ties keep the earlier candidate.
pub fn best_match<'a, I>(candidates: I, process_argv: &[String], threshold: f64) -> Option<DriftMatch>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let process = flag_tokens(process_argv);
    let mut best: Option<DriftMatch> = None;

    for (id, argv) in candidates {
        let confidence = score(&flag_tokens(argv), &process);
        log::trace!("Drift score for '{}': {:.2}", id, confidence);

        let better = best.as_ref().map_or(true, |b| confidence > b.confidence);
        if better && confidence >= threshold {
            best = Some(DriftMatch {
                id: id.to_string(),
                confidence,
            });
        }
    }
    best
}

/// Matches running argv against every strategy in the catalog
#[derive(Debug, Clone)]
pub struct DriftDetector {
    catalog: Catalog,
    layout: ResourceLayout,
    builder: LaunchPlanBuilder,
    game_filter_enabled: bool,
    threshold: f64,
}

impl DriftDetector {
    pub fn new(
        catalog: Catalog,
        layout: ResourceLayout,
        builder: LaunchPlanBuilder,
        game_filter_enabled: bool,
    ) -> Self {
        Self {
            catalog,
            layout,
            builder,
            game_filter_enabled,
            threshold: MATCH_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Strategy the process argv most likely came from
    ///
    /// Strategies that fail to resolve are skipped; an unreadable catalog
    /// means no match.
    pub fn detect(&self, process_argv: &[String]) -> Option<DriftMatch> {
        let ids = match self.catalog.ids() {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Cannot list strategies for drift detection: {:#}", e);
                return None;
            }
        };

        let candidates: Vec<(String, Vec<String>)> = ids
            .into_iter()
            .filter_map(|id| match self.catalog.resolve(&id) {
                Ok(def) => {
                    let plan = self
                        .builder
                        .build(&def.rules, def.use_game_filter && self.game_filter_enabled);
                    Some((id, materialize(&def, &plan, &self.layout).argv))
                }
                Err(e) => {
                    log::debug!("Skipping '{}' during drift detection: {}", id, e);
                    None
                }
            })
            .collect();

        let found = best_match(
            candidates
                .iter()
                .map(|(id, argv)| (id.as_str(), argv.as_slice())),
            process_argv,
            self.threshold,
        );

        match &found {
            Some(m) => log::info!(
                "Running instance matches strategy '{}' ({:.0}%)",
                m.id,
                m.confidence * 100.0
            ),
            None => log::info!("Running instance does not match any known strategy"),
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortSpec;
    use crate::rule::{DesyncParams, Rule, RuleFields, StrategyDefinition};
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(
            normalize_token(r#"--hostlist="C:\zapret\lists\list-general.txt""#),
            "--hostlist=list-general.txt"
        );
        assert_eq!(normalize_token("--filter-tcp=80,443"), "--filter-tcp=80,443");
    }

    #[test]
    fn test_flag_tokens_only_keeps_assignments() {
        let tokens = flag_tokens(&strings(&["--new", "--filter-udp=443", "plain", "--filter-udp=443"]));
        assert_eq!(tokens.into_iter().collect::<Vec<_>>(), vec!["--filter-udp=443"]);
    }

    #[test]
    fn test_flag_tokens_splits_joined_command_line() {
        let joined = strings(&[r#"C:\zapret\bin\winws.exe --wf-tcp=80 --hostlist="C:\zapret\lists\a b.txt""#]);
        let tokens = flag_tokens(&joined);
        assert!(tokens.contains("--wf-tcp=80"));
        assert!(tokens.contains("--hostlist=a b.txt"));
    }

    #[test]
    fn test_exact_argv_scores_one() {
        let alpha = strings(&["--wf-tcp=80,443", "--filter-tcp=443", "--dpi-desync=fake"]);
        let beta = strings(&["--wf-tcp=80,443", "--filter-udp=443", "--dpi-desync=multisplit"]);
        let candidates = [("alpha", alpha.as_slice()), ("beta", beta.as_slice())];

        let found = best_match(candidates, &beta, MATCH_THRESHOLD).unwrap();
        assert_eq!(found.id, "beta");
        assert_eq!(found.confidence, 1.0);
    }

    #[test]
    fn test_one_shared_flag_out_of_ten_is_no_match() {
        let candidate: Vec<String> = (0..10).map(|i| format!("--flag{}=v", i)).collect();
        let process = strings(&["--flag0=v", "--other=x"]);
        assert!(best_match([("c", candidate.as_slice())], &process, MATCH_THRESHOLD).is_none());
    }

    #[test]
    fn test_ties_keep_first_candidate() {
        let a = strings(&["--x=1", "--y=2"]);
        let b = strings(&["--x=1", "--z=3"]);
        let process = strings(&["--x=1"]);
        let found = best_match([("a", a.as_slice()), ("b", b.as_slice())], &process, 0.5).unwrap();
        assert_eq!(found.id, "a");
        assert_eq!(found.confidence, 0.5);
    }

    #[test]
    fn test_detector_against_catalog() {
        let dir = TempDir::new().unwrap();
        let layout = ResourceLayout::new(dir.path());
        let catalog = Catalog::new(&layout);
        let builder = LaunchPlanBuilder::new();

        let rule = |method: &str, ports: &str| {
            Rule::new(RuleFields {
                tcp_ports: Some(PortSpec::parse(ports)),
                hostlist: Some("list-general.txt".into()),
                desync: Some(DesyncParams::new(method)),
                ..Default::default()
            })
            .unwrap()
        };
        let general = StrategyDefinition::new("general", vec![rule("fake", "443")], false);
        let alt = StrategyDefinition::new("alt", vec![rule("multisplit", "80")], false);
        catalog.save(&general).unwrap();
        catalog.save(&alt).unwrap();

        // Same strategy launched from a different install location
        let elsewhere = ResourceLayout::new("/somewhere/else");
        let plan = builder.build(&general.rules, false);
        let argv = materialize(&general, &plan, &elsewhere).argv;

        let detector = DriftDetector::new(catalog, layout, builder, false);
        let found = detector.detect(&argv).unwrap();
        assert_eq!(found.id, "general");
        assert_eq!(found.confidence, 1.0);

        assert!(detector.clone().with_threshold(1.1).detect(&argv).is_none());
    }
}
