// Launch command materializer
//
// Turns a LaunchPlan into the literal argv used to start winws. The argv is
// what cmd.exe would hand to winws after expanding the variables of the
// rendered batch launcher, so both launch paths see identical arguments.

use crate::plan::{Arg, GAME_FILTER_PLACEHOLDER, JOB_SEPARATOR, LaunchPlan, ResourceRoot};
use crate::rule::StrategyDefinition;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

pub const DEFAULT_EXECUTABLE: &str = "winws.exe";

/// Port range the game filter placeholder stands for when enabled
pub const DEFAULT_GAME_FILTER_PORTS: &str = "1024-65535";

/// On-disk layout of a winws installation
///
/// ```text
/// <root>/            strategy launchers and definitions
/// <root>/bin/        winws executable and fake payloads
/// <root>/lists/      host and ipset lists
/// <root>/utils/      filter mode flag files
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLayout {
    pub root: PathBuf,
    pub executable_name: String,
    pub game_filter_ports: String,
}

impl ResourceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            executable_name: DEFAULT_EXECUTABLE.to_string(),
            game_filter_ports: DEFAULT_GAME_FILTER_PORTS.to_string(),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn lists_dir(&self) -> PathBuf {
        self.root.join("lists")
    }

    pub fn utils_dir(&self) -> PathBuf {
        self.root.join("utils")
    }

    pub fn executable_path(&self) -> PathBuf {
        self.bin_dir().join(&self.executable_name)
    }

    /// Directory prefix a resource variable expands to, trailing separator included
    pub fn resource_prefix(&self, root: ResourceRoot) -> String {
        let dir = match root {
            ResourceRoot::Bin => self.bin_dir(),
            ResourceRoot::Lists => self.lists_dir(),
        };
        format!("{}{}", dir.display(), MAIN_SEPARATOR)
    }

    /// Expand `%BIN%`, `%LISTS%` and `%GameFilter%` the way the launcher shell would
    pub fn expand(&self, text: &str) -> String {
        if !text.contains('%') {
            return text.to_string();
        }
        text.replace(ResourceRoot::Bin.variable(), &self.resource_prefix(ResourceRoot::Bin))
            .replace(
                ResourceRoot::Lists.variable(),
                &self.resource_prefix(ResourceRoot::Lists),
            )
            .replace(GAME_FILTER_PLACEHOLDER, &self.game_filter_ports)
    }
}

/// Everything needed to spawn the target process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable_path: PathBuf,
    /// Arguments after the program name
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// True when there is nothing beyond the firewall flags to run
    pub fn is_trivial(&self) -> bool {
        !self.argv.iter().any(|a| !is_firewall_flag(a))
    }

    pub fn executable_name(&self) -> Option<&str> {
        self.executable_path.file_name().and_then(|n| n.to_str())
    }
}

fn is_firewall_flag(arg: &str) -> bool {
    arg.starts_with("--wf-tcp=") || arg.starts_with("--wf-udp=")
}

/// Concrete argv for one job argument
pub fn expand_arg(arg: &Arg, layout: &ResourceLayout) -> String {
    match arg {
        Arg::Value { flag, value } => format!("{}={}", flag, layout.expand(value)),
        Arg::Resource { flag, root, file } => {
            format!("{}={}{}", flag, layout.resource_prefix(*root), file)
        }
        Arg::Raw(token) => layout.expand(token),
    }
}

/// Firewall flags followed by the jobs, separated by `--new`
pub fn materialize(
    def: &StrategyDefinition,
    plan: &LaunchPlan,
    layout: &ResourceLayout,
) -> LaunchSpec {
    let mut argv = Vec::new();

    argv.push(format!("--wf-tcp={}", layout.expand(&plan.firewall_tcp.to_string())));
    argv.push(format!("--wf-udp={}", layout.expand(&plan.firewall_udp.to_string())));

    let last = plan.jobs.len().saturating_sub(1);
    for (i, job) in plan.jobs.iter().enumerate() {
        argv.extend(job.args.iter().map(|arg| expand_arg(arg, layout)));
        if i < last {
            argv.push(JOB_SEPARATOR.to_string());
        }
    }

    log::debug!(
        "Materialized strategy '{}' into {} argument(s)",
        def.id,
        argv.len()
    );

    LaunchSpec {
        executable_path: layout.executable_path(),
        argv,
        working_dir: layout.bin_dir(),
    }
}

/// Executable name compared case-insensitively, with or without `.exe`
pub fn same_executable(candidate: &str, wanted: &str) -> bool {
    let strip = |s: &str| {
        let lower = s.to_ascii_lowercase();
        match lower.strip_suffix(".exe") {
            Some(stem) => stem.to_string(),
            None => lower,
        }
    };
    !candidate.is_empty() && strip(candidate) == strip(wanted)
}

/// File name component of a path-like string, `\` and `/` both accepted
pub fn file_name_of(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Path's final component as text, empty when not representable
pub fn path_file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::LaunchPlanBuilder;
    use crate::ports::PortSpec;
    use crate::rule::{DesyncParams, Rule, RuleFields};

    fn definition() -> StrategyDefinition {
        let rules = vec![
            Rule::new(RuleFields {
                udp_ports: Some(PortSpec::parse("443")),
                hostlist: Some("list-general.txt".into()),
                desync: Some(DesyncParams {
                    method: "fake".into(),
                    repeats: Some(6),
                    fake_quic: Some("quic_initial_www_google_com.bin".into()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap(),
            Rule::new(RuleFields {
                tcp_ports: Some(PortSpec::parse("%GameFilter%")),
                ipset: Some("ipset-all.txt".into()),
                ..Default::default()
            })
            .unwrap(),
        ];
        StrategyDefinition::new("general", rules, true)
    }

    fn layout() -> ResourceLayout {
        ResourceLayout::new(PathBuf::from("/opt/zapret"))
    }

    #[test]
    fn test_materialize_argv_shape() {
        let def = definition();
        let plan = LaunchPlanBuilder::new().build(&def.rules, def.use_game_filter);
        let spec = materialize(&def, &plan, &layout());

        let sep = MAIN_SEPARATOR;
        assert_eq!(
            spec.argv,
            vec![
                "--wf-tcp=80,443,2053,2083,2087,2096,8443,1024-65535".to_string(),
                "--wf-udp=443,19294,19344,50000,50100,1024-65535".to_string(),
                "--filter-udp=443".to_string(),
                format!("--hostlist=/opt/zapret{sep}lists{sep}list-general.txt"),
                "--dpi-desync=fake".to_string(),
                "--dpi-desync-repeats=6".to_string(),
                format!("--dpi-desync-fake-quic=/opt/zapret{sep}bin{sep}quic_initial_www_google_com.bin"),
                "--new".to_string(),
                "--filter-tcp=1024-65535".to_string(),
                format!("--ipset=/opt/zapret{sep}lists{sep}ipset-all.txt"),
            ]
        );
        assert_eq!(spec.working_dir, PathBuf::from("/opt/zapret").join("bin"));
        assert_eq!(spec.executable_name(), Some("winws.exe"));
        assert!(!spec.is_trivial());
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let def = definition();
        let builder = LaunchPlanBuilder::new();
        let first = materialize(&def, &builder.build(&def.rules, true), &layout());
        let second = materialize(&def, &builder.build(&def.rules, true), &layout());
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_separator_after_last_job() {
        let def = definition();
        let plan = LaunchPlanBuilder::new().build(&def.rules, false);
        let spec = materialize(&def, &plan, &layout());
        assert_eq!(spec.argv.iter().filter(|a| *a == "--new").count(), 1);
        assert_ne!(spec.argv.last().map(String::as_str), Some("--new"));
    }

    #[test]
    fn test_empty_plan_is_trivial() {
        let def = StrategyDefinition::new("empty", Vec::new(), false);
        let plan = LaunchPlanBuilder::new().build(&def.rules, false);
        assert!(materialize(&def, &plan, &layout()).is_trivial());
    }

    #[test]
    fn test_same_executable() {
        assert!(same_executable("WINWS.EXE", "winws.exe"));
        assert!(same_executable("winws", "winws.exe"));
        assert!(!same_executable("winws2.exe", "winws.exe"));
        assert!(!same_executable("", "winws.exe"));
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of(r"C:\zapret\bin\winws.exe"), "winws.exe");
        assert_eq!(file_name_of("/opt/zapret/lists/a.txt"), "a.txt");
        assert_eq!(file_name_of("plain"), "plain");
    }
}
