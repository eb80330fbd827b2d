// LaunchPlan builder: rules -> firewall port sets + ordered argument groups
//
// This is a pure transform. Resource file references are kept symbolic
// (`%BIN%`, `%LISTS%`) so the same plan can be materialized into an argv or
// rendered into a batch launcher.

use crate::ports::PortSpec;
use crate::rule::{DesyncParams, Rule};

/// Placeholder the launcher expands to the game filter port range
pub const GAME_FILTER_PLACEHOLDER: &str = "%GameFilter%";

/// Flag separating consecutive jobs on the winws command line
pub const JOB_SEPARATOR: &str = "--new";

pub const BASELINE_TCP_PORTS: [u16; 7] = [80, 443, 2053, 2083, 2087, 2096, 8443];
pub const BASELINE_UDP_PORTS: [u16; 5] = [443, 19294, 19344, 50000, 50100];

/// Directory a resource flag value is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRoot {
    /// Fake payloads and patterns (`bin/`)
    Bin,
    /// Host and IP lists (`lists/`)
    Lists,
}

impl ResourceRoot {
    /// Shell variable naming this root in launcher scripts
    pub fn variable(self) -> &'static str {
        match self {
            ResourceRoot::Bin => "%BIN%",
            ResourceRoot::Lists => "%LISTS%",
        }
    }
}

/// One command-line argument of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// `--flag=value`
    Value { flag: &'static str, value: String },
    /// `--flag=<root>file`, quoted when written to a script
    Resource {
        flag: &'static str,
        root: ResourceRoot,
        file: String,
    },
    /// Passed through untouched
    Raw(String),
}

impl Arg {
    fn value(flag: &'static str, value: impl ToString) -> Self {
        Arg::Value {
            flag,
            value: value.to_string(),
        }
    }

    fn resource(flag: &'static str, root: ResourceRoot, file: &str) -> Self {
        Arg::Resource {
            flag,
            root,
            file: file.to_string(),
        }
    }

    /// Flag name, or the whole token for raw arguments
    pub fn flag(&self) -> &str {
        match self {
            Arg::Value { flag, .. } | Arg::Resource { flag, .. } => flag,
            Arg::Raw(token) => token.split('=').next().unwrap_or(token),
        }
    }

    /// Token with resource roots left as shell variables
    pub fn symbolic(&self) -> String {
        match self {
            Arg::Value { flag, value } => format!("{}={}", flag, value),
            Arg::Resource { flag, root, file } => {
                format!("{}={}{}", flag, root.variable(), file)
            }
            Arg::Raw(token) => token.clone(),
        }
    }
}

/// Flags of a single job, in emission order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentGroup {
    pub args: Vec<Arg>,
}

impl ArgumentGroup {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Derived launch configuration for one strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub firewall_tcp: PortSpec,
    pub firewall_udp: PortSpec,
    /// One group per rule; `--new` is implied between groups
    pub jobs: Vec<ArgumentGroup>,
}

/// Builds [`LaunchPlan`]s on top of a fixed firewall baseline
#[derive(Debug, Clone)]
pub struct LaunchPlanBuilder {
    baseline_tcp: PortSpec,
    baseline_udp: PortSpec,
}

impl Default for LaunchPlanBuilder {
    fn default() -> Self {
        Self {
            baseline_tcp: PortSpec::from_ports(BASELINE_TCP_PORTS),
            baseline_udp: PortSpec::from_ports(BASELINE_UDP_PORTS),
        }
    }
}

impl LaunchPlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the baseline firewall ports
    pub fn with_baseline(baseline_tcp: PortSpec, baseline_udp: PortSpec) -> Self {
        Self {
            baseline_tcp,
            baseline_udp,
        }
    }

    pub fn build(&self, rules: &[Rule], use_game_filter: bool) -> LaunchPlan {
        let mut firewall_tcp = self.baseline_tcp.clone();
        let mut firewall_udp = self.baseline_udp.clone();

        for rule in rules {
            if let Some(ports) = &rule.tcp_ports {
                firewall_tcp.extend(ports);
            }
            if let Some(ports) = &rule.udp_ports {
                firewall_udp.extend(ports);
            }
        }

        if use_game_filter {
            firewall_tcp.insert_placeholder(GAME_FILTER_PLACEHOLDER);
            firewall_udp.insert_placeholder(GAME_FILTER_PLACEHOLDER);
        }

        let jobs = rules.iter().map(job_args).collect();

        LaunchPlan {
            firewall_tcp,
            firewall_udp,
            jobs,
        }
    }
}

fn non_empty(text: &Option<String>) -> Option<&str> {
    text.as_deref().map(str::trim).filter(|t| !t.is_empty())
}

/// Zero and blank values count as absent
fn positive(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v > 0)
}

fn non_zero_text(text: &Option<String>) -> Option<&str> {
    non_empty(text).filter(|t| t.parse::<i64>().map_or(true, |n| n != 0))
}

/// Flags for one rule: traffic filters, hostlists, ipsets, extras, desync
fn job_args(rule: &Rule) -> ArgumentGroup {
    use ResourceRoot::Lists;

    let mut args = Vec::new();

    if let Some(ports) = rule.tcp_ports.as_ref().filter(|p| !p.is_empty()) {
        args.push(Arg::value("--filter-tcp", ports));
    }
    if let Some(ports) = rule.udp_ports.as_ref().filter(|p| !p.is_empty()) {
        args.push(Arg::value("--filter-udp", ports));
    }
    if let Some(l7) = non_empty(&rule.l7_protocols) {
        args.push(Arg::value("--filter-l7", l7));
    }
    if let Some(l3) = non_empty(&rule.l3_protocols) {
        args.push(Arg::value("--filter-l3", l3));
    }

    if let Some(file) = non_empty(&rule.hostlist) {
        args.push(Arg::resource("--hostlist", Lists, file));
    }
    if let Some(file) = non_empty(&rule.hostlist_exclude) {
        args.push(Arg::resource("--hostlist-exclude", Lists, file));
    }
    if let Some(domains) = non_empty(&rule.hostlist_domains) {
        args.push(Arg::value("--hostlist-domains", domains));
    }

    if let Some(file) = non_empty(&rule.ipset) {
        args.push(Arg::resource("--ipset", Lists, file));
    }
    if let Some(file) = non_empty(&rule.ipset_exclude) {
        args.push(Arg::resource("--ipset-exclude", Lists, file));
    }

    if let Some(ip_id) = non_empty(&rule.ip_id) {
        args.push(Arg::value("--ip-id", ip_id));
    }
    args.extend(
        rule.extra_args
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(|a| Arg::Raw(a.to_string())),
    );

    if let Some(desync) = rule.desync.as_ref().filter(|d| d.is_active()) {
        desync_args(desync, &mut args);
    }

    ArgumentGroup { args }
}

fn desync_args(desync: &DesyncParams, args: &mut Vec<Arg>) {
    use ResourceRoot::Bin;

    args.push(Arg::value("--dpi-desync", desync.method.trim()));

    if let Some(repeats) = positive(desync.repeats) {
        args.push(Arg::value("--dpi-desync-repeats", repeats));
    }
    if let Some(file) = non_empty(&desync.fake_quic) {
        args.push(Arg::resource("--dpi-desync-fake-quic", Bin, file));
    }
    if let Some(file) = non_empty(&desync.fake_tls) {
        args.push(Arg::resource("--dpi-desync-fake-tls", Bin, file));
    }
    if let Some(modifier) = non_empty(&desync.fake_tls_mod) {
        args.push(Arg::value("--dpi-desync-fake-tls-mod", modifier));
    }
    if let Some(file) = non_empty(&desync.fake_unknown_udp) {
        args.push(Arg::resource("--dpi-desync-fake-unknown-udp", Bin, file));
    }
    if let Some(fooling) = non_empty(&desync.fooling) {
        args.push(Arg::value("--dpi-desync-fooling", fooling));
    }
    if let Some(seqovl) = positive(desync.split_seqovl) {
        args.push(Arg::value("--dpi-desync-split-seqovl", seqovl));
    }
    if let Some(pos) = non_empty(&desync.split_pos) {
        args.push(Arg::value("--dpi-desync-split-pos", pos));
    }
    if let Some(file) = non_empty(&desync.split_seqovl_pattern) {
        args.push(Arg::resource("--dpi-desync-split-seqovl-pattern", Bin, file));
    }
    if let Some(ttl) = non_zero_text(&desync.autottl) {
        args.push(Arg::value("--dpi-desync-autottl", ttl));
    }
    if desync.any_protocol {
        args.push(Arg::value("--dpi-desync-any-protocol", 1));
    }
    if let Some(cutoff) = non_empty(&desync.cutoff) {
        args.push(Arg::value("--dpi-desync-cutoff", cutoff));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleFields;

    fn rule(fields: RuleFields) -> Rule {
        Rule::new(fields).unwrap()
    }

    fn tcp_rule(ports: &str) -> Rule {
        rule(RuleFields {
            tcp_ports: Some(PortSpec::parse(ports)),
            ..Default::default()
        })
    }

    fn symbolic(group: &ArgumentGroup) -> Vec<String> {
        group.args.iter().map(Arg::symbolic).collect()
    }

    #[test]
    fn test_firewall_includes_baseline() {
        let plan = LaunchPlanBuilder::new().build(&[tcp_rule("19294-19296")], false);
        assert_eq!(
            plan.firewall_tcp.to_string(),
            "80,443,2053,2083,2087,2096,8443,19294-19296"
        );
        assert_eq!(
            plan.firewall_udp.to_string(),
            "443,19294,19344,50000,50100"
        );
    }

    #[test]
    fn test_game_filter_placeholder_added_to_both() {
        let plan = LaunchPlanBuilder::new().build(&[tcp_rule("80")], true);
        assert!(plan.firewall_tcp.to_string().ends_with(",%GameFilter%"));
        assert!(plan.firewall_udp.to_string().ends_with(",%GameFilter%"));
    }

    #[test]
    fn test_firewall_independent_of_rule_order() {
        let builder = LaunchPlanBuilder::new();
        let a = tcp_rule("1000-1002,%Custom%");
        let b = tcp_rule("1003,5000");
        let c = rule(RuleFields {
            udp_ports: Some(PortSpec::parse("6000,%GameFilter%")),
            tcp_ports: Some(PortSpec::parse("7000")),
            ..Default::default()
        });

        let forward = builder.build(&[a.clone(), b.clone(), c.clone()], true);
        let reversed = builder.build(&[c, b, a], true);
        assert_eq!(forward.firewall_tcp.to_string(), reversed.firewall_tcp.to_string());
        assert_eq!(forward.firewall_udp.to_string(), reversed.firewall_udp.to_string());
        assert!(forward.firewall_tcp.to_string().contains("1000-1003"));
    }

    #[test]
    fn test_job_flag_order() {
        let r = rule(RuleFields {
            tcp_ports: Some(PortSpec::parse("443")),
            l7_protocols: Some("tls".into()),
            hostlist: Some("list-general.txt".into()),
            hostlist_exclude: Some("list-exclude.txt".into()),
            ipset_exclude: Some("ipset-exclude.txt".into()),
            ip_id: Some("zero".into()),
            desync: Some(DesyncParams {
                method: "multisplit".into(),
                split_seqovl: Some(568),
                split_pos: Some("1".into()),
                split_seqovl_pattern: Some("tls_clienthello_4pda_to.bin".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let plan = LaunchPlanBuilder::new().build(&[r], false);
        assert_eq!(
            symbolic(&plan.jobs[0]),
            vec![
                "--filter-tcp=443",
                "--filter-l7=tls",
                "--hostlist=%LISTS%list-general.txt",
                "--hostlist-exclude=%LISTS%list-exclude.txt",
                "--ipset-exclude=%LISTS%ipset-exclude.txt",
                "--ip-id=zero",
                "--dpi-desync=multisplit",
                "--dpi-desync-split-seqovl=568",
                "--dpi-desync-split-pos=1",
                "--dpi-desync-split-seqovl-pattern=%BIN%tls_clienthello_4pda_to.bin",
            ]
        );
    }

    #[test]
    fn test_empty_method_suppresses_desync_block() {
        let r = rule(RuleFields {
            udp_ports: Some(PortSpec::parse("443")),
            desync: Some(DesyncParams {
                method: " ".into(),
                repeats: Some(6),
                fake_quic: Some("quic_initial_www_google_com.bin".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let plan = LaunchPlanBuilder::new().build(&[r], false);
        assert_eq!(symbolic(&plan.jobs[0]), vec!["--filter-udp=443"]);
    }

    #[test]
    fn test_zero_numeric_params_are_absent() {
        let r = rule(RuleFields {
            desync: Some(DesyncParams {
                method: "fake".into(),
                repeats: Some(0),
                split_seqovl: Some(0),
                autottl: Some("0".into()),
                cutoff: Some("n2".into()),
                any_protocol: true,
                ..Default::default()
            }),
            ..Default::default()
        });
        let plan = LaunchPlanBuilder::new().build(&[r], false);
        assert_eq!(
            symbolic(&plan.jobs[0]),
            vec![
                "--dpi-desync=fake",
                "--dpi-desync-any-protocol=1",
                "--dpi-desync-cutoff=n2",
            ]
        );
    }

    #[test]
    fn test_one_job_per_rule_in_order() {
        let plan = LaunchPlanBuilder::new().build(
            &[tcp_rule("80"), tcp_rule("443"), tcp_rule("8443")],
            false,
        );
        let firsts: Vec<String> = plan.jobs.iter().map(|j| j.args[0].symbolic()).collect();
        assert_eq!(
            firsts,
            vec!["--filter-tcp=80", "--filter-tcp=443", "--filter-tcp=8443"]
        );
    }
}
