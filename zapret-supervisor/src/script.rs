// Batch launcher scripts: rendering strategies to `.bat` and reading them back
//
// Rendered scripts keep resource paths as `%BIN%` / `%LISTS%` variables and
// place one flag per continuation line. Parsing accepts the same shape plus
// the hand-written launchers shipped with zapret.

use crate::error::SupervisorError;
use crate::launch::{file_name_of, same_executable};
use crate::plan::{Arg, GAME_FILTER_PLACEHOLDER, JOB_SEPARATOR, LaunchPlan, ResourceRoot};
use crate::ports::PortSpec;
use crate::rule::{DesyncParams, Rule, RuleFields, StrategyDefinition};

/// Ends every line of the launch command except the last
const LINE_BREAK: &str = " ^\n";
const LOAD_GAME_FILTER: &str = "load_game_filter";

/// Render the batch launcher for a strategy
pub fn render_script(def: &StrategyDefinition, plan: &LaunchPlan, executable_name: &str) -> String {
    let mut lines: Vec<String> = vec![
        "@echo off".into(),
        "chcp 65001 > nul".into(),
        ":: 65001 - UTF-8".into(),
        String::new(),
        "cd /d \"%~dp0\"".into(),
        "call service.bat status_zapret".into(),
    ];

    if def.use_game_filter {
        lines.push(format!("call service.bat {}", LOAD_GAME_FILTER));
    } else {
        lines.push(":: Game Filter disabled".into());
    }

    lines.extend([
        "echo:".to_string(),
        String::new(),
        "set \"BIN=%~dp0bin\\\"".to_string(),
        "set \"LISTS=%~dp0lists\\\"".to_string(),
        "cd /d %BIN%".to_string(),
        String::new(),
    ]);

    let mut command = vec![format!(
        "start \"zapret: %~n0\" /B /min \"{}{}\" --wf-tcp={} --wf-udp={}",
        ResourceRoot::Bin.variable(),
        executable_name,
        plan.firewall_tcp,
        plan.firewall_udp
    )];

    let last = plan.jobs.len().saturating_sub(1);
    for (i, job) in plan.jobs.iter().enumerate() {
        command.extend(job.args.iter().map(script_token));
        if i < last {
            command.push(JOB_SEPARATOR.to_string());
        }
    }

    lines.push(command.join(LINE_BREAK));
    lines.join("\n")
}

/// Resource values are quoted so list names with spaces survive cmd.exe
fn script_token(arg: &Arg) -> String {
    match arg {
        Arg::Resource { flag, root, file } => {
            format!("{}=\"{}{}\"", flag, root.variable(), file)
        }
        other => other.symbolic(),
    }
}

/// Read a strategy back out of a batch launcher
///
/// The launch line is the first logical line that invokes `executable_name`.
/// Firewall flags are dropped since the plan builder recomputes them.
/// Flags without a dedicated rule field end up in `extra_args`. Jobs that
/// yield an empty rule are skipped with a warning.
pub fn parse_script(
    id: &str,
    text: &str,
    executable_name: &str,
) -> Result<StrategyDefinition, SupervisorError> {
    let logical = logical_lines(text);

    let args = logical
        .iter()
        .filter(|line| !is_inert_line(line))
        .find_map(|line| launch_args(line, executable_name))
        .ok_or_else(|| {
            SupervisorError::Config(format!(
                "script '{}' never launches {}",
                id, executable_name
            ))
        })?;

    let mut rules = Vec::new();
    for (index, job) in args.split(|a| a == JOB_SEPARATOR).enumerate() {
        let fields = job_fields(job);
        match Rule::new(fields) {
            Ok(rule) => rules.push(rule),
            Err(_) => log::warn!("Skipping empty job #{} in script '{}'", index + 1, id),
        }
    }

    let use_game_filter = logical.iter().filter(|l| !is_comment(l)).any(|line| {
        line.contains(GAME_FILTER_PLACEHOLDER) || line.contains(LOAD_GAME_FILTER)
    });

    let def = StrategyDefinition::new(id, rules, use_game_filter);
    def.validate()?;
    Ok(def)
}

/// Join `^` continuations into single lines
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for raw in text.lines() {
        let line = raw.trim_end();
        match line.strip_suffix('^') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(line);
                lines.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push(current);
    }
    lines
}

fn is_comment(line: &str) -> bool {
    let line = line.trim_start().to_ascii_lowercase();
    line.starts_with("::") || line.starts_with("rem ") || line == "rem"
}

/// Lines that mention the executable without launching it
fn is_inert_line(line: &str) -> bool {
    let lower = line.trim_start().to_ascii_lowercase();
    is_comment(line)
        || lower.starts_with("call ")
        || lower.starts_with("set ")
        || lower.starts_with("echo")
}

/// Arguments following the executable token, if this line runs it
fn launch_args(line: &str, executable_name: &str) -> Option<Vec<String>> {
    let tokens = tokenize(line);
    let position = tokens.iter().position(|token| {
        let name = file_name_of(token);
        // `%BIN%winws.exe` has no path separator before the name
        let name = name.rsplit('%').next().unwrap_or(name);
        same_executable(name, executable_name)
    })?;
    Some(tokens[position + 1..].to_vec())
}

/// Whitespace split that keeps double-quoted runs together and drops the quotes
pub(crate) fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// File name behind a `%BIN%`/`%LISTS%` prefix; None for any other value
fn resource_file(value: &str, root: ResourceRoot) -> Option<String> {
    value
        .strip_prefix(root.variable())
        .filter(|file| !file.is_empty())
        .map(str::to_string)
}

fn job_fields(tokens: &[String]) -> RuleFields {
    let mut fields = RuleFields::default();
    let mut desync = DesyncParams::default();

    for token in tokens {
        let (flag, value) = match token.split_once('=') {
            Some((flag, value)) => (flag, value),
            None => (token.as_str(), ""),
        };
        let text = || Some(value.to_string());
        // Values without the prefix stay verbatim in extra_args
        let lists = resource_file(value, ResourceRoot::Lists);
        let bin = resource_file(value, ResourceRoot::Bin);

        match flag {
            "--wf-tcp" | "--wf-udp" => {}
            "--filter-tcp" => fields.tcp_ports = Some(PortSpec::parse(value)),
            "--filter-udp" => fields.udp_ports = Some(PortSpec::parse(value)),
            "--filter-l7" => fields.l7_protocols = text(),
            "--filter-l3" => fields.l3_protocols = text(),
            "--hostlist" if lists.is_some() => fields.hostlist = lists,
            "--hostlist-exclude" if lists.is_some() => fields.hostlist_exclude = lists,
            "--hostlist-domains" => fields.hostlist_domains = text(),
            "--ipset" if lists.is_some() => fields.ipset = lists,
            "--ipset-exclude" if lists.is_some() => fields.ipset_exclude = lists,
            "--ip-id" => fields.ip_id = text(),
            "--dpi-desync" => desync.method = value.to_string(),
            "--dpi-desync-fake-quic" if bin.is_some() => desync.fake_quic = bin,
            "--dpi-desync-fake-tls" if bin.is_some() => desync.fake_tls = bin,
            "--dpi-desync-fake-tls-mod" => desync.fake_tls_mod = text(),
            "--dpi-desync-fake-unknown-udp" if bin.is_some() => {
                desync.fake_unknown_udp = bin
            }
            "--dpi-desync-fooling" => desync.fooling = text(),
            "--dpi-desync-split-pos" => desync.split_pos = text(),
            "--dpi-desync-split-seqovl-pattern" if bin.is_some() => {
                desync.split_seqovl_pattern = bin
            }
            "--dpi-desync-autottl" => desync.autottl = text(),
            "--dpi-desync-cutoff" => desync.cutoff = text(),
            "--dpi-desync-any-protocol" => desync.any_protocol = value != "0",
            "--dpi-desync-repeats" if value.parse::<u32>().is_ok() => {
                desync.repeats = value.parse().ok();
            }
            "--dpi-desync-split-seqovl" if value.parse::<u32>().is_ok() => {
                desync.split_seqovl = value.parse().ok();
            }
            _ => fields.extra_args.push(token.clone()),
        }
    }

    if desync.is_active() {
        fields.desync = Some(desync);
    } else if desync != DesyncParams::default() {
        log::warn!("Ignoring desync parameters without --dpi-desync");
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::LaunchPlanBuilder;

    const GENERAL_BAT: &str = r#"@echo off
chcp 65001 > nul
:: 65001 - UTF-8

cd /d "%~dp0"
call service.bat status_zapret
call service.bat check_updates
call service.bat load_game_filter
echo:

set "BIN=%~dp0bin\"
set "LISTS=%~dp0lists\"
cd /d %BIN%

start "zapret: %~n0" /min "%BIN%winws.exe" --wf-tcp=80,443,2053,2083,2087,2096,8443,%GameFilter% --wf-udp=443,19294-19344,50000-50100,%GameFilter% ^
--filter-udp=443 --hostlist="%LISTS%list-general.txt" --hostlist-exclude="%LISTS%list-exclude.txt" --ipset-exclude="%LISTS%ipset-exclude.txt" --dpi-desync=fake --dpi-desync-repeats=6 --dpi-desync-fake-quic="%BIN%quic_initial_www_google_com.bin" --new ^
--filter-udp=19294-19344,50000-50100 --filter-l7=discord,stun --dpi-desync=fake --dpi-desync-repeats=6 --new ^
--filter-tcp=443,%GameFilter% --ipset="%LISTS%ipset-all.txt" --dpi-desync=multisplit --dpi-desync-split-seqovl=568 --dpi-desync-split-pos=1 --dpi-desync-split-seqovl-pattern="%BIN%tls_clienthello_4pda_to.bin" --dpi-desync-badseq-increment=2
"#;

    fn sample() -> StrategyDefinition {
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
                tcp_ports: Some(PortSpec::parse("80,443")),
                ipset: Some("ipset-all.txt".into()),
                extra_args: vec!["--dpi-desync-badseq-increment=2".into()],
                desync: Some(DesyncParams::new("multisplit")),
                ..Default::default()
            })
            .unwrap(),
        ];
        StrategyDefinition::new("custom", rules, true)
    }

    #[test]
    fn test_render_layout() {
        let def = sample();
        let plan = LaunchPlanBuilder::new().build(&def.rules, def.use_game_filter);
        let script = render_script(&def, &plan, "winws.exe");
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "@echo off");
        assert!(lines.contains(&"call service.bat load_game_filter"));
        assert!(lines.contains(&"cd /d %BIN%"));
        assert!(script.contains(
            "start \"zapret: %~n0\" /B /min \"%BIN%winws.exe\" --wf-tcp=80,443,2053,2083,2087,2096,8443,%GameFilter% --wf-udp=443,19294,19344,50000,50100,%GameFilter% ^\n--filter-udp=443 ^\n--hostlist=\"%LISTS%list-general.txt\" ^\n"
        ));
        assert!(script.contains("--dpi-desync-fake-quic=\"%BIN%quic_initial_www_google_com.bin\" ^\n--new ^\n--filter-tcp=80,443"));
        assert!(script.ends_with("--dpi-desync=multisplit"));
    }

    #[test]
    fn test_render_without_game_filter() {
        let mut def = sample();
        def.use_game_filter = false;
        let plan = LaunchPlanBuilder::new().build(&def.rules, false);
        let script = render_script(&def, &plan, "winws.exe");
        assert!(script.contains(":: Game Filter disabled"));
        assert!(!script.contains(GAME_FILTER_PLACEHOLDER));
        assert!(!script.contains(LOAD_GAME_FILTER));
    }

    #[test]
    fn test_rendered_script_reads_back() {
        let def = sample();
        let plan = LaunchPlanBuilder::new().build(&def.rules, def.use_game_filter);
        let script = render_script(&def, &plan, "winws.exe");

        let parsed = parse_script("custom", &script, "winws.exe").unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_parse_hand_written_launcher() {
        let def = parse_script("general", GENERAL_BAT, "winws.exe").unwrap();
        assert_eq!(def.id, "general");
        assert!(def.use_game_filter);
        assert_eq!(def.rules.len(), 3);

        let first = &def.rules[0];
        assert_eq!(first.hostlist.as_deref(), Some("list-general.txt"));
        assert_eq!(first.ipset_exclude.as_deref(), Some("ipset-exclude.txt"));
        let desync = first.desync.as_ref().unwrap();
        assert_eq!(desync.repeats, Some(6));
        assert_eq!(
            desync.fake_quic.as_deref(),
            Some("quic_initial_www_google_com.bin")
        );

        assert_eq!(def.rules[1].l7_protocols.as_deref(), Some("discord,stun"));
        assert_eq!(
            def.rules[1].udp_ports.as_ref().unwrap().to_string(),
            "19294-19344,50000-50100"
        );

        let last = &def.rules[2];
        assert!(last.tcp_ports.as_ref().unwrap().contains_placeholder("%GameFilter%"));
        assert_eq!(last.extra_args, vec!["--dpi-desync-badseq-increment=2"]);
        assert_eq!(
            last.desync.as_ref().unwrap().split_seqovl_pattern.as_deref(),
            Some("tls_clienthello_4pda_to.bin")
        );
    }

    #[test]
    fn test_parse_rejects_script_without_launch() {
        let err = parse_script("service", "@echo off\ncall service.bat status_zapret\n", "winws.exe")
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_parse_skips_empty_jobs() {
        let text = "\"%BIN%winws.exe\" --wf-tcp=80 --new --filter-tcp=80 --dpi-desync=fake";
        let def = parse_script("x", text, "winws.exe").unwrap();
        assert_eq!(def.rules.len(), 1);
        assert!(!def.use_game_filter);
    }

    #[test]
    fn test_unprefixed_values_kept_verbatim() {
        use crate::launch::{ResourceLayout, materialize};

        let text = r#""%BIN%winws.exe" --filter-tcp=443 --dpi-desync=fake --dpi-desync-fake-tls=0x00000000 --hostlist="C:\lists\my.txt""#;
        let def = parse_script("fake-tls", text, "winws.exe").unwrap();

        let rule = &def.rules[0];
        assert_eq!(rule.hostlist, None);
        assert_eq!(rule.desync.as_ref().unwrap().fake_tls, None);
        assert_eq!(
            rule.extra_args,
            vec![
                "--dpi-desync-fake-tls=0x00000000",
                r"--hostlist=C:\lists\my.txt"
            ]
        );

        let plan = LaunchPlanBuilder::new().build(&def.rules, false);
        let argv = materialize(&def, &plan, &ResourceLayout::new("/opt/zapret")).argv;
        assert!(argv.contains(&"--dpi-desync-fake-tls=0x00000000".to_string()));
        assert!(argv.contains(&r"--hostlist=C:\lists\my.txt".to_string()));
        assert!(!argv.iter().any(|a| a.contains("/opt/zapret/bin/0x")));
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"start "zapret: %~n0" /min --hostlist="%LISTS%a b.txt" """#),
            vec!["start", "zapret: %~n0", "/min", "--hostlist=%LISTS%a b.txt", ""]
        );
    }
}
