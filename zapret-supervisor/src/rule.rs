// Strategy data model: filter rules and the strategies built from them

use crate::error::SupervisorError;
use crate::ports::PortSpec;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// DPI desync block of a rule
///
/// Sub-parameters are only meaningful when `method` is non-empty. Numeric
/// values of zero are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesyncParams {
    /// Desync method list, e.g. `fake,multisplit`
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeats: Option<u32>,
    /// Fake QUIC payload file under `bin/`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_quic: Option<String>,
    /// Fake TLS payload file under `bin/`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_tls: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_tls_mod: Option<String>,
    /// Fake payload for unknown UDP under `bin/`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fake_unknown_udp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fooling: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_seqovl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_pos: Option<String>,
    /// Sequence overlap pattern file under `bin/`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_seqovl_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autottl: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub any_protocol: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<String>,
}

impl DesyncParams {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        !self.method.trim().is_empty()
    }
}

/// Raw, unvalidated rule fields
///
/// This is what the strategy editor and the JSON files produce. Turn it into
/// a [`Rule`] with [`Rule::new`] before handing it to the plan builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_ports: Option<PortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_ports: Option<PortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l7_protocols: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l3_protocols: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostlist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostlist_exclude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostlist_domains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipset_exclude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_id: Option<String>,
    /// Flags with no dedicated field, passed through verbatim
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desync: Option<DesyncParams>,
}

impl RuleFields {
    /// True if at least one field would produce a flag
    pub fn has_content(&self) -> bool {
        let ports = |p: &Option<PortSpec>| p.as_ref().is_some_and(|p| !p.is_empty());
        let text = |t: &Option<String>| t.as_deref().is_some_and(|t| !t.trim().is_empty());

        ports(&self.tcp_ports)
            || ports(&self.udp_ports)
            || text(&self.l7_protocols)
            || text(&self.l3_protocols)
            || text(&self.hostlist)
            || text(&self.hostlist_exclude)
            || text(&self.hostlist_domains)
            || text(&self.ipset)
            || text(&self.ipset_exclude)
            || text(&self.ip_id)
            || !self.extra_args.is_empty()
            || self.desync.as_ref().is_some_and(DesyncParams::is_active)
    }
}

/// One validated filtering job
///
/// Rules are immutable once built; read fields through `Deref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleFields", into = "RuleFields")]
pub struct Rule(RuleFields);

impl Rule {
    /// Validate raw fields, rejecting a rule that sets nothing
    pub fn new(fields: RuleFields) -> Result<Self, SupervisorError> {
        if !fields.has_content() {
            return Err(SupervisorError::Config(
                "rule has no fields set".to_string(),
            ));
        }
        Ok(Self(fields))
    }
}

impl Deref for Rule {
    type Target = RuleFields;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<RuleFields> for Rule {
    type Error = SupervisorError;

    fn try_from(fields: RuleFields) -> Result<Self, Self::Error> {
        Rule::new(fields)
    }
}

impl From<Rule> for RuleFields {
    fn from(rule: Rule) -> Self {
        rule.0
    }
}

/// A named launch configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    /// Catalog key, taken from the file stem rather than the file body
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub use_game_filter: bool,
    pub rules: Vec<Rule>,
}

impl StrategyDefinition {
    pub fn new(id: impl Into<String>, rules: Vec<Rule>, use_game_filter: bool) -> Self {
        Self {
            id: id.into(),
            use_game_filter,
            rules,
        }
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.rules.is_empty() {
            return Err(SupervisorError::Config(format!(
                "strategy '{}' has no rules",
                self.id
            )));
        }
        Ok(())
    }
}
