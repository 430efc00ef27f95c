use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use regex::{Captures, Regex};
use tracing::{debug, error, warn};

use crate::config::{BlockMode, Settings};
use crate::error::RuleSyntaxError;
use crate::rules::{BlockResponse, Rule, RuleAction, Ruleset};
use crate::wire;

const DEFAULT_DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Redirect,
    Block,
    ConditionalBlock,
    Log,
    Resolve,
    Rewrite,
}

/// Textual syntaxes per rule kind. Kinds are tried top to bottom, and within a
/// kind the first matching syntax wins.
const SYNTAXES: &[(Kind, &str)] = &[
    (
        Kind::Redirect,
        r"^redirect\s+(?P<domain>\S+)\s+to\s+(?P<destination>\S+)$",
    ),
    (Kind::Block, r"^block\s+(?P<domain>\S+)$"),
    (
        Kind::ConditionalBlock,
        r"^block\s+(?P<domain>\S+)\s+if\s+type\s+is\s+(?P<type>\S+)\s+and\s+class\s+is\s+(?P<class>\S+)$",
    ),
    (
        Kind::ConditionalBlock,
        r"^block\s+(?P<domain>\S+)\s+if\s+class\s+is\s+(?P<class>\S+)\s+and\s+type\s+is\s+(?P<type>\S+)$",
    ),
    (
        Kind::ConditionalBlock,
        r"^block\s+(?P<domain>\S+)\s+if\s+type\s+is\s+(?P<type>\S+)$",
    ),
    (
        Kind::ConditionalBlock,
        r"^block\s+(?P<domain>\S+)\s+if\s+class\s+is\s+(?P<class>\S+)$",
    ),
    (Kind::Log, r"^log\s+(?P<domain>\S+)$"),
    (
        Kind::Resolve,
        r"^resolve\s+(?P<domain>\S+)\s+using\s+(?P<resolvers>.+?)\s+timeout\s+(?P<timeout>\S+)$",
    ),
    (
        Kind::Resolve,
        r"^resolve\s+(?P<domain>\S+)\s+using\s+(?P<resolvers>.+)$",
    ),
    (
        Kind::Rewrite,
        r"^rewrite\s+(?P<domain>\S+)\s+to\s+(?P<pattern>\S+)$",
    ),
];

/// A declaration that did not make it into the ruleset.
#[derive(Debug)]
pub struct RejectedLine {
    /// 1-based position in the input.
    pub line_no: usize,
    pub line: String,
    pub error: RuleSyntaxError,
}

#[derive(Debug, Default)]
pub struct Compiled {
    pub ruleset: Ruleset,
    pub rejected: Vec<RejectedLine>,
}

pub struct RuleCompiler {
    syntaxes: Vec<(Kind, Regex)>,
}

impl RuleCompiler {
    pub fn new() -> Result<Self, regex::Error> {
        let syntaxes = SYNTAXES
            .iter()
            .map(|(kind, src)| Regex::new(src).map(|re| (*kind, re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { syntaxes })
    }

    /// Compile declarations in order. Bad lines are reported and skipped; the
    /// batch itself never fails.
    pub fn compile<I, S>(&self, lines: I, settings: &Settings) -> Compiled
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Compiled::default();
        for (idx, raw) in lines.into_iter().enumerate() {
            let line = raw.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            debug!(target = "parser", line, "parsing rule");
            match self.compile_line(line, settings) {
                Ok(rule) => {
                    debug!(target = "parser", kind = rule.action.kind(), domain = %rule.pattern, "rule compiled");
                    out.ruleset.push(rule);
                }
                Err(err) => {
                    if matches!(err, RuleSyntaxError::UnknownSyntax) {
                        warn!(target = "parser", line_no = idx + 1, line, "unrecognised rule, skipping");
                    } else {
                        error!(target = "parser", line_no = idx + 1, line, error = %err, "syntax error in rule, skipping");
                    }
                    out.rejected.push(RejectedLine {
                        line_no: idx + 1,
                        line: line.to_string(),
                        error: err,
                    });
                }
            }
        }
        out
    }

    fn compile_line(&self, line: &str, settings: &Settings) -> Result<Rule, RuleSyntaxError> {
        let (kind, caps) = self
            .syntaxes
            .iter()
            .find_map(|(kind, re)| re.captures(line).map(|caps| (*kind, caps)))
            .ok_or(RuleSyntaxError::UnknownSyntax)?;

        let domain = capture(&caps, "domain").unwrap_or_default();
        let pattern = Regex::new(domain).map_err(|source| RuleSyntaxError::InvalidPattern {
            pattern: domain.to_string(),
            source,
        })?;

        let action = match kind {
            Kind::Redirect => {
                let destination = capture(&caps, "destination").unwrap_or_default();
                RuleAction::Redirect {
                    destination: parse_name(destination)?,
                }
            }
            Kind::Block => RuleAction::Block {
                response: block_response(settings),
            },
            Kind::ConditionalBlock => RuleAction::ConditionalBlock {
                qtype: capture(&caps, "type").map(parse_type).transpose()?,
                qclass: capture(&caps, "class")
                    .map(|c| wire::parse_dns_class(c).ok_or_else(|| RuleSyntaxError::InvalidClass(c.to_string())))
                    .transpose()?,
                response: block_response(settings),
            },
            Kind::Log => RuleAction::Log,
            Kind::Resolve => RuleAction::Resolve {
                resolvers: parse_resolvers(capture(&caps, "resolvers").unwrap_or_default())?,
                timeout: match capture(&caps, "timeout") {
                    Some(t) => parse_timeout(t)?,
                    None => settings.resolution_timeout,
                },
            },
            Kind::Rewrite => {
                let replacement = capture(&caps, "pattern").unwrap_or_default();
                if replacement.is_empty() {
                    return Err(RuleSyntaxError::InvalidName(replacement.to_string()));
                }
                RuleAction::Rewrite {
                    replacement: replacement.to_string(),
                }
            }
        };

        Ok(Rule {
            pattern,
            source: line.to_string(),
            action,
        })
    }
}

fn capture<'a>(caps: &Captures<'a>, name: &str) -> Option<&'a str> {
    caps.name(name).map(|m| m.as_str().trim())
}

fn block_response(settings: &Settings) -> BlockResponse {
    match settings.block_mode {
        BlockMode::Empty => BlockResponse::Empty,
        BlockMode::Sinkhole => BlockResponse::Sinkhole(settings.catchall_address),
    }
}

fn parse_name(v: &str) -> Result<hickory_proto::rr::Name, RuleSyntaxError> {
    wire::parse_fqdn(v).map_err(|_| RuleSyntaxError::InvalidName(v.to_string()))
}

fn parse_type(v: &str) -> Result<RecordType, RuleSyntaxError> {
    RecordType::from_str(&v.to_ascii_uppercase()).map_err(|_| RuleSyntaxError::InvalidType(v.to_string()))
}

fn parse_timeout(v: &str) -> Result<Duration, RuleSyntaxError> {
    let secs: f64 = v
        .trim_end_matches('s')
        .parse()
        .map_err(|_| RuleSyntaxError::InvalidTimeout(v.to_string()))?;
    if !(secs.is_finite() && secs > 0.0) {
        return Err(RuleSyntaxError::InvalidTimeout(v.to_string()));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// `8.8.4.4, 8.8.8.8:5353, [2001:db8::1]:53` → socket addresses; bare IPs get port 53.
fn parse_resolvers(v: &str) -> Result<Vec<SocketAddr>, RuleSyntaxError> {
    let mut out = Vec::new();
    for part in v.split(',') {
        let s = part.trim();
        if s.is_empty() {
            continue;
        }
        let addr = s
            .parse::<SocketAddr>()
            .or_else(|_| s.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT)))
            .map_err(|_| RuleSyntaxError::InvalidResolver(s.to_string()))?;
        out.push(addr);
    }
    if out.is_empty() {
        return Err(RuleSyntaxError::NoResolvers);
    }
    Ok(out)
}
