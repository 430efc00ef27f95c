use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use regex::Regex;
use tracing::info;

use crate::error::EngineError;
use crate::upstream::UpstreamResolver;
use crate::wire;

/// Addresses of one request, threaded through dispatch for logging.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

/// Outcome of a rule that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Final answer; matching stops here.
    Terminal(Bytes),
    /// Keep walking the ruleset.
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResponse {
    Empty,
    Sinkhole(IpAddr),
}

#[derive(Debug, Clone)]
pub enum RuleAction {
    Block {
        response: BlockResponse,
    },
    ConditionalBlock {
        qtype: Option<RecordType>,
        qclass: Option<DNSClass>,
        response: BlockResponse,
    },
    Log,
    Redirect {
        destination: Name,
    },
    Resolve {
        resolvers: Vec<SocketAddr>,
        timeout: Duration,
    },
    Rewrite {
        replacement: String,
    },
}

impl RuleAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleAction::Block { .. } => "block",
            RuleAction::ConditionalBlock { .. } => "conditional_block",
            RuleAction::Log => "log",
            RuleAction::Redirect { .. } => "redirect",
            RuleAction::Resolve { .. } => "resolve",
            RuleAction::Rewrite { .. } => "rewrite",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: Regex,
    /// Declaration line the rule was compiled from.
    pub source: String,
    pub action: RuleAction,
}

impl Rule {
    #[inline]
    pub fn matches(&self, qname: &str) -> bool {
        self.pattern.is_match(qname)
    }

    pub async fn dispatch(
        &self,
        message: &mut Message,
        ctx: &RequestContext,
        upstream: &UpstreamResolver,
    ) -> Result<Dispatch, EngineError> {
        match &self.action {
            RuleAction::Block { response } => block(message, *response),
            RuleAction::ConditionalBlock {
                qtype,
                qclass,
                response,
            } => {
                let Some(query) = wire::first_query(message) else {
                    return Err(EngineError::MissingQuestion);
                };
                let type_ok = qtype.map_or(true, |t| t == query.query_type());
                let class_ok = qclass.map_or(true, |c| c == query.query_class());
                if type_ok && class_ok {
                    block(message, *response)
                } else {
                    Ok(Dispatch::Pass)
                }
            }
            RuleAction::Log => {
                if let Some(query) = wire::first_query(message) {
                    info!(
                        event = "rule_log",
                        rule = %self.source,
                        qname = %query.name(),
                        qtype = %query.query_type(),
                        qclass = %query.query_class(),
                        client = %ctx.client,
                        server = %ctx.server,
                        "query matched"
                    );
                }
                Ok(Dispatch::Pass)
            }
            RuleAction::Redirect { destination } => {
                let Some(query) = wire::first_query(message) else {
                    return Err(EngineError::MissingQuestion);
                };
                let answer = wire::cname_record(query.name().clone(), destination.clone());
                let bytes = wire::build_response(message, ResponseCode::NoError, vec![answer])?;
                Ok(Dispatch::Terminal(bytes))
            }
            RuleAction::Resolve { resolvers, timeout } => {
                let packet = wire::encode(message)?;
                let bytes = upstream.resolve(&packet, resolvers, *timeout).await?;
                Ok(Dispatch::Terminal(bytes))
            }
            RuleAction::Rewrite { replacement } => {
                let Some(qname) = wire::question_name(message) else {
                    return Err(EngineError::MissingQuestion);
                };
                let rewritten = self.expand(&qname, replacement);
                match wire::parse_fqdn(&rewritten) {
                    Ok(name) => {
                        tracing::debug!(from = %qname, to = %name, rule = %self.source, "question rewritten");
                        wire::set_question_name(message, name);
                    }
                    Err(err) => {
                        tracing::warn!(from = %qname, to = %rewritten, error = %err, "rewrite produced an invalid name, keeping original");
                    }
                }
                Ok(Dispatch::Pass)
            }
        }
    }

    /// Substitute `$n`/`${name}` groups captured from `qname` into `replacement`.
    fn expand(&self, qname: &str, replacement: &str) -> String {
        match self.pattern.captures(qname) {
            Some(caps) => {
                let mut out = String::new();
                caps.expand(replacement, &mut out);
                out
            }
            None => replacement.to_string(),
        }
    }
}

/// Sinkhole answers only carry a record the query asked for; an AAAA query
/// against an IPv4 catch-all (or a TXT, MX, ... query) gets an empty NOERROR.
fn block(message: &Message, response: BlockResponse) -> Result<Dispatch, EngineError> {
    let answers = match response {
        BlockResponse::Empty => Vec::new(),
        BlockResponse::Sinkhole(ip) => {
            let Some(query) = wire::first_query(message) else {
                return Err(EngineError::MissingQuestion);
            };
            let fits = match (query.query_type(), ip) {
                (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_)) => true,
                (RecordType::ANY, _) => true,
                _ => false,
            };
            if fits {
                vec![wire::address_record(query.name().clone(), ip)]
            } else {
                Vec::new()
            }
        }
    };
    let bytes = wire::build_response(message, ResponseCode::NoError, answers)?;
    Ok(Dispatch::Terminal(bytes))
}

/// Compiled rules in declaration order. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<'a> IntoIterator for &'a Ruleset {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
