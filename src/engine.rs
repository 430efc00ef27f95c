use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::rules::{Dispatch, RequestContext, Ruleset};
use crate::upstream::UpstreamResolver;
use crate::wire;

const REQUESTS: &str = "core.requests";

/// Runs one decoded query through the ruleset.
#[derive(Clone)]
pub struct Engine {
    ruleset: Arc<Ruleset>,
    upstream: Arc<UpstreamResolver>,
    metrics: Metrics,
}

impl Engine {
    pub fn new(ruleset: Ruleset, metrics: Metrics) -> Self {
        Self {
            ruleset: Arc::new(ruleset),
            upstream: Arc::new(UpstreamResolver::new(metrics.clone())),
            metrics,
        }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// Walk the rules in declaration order until one answers.
    ///
    /// Non-terminal rules (log, rewrite, a conditional block whose predicate
    /// does not hold) fall through to the next rule; a rewrite changes the
    /// name every later rule sees. Exhausting the ruleset is an error, not an
    /// implicit forward.
    pub async fn process(&self, packet: &[u8], ctx: &RequestContext) -> Result<Bytes, EngineError> {
        struct InflightGuard<'a>(&'a Metrics);
        impl Drop for InflightGuard<'_> {
            fn drop(&mut self) {
                self.0.dec_ops(REQUESTS);
            }
        }
        self.metrics.inc_ops(REQUESTS);
        let _inflight_guard = InflightGuard(&self.metrics);
        let start = Instant::now();

        let mut message = wire::decode(packet)?;
        let Some(original) = wire::first_query(&message).map(|q| q.name().clone()) else {
            return Err(EngineError::MissingQuestion);
        };
        let mut qname = original.to_string();
        trace!(id = message.id(), qname = %qname, client = %ctx.client, "processing query");

        for rule in &*self.ruleset {
            if !rule.matches(&qname) {
                continue;
            }
            let kind = rule.action.kind();
            self.metrics.add(&format!("rules.{kind}"), 1);
            debug!(qname = %qname, rule = %rule.source, kind, "rule matched");

            match rule.dispatch(&mut message, ctx, &self.upstream).await {
                Ok(Dispatch::Terminal(bytes)) => {
                    // 改写过的查询：响应中还原客户端原始问题 / rewritten query: hand the client back its own question
                    let rewritten = wire::first_query(&message)
                        .map(|q| q.name().clone())
                        .filter(|name| *name != original);
                    let bytes = match rewritten {
                        Some(name) => match wire::restore_question(&bytes, &original, &name) {
                            Ok(restored) => restored,
                            Err(err) => {
                                self.metrics.add("core.errors", 1);
                                return Err(err);
                            }
                        },
                        None => bytes,
                    };
                    self.metrics
                        .add_avg("core.latency_ms", start.elapsed().as_secs_f64() * 1000.0);
                    self.metrics.hit_domain(&qname);
                    return Ok(bytes);
                }
                Ok(Dispatch::Pass) => {
                    if let Some(current) = wire::question_name(&message) {
                        qname = current;
                    }
                }
                Err(err) => {
                    self.metrics.add("core.errors", 1);
                    return Err(err);
                }
            }
        }

        self.metrics.add("core.no_matching_rule", 1);
        Err(EngineError::NoMatchingRule {
            qname,
            message: Box::new(message),
        })
    }
}
