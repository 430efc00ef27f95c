mod config;
mod engine;
mod error;
mod metrics;
mod parser;
mod rules;
mod server;
#[cfg(test)]
mod test_support;
mod upstream;
mod wire;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;
use crate::metrics::Metrics;
use crate::parser::RuleCompiler;
use crate::server::{Listener, ListenerOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "Rule-driven DNS proxy", long_about = None)]
struct Args {
    /// 配置文件路径（JSON） / configuration file (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/dnsentry.json")]
    config: PathBuf,
    /// 启用调试日志 / enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 并发查询 worker 数量，覆盖配置文件 / concurrent query workers, overrides the config file
    #[arg(long = "threadpool-size")]
    threadpool_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load config")?;
    let bind_addr = cfg.bind_addr()?;
    let threadpool_size = args.threadpool_size.unwrap_or(cfg.threadpool_size);
    if threadpool_size == 0 {
        anyhow::bail!("--threadpool-size must be greater than zero");
    }

    let compiler = RuleCompiler::new().context("build rule syntax table")?;
    let compiled = compiler.compile(&cfg.rules, &cfg.settings());
    if !compiled.rejected.is_empty() {
        let skipped: Vec<&str> = compiled.rejected.iter().map(|r| r.line.as_str()).collect();
        warn!(?skipped, "some rules were skipped");
    }

    let metrics = Metrics::new();
    let engine = Engine::new(compiled.ruleset, metrics.clone());
    if engine.ruleset().is_empty() {
        warn!("no rules loaded, every query will be dropped");
    }
    info!("starting, {} known rules", engine.ruleset().len());
    let listener = Listener::bind(
        bind_addr,
        engine,
        metrics.clone(),
        ListenerOptions {
            threadpool_size,
            servfail_on_error: cfg.servfail_on_error,
        },
    )?;
    let listener = Arc::new(listener);

    spawn_signal_handlers(Arc::clone(&listener), metrics);

    info!(bind = %listener.local_addr(), threadpool_size, "dns proxy started");
    listener.start().await
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// SIGINT/SIGTERM 停止监听并等待在途查询；SIGUSR1 输出指标表
fn spawn_signal_handlers(listener: Arc<Listener>, metrics: Metrics) {
    let on_interrupt = Arc::clone(&listener);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => on_interrupt.stop(),
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::spawn(async move {
                    if term.recv().await.is_some() {
                        listener.stop();
                    }
                });
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }

        match signal(SignalKind::user_defined1()) {
            Ok(mut usr1) => {
                tokio::spawn(async move {
                    while usr1.recv().await.is_some() {
                        info!("metrics snapshot\n{}", metrics.render_table());
                    }
                });
            }
            Err(err) => error!(error = %err, "failed to install SIGUSR1 handler"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (listener, metrics);
    }
}
