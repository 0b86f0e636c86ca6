// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Print the SQL generated for a query, or run it against ClickHouse.

// Copyright 2024 Oxide Computer Company

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use reader_engine::client::Client;
use reader_engine::executor::Executor;
use reader_engine::executor::RangeParams;
use reader_engine::logql;
use reader_engine::logql::ast::LogQuery;
use reader_engine::planner::PlannerFactory;
use reader_engine::promql::ast::PromExpr;
use reader_engine::promql::ast::SelectHints;
use reader_engine::promql::optimizer;
use reader_engine::traceql;
use reader_engine::traceql::ast::TraceQuery;
use reader_engine::Config;
use reader_engine::Planner;
use reader_engine::PlannerContext;
use serde::de::DeserializeOwned;
use slog::debug;
use slog::Drain;
use slog::Level;
use slog::LevelFilter;
use slog::Logger;
use slog_term::FullFormat;
use slog_term::TermDecorator;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration of the engine.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the URL of the ClickHouse HTTP interface.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Check that ClickHouse answers.
    Ping,
    /// A LogQL query, as a JSON encoded AST.
    Logql {
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
        /// Return log lines oldest first.
        #[arg(long)]
        forward: bool,
    },
    /// The selectors and pushed down subtrees of a PromQL expression.
    Promql {
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// A TraceQL search, as a JSON encoded AST.
    Traceql {
        file: PathBuf,
        #[command(flatten)]
        range: RangeArgs,
    },
}

#[derive(Debug, Args)]
struct RangeArgs {
    /// Start of the range, RFC 3339. Defaults to an hour before `--to`.
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// End of the range, RFC 3339. Defaults to now.
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Resolution of metric queries, in seconds.
    #[arg(long, default_value_t = 15)]
    step: u64,

    /// Maximum number of lines, traces or series. Zero means no limit.
    #[arg(long, default_value_t = 100)]
    limit: i64,

    /// Print the generated SQL instead of running it.
    #[arg(long)]
    explain: bool,
}

impl RangeArgs {
    fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self.from.unwrap_or(to - chrono::Duration::hours(1));
        (from, to)
    }

    fn step(&self) -> Duration {
        Duration::from_secs(self.step)
    }
}

fn logger(verbose: bool) -> Logger {
    let level = if verbose { Level::Debug } else { Level::Info };
    let decorator = TermDecorator::new().stderr().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, slog::o!())
}

fn read_ast<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("invalid query AST in {}", path.display()))
}

fn print_sql(sql: &str) {
    println!(
        "{}",
        sqlformat::format(
            sql,
            &sqlformat::QueryParams::None,
            &sqlformat::FormatOptions {
                uppercase: Some(true),
                ..Default::default()
            }
        )
    );
    println!();
}

fn render(ctx: &PlannerContext, planner: &dyn Planner) -> Result<String> {
    Ok(ctx.render(&planner.process(ctx)?)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = logger(cli.verbose);
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(url) = &cli.url {
        config.db.url = url.clone();
    }
    let client = Arc::new(Client::new(&config.db, &log));
    debug!(log, "using ClickHouse"; "url" => client.url());
    let executor = Executor::new(config.clone(), client.clone(), &log);

    match cli.cmd {
        Cmd::Ping => {
            client.ping().await?;
            println!("ok");
        }
        Cmd::Logql { file, range, forward } => {
            let query: LogQuery = read_ast(&file)?;
            let (from, to) = range.bounds();
            if range.explain {
                let factory = PlannerFactory::default();
                let processor = logql::plan(&query, &factory)?;
                let ctx = PlannerContext::new(
                    &config,
                    client,
                    &log,
                    from,
                    to,
                    range.step(),
                )
                .with_limit(range.limit)
                .with_order_asc(forward);
                print_sql(&render(&ctx, &processor.getter().planner)?);
                for stage in processor.stages() {
                    println!("-- then {stage:?}");
                }
                return Ok(());
            }
            let params = RangeParams {
                from,
                to,
                step: range.step(),
                limit: range.limit,
                forward,
            };
            let mut body = executor.query_range(&query, &params)?;
            let mut out = std::io::stdout().lock();
            while let Some(chunk) = body.recv().await {
                out.write_all(&chunk)?;
            }
            writeln!(out)?;
        }
        Cmd::Promql { file, range } => {
            let expr: PromExpr = read_ast(&file)?;
            let (from, to) = range.bounds();
            let hints = SelectHints {
                start: from.timestamp_millis(),
                end: to.timestamp_millis(),
                step: i64::try_from(range.step().as_millis())?,
                ..Default::default()
            };
            let optimized = optimizer::optimize(expr)?;
            if optimized.substitutes.is_empty() {
                bail!("nothing in the expression can be pushed down");
            }
            if range.explain {
                let ctx = PlannerContext::new(
                    &config,
                    client,
                    &log,
                    from,
                    to,
                    range.step(),
                );
                for (name, sub) in optimized.substitutes.iter() {
                    println!("-- {name}");
                    print_sql(&render(&ctx, &sub.request)?);
                }
                return Ok(());
            }
            let series =
                executor.prom_substitutes(&optimized, &hints).await?;
            print_json(&series)?;
        }
        Cmd::Traceql { file, range } => {
            let query: TraceQuery = read_ast(&file)?;
            let (from, to) = range.bounds();
            if range.explain {
                let plan = traceql::plan(&query)?;
                let ctx = PlannerContext::new(
                    &config,
                    client,
                    &log,
                    from,
                    to,
                    range.step(),
                )
                .with_limit(range.limit);
                println!("-- complexity");
                print_sql(&render(&ctx, &plan.eval)?);
                println!("-- simple");
                print_sql(&render(&ctx, &plan.simple)?);
                println!("-- complex");
                print_sql(&render(&ctx, &plan.complex)?);
                return Ok(());
            }
            let result = executor
                .trace_search(&query, from, to, range.step(), range.limit)
                .await?;
            print_json(&result)?;
        }
    }
    Ok(())
}
