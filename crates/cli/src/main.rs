use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use freightline_api::{SyncConfig, SyncEngine};
use freightline_core::{Kind, Resource, Scope};
use freightline_kubehub::KubeEventSource;
use freightline_watch::{EventSource, OnResource, ReplaySource, Resolved, SessionEnd};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "freightctl", version, about = "freightline: live Kargo stage/freight sync")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kargo project namespace (scope)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded JSONL event log and print the resulting caches and distances
    Replay {
        /// File with one `{"changeType":..,"resource":..}` object per line
        file: std::path::PathBuf,
    },
    /// Watch a Kargo project on the current cluster and print +/~/- events
    Watch,
}

fn init_tracing() {
    let env = std::env::var("FREIGHTLINE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FREIGHTLINE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FREIGHTLINE_METRICS_ADDR; expected host:port");
        }
    }
}

/// JSON view of one scope: cached resources per kind plus the distance matrix.
fn scope_document(engine: &SyncEngine, scope: &Scope) -> Result<serde_json::Value> {
    let mut kinds = serde_json::Map::new();
    for kind in Kind::ALL {
        let snap = engine.snapshot(scope, kind);
        let items: Vec<&Resource> = snap.items.iter().map(|r| r.as_ref()).collect();
        kinds.insert(kind.plural().to_string(), serde_json::to_value(&items)?);
    }
    Ok(serde_json::json!({
        "scope": scope,
        "resources": kinds,
        "distances": engine.distances(scope).as_ref(),
    }))
}

fn print_scope(engine: &SyncEngine, scope: &Scope, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("scope {}", scope);
            for kind in Kind::ALL {
                let snap = engine.snapshot(scope, kind);
                let names: Vec<&str> = snap.names().collect();
                println!("  {:<10} {:>3}  {}", kind.plural(), snap.len(), names.join(", "));
            }
            let cells = engine.distances(scope).cells();
            if cells.is_empty() {
                println!("  distances: (none)");
            }
            for c in cells {
                println!("  {}:{} @ {} = {}", c.repo, c.tag, c.stage, c.distance);
            }
        }
        Output::Json => println!("{}", serde_json::to_string(&scope_document(engine, scope)?)?),
    }
    Ok(())
}

async fn replay(file: &std::path::Path, only: Option<Scope>, output: Output) -> Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let source = ReplaySource::from_jsonl(&text);
    if source.skipped() > 0 {
        warn!(file = %file.display(), skipped = source.skipped(), "replay: malformed lines skipped");
    }
    info!(file = %file.display(), events = source.len(), "replay invoked");
    let scopes = match only {
        Some(s) => vec![s],
        None => source.scopes(),
    };
    let engine = SyncEngine::new(Arc::new(source) as Arc<dyn EventSource>, SyncConfig::from_env());
    for scope in &scopes {
        engine.open_scope(scope).await?;
        for (kind, res) in engine.wait_scope(scope).await {
            match res {
                Ok(s) if s.end == SessionEnd::Completed => {
                    info!(scope = %scope, kind = %kind, applied = s.stats.applied, dropped = s.stats.dropped, deduped = s.stats.deduped, "replay: partition done")
                }
                Ok(s) => warn!(scope = %scope, kind = %kind, end = ?s.end, "replay: partition ended early"),
                Err(e) => return Err(anyhow!(e).context(format!("replaying {}/{}", scope, kind))),
            }
        }
        print_scope(&engine, scope, output)?;
    }
    Ok(())
}

async fn watch(scope: Scope, output: Output) -> Result<()> {
    let source = KubeEventSource::try_default().await?;
    let engine = SyncEngine::new(Arc::new(source) as Arc<dyn EventSource>, SyncConfig::from_env());
    let matrix = Arc::clone(engine.matrix());
    let printer: OnResource = Arc::new(move |r: &Resolved| match output {
        Output::Human => {
            println!("{} {}/{}", r.change.marker(), r.resource.kind, r.resource.name);
            if r.resource.kind == Kind::Stage {
                for c in matrix.get(&r.resource.scope).cells().into_iter().filter(|c| c.stage == r.resource.name) {
                    println!("    {}:{} = {}", c.repo, c.tag, c.distance);
                }
            }
        }
        Output::Json => match serde_json::to_string(&serde_json::json!({ "changeType": r.change, "resource": r.resource.as_ref() })) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "encode event"),
        },
    });
    engine.open_scope_with(&scope, Some(printer)).await?;
    info!(scope = %scope, "watch: streaming; Ctrl-C to stop");

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut failed = None;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for (key, res) in engine.reap().await {
                    match res {
                        Ok(s) => warn!(partition = %key, end = ?s.end, "watch stream ended"),
                        Err(e) => {
                            error!(partition = %key, error = %e, "watch stream failed");
                            failed = Some(e);
                        }
                    }
                }
                if failed.is_some() { break; }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    engine.shutdown().await;
    print_scope(&engine, &scope, output)?;
    match failed {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let scope = cli.namespace.map(Scope::from);

    match cli.command {
        Commands::Replay { file } => replay(&file, scope, cli.output).await,
        Commands::Watch => {
            let scope = scope.ok_or_else(|| anyhow!("watch requires --ns <project>"))?;
            watch(scope, cli.output).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"
{"changeType":"Added","resource":{"scope":"demo","kind":"Freight","name":"f1","payload":{}}}
{"changeType":"Added","resource":{"scope":"demo","kind":"Stage","name":"prod","payload":{"status":{"currentFreight":{"name":"f1"},"lastPromotion":{"status":{"phase":"Succeeded"},"freight":{"images":[{"repoURL":"nginx","tag":"1.0"}]}}}}}}
"#;

    #[tokio::test]
    async fn json_document_lists_resources_and_distances() {
        let engine = SyncEngine::new(Arc::new(ReplaySource::from_jsonl(LOG)) as Arc<dyn EventSource>, SyncConfig::default());
        let scope = Scope::new("demo");
        engine.open_scope(&scope).await.unwrap();
        for (_, res) in engine.wait_scope(&scope).await {
            assert_eq!(res.unwrap().end, SessionEnd::Completed);
        }
        let doc = scope_document(&engine, &scope).unwrap();
        assert_eq!(doc["scope"], "demo");
        assert_eq!(doc["resources"]["stages"][0]["name"], "prod");
        assert_eq!(doc["resources"]["freights"][0]["name"], "f1");
        assert_eq!(doc["resources"]["warehouses"], serde_json::json!([]));
        assert_eq!(doc["distances"]["nginx"]["1.0"]["prod"], 0);
    }
}
