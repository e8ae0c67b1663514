use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use synop_api::{Heisenbridge, MautrixSignal, Synapse, GROUP};
use synop_controllers::{Context, EntityKind, Reconciler};
use synop_engine::{drive, ControllerConfig, Directive};
use tracing::{error, info, warn};

mod render;

#[derive(Parser, Debug)]
#[command(name = "synopctl", version, about = "Synop: Synapse operator toolbox")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the entity, and of manifests that carry none
    #[arg(long = "ns", global = true, env = "SYNOP_NAMESPACE", default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the CustomResourceDefinitions as YAML
    Crds,
    /// Reconcile one entity against the current kube context
    Reconcile {
        /// synapse, heisenbridge or mautrixsignal
        kind: String,
        name: String,
        /// Passes to run while the pipeline asks for an immediate rerun
        #[arg(long = "max-runs", default_value_t = 10)]
        max_runs: usize,
    },
    /// Reconcile the entities of a manifest file in memory and print the result
    Render {
        /// Multi-document YAML with entities and the ConfigMaps/Secrets they reference
        file: String,
        #[arg(long = "max-runs", default_value_t = 10)]
        max_runs: usize,
    },
}

/// Filter used when `SYNOP_LOG` is unset or invalid: the pipelines at info,
/// the kube client only when something goes wrong.
const DEFAULT_LOG_FILTER: &str = "info,kube=warn,tower=warn,hyper=warn";

fn log_filter(raw: Option<String>) -> tracing_subscriber::EnvFilter {
    raw.and_then(|raw| tracing_subscriber::EnvFilter::from_str(&raw).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Logs go to stderr so `-o json` output on stdout stays parseable.
fn init_tracing() {
    let filter = log_filter(std::env::var("SYNOP_LOG").ok());
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Serve the `ensure_*`, `status_*`, `pipeline_*` and `kube_writes_total`
/// metrics on `SYNOP_METRICS_ADDR` (`host:port`) while a live reconcile runs.
/// Unset means no exporter.
fn init_metrics() {
    let Ok(addr) = std::env::var("SYNOP_METRICS_ADDR") else {
        return;
    };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %sock, "serving reconcile metrics"),
            Err(e) => warn!(error = %e, "metrics exporter not installed"),
        },
        Err(_) => warn!(addr = %addr, "SYNOP_METRICS_ADDR must be host:port; metrics disabled"),
    }
}

fn print_directive(output: Output, object: &str, directive: &Directive) -> Result<()> {
    match output {
        Output::Human => println!("{} • {}", object, directive),
        Output::Json => println!("{}", serde_json::to_string(&serde_json::json!({ "object": object, "directive": directive.to_string() }))?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => {
            let crds = [Synapse::crd(), Heisenbridge::crd(), MautrixSignal::crd()];
            match cli.output {
                Output::Human => {
                    for crd in crds {
                        print!("---\n{}", serde_yaml::to_string(&crd)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&crds)?),
            }
        }
        Commands::Reconcile { kind, name, max_runs } => {
            let kind: EntityKind = kind.parse().map_err(|e: String| anyhow!(e))?;
            let store = synop_kubehub::KubeStore::try_default().await?;
            let gvk = format!("{}/v1alpha1/{}", GROUP, kind);
            if let Err(e) = synop_kubehub::find_api_resource(store.client().clone(), &gvk).await {
                warn!(error = %e, "CRD not found; install it with `synopctl crds | kubectl apply -f -`");
                return Err(e);
            }

            init_metrics();
            let config = ControllerConfig::from_env();
            info!(kind = %kind, name = %name, ns = %cli.namespace, max_runs, "reconcile invoked");
            let ctx = Arc::new(Context::new(Arc::new(store), config));
            let reconciler = Reconciler::new(ctx, kind);
            let key = kind.key(&cli.namespace, &name);
            let (directive, runs) = drive(&reconciler, &key, max_runs).await;
            info!(object = %key, runs, action = ?directive.clone().into_action(), "reconcile finished");
            print_directive(cli.output, &key.to_string(), &directive)?;
            if let Directive::RequeueWithError(msg) = directive {
                error!(object = %key, error = %msg, "reconcile failed");
                return Err(anyhow!(msg));
            }
        }
        Commands::Render { file, max_runs } => {
            let raw = std::fs::read_to_string(&file)?;
            let objects = render::load_manifests(&raw, &cli.namespace)?;
            info!(file = %file, documents = objects.len(), "render invoked");
            let out = render::render(&objects, ControllerConfig::from_env(), max_runs).await?;
            match cli.output {
                Output::Human => {
                    for (key, directive) in &out.directives {
                        print_directive(cli.output, &key.to_string(), directive)?;
                    }
                    for obj in &out.objects {
                        let ns = obj["metadata"]["namespace"].as_str().unwrap_or("-");
                        let name = obj["metadata"]["name"].as_str().unwrap_or("-");
                        println!("{}\t{}\t{}", obj["kind"].as_str().unwrap_or("?"), ns, name);
                    }
                }
                Output::Json => {
                    let directives: Vec<_> = out
                        .directives
                        .iter()
                        .map(|(k, d)| serde_json::json!({ "object": k.to_string(), "directive": d.to_string() }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "directives": directives, "objects": out.objects }))?);
                }
            }
        }
    }
    Ok(())
}
