use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kite_core::KiteConfig;
use kite_manifest::{emit, EmitOptions, Target};
use kite_rpc::{Invoke, ProxyFactory};
use tracing::{info, warn};

mod services;

use services::Graph;

#[derive(Parser, Debug)]
#[command(name = "kitectl", version, about = "Kite CLI: manifests, harness and calls for the sample graph")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print deployment manifests for the greeter graph
    Manifests {
        /// Target platform: kubernetes (k8s) or knative (serverless)
        #[arg(long = "target", default_value = "kubernetes")]
        target: String,
        /// Prefix for artifact names (default: KITE_TEMPLATE_DIR)
        #[arg(long = "template-dir")]
        template_dir: Option<String>,
    },
    /// Run the server harness for one service (echo or greeter)
    Serve {
        service: String,
    },
    /// Call a method on a deployed service through a remote proxy
    Call {
        service: String,
        method: String,
        /// JSON argument (default: null)
        #[arg(default_value = "null")]
        arg: String,
    },
    /// Call a method with the whole graph running in-process
    Local {
        service: String,
        method: String,
        #[arg(default_value = "null")]
        arg: String,
    },
    /// List the methods a service declares
    Methods {
        service: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KITE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KITE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KITE_METRICS_ADDR; expected host:port");
        }
    }
}

fn lookup<'a>(graph: &'a Graph, service: &str) -> Result<&'a std::sync::Arc<kite_core::ServiceDescription>> {
    graph.get(service).ok_or_else(|| anyhow!("unknown service {:?} (expected echo or greeter)", service))
}

fn print_value(output: Output, v: &serde_json::Value) -> Result<()> {
    match output {
        Output::Human => println!("{}", serde_json::to_string_pretty(v)?),
        Output::Json => println!("{}", serde_json::to_string(v)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = KiteConfig::from_env()?;

    match cli.command {
        Commands::Manifests { target, template_dir } => {
            let target = Target::from_str(&target)?;
            let mut opts = EmitOptions::from_config(&cfg);
            if let Some(dir) = template_dir { opts.template_dir = dir; }
            let graph = Graph::deployed()?;
            info!(target = %target, "manifests invoked");
            let artifacts = emit(&graph.greeter, target, &opts)?;
            match cli.output {
                Output::Human => {
                    for a in &artifacts {
                        println!("# {}", a.name);
                        print!("{}", a.yaml);
                        println!("---");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&artifacts)?),
            }
        }
        Commands::Serve { service } => {
            let graph = Graph::deployed()?;
            let desc = lookup(&graph, &service)?.clone();
            let factory = ProxyFactory::new(&cfg)?;
            info!(service = %service, addr = %cfg.listen_addr, "serve invoked");
            kite_rpc::serve(&desc, |local| graph.local(local, Some(&factory)), &cfg)
                .await
                .with_context(|| format!("serving {}", service))?;
        }
        Commands::Call { service, method, arg } => {
            let graph = Graph::deployed()?;
            let desc = lookup(&graph, &service)?;
            let arg: serde_json::Value = serde_json::from_str(&arg).context("argument must be JSON")?;
            let proxy = ProxyFactory::new(&cfg)?.proxy(desc)?;
            info!(service = %service, method = %method, "call invoked");
            let out = proxy.invoke(&method, arg).await?;
            print_value(cli.output, &out)?;
        }
        Commands::Local { service, method, arg } => {
            let graph = Graph::in_process()?;
            let desc = lookup(&graph, &service)?;
            let arg: serde_json::Value = serde_json::from_str(&arg).context("argument must be JSON")?;
            let svc = graph.local(desc, None)?;
            let out = svc.invoke(&method, arg).await?;
            print_value(cli.output, &out)?;
        }
        Commands::Methods { service } => {
            let graph = Graph::deployed()?;
            let desc = lookup(&graph, &service)?;
            match cli.output {
                Output::Human => {
                    for m in desc.methods().iter() { println!("{}", m); }
                }
                Output::Json => println!("{}", serde_json::to_string(desc.methods())?),
            }
        }
    }

    Ok(())
}
