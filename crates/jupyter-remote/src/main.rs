//! jupyter-remote CLI entry point.
//!
//! Talks to a Jupyter server: lists kernel specs and kernels, manages kernel
//! lifecycles, runs code on a kernel and prints notebook contents.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jupyter_protocol::JupyterMessageContent;
use jupyter_remote::config::{default_config_path, load_config};
use jupyter_remote::{
    ContentsManager, GetOptions, KernelConnection, KernelLifecycle, KernelManager,
    KernelSpecManager, ServerConnection, WebSocketConnector,
};
use log::debug;

#[derive(Parser, Debug)]
#[command(name = "jupyter-remote")]
#[command(about = "Work with kernels on a remote Jupyter server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/jupyter-remote/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server URL, overriding the config file and JUPYTER_SERVER_URL
    #[arg(long, global = true)]
    url: Option<String>,

    /// Server token, overriding the config file and JUPYTER_TOKEN
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List installed kernel specs
    Specs,

    /// List running kernels
    Kernels,

    /// Start a kernel and print its id
    Start {
        /// Kernel spec name (default: the server's default spec)
        #[arg(long)]
        spec: Option<String>,
    },

    /// Execute code on a running kernel, streaming its output
    Run {
        /// Kernel id
        #[arg(long)]
        kernel: String,

        /// Code to execute
        code: String,
    },

    /// Interrupt a kernel
    Interrupt { kernel_id: String },

    /// Restart a kernel
    Restart { kernel_id: String },

    /// Shut a kernel down
    Shutdown { kernel_id: String },

    /// Print a file or notebook from the server
    Cat { path: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path);
    config.apply_env();
    if let Some(url) = cli.url {
        config.base_url = url;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    debug!("Server: {}", config.base_url);

    let settings = config
        .server_settings()
        .with_context(|| format!("invalid server settings in {}", config_path.display()))?;
    let server = Arc::new(ServerConnection::new(settings)?);
    let specs = Arc::new(KernelSpecManager::with_ttl(
        Arc::clone(&server),
        config.kernelspec_ttl(),
    ));
    let kernels = Arc::new(KernelManager::new(Arc::clone(&server), Arc::clone(&specs)));

    match cli.command {
        Commands::Specs => {
            let snapshot = specs.list_specs().await?;
            for (name, spec) in &snapshot.catalog.kernelspecs {
                let marker = if *name == snapshot.catalog.default { "*" } else { " " };
                println!(
                    "{} {:<20} {:<12} {}",
                    marker, name, spec.spec.language, spec.spec.display_name
                );
            }
            if snapshot.stale {
                eprintln!("(server unreachable; showing cached specs)");
            }
        }
        Commands::Kernels => {
            for kernel in kernels.list_kernels().await? {
                println!(
                    "{}  {:<12} {:<10} connections={}",
                    kernel.id, kernel.name, kernel.status, kernel.connections
                );
            }
        }
        Commands::Start { spec } => {
            let kernel = kernels.start_kernel(spec.as_deref()).await?;
            println!("{}", kernel.id);
        }
        Commands::Run { kernel, code } => {
            run_code(&server, &kernels, &kernel, &code, config.connection_config()).await?;
        }
        Commands::Interrupt { kernel_id } => kernels.interrupt_kernel(&kernel_id).await?,
        Commands::Restart { kernel_id } => {
            let kernel = kernels.restart_kernel(&kernel_id).await?;
            println!("Restarted {} ({})", kernel.id, kernel.status);
        }
        Commands::Shutdown { kernel_id } => {
            kernels.shutdown_kernel(&kernel_id).await?;
            println!("Shut down {}", kernel_id);
        }
        Commands::Cat { path } => {
            let contents = ContentsManager::new(Arc::clone(&server));
            let content = contents.get(&path, &GetOptions::default()).await?;
            match (content.format.as_deref(), content.content) {
                (Some("text"), Some(serde_json::Value::String(text))) => print!("{}", text),
                (Some("base64"), Some(_)) => {
                    println!("<binary file, {} bytes>", content.size.unwrap_or(0))
                }
                (_, Some(body)) => println!("{}", serde_json::to_string_pretty(&body)?),
                (_, None) => println!("{} ({})", content.path, content.kind),
            }
        }
    }

    Ok(())
}

async fn run_code(
    server: &Arc<ServerConnection>,
    kernels: &Arc<KernelManager>,
    kernel_id: &str,
    code: &str,
    config: jupyter_remote::ConnectionConfig,
) -> anyhow::Result<()> {
    if kernels.get_kernel(kernel_id).await?.is_none() {
        anyhow::bail!("kernel {} is not running", kernel_id);
    }

    let connector = Arc::new(WebSocketConnector::new(Arc::clone(server)));
    let lifecycle: Arc<dyn KernelLifecycle> = Arc::clone(kernels) as _;
    let connection = KernelConnection::open(kernel_id, connector, lifecycle, config);

    let mut execution = connection.execute_code(code);
    while let Some(event) = execution.next_event().await {
        match &event.content {
            JupyterMessageContent::StreamContent(stream) => print!("{}", stream.text),
            JupyterMessageContent::ErrorOutput(error) => {
                eprintln!("{}: {}", error.ename, error.evalue)
            }
            JupyterMessageContent::ExecuteResult(_) | JupyterMessageContent::DisplayData(_) => {
                let content = serde_json::to_value(&event.content)?;
                if let Some(text) = content["data"]["text/plain"].as_str() {
                    println!("{}", text);
                }
            }
            _ => {}
        }
    }

    let reply = execution.reply().await;
    connection.shutdown().await;
    let reply = reply?;
    if let JupyterMessageContent::ExecuteReply(reply) = &reply.content {
        debug!("Execution count {}", reply.execution_count.0);
    }
    Ok(())
}
