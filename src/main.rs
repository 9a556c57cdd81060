//! mtrelay - a transparent MTProto relay

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mtrelay::app::{metrics, EventObserver, EventStream, PrometheusObserver, Proxy};
use mtrelay::config::Config;
use mtrelay::defense::{
    AntiReplayCache, FileIpList, IpGate, IpList, NoopAntiReplay, StableBloomAntiReplay,
};
use mtrelay::error::Result;
use mtrelay::secret::Secret;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(host) = args.gen_secret {
        let secret = Secret::generate(&host)?;
        println!("{}", secret.to_hex());
        println!("{}", secret.to_base64());
        return Ok(());
    }

    if args.gen_config {
        let secret = Secret::generate("example.com")?;
        let config = Config::default_with_secret(&secret);
        println!("{}", serde_json::to_string_pretty(&config).unwrap());
        return Ok(());
    }

    let config = match args.config {
        Some(path) => Config::load(path)?,
        None => {
            eprintln!("No config file specified. See -h for usage.");
            std::process::exit(1);
        }
    };

    // Initialize logging: --debug wins, RUST_LOG overrides the default.
    let log_level = if config.debug {
        Level::DEBUG
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Level::INFO)
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("mtrelay v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let token = CancellationToken::new();

    // Observers first: everything downstream announces through them.
    let mut observers: Vec<Box<dyn EventObserver>> = Vec::new();
    if config.stats.prometheus.enabled {
        metrics::init_metrics();
        observers.push(Box::new(PrometheusObserver));
        tokio::spawn(metrics::serve_metrics(
            config.stats.prometheus.listen,
            token.clone(),
        ));
    }
    let events = EventStream::new(observers);

    let antireplay: Arc<dyn AntiReplayCache> = if config.defense.anti_replay.enabled {
        Arc::new(StableBloomAntiReplay::new(
            config.defense.anti_replay.max_size,
            config.defense.anti_replay.error_rate,
        ))
    } else {
        Arc::new(NoopAntiReplay)
    };

    let gate = IpGate::new(
        build_list("allowlist", &config.defense.allowlist, &events, false, &token)?,
        build_list("blocklist", &config.defense.blocklist, &events, true, &token)?,
    );

    let proxy = Proxy::new(&config, antireplay, gate, events, token.clone())?;
    let listener = tokio::net::TcpListener::bind(config.bind_to).await?;

    // Ctrl-C drains into cancellation; every live context is a child of
    // this token.
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    proxy.serve(listener).await
}

fn build_list(
    name: &'static str,
    config: &mtrelay::config::IpListConfig,
    events: &EventStream,
    is_blocklist: bool,
    token: &CancellationToken,
) -> Result<Option<Arc<dyn IpList>>> {
    if !config.enabled {
        return Ok(None);
    }
    let list = Arc::new(FileIpList::new(name, config.files.clone())?);
    let _refresh = list.spawn_refresh(
        std::time::Duration::from_secs(config.update_each),
        events.clone(),
        is_blocklist,
        token.clone(),
    );
    info!(list = name, entries = list.len(), "ip list loaded");
    Ok(Some(list as Arc<dyn IpList>))
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    gen_secret: Option<String>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut gen_secret = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "--gen-secret" => {
                    if i + 1 < args.len() {
                        gen_secret = Some(args[i + 1].clone());
                        i += 1;
                    } else {
                        eprintln!("--gen-secret needs a hostname");
                        std::process::exit(1);
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            gen_secret,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"mtrelay - a transparent MTProto relay

USAGE:
    mtrelay [OPTIONS]

OPTIONS:
    -c, --config <FILE>      Path to configuration file
    --gen-config             Generate an example config with a fresh secret
    --gen-secret <HOSTNAME>  Generate a secret fronting to HOSTNAME
    -v, --version            Print version information
    -h, --help               Print help information

EXAMPLES:
    mtrelay --gen-secret cdn.example.com
    mtrelay --gen-config > mtrelay.json
    mtrelay -c mtrelay.json
"#
    );
}

fn print_version() {
    println!("mtrelay v{}", env!("CARGO_PKG_VERSION"));
}
