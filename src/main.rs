use std::io::Write;

use tokio::runtime::Builder;

use pacbridge::config::{self, PacConfig};
use pacbridge::gateway::GatewayServer;
use pacbridge::pac::{LoopGuardPolicy, PacBuiltins, ProxyResolver, ScriptSandbox, ScriptSource};
use pacbridge::upstream::DEFAULT_CONNECT_TIMEOUT;

fn print_usage_and_exit(arg0: String) -> ! {
    eprintln!("Usage: {arg0} <config filename>");
    eprintln!("       {arg0} --resolve <pac locator or config filename> <target url>");
    std::process::exit(1);
}

fn init_logger() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();
}

fn main() {
    init_logger();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut resolve_mode = false;

    while !args.is_empty() && args[0].starts_with('-') {
        if args[0] == "--resolve" || args[0] == "-r" {
            args.remove(0);
            resolve_mode = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
        }
    }

    if resolve_mode {
        if args.len() != 2 {
            eprintln!("--resolve needs a PAC locator and a target URL.");
            print_usage_and_exit(arg0);
        }
        let locator = args.remove(0);
        let target_url = args.remove(0);
        // Resolution is blocking (HTTP fetch, DNS from script builtins), so
        // it runs without a runtime entirely.
        run_resolve(&locator, &target_url);
        return;
    }

    if args.len() != 1 {
        print_usage_and_exit(arg0);
    }
    let config_filename = args.remove(0);

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    if let Err(e) = runtime.block_on(serve(&config_filename)) {
        eprintln!("Gateway failed: {e}");
        std::process::exit(1);
    }
}

async fn serve(config_filename: &str) -> std::io::Result<()> {
    let config = config::load_config(config_filename).await?;
    let gateway = GatewayServer::start(
        config.bind_address,
        config.upstream.to_target(),
        DEFAULT_CONNECT_TIMEOUT,
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    log::info!("interrupted, shutting down");
    gateway.stop().await;
    Ok(())
}

/// One-shot resolution mode. The locator can be a PAC file/URL directly, or
/// a gateway config file whose `pac` section points at one.
fn run_resolve(locator: &str, target_url: &str) {
    let pac_config = if locator.ends_with(".yaml") || locator.ends_with(".yml") {
        match load_pac_section(locator) {
            Ok(pac) => pac,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    } else {
        PacConfig {
            url: locator.to_string(),
            loop_guard: LoopGuardPolicy::default(),
            my_ip_address: None,
        }
    };

    let host = match url::Url::parse(target_url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.to_string(),
            None => {
                eprintln!("Target URL has no host: {target_url}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Invalid target URL {target_url}: {e}");
            std::process::exit(1);
        }
    };

    let source = match ScriptSource::new(&pac_config.url) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not create PAC source: {e}");
            std::process::exit(1);
        }
    };
    let sandbox = ScriptSandbox::new(PacBuiltins::new(pac_config.my_ip_address));
    let resolver = ProxyResolver::new(source, sandbox, pac_config.loop_guard);

    match resolver.resolve(target_url, &host) {
        Ok(descriptors) => {
            if descriptors.is_empty() {
                println!("(no proxy)");
            }
            for descriptor in descriptors {
                println!("{descriptor}");
            }
        }
        Err(e) => {
            eprintln!("Resolution failed: {e}");
            std::process::exit(1);
        }
    }
}

fn load_pac_section(config_filename: &str) -> Result<PacConfig, String> {
    let config_str = std::fs::read_to_string(config_filename)
        .map_err(|e| format!("Could not read config file {config_filename}: {e}"))?;
    let config: config::GatewayConfig = serde_yaml::from_str(&config_str)
        .map_err(|e| format!("Could not parse config file {config_filename}: {e}"))?;
    config
        .pac
        .ok_or_else(|| format!("Config file {config_filename} has no pac section"))
}
