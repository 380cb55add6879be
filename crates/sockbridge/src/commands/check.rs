use std::path::PathBuf;
use std::sync::Arc;

use sockbridge_core::{Registry, UpstreamSupervisor, UpstreamTarget};
use sockbridge_settings::ConfigLoader;

use crate::cli::CheckArgs;
use crate::error::CliError;

pub async fn check(args: CheckArgs, cwd: PathBuf) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Config files
    println!("Config files:");
    let global_path = ConfigLoader::global_config_path();
    let project_path = ConfigLoader::project_config_path(&cwd);
    for path in [&global_path, &project_path] {
        let status = if args.source.no_config {
            "skipped"
        } else if path.exists() {
            "found"
        } else {
            "not found"
        };
        println!("  {} ({status})", path.display());
    }
    if let Some(extra) = &args.source.extra_config {
        println!("  {} (explicit)", extra.display());
    }

    // 2. Validation
    let settings = ConfigLoader::load_layered(
        &cwd,
        args.source.extra_config.as_deref(),
        !args.source.no_config,
    )?;
    let config = match settings.to_bridge_config() {
        Ok(config) => {
            println!("Config valid: OK");
            config
        }
        Err(e) => {
            println!("Config valid: FAIL ({e})");
            return Err(CliError::Other("One or more checks failed".to_string()));
        }
    };

    // 3. Upstream proxy, single attempt
    let upstream = UpstreamSupervisor::new(
        Arc::new(UpstreamTarget::new(
            config.upstream_host.clone(),
            config.upstream_port,
        )),
        config.backoff.clone(),
        config.upstream_connect_timeout,
        Arc::new(Registry::new(1)),
    );
    print!("Upstream {}: ", config.upstream_authority());
    match upstream.probe().await {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAIL ({e})");
            all_ok = false;
        }
    }

    // 4. Listen port
    print!("Listen {}: ", config.listen_addr);
    match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAIL ({e})");
            all_ok = false;
        }
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}
