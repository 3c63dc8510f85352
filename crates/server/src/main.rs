use fleet_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fleet-server configuration invalid: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = fleet_server::serve(config).await {
        eprintln!("fleet-server failed: {err}");
        std::process::exit(1);
    }
}
