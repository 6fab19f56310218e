use clap::Parser;

fn main() -> Result<(), anyhow::Error> {
    let cli = portal_alerts::Cli::parse();

    // Use reasonable defaults for printing structured logs to stderr.
    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());

    if cli.log_json {
        tracing::subscriber::set_global_default(
            builder
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        )
    } else {
        tracing::subscriber::set_global_default(
            builder
                .with_ansi(!matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1"))
                .finish(),
        )
    }
    .expect("setting tracing default failed");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(runtime.spawn(portal_alerts::run(cli)));

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}
