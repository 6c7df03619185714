use anyhow::Context;
use clap::Parser;
use evhttpd::config::Config;
use evhttpd::event_loop::EventLoop;
use evhttpd::server::Server;
use log::info;

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let threads = config.worker_threads()?;
    let log_path = config.resolved_log_path()?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {log_path}"))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    let main_loop = EventLoop::new();
    let server = Server::new(&main_loop, threads, config.port)
        .with_context(|| format!("failed to listen on port {}", config.port))?;
    server.start();
    info!(
        "evhttpd starting: port {}, {} workers, log {}",
        config.port, threads, log_path
    );
    main_loop.run();
    Ok(())
}
