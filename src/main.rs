mod args;
mod builder;
mod cgi;
mod codec;
mod config;
mod connection;
mod error;
mod handler;
mod reactor;
mod request;
mod response;
mod router;
mod table;

use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use nix::sys::signal::{signal, SigHandler, Signal};

use crate::args::Command;
use crate::cgi::ForkSpawner;
use crate::config::Config;
use crate::handler::Site;
use crate::reactor::Reactor;
use crate::response::SERVER_NAME;

/// Bind one non-blocking listener per configured server, paired with the server's index.
fn create_listeners(config: &Config) -> Result<Vec<(TcpListener, usize)>> {
    let mut listeners = Vec::new();
    for (index, server) in config.servers.iter().enumerate() {
        let addr = server.addr();
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to create listening socket for {}", addr))?;
        listener
            .set_nonblocking(true)
            .with_context(|| format!("failed to make listener for {} non-blocking", addr))?;
        info!("listening on: http://{}/", addr);
        listeners.push((listener, index));
    }
    Ok(listeners)
}

fn main() -> Result<()> {
    let args = match args::from_command_line()? {
        Command::Run(args) => args,
        Command::Help => {
            let name = std::env::args().next().unwrap_or_else(|| SERVER_NAME.to_string());
            print!("{}", args::usage(&name));
            return Ok(());
        }
        Command::Version => {
            println!("{}", SERVER_NAME);
            return Ok(());
        }
    };

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    let config_path = args.config_path()?;
    let config = Config::load(&config_path)?;
    info!(
        "{} loaded {} server(s) from {}",
        SERVER_NAME,
        config.servers.len(),
        config_path.display()
    );

    let listeners = create_listeners(&config)?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    let shutdown = Arc::new(AtomicBool::new(false));
    for &sig in &[signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .with_context(|| format!("failed to set handler for signal {}", sig))?;
    }

    let site = Site::new(config, args.prefix);
    let mut reactor = Reactor::new(
        site,
        listeners,
        Box::new(ForkSpawner),
        args.timeout,
        shutdown,
    )?;
    reactor.run()
}
