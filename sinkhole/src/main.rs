// Copyright 2024 The sinkhole contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod listen;
mod sources;

use anyhow::{Context, Result};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use smatcher::Matcher;
use sroute::{Adapter, Block, Cache, Local, Pipeline, Recursor, Terminal, Upstream};
use std::{num::NonZeroUsize, path::PathBuf, sync::Arc, time::Duration};
use structopt::StructOpt;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

const DEFAULT_UPSTREAMS: &[&str] = &["tcp-tls://1.1.1.1:853", "tcp-tls://1.0.0.1:853"];

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sinkhole",
    about = "A recursive, filtering DNS resolver: answers locally, blocks what you tell it to, and resolves the rest."
)]
struct Opts {
    /// DNS listening port
    #[structopt(short, long, default_value = "53")]
    port: u16,

    /// Upstream DNS servers, [proto://]ip[:port] with proto udp|tcp|tcp-tls
    #[structopt(short, long)]
    upstream: Vec<String>,

    /// Walk the DNS hierarchy from the root hints instead of using upstreams
    #[structopt(short, long)]
    recursive: bool,

    /// Root hints zone file (the embedded named.root is used otherwise)
    #[structopt(long)]
    hints: Option<PathBuf>,

    /// Ignore IPv4 glue during recursion
    #[structopt(long)]
    disable_ipv4: bool,

    /// Ignore IPv6 glue during recursion
    #[structopt(long)]
    disable_ipv6: bool,

    /// Local record sources: files, directories, or http(s) URLs
    #[structopt(long)]
    local: Vec<String>,

    /// Allow list sources: files, directories, or http(s) URLs
    #[structopt(long)]
    allow: Vec<String>,

    /// Block list sources: files, directories, or http(s) URLs
    #[structopt(long)]
    block: Vec<String>,

    /// Directory where fetched remote sources are kept between runs
    #[structopt(long)]
    cache_dir: Option<PathBuf>,

    /// Answer cache capacity, in entries
    #[structopt(long, default_value = "8192")]
    cache_size: usize,

    /// Upstream exchange timeout, in seconds
    #[structopt(long, default_value = "5")]
    timeout: u64,

    /// Extra CA certificate (PEM) trusted for tcp-tls upstreams
    #[structopt(long)]
    ca: Option<PathBuf>,

    /// Log verbosity: off, error, warn, info, debug, or trace
    #[structopt(short = "v", long, default_value = "info")]
    log_level: LevelFilter,

    /// Disable response timing logs
    #[structopt(long)]
    no_metrics: bool,
}

async fn matcher_for(
    what: &str,
    locations: &[String],
    cache_dir: Option<&std::path::Path>,
) -> Result<Option<Arc<Matcher>>> {
    if locations.is_empty() {
        return Ok(None);
    }

    let records = sources::records(locations, cache_dir).await;
    info!("loaded {} {} records", records.len(), what);
    let matcher = Matcher::new(records)
        .with_context(|| format!("no usable {} records among {:?}", what, locations))?;
    Ok(Some(Arc::new(matcher)))
}

async fn init(opts: &Opts, token: &CancellationToken) -> Result<Adapter> {
    let cache_dir = opts.cache_dir.as_deref();

    let local = matcher_for("local", &opts.local, cache_dir).await?.map(Local::new);
    let allow = matcher_for("allow", &opts.allow, cache_dir).await?;
    let block = matcher_for("block", &opts.block, cache_dir).await?.map(Block::new);

    let timeout = Duration::from_secs(opts.timeout);
    let terminal = if opts.recursive {
        let hints = match &opts.hints {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read root hints {}", path.display()))?,
            ),
            None => None,
        };
        Terminal::Recursive(
            Recursor::new(hints.as_deref(), !opts.disable_ipv4, !opts.disable_ipv6)
                .context("failed to set up the recursive resolver")?
                .with_timeout(timeout),
        )
    } else {
        let addresses: Vec<String> = if opts.upstream.is_empty() {
            DEFAULT_UPSTREAMS.iter().map(|s| s.to_string()).collect()
        } else {
            opts.upstream.clone()
        };
        let ca = match &opts.ca {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read CA bundle {}", path.display()))?,
            ),
            None => None,
        };
        Terminal::Upstreams(
            Upstream::from_addresses(
                addresses.iter().map(String::as_str),
                ca.as_deref(),
                timeout,
            )
            .context("failed to set up upstreams")?,
        )
    };

    let cache_size =
        NonZeroUsize::new(opts.cache_size).context("cache-size must be at least 1")?;
    let pipeline = Pipeline::spawn(
        token,
        Cache::new(cache_size),
        local,
        allow,
        block,
        terminal,
    );

    Ok(Adapter::new(token.clone(), pipeline.inlet(), !opts.no_metrics))
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::from_args();

    SimpleLogger::new().with_level(opts.log_level).init()?;

    let token = CancellationToken::new();
    let adapter = Arc::new(init(&opts, &token).await?);

    let udp = Arc::new(
        UdpSocket::bind(("0.0.0.0", opts.port))
            .await
            .with_context(|| format!("failed to bind UDP port {}", opts.port))?,
    );
    let tcp = TcpListener::bind(("0.0.0.0", opts.port))
        .await
        .with_context(|| format!("failed to bind TCP port {}", opts.port))?;

    info!("sinkhole ready on port {}", opts.port);

    tokio::spawn(listen::serve_udp(udp, Arc::clone(&adapter), token.clone()));
    tokio::spawn(listen::serve_tcp(tcp, Arc::clone(&adapter), token.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    token.cancel();

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => (),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
