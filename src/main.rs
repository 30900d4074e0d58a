//! CLI entry point for the fetchcore tool.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use fetchcore::{
    CookieIntegration, DirectorError, Request, RequestDirector, Response, TransportBackend,
    TransportConfig, TransportError, load_cookie_file,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

const READ_CHUNK: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = match &args.config {
        Some(path) => TransportConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TransportConfig::from_env(),
    };
    if args.source_address.is_some() {
        config.source_address = args.source_address;
    }
    if args.insecure {
        warn!("certificate validation disabled");
        config.verify_certificates = false;
    }

    let mut backend = TransportBackend::new(&config).context("building transport backend")?;
    if let Some(path) = &args.cookies {
        let jar = load_cookie_file(path).with_context(|| format!("loading cookies {}", path.display()))?;
        backend = backend.with_cookies(CookieIntegration::with_jar(jar));
    }

    let mut director = RequestDirector::new();
    director.register(Box::new(backend));

    let request = build_request(&args)?;
    info!(method = %request.method(), url = %request.url(), "Sending request");

    match director.send(request).await {
        Ok(mut response) => {
            write_response(&mut response, args.include).await?;
            Ok(())
        }
        Err(DirectorError::Transport(TransportError::HttpStatus { status, mut response })) => {
            if args.include {
                write_response(&mut response, true).await?;
            }
            Err(anyhow!("request failed (http-status): HTTP Error {status}"))
        }
        Err(DirectorError::Transport(error)) => {
            let kind = error.kind();
            Err(anyhow::Error::new(error).context(format!("request failed ({kind})")))
        }
        Err(error) => Err(error.into()),
    }
}

fn build_request(args: &Args) -> Result<Request> {
    let mut builder = Request::builder(&args.method, &args.url);
    let pairs = args
        .header_pairs()
        .map_err(|raw| anyhow!("invalid header {raw:?}: expected \"Name: value\""))?;
    for (name, value) in pairs {
        builder = builder.header(name, value);
    }
    if let Some(data) = &args.data {
        builder = builder.body(data.clone().into_bytes());
    }
    if let Some(proxy) = &args.proxy {
        builder = builder.proxy(proxy);
    }
    if let Some(secs) = args.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if args.no_compression {
        builder = builder.compression(false);
    }
    Ok(builder.build()?)
}

async fn write_response(response: &mut Response, include: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if include {
        writeln!(stdout, "{:?} {}", response.version(), response.status())?;
        for (name, value) in response.headers().iter() {
            writeln!(stdout, "{name}: {}", String::from_utf8_lossy(value.as_bytes()))?;
        }
        writeln!(stdout)?;
    }
    drop(stdout);

    loop {
        let chunk = response.read(READ_CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        std::io::stdout().write_all(&chunk)?;
    }
    std::io::stdout().flush()?;
    debug!(
        bytes_read = response.bytes_read(),
        bytes_delivered = response.bytes_delivered(),
        "Response complete"
    );
    Ok(())
}
