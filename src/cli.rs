//! CLI argument definitions using clap derive macros.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Fetch one URL through the pooled transport and print the body.
///
/// Exit status is 0 on a 2xx response and 1 on any transport error, in which
/// case the error kind is printed to stderr.
#[derive(Parser, Debug)]
#[command(name = "fetchcore")]
#[command(author, version, about)]
pub struct Args {
    /// Target URL (http or https)
    pub url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Request body
    #[arg(short = 'd', long)]
    pub data: Option<String>,

    /// Proxy URL (http, https, socks4, socks4a, socks5, socks5h); "" disables proxies
    #[arg(long)]
    pub proxy: Option<String>,

    /// Local address outgoing connections are bound to
    #[arg(long)]
    pub source_address: Option<IpAddr>,

    /// Timeout in seconds for connecting and for each read (1-3600)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// Do not send Accept-Encoding (encoded replies are still decoded)
    #[arg(long)]
    pub no_compression: bool,

    /// Skip TLS certificate validation
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// JSON transport configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Netscape cookies.txt file to load
    #[arg(long, value_name = "FILE")]
    pub cookies: Option<PathBuf>,

    /// Print the status line and response headers before the body
    #[arg(short = 'i', long)]
    pub include: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Splits each `-H` value into name and value.
    ///
    /// # Errors
    ///
    /// Returns the offending argument when it has no `:` separator.
    pub fn header_pairs(&self) -> Result<Vec<(&str, &str)>, String> {
        self.headers
            .iter()
            .map(|raw| {
                raw.split_once(':')
                    .map(|(name, value)| (name.trim(), value.trim()))
                    .filter(|(name, _)| !name.is_empty())
                    .ok_or_else(|| raw.clone())
            })
            .collect()
    }
}
