//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use fetchkit_core::{DEFAULT_MAX_RETRIES, DEFAULT_SIMULTANEOUS_DOWNLOADS};

/// Fetch a batch of URLs with mirror-aware retries and local caching.
///
/// Already-cached files are skipped; completed files are promoted into the
/// destination directory under their resource id.
#[derive(Parser, Debug)]
#[command(name = "fetchkit")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch (reads stdin when omitted and piped)
    pub urls: Vec<String>,

    /// Destination cache directory
    #[arg(short, long, default_value = "./downloads")]
    pub dest: PathBuf,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_SIMULTANEOUS_DOWNLOADS as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Maximum retries of the final fallback mirror (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Mark fetched files permanent (never evicted by cleanup)
    #[arg(long)]
    pub permanent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["fetchkit"]).unwrap();
        assert!(args.urls.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.permanent);
        assert_eq!(args.concurrency, 20); // DEFAULT_SIMULTANEOUS_DOWNLOADS
        assert_eq!(args.max_retries, 3); // DEFAULT_MAX_RETRIES
        assert_eq!(args.dest, PathBuf::from("./downloads"));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["fetchkit", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_accepts_urls_and_dest() {
        let args = Args::try_parse_from([
            "fetchkit",
            "--dest",
            "/tmp/cache",
            "https://example.com/a.bin",
            "https://example.com/b.bin",
        ])
        .unwrap();
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.dest, PathBuf::from("/tmp/cache"));
    }

    #[test]
    fn test_cli_rejects_out_of_range_concurrency() {
        assert!(Args::try_parse_from(["fetchkit", "-c", "0"]).is_err());
        assert!(Args::try_parse_from(["fetchkit", "-c", "101"]).is_err());
    }
}
