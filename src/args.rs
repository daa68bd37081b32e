use clap::{Parser, Subcommand, ValueEnum};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "asnfold",
    about = "Collapse wide-area DNS scan captures into per-domain ASN resolution maps",
    version,
    long_about = None
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Aggregate a run directory of scan captures into per-domain histograms
    Aggregate {
        /// Directory of scan captures (*.csv, with optional domain indexes)
        rundir: PathBuf,

        /// Prefix -> ASN lookup table (JSON object of CIDR to ASN code)
        asn_table: PathBuf,

        /// Compiled output file
        output: PathBuf,

        /// Calibration capture used to exclude interfering vantage points
        #[arg(long, requires = "canary_ip")]
        blacklist: Option<PathBuf>,

        /// Address the calibration canary domain is expected to resolve to
        #[arg(long, requires = "blacklist")]
        canary_ip: Option<Ipv4Addr>,

        /// Shape of the compiled output
        #[arg(long, value_enum, default_value = "map")]
        format: OutputFormat,
    },

    /// Grade each domain's ASNs against its majority IP set
    Collapse {
        /// Aggregate stream (one JSON object per line)
        aggregates: PathBuf,

        /// Output file (one graded domain per line)
        output: PathBuf,

        /// Number of worker threads
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Cross-reference aggregates against domain and IP clusters
    Cross {
        /// Aggregate stream (one JSON object per line)
        aggregates: PathBuf,

        /// Prefix -> ASN lookup table (JSON object of CIDR to ASN code)
        asn_table: PathBuf,

        /// Domain clusters (JSON array; index = cluster id)
        domain_clusters: PathBuf,

        /// IP clusters (JSON object; cluster id -> member prefixes)
        ip_clusters: PathBuf,

        /// Output file (one cross-referenced domain per line)
        output: PathBuf,
    },

    /// Keep only hosts whose /24 appeared in a previous host list
    Filter {
        /// Current host list
        hosts: PathBuf,

        /// Host list from an earlier run
        old_hosts: PathBuf,

        /// Output file for the intersection
        output: PathBuf,
    },
}

/// Shape of the compiled aggregation output.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON map: {"length": N, "<domain>": <aggregate>, ...}
    Map,
    /// One JSON object per line, ready for the collapse tools
    Lines,
}
