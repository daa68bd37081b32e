use clap::Parser;
use tracing::error;

use asnfold::args::{Args, Command};
use asnfold::{aggregate, collapse, cross, filter, utils};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    utils::setup_logging(args.verbose);
    utils::validate_args(&args)?;

    let result = match &args.command {
        Command::Aggregate {
            rundir,
            asn_table,
            output,
            blacklist,
            canary_ip,
            format,
        } => aggregate::run_aggregate(
            rundir,
            asn_table,
            output,
            *format,
            blacklist.as_deref(),
            *canary_ip,
        ),
        Command::Collapse {
            aggregates,
            output,
            workers,
        } => collapse::run_collapse(aggregates, output, *workers),
        Command::Cross {
            aggregates,
            asn_table,
            domain_clusters,
            ip_clusters,
            output,
        } => cross::run_cross(aggregates, asn_table, domain_clusters, ip_clusters, output),
        Command::Filter {
            hosts,
            old_hosts,
            output,
        } => filter::run_filter(hosts, old_hosts, output),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
