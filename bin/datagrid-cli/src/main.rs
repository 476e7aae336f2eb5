//! DataGrid CLI
//!
//! Runs replica operations against a local server configuration: the
//! resources and catalog named in the TOML file are opened in-process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use datagrid_catalog::RedbCatalog;
use datagrid_common::{
    ChecksumFlag, ChecksumMode, ClientConnection, CopyCount, ReplicaInfo, ResourceStatus,
    ServerConfig,
};
use datagrid_core::{ChecksumRequest, DataObjRequest, Server, UnbundleRequest};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "datagrid")]
#[command(about = "DataGrid replica management")]
#[command(version)]
struct Args {
    /// Server configuration file
    #[arg(short, long, env = "DATAGRID_CONFIG", default_value = "datagrid.toml")]
    config: PathBuf,

    /// Acting user
    #[arg(short, long, env = "DATAGRID_USER", default_value = "rods")]
    user: String,

    /// Log level, overriding the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a local file as a data object
    Put {
        local: PathBuf,
        obj_path: String,
        /// Destination resource or resource group
        #[arg(short = 'R', long)]
        resource: Option<String>,
        /// Overwrite an existing object
        #[arg(short, long)]
        force: bool,
        /// Register a checksum
        #[arg(short = 'k', long)]
        checksum: bool,
        /// Verify against this checksum
        #[arg(long)]
        verify: Option<String>,
        /// Copies to make when a resource group is given ("all" or a count)
        #[arg(long)]
        copies: Option<String>,
    },
    /// Download a data object
    Get {
        obj_path: String,
        /// Output file; stdout when omitted
        local: Option<PathBuf>,
        /// Replica number to read
        #[arg(short, long)]
        repl_num: Option<i32>,
    },
    /// Copy a data object onto another resource
    Replicate {
        obj_path: String,
        #[arg(short = 'R', long)]
        resource: Option<String>,
        /// Source resource
        #[arg(short = 'S', long)]
        src_resource: Option<String>,
        /// Update every stale replica
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        force: bool,
        /// Transfer threads; 0 forces a single stream
        #[arg(short = 'N', long)]
        threads: Option<usize>,
    },
    /// Move a replica to another resource
    Phymv {
        obj_path: String,
        #[arg(short = 'R', long)]
        resource: String,
        #[arg(short = 'S', long)]
        src_resource: Option<String>,
        #[arg(short = 'n', long)]
        repl_num: Option<i32>,
    },
    /// Compute or verify checksums
    Checksum {
        obj_path: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Default)]
        mode: ModeArg,
        #[arg(short = 'n', long)]
        repl_num: Option<i32>,
        #[arg(short, long)]
        all: bool,
    },
    /// Remove replicas
    Unlink {
        obj_path: String,
        #[arg(short = 'n', long)]
        repl_num: Option<i32>,
        #[arg(short = 'R', long)]
        resource: Option<String>,
    },
    /// Pack a collection into one bundle object
    Bundle {
        collection: String,
        bundle_path: String,
        #[arg(short = 'R', long)]
        resource: Option<String>,
    },
    /// Extract a bundle object into a collection
    Unbundle {
        bundle_path: String,
        collection: String,
        #[arg(short = 'R', long)]
        resource: Option<String>,
        #[arg(short, long)]
        force: bool,
    },
    /// Resource administration
    Resource {
        #[command(subcommand)]
        action: ResourceCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ResourceCommands {
    /// List configured resources
    List,
    /// Show one resource
    Show { name: String },
    /// Mark a resource up or down
    Status { name: String, status: String },
    /// Repair cached state below a resource
    Rebalance { name: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Default,
    Verify,
    Force,
}

impl From<ModeArg> for ChecksumMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Default => Self::Default,
            ModeArg::Verify => Self::Verify,
            ModeArg::Force => Self::Force,
        }
    }
}

fn parse_copies(value: &str) -> Result<CopyCount> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(CopyCount::All);
    }
    let n: usize = value
        .parse()
        .with_context(|| format!("invalid copy count '{value}'"))?;
    Ok(if n <= 1 { CopyCount::One } else { CopyCount::N(n) })
}

fn print_replicas(rows: &[ReplicaInfo], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }
    for row in rows {
        println!(
            "{:>3}  {:<24} {:>12}  {:<8} {}  {}",
            row.repl_num,
            row.resc_hier,
            row.size,
            if row.status.is_good() { "good" } else { "stale" },
            if row.checksum.is_empty() { "-" } else { &row.checksum },
            row.phy_path
        );
    }
    Ok(())
}

fn open_server(config: ServerConfig) -> Result<Server> {
    let mut builder = Server::builder(config.clone());
    if let Some(path) = &config.server.catalog_path {
        let catalog = RedbCatalog::open(path)
            .with_context(|| format!("cannot open catalog {}", path.display()))?;
        builder = builder.catalog(Arc::new(catalog));
    }
    Ok(builder.build()?)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("cannot load {}", args.config.display()))?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }

    let comm = ClientConnection::new(
        config.server.host.clone(),
        args.user.clone(),
        config.server.zone.clone(),
    );
    let server = open_server(config)?;
    info!("Running {:?}", args.command);

    match args.command {
        Commands::Put {
            local,
            obj_path,
            resource,
            force,
            checksum,
            verify,
            copies,
        } => {
            let file = File::open(&local)
                .with_context(|| format!("cannot open {}", local.display()))?;
            let size = file.metadata()?.len();
            let mut req = DataObjRequest::new(obj_path).with_size(size);
            req.dest_resource = resource;
            req.force = force;
            if let Some(copies) = copies {
                req.copies = parse_copies(&copies)?;
            }
            if let Some(value) = verify {
                req = req
                    .with_checksum_flag(ChecksumFlag::Verify)
                    .with_checksum_value(value);
            } else if checksum {
                req = req.with_checksum_flag(ChecksumFlag::Register);
            }
            let row = server.put(&comm, req, &mut BufReader::new(file))?;
            print_replicas(&[row], args.json)?;
        }
        Commands::Get {
            obj_path,
            local,
            repl_num,
        } => {
            let mut req = DataObjRequest::new(obj_path);
            req.repl_num = repl_num;
            let bytes = match local {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    let mut out = BufWriter::new(file);
                    let bytes = server.get(&comm, req, &mut out)?;
                    out.flush()?;
                    bytes
                }
                None => {
                    let stdout = io::stdout();
                    let mut out = stdout.lock();
                    let bytes = server.get(&comm, req, &mut out)?;
                    out.flush()?;
                    bytes
                }
            };
            info!("Read {} bytes", bytes);
        }
        Commands::Replicate {
            obj_path,
            resource,
            src_resource,
            all,
            force,
            threads,
        } => {
            let mut req = DataObjRequest::new(obj_path);
            req.dest_resource = resource;
            req.src_resource = src_resource;
            req.all_replicas = all;
            req.force = force;
            req.threads = threads;
            let outcome = server.replicate(&comm, req)?;
            print_replicas(&outcome.replicas, args.json)?;
            info!("Transferred {} bytes", outcome.bytes_transferred);
        }
        Commands::Phymv {
            obj_path,
            resource,
            src_resource,
            repl_num,
        } => {
            let mut req = DataObjRequest::new(obj_path).with_resource(resource);
            req.src_resource = src_resource;
            req.repl_num = repl_num;
            let outcome = server.phymv(&comm, req)?;
            print_replicas(&outcome.replicas, args.json)?;
        }
        Commands::Checksum {
            obj_path,
            mode,
            repl_num,
            all,
        } => {
            let mut req = ChecksumRequest::new(obj_path).with_mode(mode.into());
            req.repl_num = repl_num;
            req.all_replicas = all;
            println!("{}", server.checksum(&comm, req)?);
        }
        Commands::Unlink {
            obj_path,
            repl_num,
            resource,
        } => {
            let mut req = DataObjRequest::new(obj_path);
            req.repl_num = repl_num;
            req.src_resource = resource;
            let removed = server.unlink(&comm, req)?;
            print_replicas(&removed, args.json)?;
        }
        Commands::Bundle {
            collection,
            bundle_path,
            resource,
        } => {
            let row =
                server.bundle_collection(&comm, &collection, &bundle_path, resource.as_deref())?;
            print_replicas(&[row], args.json)?;
        }
        Commands::Unbundle {
            bundle_path,
            collection,
            resource,
            force,
        } => {
            let rows = server.unbundle(
                &comm,
                UnbundleRequest {
                    bundle_path,
                    target_coll: collection,
                    dest_resource: resource,
                    force,
                },
            )?;
            print_replicas(&rows, args.json)?;
        }
        Commands::Resource { action } => match action {
            ResourceCommands::List => {
                let infos = server.list_resources();
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&infos)?);
                } else {
                    for info in infos {
                        println!(
                            "{:<16} {:<16} {:<6} {:<12} {}",
                            info.name,
                            info.type_name,
                            format!("{:?}", info.status).to_lowercase(),
                            info.host,
                            info.parent.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
            ResourceCommands::Show { name } => {
                let info = server.resource_info(&name)?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            ResourceCommands::Status { name, status } => {
                let status: ResourceStatus = status.parse()?;
                server.set_resource_status(&name, status)?;
                println!("{name}: {status:?}");
            }
            ResourceCommands::Rebalance { name } => {
                server.rebalance(&comm, &name)?;
                println!("{name}: rebalanced");
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copies() {
        assert_eq!(parse_copies("all").unwrap(), CopyCount::All);
        assert_eq!(parse_copies("1").unwrap(), CopyCount::One);
        assert_eq!(parse_copies("3").unwrap(), CopyCount::N(3));
        assert!(parse_copies("many").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "datagrid", "replicate", "/tempZone/home/u/f", "-R", "disk2", "-N", "0",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Commands::Replicate { threads: Some(0), ref resource, .. } if resource.as_deref() == Some("disk2")
        ));
    }
}
