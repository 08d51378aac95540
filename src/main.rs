use std::path::PathBuf;

use clap::{Parser, Subcommand};
use creo_runtime::Core;
use creo_runtime::container::Container;
use creo_runtime::repair::QuotaRepairRequest;

/// Set or get the quota information of a path, or repair a container's quota.
///
/// Reads its configuration from `CREO_*` environment variables and logs through
/// `RUST_LOG`.
///
/// # Examples
///
/// ```bash
/// RUST_LOG=info creo-runtime set /var/lib/volumes/v1 -s 10g -i 16777300 -r
/// ```
#[derive(Debug, Parser)]
#[command(name = "creo-runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the project quota id stamped on a path.
    Get { path: PathBuf },
    /// Stamp a project quota id on a path and optionally limit its size.
    Set {
        path: PathBuf,
        /// The limit of the directory, e.g. `10g`.
        #[arg(short, long)]
        size: Option<String>,
        /// The quota id to set, -1 reuses or allocates one.
        #[arg(short = 'i', long = "quota-id", default_value_t = 0, allow_hyphen_values = true)]
        quota_id: i64,
        /// Set the directory and everything below it.
        #[arg(short, long)]
        recursive: bool,
    },
    /// Repair the quota of a container from its JSON metadata file.
    Fix {
        meta: PathBuf,
        /// Fix every quota of the container with its recorded id, only -1 is accepted.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        container: i64,
        /// Fix the rootfs quota with the recorded id (-1) or the given id.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        rootfs: i64,
        /// Fix the quota of local volumes with the recorded id (-1) or the given id.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        volumes: i64,
    },
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let core = Core::from_env()?;
    let quota = core.quota();

    match cli.command {
        Command::Get { path } => {
            std::fs::metadata(&path)?;
            println!("{}", quota.get_quota_id_in_file_attr(&path));
        }
        Command::Set {
            path,
            size,
            quota_id,
            recursive,
        } => {
            std::fs::metadata(&path)?;
            let id = match quota_id {
                0 => return Err("quota id can not be 0".into()),
                -1 => 0,
                id => u32::try_from(id).map_err(|_| format!("invalid quota id {id}"))?,
            };

            let id = match size {
                Some(size) => quota.set_disk_quota(&path, &size, id)?,
                None if recursive => id,
                None => {
                    quota.set_quota_id_in_file_attr(&path, id)?;
                    id
                }
            };
            if recursive {
                quota.set_file_attr_recursive(&path, id)?;
            }
            log::info!("set quota id {} on `{}`", id, path.display());
        }
        Command::Fix {
            meta,
            container,
            rootfs,
            volumes,
        } => {
            let file = creo_runtime::fsutil::open_file_reader(&meta)?;
            let record: Container = serde_json::from_reader(file)?;
            let request = QuotaRepairRequest {
                container,
                rootfs,
                volumes,
            };
            let report = core.fix_quota(&record, request)?;
            for (dir, id) in &report.handled {
                println!("{}\t{}", id, dir.display());
            }
            report.wait();
        }
    }

    Ok(())
}
