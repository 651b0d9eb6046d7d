//! # Appliance lifecycle CLI
//!
//! Thin command surface over the transaction orchestrator. Image
//! preparation (OCI extraction, download) happens in external tooling;
//! the commands here take prepared sources (`dir:<path>` or
//! `file:<path>`) and drive the snapshot lifecycle with them.

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::bootloader;
use crate::config::{self, BackendConfig, SnapshotterConfig};
use crate::mode::{Mode, DEFAULT_RUN_DIR};
use crate::mount::{HostMounter, Mounter};
use crate::runner::{CommandRunner, HostRunner};
use crate::snapshot::{ImageSource, Partition, SnapshotId, SNAPSHOTS_DIR};
use crate::snapshotter::{new_snapshotter, SnapshotterContext};
use crate::transaction::{populate_from_source, Action, Orchestrator};
use crate::vfs::{Filesystem, HostFs, ReadOnlyFs};

const DEFAULT_STATE_MOUNT: &str = "/run/initramfs/elemental-state";
const DEFAULT_EFI_DIR: &str = "/run/elemental/efi";

/// Options shared by every command touching the state partition.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct StateOpts {
    /// Block device of the state partition.
    #[clap(long)]
    pub(crate) state_device: Option<Utf8PathBuf>,

    /// Where the state partition is (or should be) mounted.
    #[clap(long, default_value = DEFAULT_STATE_MOUNT)]
    pub(crate) state_mount: Utf8PathBuf,

    /// Directory carrying the boot menu environment file.
    #[clap(long, default_value = DEFAULT_EFI_DIR)]
    pub(crate) efi_dir: Utf8PathBuf,

    /// Configuration file to read the snapshotter section from.
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Override the configured snapshotter type (loop-device or btrfs).
    #[clap(long)]
    pub(crate) snapshotter: Option<String>,

    /// Override the maximum number of kept snapshots.
    #[clap(long)]
    pub(crate) max_snaps: Option<u32>,
}

impl StateOpts {
    fn snapshotter_config(&self, fs: &dyn Filesystem) -> Result<SnapshotterConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config(fs, path)?.snapshotter,
            None => SnapshotterConfig::default(),
        };
        if let Some(kind) = &self.snapshotter {
            cfg.backend = config::backend_for_type(kind)?;
        }
        if let Some(max) = self.max_snaps {
            cfg.max_snaps = max;
        }
        Ok(cfg)
    }

    fn partition(&self, cfg: &SnapshotterConfig) -> Result<Partition> {
        let device = self
            .state_device
            .clone()
            .ok_or_else(|| anyhow!("--state-device is required for this command"))?;
        let filesystem = match &cfg.backend {
            BackendConfig::Btrfs(_) => "btrfs",
            BackendConfig::LoopDevice(_) => "ext4",
        };
        Ok(Partition {
            name: "COS_STATE".to_string(),
            device,
            mount_point: self.state_mount.clone(),
            filesystem: filesystem.to_string(),
            flags: Vec::new(),
        })
    }
}

/// Perform an install operation onto a pristine state partition.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    #[clap(flatten)]
    pub(crate) state: StateOpts,

    /// Image source for the new system (`dir:<path>` or `file:<path>`).
    #[clap(long)]
    pub(crate) source: String,
}

/// Perform an upgrade operation on an installed system.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpgradeOpts {
    #[clap(flatten)]
    pub(crate) state: StateOpts,

    /// Image source for the new snapshot (`dir:<path>` or `file:<path>`).
    #[clap(long)]
    pub(crate) source: String,
}

/// Reset the system to a pristine image, from recovery or installer media.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ResetOpts {
    #[clap(flatten)]
    pub(crate) state: StateOpts,

    /// Image source to reset to (`dir:<path>` or `file:<path>`).
    #[clap(long)]
    pub(crate) source: String,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum SnapshotsCmd {
    /// List the snapshot ids on the state partition.
    List,
    /// Delete one snapshot. The snapshot the system booted from is
    /// protected.
    Delete {
        /// Id of the snapshot to delete.
        id: SnapshotId,
    },
}

#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "elemental", about = "Immutable OS lifecycle tool", version)]
pub(crate) enum Opt {
    /// Install the system onto a state partition
    Install(InstallOpts),
    /// Create and switch to a new snapshot from an image source
    Upgrade(UpgradeOpts),
    /// Reset to a pristine image
    Reset(ResetOpts),
    /// Inspect or prune the snapshot inventory
    Snapshots {
        #[clap(flatten)]
        state: StateOpts,
        #[clap(subcommand)]
        cmd: SnapshotsCmd,
    },
    /// Show booted mode and boot menu state
    Status(StateOpts),
}

fn host_context() -> SnapshotterContext {
    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
    let mounter: Arc<dyn Mounter> = Arc::new(HostMounter::new(runner.clone()));
    let run_dir = Utf8PathBuf::from(DEFAULT_RUN_DIR);
    let mode = Mode::detect(&HostFs, &run_dir);
    SnapshotterContext {
        runner,
        mounter,
        fs: Arc::new(HostFs),
        mode,
        run_dir,
    }
}

fn run_action(action: Action, state: &StateOpts, source: &str) -> Result<()> {
    let ctx = host_context();
    let cfg = state.snapshotter_config(ctx.fs.as_ref())?;
    tracing::debug!("Using {} snapshotter in {} mode", cfg.backend.type_name(), ctx.mode);
    let source = ImageSource::parse(source)?;
    if !ctx.fs.exists(source.path()) {
        return Err(anyhow!("image source does not exist: {}", source.path()));
    }
    let partition = state.partition(&cfg)?;
    let orchestrator = Orchestrator::new(ctx.clone(), cfg, partition, state.efi_dir.clone());
    orchestrator.run(action, |snapshot| {
        populate_from_source(&ctx, &source, snapshot)
    })?;
    Ok(())
}

fn run_snapshots(state: &StateOpts, cmd: &SnapshotsCmd) -> Result<()> {
    let ctx = host_context();
    let cfg = state.snapshotter_config(ctx.fs.as_ref())?;
    let partition = state.partition(&cfg)?;
    let mut snapshotter = new_snapshotter(&ctx, &cfg, &partition, &state.efi_dir)?;
    snapshotter.init()?;
    match cmd {
        SnapshotsCmd::List => {
            for id in snapshotter.get_snapshots()? {
                println!("{id}");
            }
        }
        SnapshotsCmd::Delete { id } => {
            snapshotter.delete_snapshot(*id)?;
            println!("Deleted snapshot {id}");
        }
    }
    Ok(())
}

/// Read-only status report; safe to run from any mode, including a
/// recovery system whose state partition must not be touched.
fn run_status(state: &StateOpts) -> Result<()> {
    let fs = ReadOnlyFs(HostFs);
    let mode = Mode::detect(&fs, DEFAULT_RUN_DIR.into());
    println!("Booted mode: {mode}");
    let env =
        bootloader::read_persistent_variables(&fs, &state.efi_dir.join(bootloader::GRUB_ENV_FILE))?;
    if let Some(snapshotter) = env.get("snapshotter") {
        println!("Snapshotter: {snapshotter}");
    }
    if let Some(passives) = env.get(bootloader::PASSIVE_SNAPS_KEY) {
        println!("Passive snapshots: {passives}");
    }
    let snaps_dir = state.state_mount.join(SNAPSHOTS_DIR);
    if fs.is_dir(&snaps_dir) {
        let mut ids: Vec<SnapshotId> = fs
            .read_dir_names(&snaps_dir)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        let ids = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        println!("Snapshots: {ids}");
    }
    Ok(())
}

/// Parse the command line from `args` and run the selected operation.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    match opt {
        Opt::Install(opts) => run_action(Action::Install, &opts.state, &opts.source),
        Opt::Upgrade(opts) => run_action(Action::Upgrade, &opts.state, &opts.source),
        Opt::Reset(opts) => run_action(Action::Reset, &opts.state, &opts.source),
        Opt::Snapshots { state, cmd } => run_snapshots(&state, &cmd),
        Opt::Status(state) => run_status(&state),
    }
}
