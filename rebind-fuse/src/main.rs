//! rebind - mount a directory elsewhere with altered ownership and permissions.
//!
//! A bindfs-style passthrough FUSE daemon. All transformation logic lives in
//! `rebind_core`; this binary parses options, wires the SIGUSR1 cache
//! invalidation and runs the FUSE session.

mod fs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fuser::MountOption;
use log::info;
use nix::sys::stat::{umask, Mode};
use rebind_core::settings::ChangePolicy;
use rebind_core::{
    AttrTransformer, CacheStrategy, IdentityCache, IdentityDb, MountConfig, PermChain, Settings,
    SystemDb,
};

#[derive(Parser)]
#[command(name = "rebind-fuse")]
#[command(about = "Mirror a directory with altered ownership and permissions")]
#[command(version)]
struct Cli {
    /// Log every filesystem operation
    #[arg(long, global = true, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount SOURCE at MOUNT_POINT
    Mount(MountArgs),
    /// Print the mode a permission chain produces
    CheckPerms {
        /// Permission chain, e.g. "og-x,og+rD,u=rwX"
        spec: String,
        /// Octal input mode, e.g. 644
        mode: String,
        /// Treat the input as a directory
        #[arg(long, default_value = "false")]
        dir: bool,
    },
    /// Check version
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheStrategyArg {
    Bulk,
    ReadThrough,
}

impl From<CacheStrategyArg> for CacheStrategy {
    fn from(arg: CacheStrategyArg) -> Self {
        match arg {
            CacheStrategyArg::Bulk => CacheStrategy::Bulk,
            CacheStrategyArg::ReadThrough => CacheStrategy::ReadThrough,
        }
    }
}

#[derive(Args)]
struct MountArgs {
    /// Directory to mirror
    #[arg(value_name = "SOURCE")]
    source: PathBuf,

    /// Mount point path
    #[arg(value_name = "MOUNT_POINT")]
    mount_point: PathBuf,

    /// Permission chain applied to every reported mode
    #[arg(long, short = 'p', env = "REBIND_PERMS")]
    perms: Option<String>,

    /// Permission chain applied to the mode of new files
    #[arg(long)]
    create_with_perms: Option<String>,

    /// Permission chain applied to chmod requests
    #[arg(long)]
    chmod_filter: Option<String>,

    /// Let execute bits through when chmod is ignored or denied
    #[arg(long, default_value = "false")]
    chmod_allow_x: bool,

    /// Report every file as owned by this user
    #[arg(long, short = 'u')]
    force_user: Option<String>,

    /// Report every file as owned by this group
    #[arg(long, short = 'g')]
    force_group: Option<String>,

    /// Users and @groups who see themselves as owner of every file
    #[arg(long, short = 'm', env = "REBIND_MIRROR")]
    mirror: Option<String>,

    /// Like --mirror, and everyone else is denied access
    #[arg(long, short = 'M')]
    mirror_only: Option<String>,

    /// user1/user2:@group1/@group2 substitutions
    #[arg(long, env = "REBIND_MAP")]
    map: Option<String>,

    /// passwd file whose names map file uids to local uids
    #[arg(long)]
    map_passwd: Option<PathBuf>,

    /// passwd file mapping local uids back to file uids
    #[arg(long)]
    map_passwd_rev: Option<PathBuf>,

    /// group file whose names map file gids to local gids
    #[arg(long)]
    map_group: Option<PathBuf>,

    /// group file mapping local gids back to file gids
    #[arg(long)]
    map_group_rev: Option<PathBuf>,

    /// Added to every reported uid, subtracted on the way back
    #[arg(long, allow_hyphen_values = true)]
    uid_offset: Option<String>,

    /// Added to every reported gid, subtracted on the way back
    #[arg(long, allow_hyphen_values = true)]
    gid_offset: Option<String>,

    /// New files belong to the requesting user (root only)
    #[arg(long, default_value = "false", conflicts_with = "create_as_mounter")]
    create_as_user: bool,

    /// New files belong to the mounting user
    #[arg(long, default_value = "false")]
    create_as_mounter: bool,

    /// New files belong to this user (root only)
    #[arg(long)]
    create_for_user: Option<String>,

    /// New files belong to this group (root only)
    #[arg(long)]
    create_for_group: Option<String>,

    /// normal, ignore or deny
    #[arg(long, default_value = "normal")]
    chown_policy: ChangePolicy,

    /// normal, ignore or deny
    #[arg(long, default_value = "normal")]
    chgrp_policy: ChangePolicy,

    /// normal, ignore or deny
    #[arg(long, default_value = "normal")]
    chmod_policy: ChangePolicy,

    /// Hide permission bits the requester lacks on the source
    #[arg(long, default_value = "false")]
    realistic_permissions: bool,

    /// Report mtime as ctime
    #[arg(long, default_value = "false")]
    ctime_from_mtime: bool,

    /// Report a link count of 1 for everything
    #[arg(long, default_value = "false")]
    hide_hard_links: bool,

    /// Refuse unlink and rmdir
    #[arg(long, default_value = "false")]
    delete_deny: bool,

    /// Refuse rename
    #[arg(long, default_value = "false")]
    rename_deny: bool,

    /// How the group membership cache is filled
    #[arg(long, value_enum, default_value = "bulk", env = "REBIND_CACHE_STRATEGY")]
    cache_strategy: CacheStrategyArg,

    /// Only the mounting user may access the mount
    #[arg(long, default_value = "false")]
    no_allow_other: bool,

    /// Mount read-only
    #[arg(long, short = 'r', default_value = "false")]
    read_only: bool,
}

impl MountArgs {
    fn config(&self) -> MountConfig {
        MountConfig {
            perms: self.perms.clone(),
            create_with_perms: self.create_with_perms.clone(),
            chmod_filter: self.chmod_filter.clone(),
            chmod_allow_x: self.chmod_allow_x,
            force_user: self.force_user.clone(),
            force_group: self.force_group.clone(),
            mirror: self.mirror.clone(),
            mirror_only: self.mirror_only.clone(),
            map: self.map.clone(),
            map_passwd: self.map_passwd.clone(),
            map_passwd_rev: self.map_passwd_rev.clone(),
            map_group: self.map_group.clone(),
            map_group_rev: self.map_group_rev.clone(),
            uid_offset: self.uid_offset.clone(),
            gid_offset: self.gid_offset.clone(),
            create_as_user: self.create_as_user,
            create_as_mounter: self.create_as_mounter,
            create_for_user: self.create_for_user.clone(),
            create_for_group: self.create_for_group.clone(),
            chown_policy: self.chown_policy,
            chgrp_policy: self.chgrp_policy,
            chmod_policy: self.chmod_policy,
            realistic_permissions: self.realistic_permissions,
            ctime_from_mtime: self.ctime_from_mtime,
            hide_hard_links: self.hide_hard_links,
            delete_deny: self.delete_deny,
            rename_deny: self.rename_deny,
        }
    }

    fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.source.display().to_string()),
            MountOption::Subtype("rebind".to_string()),
            MountOption::DefaultPermissions,
        ];
        if !self.no_allow_other {
            options.push(MountOption::AllowOther);
            options.push(MountOption::AutoUnmount);
        }
        if self.read_only {
            options.push(MountOption::RO);
        }
        options
    }
}

fn mount(args: MountArgs) -> anyhow::Result<()> {
    info!("rebind starting...");
    info!("Source: {}", args.source.display());
    info!("Mount point: {}", args.mount_point.display());

    let source = args
        .source
        .canonicalize()
        .with_context(|| format!("cannot resolve source {}", args.source.display()))?;
    if !source.is_dir() {
        bail!("source {} is not a directory", source.display());
    }

    let db: Arc<dyn IdentityDb> = Arc::new(SystemDb::new());
    let is_root = nix::unistd::getuid().is_root();
    let settings = Settings::resolve(&args.config(), db.as_ref(), is_root)?;

    let cache = Arc::new(IdentityCache::new(db, args.cache_strategy.into()));
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, cache.invalidation_flag())
        .context("failed to install SIGUSR1 handler")?;
    info!(
        "Group membership cache: {} (SIGUSR1 invalidates)",
        cache.strategy()
    );

    // Modes of new files are computed explicitly.
    umask(Mode::empty());

    let transformer = AttrTransformer::new(Arc::new(settings), cache);
    let filesystem = fs::RebindFs::new(source, transformer);
    if filesystem.attr_ttl().is_zero() {
        info!("Mirroring enabled, attribute caching disabled");
    }

    info!("Mounting filesystem...");
    fuser::mount2(filesystem, &args.mount_point, &args.mount_options())?;
    info!("Filesystem unmounted");
    Ok(())
}

fn parse_mode(mode: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(mode, 8).with_context(|| format!("'{}' is not an octal mode", mode))
}

fn check_perms(spec: &str, mode: &str, dir: bool) -> anyhow::Result<u32> {
    let chain = PermChain::parse(spec)?;
    let mut input = parse_mode(mode)?;
    if input & libc::S_IFMT as u32 == 0 {
        input |= if dir {
            libc::S_IFDIR as u32
        } else {
            libc::S_IFREG as u32
        };
    }
    Ok(chain.apply(input) & 0o7777)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Mount(args) => mount(args)?,
        Commands::CheckPerms { spec, mode, dir } => {
            println!("{:04o}", check_perms(&spec, &mode, dir)?);
        }
        Commands::Version => {
            println!("rebind-fuse {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
