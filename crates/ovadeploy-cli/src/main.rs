//! OVADeploy CLI - Import OVA appliances into a vSphere host.

mod profile;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ovadeploy_core::vim::{HostApi, KeyValue};
use ovadeploy_core::{
    deploy_appliance, extract_appliance, inspect_descriptor, probe_disk, verify_manifest,
    ConnectionConfig, CopyFileParams, DeployOptions, DeployPhase, DeployPlan, DeployProgress,
    DeployTarget, DiskFormat, FileRole, ImportOptions, LeasePolicy, ProgressCallback,
    TransferClient, TransferRoute, VimSession, VmShape,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use profile::Profile;

/// Import OVA appliances into a vSphere host.
#[derive(Parser)]
#[command(name = "ovadeploy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what an OVF descriptor declares.
    Inspect {
        /// Path to the .ovf file.
        descriptor: PathBuf,
    },

    /// Unpack an OVA next to itself.
    Extract {
        /// Path to the .ova file.
        ova_file: PathBuf,

        /// Check manifest digests after extraction.
        #[arg(long)]
        verify: bool,
    },

    /// Import an OVA into the host.
    Deploy {
        /// Path to the .ova file.
        ova_file: PathBuf,

        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        vm: VmArgs,

        /// Datastore name.
        #[arg(long)]
        datastore: Option<String>,

        /// Resource pool name. Defaults to the first pool found.
        #[arg(long)]
        resource_pool: Option<String>,

        /// Host system name. Defaults to the first host found.
        #[arg(long)]
        host_system: Option<String>,

        /// Check manifest digests before importing.
        #[arg(long)]
        verify: bool,

        /// Give up waiting for the lease after this many seconds.
        #[arg(long, default_value = "1800")]
        lease_timeout: u64,

        /// Succeed even when some disks could not be placed.
        #[arg(long)]
        allow_partial: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Copy a local file into a datastore folder.
    Copy {
        /// Local file to upload.
        file: PathBuf,

        #[command(flatten)]
        connection: ConnectionArgs,

        /// Datastore name.
        #[arg(long)]
        datastore: Option<String>,

        /// Folder on the datastore.
        #[arg(long, default_value = "/")]
        remote_dir: String,

        /// Target filename. Defaults to the local filename.
        #[arg(long)]
        remote_name: Option<String>,
    },
}

#[derive(Args)]
struct ConnectionArgs {
    /// Host name or address.
    #[arg(long, env = "OVADEPLOY_HOST")]
    host: Option<String>,

    #[arg(short, long, env = "OVADEPLOY_USER")]
    user: Option<String>,

    #[arg(long, env = "OVADEPLOY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// TOML profile with connection and placement defaults.
    #[arg(long, env = "OVADEPLOY_CONFIG")]
    config: Option<PathBuf>,

    /// Require a valid TLS certificate.
    #[arg(long)]
    verify_tls: bool,
}

#[derive(Args)]
struct VmArgs {
    /// Name of the new VM.
    #[arg(short, long)]
    name: String,

    /// Memory in MB, overriding the descriptor.
    #[arg(long)]
    memory: Option<u32>,

    /// vCPU count, overriding the descriptor.
    #[arg(long)]
    cpus: Option<u32>,

    /// Port group to map; repeat for several.
    #[arg(long = "network")]
    networks: Vec<String>,

    /// Disk provisioning (thin, thick, eagerZeroedThick, ...).
    #[arg(long)]
    disk_provisioning: Option<String>,

    /// Deployment configuration id.
    #[arg(long, default_value = "")]
    deployment_option: String,

    /// OVF property as key=value; repeat for several.
    #[arg(long = "property", value_parser = parse_key_val)]
    properties: Vec<(String, String)>,
}

/// Connection settings after merging the profile with flags.
struct Resolved {
    profile: Profile,
    host: String,
    user: String,
    password: String,
    config: ConnectionConfig,
}

impl ConnectionArgs {
    fn resolve(self) -> Result<Resolved> {
        let profile = match &self.config {
            Some(path) => Profile::load(path)?,
            None => Profile::default(),
        };

        let host = self
            .host
            .or_else(|| profile.host.clone())
            .ok_or_else(|| anyhow!("no host given (use --host, OVADEPLOY_HOST or a profile)"))?;
        let user = self
            .user
            .or_else(|| profile.user.clone())
            .ok_or_else(|| anyhow!("no user given (use --user, OVADEPLOY_USER or a profile)"))?;
        let password = self
            .password
            .or_else(|| profile.password.clone())
            .ok_or_else(|| anyhow!("no password given (use OVADEPLOY_PASSWORD or a profile)"))?;

        let mut config = ConnectionConfig::new(host.clone());
        config.accept_invalid_certs = !(self.verify_tls || profile.verify_tls);
        if let Some(version) = &profile.api_version {
            config.api_version = version.clone();
        }
        if let Some(secs) = profile.upload_timeout_secs {
            config.upload_timeout = Duration::from_secs(secs);
        }
        config.validate()?;

        Ok(Resolved {
            profile,
            host,
            user,
            password,
            config,
        })
    }
}

impl Resolved {
    fn login(&self) -> Result<VimSession> {
        let mut session = VimSession::connect(self.config.clone())
            .with_context(|| format!("failed to connect to {}", self.host))?;
        session
            .login(&self.user, &self.password)
            .with_context(|| format!("failed to log in to {} as {}", self.host, self.user))?;
        Ok(session)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Inspect { descriptor } => {
            show_descriptor(&descriptor)?;
        }
        Commands::Extract { ova_file, verify } => {
            run_extract(&ova_file, verify)?;
        }
        Commands::Deploy {
            ova_file,
            connection,
            vm,
            datastore,
            resource_pool,
            host_system,
            verify,
            lease_timeout,
            allow_partial,
            quiet,
        } => {
            let placement = Placement {
                datastore,
                resource_pool,
                host_system,
            };
            let options = DeployOptions {
                import: ImportOptions::default(),
                lease: LeasePolicy::default().with_timeout(Duration::from_secs(lease_timeout)),
                verify_manifest: verify,
            };
            run_deploy(&ova_file, connection.resolve()?, vm, placement, options, allow_partial, quiet)?;
        }
        Commands::Copy {
            file,
            connection,
            datastore,
            remote_dir,
            remote_name,
        } => {
            run_copy(&file, connection.resolve()?, datastore, remote_dir, remote_name)?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log filter '{level}'"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn show_descriptor(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let summary = inspect_descriptor(&text)?;

    println!("Appliance Information");
    println!("=====================");
    println!();
    println!("System:    {}", summary.system_id.as_deref().unwrap_or("-"));
    println!("Product:   {}", summary.product.as_deref().unwrap_or("-"));
    println!();

    if summary.networks.is_empty() {
        println!("Networks:  None");
    } else {
        println!("Networks:");
        for network in &summary.networks {
            println!("  - {network}");
        }
    }

    if !summary.deployment_options.is_empty() {
        println!("Deployment options: {}", summary.deployment_options.join(", "));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    println!();
    println!("Files:");
    for (i, file) in summary.files.iter().enumerate() {
        let size = file.size.map(format_bytes).unwrap_or_else(|| "unknown size".to_string());
        let layout = match FileRole::classify(&file.href) {
            FileRole::Disk => match probe_disk(&dir.join(&file.href)) {
                Ok(format) => describe_format(format),
                Err(_) => "not present".to_string(),
            },
            _ => String::new(),
        };
        println!("  {}. {} - {} {}", i + 1, file.href, size, layout);
    }
    if summary.declared_size() > 0 {
        println!();
        println!("Total declared size: {}", format_bytes(summary.declared_size()));
    }

    if !summary.properties.is_empty() {
        println!();
        println!("Properties:");
        for property in &summary.properties {
            match &property.default_value {
                Some(value) => println!("  {} = {}", property.key, value),
                None => println!("  {}", property.key),
            }
        }
    }

    Ok(())
}

fn describe_format(format: DiskFormat) -> String {
    match format {
        DiskFormat::StreamOptimized { capacity_bytes } => {
            format!("(streamOptimized, {} capacity)", format_bytes(capacity_bytes))
        }
        DiskFormat::Sparse { capacity_bytes } => {
            format!("(sparse, {} capacity, not stream-optimized)", format_bytes(capacity_bytes))
        }
        DiskFormat::Raw => "(no sparse header)".to_string(),
    }
}

fn split_archive_path(ova_file: &Path) -> Result<(PathBuf, String)> {
    let file_name = ova_file
        .file_name()
        .ok_or_else(|| anyhow!("'{}' is not a file path", ova_file.display()))?
        .to_string_lossy()
        .into_owned();
    let dir = match ova_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, file_name))
}

fn run_extract(ova_file: &Path, verify: bool) -> Result<()> {
    let (dir, file_name) = split_archive_path(ova_file)?;
    let info = extract_appliance(&dir, &file_name)
        .with_context(|| format!("failed to extract {}", ova_file.display()))?;

    println!("Descriptor: {}", info.ovf.file_name);
    println!("Directory:  {}", info.dir.display());
    println!("Images:");
    for disk in &info.disks {
        let size = std::fs::metadata(info.path_of(disk)).map(|m| m.len()).unwrap_or(0);
        println!("  - {} ({})", disk, format_bytes(size));
    }

    if verify {
        match &info.manifest {
            Some(manifest) => {
                let report = verify_manifest(&info.dir, manifest)?;
                println!(
                    "Manifest:   {} verified, {} not checked",
                    report.verified.len(),
                    report.unverified.len()
                );
            }
            None => println!("Manifest:   none"),
        }
    }

    Ok(())
}

struct Placement {
    datastore: Option<String>,
    resource_pool: Option<String>,
    host_system: Option<String>,
}

fn run_deploy(
    ova_file: &Path,
    resolved: Resolved,
    vm: VmArgs,
    placement: Placement,
    options: DeployOptions,
    allow_partial: bool,
    quiet: bool,
) -> Result<()> {
    let (directory, archive) = split_archive_path(ova_file)?;
    let mut session = resolved.login()?;
    let defaults = &resolved.profile.deploy;

    let datastore_name = placement
        .datastore
        .or_else(|| defaults.datastore.clone())
        .ok_or_else(|| anyhow!("no datastore given (use --datastore or a profile)"))?;
    let datastore = session.find("Datastore", &datastore_name)?;
    let resource_pool = pick(&session, "ResourcePool", placement.resource_pool.or_else(|| defaults.resource_pool.clone()))?;
    let host_system = pick(&session, "HostSystem", placement.host_system.or_else(|| defaults.host_system.clone()))?;
    let datacenter = session
        .datacenters()?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("host reports no datacenter"))?;
    let networks = session.networks()?;
    debug!(networks = networks.len(), "inventory resolved");

    let mut port_groups = vm.networks;
    if port_groups.is_empty() {
        port_groups = defaults.networks.clone();
    }
    let mut property_mappings: Vec<KeyValue> = defaults
        .properties
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    for (key, value) in vm.properties {
        property_mappings.retain(|p| p.key != key);
        property_mappings.push(KeyValue::new(key, value));
    }

    let plan = DeployPlan {
        directory,
        archive,
        target: DeployTarget {
            vm_folder: datacenter.vm_folder,
            host: host_system.reference,
            datastore: datastore.reference,
            resource_pool: resource_pool.reference,
            networks,
        },
        vm: VmShape {
            name: vm.name,
            memory_mb: vm.memory,
            num_cpus: vm.cpus,
            port_groups,
            disk_provisioning: vm
                .disk_provisioning
                .or_else(|| defaults.disk_provisioning.clone())
                .unwrap_or_default(),
            deployment_option: vm.deployment_option,
        },
        property_mappings,
        options,
        cancel: None,
    };

    if !quiet {
        println!("Appliance Import");
        println!("----------------");
        println!("Archive:    {}", ova_file.display());
        println!("VM name:    {}", plan.vm.name);
        println!("Host:       {} ({})", resolved.host, host_system.name);
        println!("Datastore:  {}", datastore.name);
        println!("Networks:   {}", plan.vm.port_groups.join(", "));
        println!();
    }

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {msg:20} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let callback: Option<ProgressCallback> = progress_bar.clone().map(|pb| {
        Arc::new(move |progress: DeployProgress| {
            pb.set_length(progress.bytes_total);
            pb.set_position(progress.bytes_sent);
            let phase_msg = match progress.phase {
                DeployPhase::Uploading if progress.total_disks > 1 => "Uploading disks".to_string(),
                DeployPhase::Complete => "Complete!".to_string(),
                phase => format!("{phase}..."),
            };
            pb.set_message(phase_msg);
        }) as ProgressCallback
    });

    let transfer = TransferClient::from_session(&session);
    let result = deploy_appliance(&session, &transfer, &plan, callback);

    if let Some(pb) = &progress_bar {
        match &result {
            Ok(_) => pb.finish_with_message("Complete!"),
            Err(_) => pb.abandon_with_message("Failed"),
        }
    }
    if let Err(e) = session.logout() {
        debug!(error = %e, "logout failed");
    }
    let outcome = result.with_context(|| format!("failed to deploy {}", ova_file.display()))?;

    if !quiet {
        println!();
        for disk in &outcome.report.outcomes {
            match &disk.route {
                TransferRoute::Primary => println!("  {}: uploaded", disk.disk),
                TransferRoute::Fallback { remote_name } => {
                    println!("  {}: copied to datastore as {}", disk.disk, remote_name)
                }
                TransferRoute::FallbackFailed { remote_name, reason } => {
                    println!("  {}: NOT placed as {} ({})", disk.disk, remote_name, reason)
                }
            }
        }
    }

    if !allow_partial {
        outcome.report.ensure_complete()?;
    }

    info!(vm = %plan.vm.name, lease = %outcome.lease, "deploy finished");
    if !quiet {
        println!();
        println!("Import completed: {}", plan.vm.name);
    }
    Ok(())
}

/// Find `name` among objects of `kind`, or take the first one when no name is given.
fn pick(
    session: &VimSession,
    kind: &str,
    name: Option<String>,
) -> Result<ovadeploy_core::vim::InventoryObject> {
    match name {
        Some(name) => Ok(session.find(kind, &name)?),
        None => session
            .list(kind)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("host reports no {kind}")),
    }
}

fn run_copy(
    file: &Path,
    resolved: Resolved,
    datastore: Option<String>,
    remote_dir: String,
    remote_name: Option<String>,
) -> Result<()> {
    let datastore_name = datastore
        .or_else(|| resolved.profile.deploy.datastore.clone())
        .ok_or_else(|| anyhow!("no datastore given (use --datastore or a profile)"))?;
    let (local_dir, file_name) = split_archive_path(file)?;

    let mut session = resolved.login()?;
    let datacenter = session.datacenter()?;
    let datastore = session.find("Datastore", &datastore_name)?;
    let transfer = TransferClient::from_session(&session);

    let params = CopyFileParams {
        dc_name: datacenter.name,
        ds_name: datastore.name,
        local_dir,
        file_name,
        remote_dir,
        remote_file_name: remote_name,
    };
    let result = transfer.copy_to_datastore(&params, None);
    if let Err(e) = session.logout() {
        debug!(error = %e, "logout failed");
    }
    result.with_context(|| format!("failed to copy {}", file.display()))?;

    println!(
        "Copied {} to [{}] {}/{}",
        params.file_name,
        params.ds_name,
        params.remote_dir.trim_end_matches('/'),
        params.remote_name()
    );
    Ok(())
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        bail!("property key must not be empty in '{s}'");
    }
    Ok((key.to_string(), value.to_string()))
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
