// Licensed under the Apache-2.0 license

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use flash_layout::Layout;
use qspi::mounts::SystemMounts;
use qspi::mtd::{find_device, MtdFlash};
use qspi::ubi::UbiControl;
use qspi::{ipcfg, EnvStore, FlashDevice, MountOrchestrator};
use std::path::PathBuf;
use upgrade::{
    flash_select, Backend, GpioMuxSelector, HttpSource, SelectOptions, UnitSelector,
    UpgradeConfig, UpgradeController, UpgradeOptions, UpgradeOutcome,
};

#[derive(Parser)]
#[command(version, about = "BMC QSPI flash upgrade and selection", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade the firmware in the selected QSPI flash
    Upgrade {
        /// Version to fetch, e.g. LATEST or v0.41
        #[arg(short = 'v', long = "version")]
        pkg_version: Option<String>,

        /// Server host, URL or local directory
        #[arg(short, long)]
        server: Option<String>,

        /// Fetch with TFTP instead of HTTP
        #[arg(short, long, default_value_t = false)]
        tftp: bool,

        /// Report the version available on the server and exit
        #[arg(short = 'l', long, default_value_t = false)]
        list: bool,

        /// Report the installed version and exit
        #[arg(short, long, default_value_t = false)]
        report: bool,

        /// Report partition checksums and exit
        #[arg(short, long, default_value_t = false)]
        checksums: bool,

        /// Install even if the package is not newer
        #[arg(short, long, default_value_t = false)]
        force: bool,

        /// Program the raw legacy partitions, required to downgrade to
        /// packages without volume support
        #[arg(long, default_value_t = false)]
        legacy: bool,
    },
    /// Report or set the selected QSPI flash
    Flashselect {
        /// Unit to select, 0 or 1
        unit: Option<u8>,

        /// Attach and mount the volume of the selected unit
        #[arg(long, default_value_t = false)]
        mount: bool,

        /// Unmount and detach the current unit before switching
        #[arg(long, default_value_t = false)]
        unmount: bool,

        /// Persist the volatile /etc and /boot into the selected unit
        #[arg(long, default_value_t = false)]
        update: bool,
    },
    /// Show or set the persisted IP configuration
    Ipcfg {
        /// `dhcp` or `IP::GATEWAY:NETMASK::eth0:on`
        ip: Option<String>,
    },
    /// Convert a legacy flash and mount the volume layout, run at boot
    VolumeSetup,
    /// Print the boot environment
    Env,
}

type Orchestrator = MountOrchestrator<SystemMounts, UbiControl>;

fn open_orchestrator(config: &UpgradeConfig) -> anyhow::Result<(Orchestrator, PathBuf)> {
    let (unit, container) = find_device(&config.proc_mtd, &config.container_name)?;
    let volumes = UbiControl::new(unit, &container).with_paths(
        &config.ubi_ctrl,
        &config.ubi_device,
        &config.ubi_sysfs,
        &config.ubi_attached_marker,
    );
    let orchestrator = MountOrchestrator::new(
        SystemMounts::with_table(&config.proc_mounts),
        volumes,
        &config.root,
        config.volume_device.as_str(),
        config.machine.as_str(),
    );
    Ok((orchestrator, container))
}

fn open_flash(config: &UpgradeConfig) -> anyhow::Result<MtdFlash> {
    let flash = MtdFlash::open(&config.mtd_device)?;
    let size = flash.info().total_size;
    for layout in [Layout::Legacy, Layout::Current] {
        layout.validate(size).with_context(|| {
            format!("{} does not fit the {layout} layout", config.mtd_device.display())
        })?;
    }
    Ok(flash)
}

#[allow(clippy::too_many_arguments)]
fn run_upgrade(
    config: UpgradeConfig,
    pkg_version: Option<String>,
    server: Option<String>,
    tftp: bool,
    list: bool,
    report: bool,
    checksums: bool,
    force: bool,
    legacy: bool,
) -> anyhow::Result<()> {
    let options = UpgradeOptions {
        server: server.unwrap_or_else(|| config.server.clone()),
        version: pkg_version.unwrap_or_else(|| config.version.clone()),
        tftp,
        force,
        legacy,
    };
    let (orchestrator, _) = open_orchestrator(&config)?;
    let backend = Backend {
        flash: open_flash(&config)?,
        orchestrator,
        source: Box::new(HttpSource::new(config.download_timeout())),
    };
    let mut controller = UpgradeController::new(backend, config);
    controller.preflight()?;

    if list {
        match controller.server_version(&options)? {
            Some(version) => println!(
                "Server {} version {}: {}",
                options.server, options.version, version
            ),
            None => println!("Image version not found on server"),
        }
        return Ok(());
    }
    if report {
        let installed = controller.installed_version()?;
        match installed.version {
            Some(version) => println!("Installed version: {version}"),
            None => println!("Installed version not found"),
        }
        if let Some(json) = installed.json {
            println!("{json}");
        }
        return Ok(());
    }
    if checksums {
        let layout = if legacy { Layout::Legacy } else { Layout::Current };
        for (partition, crc) in controller.checksums(layout)? {
            println!(
                "{:<12} 0x{:06x} 0x{:06x} {:08x}",
                partition.id, partition.offset, partition.size, crc
            );
        }
        return Ok(());
    }

    match controller.run(&options)? {
        UpgradeOutcome::Upgraded(target) => {
            println!("Upgrade complete ({target:?} layout), reboot to run the new firmware")
        }
        UpgradeOutcome::Skipped(reason) => {
            println!("Aborting, {reason}");
            println!("Use -f to force upgrade.");
        }
    }
    Ok(())
}

fn run_flashselect(
    config: UpgradeConfig,
    unit: Option<u8>,
    options: SelectOptions,
) -> anyhow::Result<()> {
    let mut selector = GpioMuxSelector::new(&config.mux_gpio);
    if unit.is_none() && !options.mount && !options.unmount && !options.update {
        println!("QSPI{} is selected", selector.selected()?);
        return Ok(());
    }
    let (mut orchestrator, _) = open_orchestrator(&config)?;
    let unit = flash_select(&mut selector, &mut orchestrator, unit, options)?;
    println!("Selected QSPI{unit}");
    Ok(())
}

fn run_ipcfg(config: UpgradeConfig, ip: Option<String>) -> anyhow::Result<()> {
    let boot = config.path("boot");
    match ip {
        Some(ip) => {
            if ip.is_empty() || ip.contains('\0') {
                bail!("invalid ip setting {ip:?}");
            }
            ipcfg::write_ip_config(&boot, &config.machine, &ip)?;
            println!("ip={ip}");
        }
        None => match ipcfg::read_ip_config(&boot, &config.machine)? {
            Some(ip) => println!("ip={ip}"),
            None => println!("ip configuration not set"),
        },
    }
    Ok(())
}

fn run_volume_setup(config: UpgradeConfig) -> anyhow::Result<()> {
    let (mut orchestrator, container) = open_orchestrator(&config)?;
    let mut flash = open_flash(&config)?;
    let mut container = MtdFlash::open(&container)?;
    orchestrator.setup_volume(&mut flash, &mut container)?;
    Ok(())
}

fn run_env(config: UpgradeConfig) -> anyhow::Result<()> {
    let mut flash = open_flash(&config)?;
    let env = EnvStore::new(&mut flash).load()?;
    for entry in &env.entries {
        println!("{entry}");
    }
    Ok(())
}

fn main() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init();
    let cli = Cli::parse();

    let result = UpgradeConfig::load(cli.config.as_deref())
        .map_err(anyhow::Error::from)
        .and_then(|config| match cli.command {
            Commands::Upgrade {
                pkg_version,
                server,
                tftp,
                list,
                report,
                checksums,
                force,
                legacy,
            } => run_upgrade(
                config,
                pkg_version,
                server,
                tftp,
                list,
                report,
                checksums,
                force,
                legacy,
            ),
            Commands::Flashselect {
                unit,
                mount,
                unmount,
                update,
            } => run_flashselect(
                config,
                unit,
                SelectOptions {
                    unmount,
                    mount,
                    update,
                },
            ),
            Commands::Ipcfg { ip } => run_ipcfg(config, ip),
            Commands::VolumeSetup => run_volume_setup(config),
            Commands::Env => run_env(config),
        });
    result.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
}
