//! qatopology 管理工具
//!
//! 直接操作元数据文件：升级 schema、查看与清理 Router 注册。
//! `--demo` 在内存实例集上演示一次完整的 Cluster 生命周期。
//!
//! 运行: cargo run --bin qatopology-admin -- --upgrade-metadata --interactive

use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;

use qatopology::gtid::GtidSet;
use qatopology::interaction::ConsoleInteraction;
use qatopology::mutator::{AddInstanceOptions, CreateClusterOptions};
use qatopology::probe::{ControlCommand, InstanceStatus, MemoryFleet};
use qatopology::utils::config::TopologyConfig;
use qatopology::{InstanceAddress, InteractionPort, NodeClient, NonInteractive, Session, TopologyError};

/// 管理工具不连接实例：所有远端调用都报不可达
struct MetadataOnlyClient;

impl NodeClient for MetadataOnlyClient {
    fn get_status(&self, instance: &InstanceAddress) -> qatopology::Result<InstanceStatus> {
        Err(TopologyError::Unreachable {
            instance: instance.to_string(),
            reason: "qatopology-admin works on the metadata only".to_string(),
        })
    }

    fn apply_control(&self, instance: &InstanceAddress, _command: ControlCommand) -> qatopology::Result<()> {
        Err(TopologyError::Unreachable {
            instance: instance.to_string(),
            reason: "qatopology-admin works on the metadata only".to_string(),
        })
    }

    fn wait_applied(
        &self,
        instance: &InstanceAddress,
        _gtids: &GtidSet,
        _timeout: Option<Duration>,
    ) -> qatopology::Result<bool> {
        Err(TopologyError::Unreachable {
            instance: instance.to_string(),
            reason: "qatopology-admin works on the metadata only".to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct AdminArgs {
    config: Option<String>,
    metadata: Option<String>,
    interactive: bool,
    dry_run: bool,
    upgrade_metadata: bool,
    list_routers: bool,
    remove_router: Option<String>,
    demo: bool,
}

impl AdminArgs {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut parsed = AdminArgs::default();
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" | "-c" => parsed.config = Some(value_of(arg, iter.next())?),
                "--metadata" | "-m" => parsed.metadata = Some(value_of(arg, iter.next())?),
                "--remove-router" => parsed.remove_router = Some(value_of(arg, iter.next())?),
                "--interactive" | "-i" => parsed.interactive = true,
                "--dry-run" => parsed.dry_run = true,
                "--upgrade-metadata" => parsed.upgrade_metadata = true,
                "--list-routers" => parsed.list_routers = true,
                "--demo" => parsed.demo = true,
                other => bail!("unknown argument '{}'", other),
            }
        }
        Ok(parsed)
    }
}

fn value_of(flag: &str, value: Option<&String>) -> anyhow::Result<String> {
    match value {
        Some(v) => Ok(v.clone()),
        None => bail!("{} requires a value", flag),
    }
}

fn load_config(args: &AdminArgs) -> anyhow::Result<TopologyConfig> {
    let mut config = match &args.config {
        Some(path) => TopologyConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path))?,
        None => match TopologyConfig::load_default() {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Failed to load config file: {}, using defaults", e);
                TopologyConfig::default()
            }
        },
    };
    if let Some(path) = &args.metadata {
        config.metadata.path = Some(path.clone());
    }
    if args.interactive {
        config.interaction.interactive = true;
    }
    Ok(config)
}

fn run_demo(config: TopologyConfig) -> anyhow::Result<()> {
    let fleet = Arc::new(MemoryFleet::new());
    for node in ["demo-1:3306", "demo-2:3306", "demo-3:3306"] {
        fleet.add_node(node);
    }
    let mut config = config;
    config.metadata.path = None;
    let session = Session::open(config, fleet.clone(), Arc::new(NonInteractive))?;
    session.create_cluster(
        "demo",
        "demo-1:3306",
        CreateClusterOptions {
            gtid_set_complete: true,
            ..Default::default()
        },
    )?;
    let cluster = session.get_cluster("demo")?;
    cluster.add_instance("demo-2:3306", AddInstanceOptions::default())?;
    cluster.add_instance("demo-3:3306", AddInstanceOptions::default())?;
    let status = cluster.status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let raw: Vec<String> = std::env::args().collect();
    let args = AdminArgs::parse(&raw)?;
    let config = load_config(&args)?;
    log::info!("Configuration loaded");
    log::info!("  Metadata path: {}", config.metadata.path.as_deref().unwrap_or("<memory>"));
    log::info!("  Interactive: {}", config.interaction.interactive);

    if args.demo {
        return run_demo(config);
    }

    let interaction: Arc<dyn InteractionPort> = if config.interaction.interactive {
        Arc::new(ConsoleInteraction)
    } else {
        Arc::new(NonInteractive)
    };
    let session = Session::open(config, Arc::new(MetadataOnlyClient), interaction)?;

    if let Some(router) = &args.remove_router {
        session.remove_router_metadata(router)?;
    }
    if args.list_routers {
        let routers = session.list_routers()?;
        println!("{}", serde_json::to_string_pretty(&routers)?);
    }
    if args.upgrade_metadata {
        let report = session.upgrade_metadata(args.dry_run)?;
        match (&report.from, &report.to) {
            (Some(from), Some(to)) => log::info!("Metadata upgraded from {} to {}", from, to),
            _ => log::info!("Metadata is already up to date ({})", session.store().version()),
        }
        for router in &report.outdated_routers {
            log::warn!("Router {} requires an upgrade", router);
        }
        for router in &report.unregistered_routers {
            log::info!("Router {} was unregistered", router);
        }
    }
    if !args.upgrade_metadata && !args.list_routers && args.remove_router.is_none() {
        println!("metadata version {}", session.store().version());
    }
    Ok(())
}
