use anyhow::Context as _;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relaycore::autoenable::AutoEnableProber;
use relaycore::monitor::PriorityMonitor;
use relaycore::probe::{HttpChannelTester, LogNotifier};
use relaycore::stats::{ChannelStatsCache, StatsAggregator};
use relaycore::{logging, storage};

#[derive(Parser, Debug)]
#[command(
    name = "relaycore",
    version,
    about = "Channel routing + health management core for an LLM API gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动后台维护任务（自动启用、优先级监控、统计刷新）
    Serve {
        /// 以副本身份运行：不启动任何周期性修改任务
        #[arg(long)]
        replica: bool,
    },
    Migrate,
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("com", "relaycore", "RelayCore")
        .context("无法定位用户数据目录（ProjectDirs）")?;
    Ok(proj.data_dir().to_path_buf())
}

fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("relaycore.sqlite3")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve { replica: false }) {
        Command::Serve { replica } => {
            let data_dir = default_data_dir()?;
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("创建数据目录失败：{}", data_dir.display()))?;

            let db_path = db_path(&data_dir);
            storage::init_db(&db_path).with_context(|| "初始化 SQLite 失败")?;

            let settings = storage::get_gateway_settings(db_path.clone()).await?;
            logging::init(&data_dir, settings.log_level)?;

            tracing::info!(
                db = %db_path.display(),
                replica,
                "relaycore started"
            );

            if !replica {
                let tester = Arc::new(HttpChannelTester::new());
                let notifier = Arc::new(LogNotifier);

                let prober = Arc::new(AutoEnableProber::new(
                    db_path.clone(),
                    tester.clone(),
                    notifier,
                ));
                tokio::spawn({
                    let prober = prober.clone();
                    async move { prober.run_loop().await }
                });

                let monitor = Arc::new(PriorityMonitor::new(db_path.clone(), tester));
                tokio::spawn({
                    let monitor = monitor.clone();
                    async move { monitor.run_loop().await }
                });

                let stats_cache = Arc::new(ChannelStatsCache::new());
                let aggregator = Arc::new(StatsAggregator::new(db_path.clone(), stats_cache));
                tokio::spawn({
                    let aggregator = aggregator.clone();
                    async move { aggregator.run_loop().await }
                });
            }

            tokio::signal::ctrl_c().await?;
            tracing::info!("relaycore shutting down");
            Ok(())
        }
        Command::Migrate => {
            let data_dir = default_data_dir()?;
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("创建数据目录失败：{}", data_dir.display()))?;
            let db_path = db_path(&data_dir);
            storage::init_db(&db_path).with_context(|| "初始化 SQLite 失败")?;
            println!("ok: {}", db_path.display());
            Ok(())
        }
    }
}
