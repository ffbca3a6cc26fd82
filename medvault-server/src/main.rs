//! MedVault归档服务器主程序
//!
//! 协议栈（DICOM关联、HTTP服务）由外部协作方注册；本进程负责
//! 装配归档核心并托管其生命周期。

use anyhow::Context;
use clap::Parser;
use medvault_core::{ArchiveConfig, ArchiveError};
use medvault_engine::{ArchiveContext, PeerConfig, PeerTransport, PeerTransportFactory};
use std::sync::Arc;
use tracing::info;

/// 归档服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "medvault-server")]
#[command(about = "MedVault 轻量级医学影像归档服务器")]
struct Args {
    /// 配置文件路径，给出时优先于其余命令行参数
    #[arg(short, long)]
    config: Option<String>,

    /// Blob存储目录
    #[arg(short, long, default_value = "./data/storage")]
    storage_dir: String,

    /// 索引数据库文件，缺省使用内存库
    #[arg(short, long)]
    index_file: Option<String>,

    /// AE标题 (Application Entity Title)
    #[arg(short, long, default_value = "MEDVAULT")]
    ae_title: String,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// 未注册协议栈时的占位工厂：任何出站请求都报网络协议错误
struct OfflineTransportFactory;

#[async_trait::async_trait]
impl PeerTransportFactory for OfflineTransportFactory {
    async fn connect(
        &self,
        _local_aet: &str,
        peer: &PeerConfig,
    ) -> medvault_core::Result<Box<dyn PeerTransport>> {
        Err(ArchiveError::NetworkProtocol(format!(
            "no DICOM protocol stack is registered for peer {peer}"
        )))
    }
}

fn load_config(args: &Args) -> anyhow::Result<ArchiveConfig> {
    match &args.config {
        Some(path) => {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(path))
                .add_source(config::Environment::with_prefix("MEDVAULT"))
                .build()
                .context("cannot load configuration file")?;
            settings
                .try_deserialize::<ArchiveConfig>()
                .context("invalid configuration")
        }
        None => {
            let mut config = ArchiveConfig::default();
            config.storage_root = args.storage_dir.clone().into();
            config.index_path = args.index_file.clone().map(Into::into);
            config.local_aet = args.ae_title.clone();
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    info!("启动MedVault归档服务器...");

    let archive_config = load_config(&args)?;
    info!("归档配置:");
    info!("  AE标题: {}", archive_config.local_aet);
    info!("  存储目录: {}", archive_config.storage_root.display());
    info!(
        "  索引数据库: {}",
        archive_config
            .index_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "内存库".to_string())
    );

    let context = ArchiveContext::initialize(archive_config, Arc::new(OfflineTransportFactory))
        .await
        .context("failed to initialize the archive context")?;

    info!("归档核心就绪，按 Ctrl+C 退出");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;

    info!("正在关闭...");
    context.finalize().await;
    info!("已退出");
    Ok(())
}
