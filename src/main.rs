//! Bee Hive 命令行入口
//!
//! 用法：bee-hive [--config <file>] [--events] <goal...>
//! 初始化日志、加载配置、构建引擎，执行一个目标并把报告以 JSON 打印到 stdout，最后关闭引擎。

use std::path::PathBuf;

use anyhow::{bail, Context};
use bee_hive::config::load_config;
use bee_hive::core::{Engine, ShutdownManager};
use bee_hive::observability;
use bee_hive::react::LoopEvent;

struct CliArgs {
    config: Option<PathBuf>,
    events: bool,
    goal: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut config = None;
    let mut events = false;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().context("--config needs a file path")?;
                config = Some(PathBuf::from(path));
            }
            "--events" => events = true,
            _ => words.push(arg),
        }
    }
    let goal = words.join(" ");
    if goal.trim().is_empty() {
        bail!("usage: bee-hive [--config <file>] [--events] <goal...>");
    }
    Ok(CliArgs { config, events, goal })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    observability::init_with(cfg.app.log_format);

    let engine = Engine::builder(cfg).build().await.context("Failed to build engine")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    // --events：过程事件逐行写到 stderr
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<LoopEvent>();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&ev) {
                eprintln!("{line}");
            }
        }
    });

    let report = if args.events {
        engine
            .run_goal_with_events(&args.goal, shutdown.token(), Some(&event_tx))
            .await
    } else {
        engine.run_goal(&args.goal, shutdown.token()).await
    };
    drop(event_tx);
    let _ = printer.await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.shutdown().await.context("Engine shutdown failed")?;

    if !report.is_done() {
        std::process::exit(1);
    }
    Ok(())
}
