//! Ping-pong 演示
//!
//! Caller 逐轮以 continuing call 请求 Responder 应答，打印运行统计

use clap::Parser;
use primemover_rs::demo::{PingPongOpts, build_ping_pong};
use primemover_rs::sim::{Controller, ControllerConfig, FailurePolicy, SimTime};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "ping-pong", about = "Ping-pong 演示：Caller 通过 continuing call 与 Responder 对话")]
struct Args {
    /// 对话轮数
    #[arg(long, default_value_t = 3)]
    rounds: u64,
    /// 两轮之间的阻塞睡眠时长
    #[arg(long, default_value_t = 10)]
    gap: u64,
    /// Caller.play 的投递时刻
    #[arg(long, default_value_t = 0)]
    start: u64,
    /// Responder 在这一轮拒绝应答
    #[arg(long)]
    fail_at: Option<u64>,
    /// 控制器配置（JSON）
    #[arg(long)]
    config: Option<PathBuf>,
    /// 未捕获的失败只报告，不终止运行（覆盖配置文件）
    #[arg(long)]
    continue_on_failure: bool,
    /// 只运行到该时刻
    #[arg(long)]
    until: Option<u64>,
}

fn main() {
    // 初始化 tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ControllerConfig::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), "读取配置失败");
                eprintln!("error: {e}");
                process::exit(2);
            }
        },
        None => ControllerConfig::default(),
    };
    if args.continue_on_failure {
        config.failure_policy = FailurePolicy::Continue;
    }

    let ctl = Controller::with_config(config);
    let opts = PingPongOpts {
        rounds: args.rounds,
        gap: SimTime(args.gap),
        fail_at: args.fail_at,
        start: SimTime(args.start),
    };
    let scene = build_ping_pong(&ctl, &opts);
    info!(rounds = opts.rounds, gap = ?opts.gap, "场景已搭建");

    let result = match args.until {
        Some(until) => ctl.run_until(SimTime(until)),
        None => ctl.run(),
    };
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    println!(
        "done @ {}, state={:?}, dispatched={}, replies={}, notes={}, uncaught={}, stalled={}",
        summary.final_time,
        summary.state,
        summary.dispatched,
        scene.caller.replies().len(),
        scene.responder.notes().len(),
        summary.uncaught,
        summary.stalled
    );
}
