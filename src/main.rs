use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use gnomehat::app::{AppMode, Application};
use gnomehat::common::{init_logging, load_config, wait_for_shutdown_signal, StartupOverrides};
use gnomehat_config::{AppConfig, LogLevel, OutputFormat};
use gnomehat_dispatcher::JobScheduler;
use gnomehat_domain::{Job, JobFilter, JobMetadata, JobState, SchedulerError};
use gnomehat_infrastructure::DatabaseManager;
use tracing::info;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn cli() -> Command {
    Command::new("gnomehat")
        .version(env!("CARGO_PKG_VERSION"))
        .about("实验任务调度系统")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/gnomehat.toml 或 gnomehat.toml")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(
            Command::new("worker").about("启动一个 Worker").arg(
                Arg::new("worker-id")
                    .long("worker-id")
                    .value_name("ID")
                    .help("Worker ID，默认 <主机名>-<进程号>"),
            ),
        )
        .subcommand(Command::new("sweeper").about("启动过期任务回收服务"))
        .subcommand(
            Command::new("all")
                .about("在同一进程内启动回收服务和多个 Worker")
                .arg(
                    Arg::new("workers")
                        .short('w')
                        .long("workers")
                        .value_name("N")
                        .help("Worker 数量")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("submit")
                .about("提交实验任务")
                .arg(Arg::new("name").long("name").value_name("NAME").help("任务名称"))
                .arg(
                    Arg::new("workdir")
                        .long("workdir")
                        .value_name("DIR")
                        .help("任务工作目录"),
                )
                .arg(Arg::new("notes").long("notes").value_name("TEXT").help("备注"))
                .arg(
                    Arg::new("command")
                        .value_name("COMMAND")
                        .help("要执行的 shell 命令")
                        .required(true)
                        .num_args(1..)
                        .trailing_var_arg(true)
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("list")
                .about("列出任务")
                .arg(
                    Arg::new("state")
                        .long("state")
                        .value_name("STATE")
                        .help("按状态过滤")
                        .value_parser(clap::value_parser!(JobStateArg)),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .help("最多显示条数")
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("查看任务详情")
                .arg(job_id_arg()),
        )
        .subcommand(Command::new("kill").about("终止任务").arg(job_id_arg()))
}

fn job_id_arg() -> Arg {
    Arg::new("id")
        .value_name("ID")
        .help("任务ID")
        .required(true)
        .value_parser(clap::value_parser!(i64))
}

#[derive(Debug, Clone)]
struct JobStateArg(JobState);

impl std::str::FromStr for JobStateArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobStateArg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let overrides = StartupOverrides {
        log_level: parse_opt::<LogLevel>(&matches, "log-level")?,
        log_format: parse_opt::<OutputFormat>(&matches, "log-format")?,
        worker_id: matches
            .subcommand_matches("worker")
            .and_then(|m| m.get_one::<String>("worker-id").cloned()),
        concurrency: matches
            .subcommand_matches("all")
            .and_then(|m| m.get_one::<usize>("workers").copied()),
    };
    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = load_config(config_path, &overrides)?;

    init_logging(
        config.observability.log_level,
        config.observability.log_format,
    )?;

    match matches.subcommand() {
        Some(("worker", _)) => serve(config, AppMode::Worker).await,
        Some(("sweeper", _)) => serve(config, AppMode::Sweeper).await,
        Some(("all", _)) => serve(config, AppMode::All).await,
        Some(("submit", sub)) => submit(&config, sub).await,
        Some(("list", sub)) => list(&config, sub).await,
        Some(("show", sub)) => show(&config, sub).await,
        Some(("kill", sub)) => kill(&config, sub).await,
        Some((other, _)) => Err(anyhow::anyhow!("未知子命令: {other}")),
        None => Err(anyhow::anyhow!("缺少子命令")),
    }
}

fn parse_opt<T>(matches: &ArgMatches, id: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    matches
        .get_one::<String>(id)
        .map(|raw| raw.parse::<T>().map_err(anyhow::Error::msg))
        .transpose()
}

/// 长期运行的服务模式，组件失败时以非零状态退出
async fn serve(config: AppConfig, mode: AppMode) -> Result<()> {
    info!("启动实验任务调度系统，模式: {:?}", mode);

    let app = Arc::new(Application::new(config, mode).await?);
    app.serve_until(wait_for_shutdown_signal(), SHUTDOWN_TIMEOUT)
        .await?;

    info!("实验任务调度系统已退出");
    Ok(())
}

/// 命令行客户端直接访问存储，不需要任何长期运行的服务
async fn client(config: &AppConfig) -> Result<(DatabaseManager, JobScheduler)> {
    let database = DatabaseManager::new(&config.database)
        .await
        .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
    let scheduler = JobScheduler::new(database.job_store(), &config.scheduler);
    Ok((database, scheduler))
}

async fn submit(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let command = matches
        .get_many::<String>("command")
        .map(|parts| parts.cloned().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let metadata = JobMetadata {
        name: matches.get_one::<String>("name").cloned(),
        working_dir: matches.get_one::<String>("workdir").cloned(),
        notes: matches.get_one::<String>("notes").cloned(),
    };

    let (database, scheduler) = client(config).await?;
    let id = scheduler
        .submit(&command, metadata)
        .await
        .map_err(client_error)?;
    println!("{id}");
    database.close().await;
    Ok(())
}

async fn list(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let mut filter = match matches.get_one::<JobStateArg>("state") {
        Some(JobStateArg(state)) => JobFilter::with_state(*state),
        None => JobFilter::default(),
    };
    if let Some(limit) = matches.get_one::<i64>("limit") {
        filter = filter.limit(*limit);
    }

    let (database, scheduler) = client(config).await?;
    let jobs = scheduler.list(&filter).await.map_err(client_error)?;
    println!(
        "{:>6}  {:<10}  {:<20}  {:>7}  {:<19}  COMMAND",
        "ID", "STATE", "OWNER", "ATTEMPT", "SUBMITTED"
    );
    for job in &jobs {
        println!("{}", format_row(job));
    }
    database.close().await;
    Ok(())
}

fn format_row(job: &Job) -> String {
    format!(
        "{:>6}  {:<10}  {:<20}  {:>7}  {:<19}  {}",
        job.id,
        job.state,
        job.owner.as_deref().unwrap_or("-"),
        job.attempt_count,
        job.submitted_at.format("%Y-%m-%d %H:%M:%S"),
        job.command
    )
}

async fn show(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let id = required_id(matches)?;
    let (database, scheduler) = client(config).await?;
    let job = scheduler.get(id).await.map_err(client_error)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&job).context("序列化任务失败")?
    );
    database.close().await;
    Ok(())
}

async fn kill(config: &AppConfig, matches: &ArgMatches) -> Result<()> {
    let id = required_id(matches)?;
    let (database, scheduler) = client(config).await?;
    let job = scheduler.kill(id).await.map_err(client_error)?;
    println!("{} {}", job.id, job.state);
    database.close().await;
    Ok(())
}

/// 命令行错误先给出面向用户的提示，原始错误作为原因
fn client_error(err: SchedulerError) -> anyhow::Error {
    let hint = err.user_message().to_string();
    anyhow::Error::new(err).context(hint)
}

fn required_id(matches: &ArgMatches) -> Result<i64> {
    matches
        .get_one::<i64>("id")
        .copied()
        .ok_or_else(|| anyhow::anyhow!("缺少任务ID"))
}
