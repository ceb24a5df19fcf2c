use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use scenecast_contracts::events::EventWriter;
use scenecast_contracts::jobs::{GenerationOutcome, JobNotice};
use scenecast_contracts::language::LanguageHint;
use scenecast_contracts::receipts::{write_receipt, GenerationReceipt};
use scenecast_contracts::rewrite::{RewriteRequest, RewriteResult};
use scenecast_engine::{CancelToken, DashScopeClient, EngineConfig, ScenePipeline, ThreadClock};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "scenecast",
    version,
    about = "Turn a short phrase into a generated image"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
    Chat(ChatArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    locale: Option<String>,
    /// Seconds to wait for the image job before giving up.
    #[arg(long)]
    max_wait: Option<u64>,
}

type DashScopePipeline = ScenePipeline<Arc<DashScopeClient>, Arc<DashScopeClient>, ThreadClock>;

const NOTICE_QUEUE_DEPTH: usize = 8;
const CAPTION_SCENE_MAX_CHARS: usize = 200;
const GENERATION_FAILED_MESSAGE: &str = "❌ 图像生成失败，请重试。如果持续失败，可能是服务器繁忙。";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("scenecast error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_once(args),
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
    }
}

/// Everything one process needs to serve requests.
struct Session {
    client: Arc<DashScopeClient>,
    config: EngineConfig,
    events_path: PathBuf,
    downloader: ImageDownloader,
    out_dir: PathBuf,
    notices: mpsc::SyncSender<JobNotice>,
    /// Shared by every request of the session. Nothing in the CLI fires it
    /// yet; it is the hook for an interrupt handler.
    cancel: CancelToken,
}

impl Session {
    fn open(out_dir: &Path, engine: &EngineArgs) -> Result<(Self, thread::JoinHandle<()>)> {
        let config = engine_config(engine);
        let events_path = engine
            .events
            .clone()
            .unwrap_or_else(|| out_dir.join("events.jsonl"));
        let client = Arc::new(DashScopeClient::from_config(&config)?);
        let downloader = ImageDownloader::new(out_dir)?;
        let (tx, rx) = mpsc::sync_channel(NOTICE_QUEUE_DEPTH);
        let printer = thread::Builder::new()
            .name("scenecast-notices".to_string())
            .spawn(move || print_notices(rx))
            .context("notice printer thread spawn failed")?;
        Ok((
            Self {
                client,
                config,
                events_path,
                downloader,
                out_dir: out_dir.to_path_buf(),
                notices: tx,
                cancel: CancelToken::new(),
            },
            printer,
        ))
    }

    fn locale(&self) -> &str {
        &self.config.rewrite.locale
    }

    /// Events of one request share its receipt id as `run_id`.
    fn pipeline(&self, request_id: &str) -> DashScopePipeline {
        ScenePipeline::with_client(
            Arc::clone(&self.client),
            &self.config,
            EventWriter::new(&self.events_path, request_id),
        )
    }

    /// Handles one inbound line. `None` means the line was not a prompt.
    fn handle(&self, input: &str) -> Result<Option<bool>> {
        let Some(request) = RewriteRequest::parse(input) else {
            return Ok(None);
        };
        match request.language() {
            LanguageHint::Cjk => {
                println!("🧠 正在理解\"{}\"...", request.raw_text());
                println!("🎨 正在生成图像，请稍候...");
            }
            LanguageHint::Other => println!("🎨 Generating: \"{}\"...", request.raw_text()),
        }

        let request_id = new_request_id();
        let report = self
            .pipeline(&request_id)
            .generate(&request, &self.notices, &self.cancel);
        let mut receipt = GenerationReceipt::new(&request_id, &request, &report.rewrite);
        let mut delivered = false;

        match &report.outcome {
            Err(err) => {
                eprintln!("{err}");
                println!("{GENERATION_FAILED_MESSAGE}");
                receipt = receipt.with_submission_error(err.to_string());
            }
            Ok(outcome) => {
                receipt = receipt.with_outcome(outcome);
                match outcome.result_url() {
                    Some(url) => match self.downloader.download(url) {
                        Ok(path) => {
                            println!("{}", caption(&request, &report.rewrite));
                            println!("🖼️ {}", path.display());
                            receipt = receipt.with_image_path(path);
                            delivered = true;
                        }
                        Err(err) => println!("⚠️ 发送图片失败: {err:#}"),
                    },
                    None => {
                        if let Some(reason) = outcome.failure_reason() {
                            eprintln!("generation did not complete: {reason}");
                        }
                        if !matches!(outcome, GenerationOutcome::Cancelled { .. }) {
                            println!("{GENERATION_FAILED_MESSAGE}");
                        }
                    }
                }
            }
        }

        let receipt_path = self.out_dir.join(format!("receipt-{request_id}.json"));
        write_receipt(&receipt_path, &receipt)
            .with_context(|| format!("failed to write {}", receipt_path.display()))?;
        Ok(Some(delivered))
    }
}

fn run_once(args: RunArgs) -> Result<i32> {
    if RewriteRequest::parse(&args.text).is_none() {
        bail!("--text must be a non-empty phrase, not a command");
    }
    let (session, printer) = Session::open(&args.out, &args.engine)?;
    let delivered = session.handle(&args.text)?.unwrap_or(false);
    drop(session);
    let _ = printer.join();
    Ok(if delivered { 0 } else { 2 })
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let (session, printer) = Session::open(&args.out, &args.engine)?;
    let stdin = io::stdin();
    let mut line = String::new();

    println!("{}", usage_text(session.locale()));

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim();
        match input {
            "/start" | "/help" => println!("{}", usage_text(session.locale())),
            "/exit" | "/quit" => break,
            _ => {
                session.handle(input)?;
            }
        }
    }

    drop(session);
    let _ = printer.join();
    Ok(())
}

fn engine_config(args: &EngineArgs) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    apply_overrides(&mut config, args);
    config
}

fn apply_overrides(config: &mut EngineConfig, args: &EngineArgs) {
    if let Some(model) = non_empty(args.text_model.as_deref()) {
        config.rewrite.model = model;
    }
    if let Some(locale) = non_empty(args.locale.as_deref()) {
        config.rewrite.locale = locale;
    }
    if let Some(model) = non_empty(args.image_model.as_deref()) {
        config.image.model = model;
    }
    if let Some(size) = non_empty(args.size.as_deref()) {
        config.image.size = size;
    }
    if let Some(max_wait) = args.max_wait {
        config.poll.max_wait_seconds = max_wait.clamp(10, 1800);
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn print_notices(rx: mpsc::Receiver<JobNotice>) {
    for notice in rx {
        println!("{}", notice_message(&notice));
    }
}

fn notice_message(notice: &JobNotice) -> &'static str {
    match notice {
        JobNotice::SlowQueue { .. } => "⏳ 图像生成队列较长，请继续等待...",
        JobNotice::TimedOut { .. } => "⏱️ 生成超时。服务器队列可能繁忙，请稍后重试。",
    }
}

fn usage_text(locale: &str) -> String {
    format!(
        "🖼️ Send me text in Chinese or English:\n\
• Chinese: I will create a scene set in {locale}\n\
• English: I will generate exactly what you describe\n\n\
⚠️ Note: Image generation may take 1-3 minutes."
    )
}

fn caption(request: &RewriteRequest, rewrite: &RewriteResult) -> String {
    match request.language() {
        LanguageHint::Cjk => format!(
            "✅ 原词: {}\n🎨 场景: {}",
            request.raw_text(),
            rewrite
                .final_prompt
                .chars()
                .take(CAPTION_SCENE_MAX_CHARS)
                .collect::<String>()
        ),
        LanguageHint::Other => format!("✅ Prompt: {}", request.raw_text()),
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn image_file_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}.png", &id[..8])
}

/// Fetches finished images into a fixed directory chosen by the caller.
struct ImageDownloader {
    dir: PathBuf,
    http: HttpClient,
}

impl ImageDownloader {
    fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build download client")?;
        Ok(Self {
            dir: dir.to_path_buf(),
            http,
        })
    }

    fn download(&self, url: &str) -> Result<PathBuf> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("image download failed ({url})"))?;
        if !response.status().is_success() {
            bail!("image download failed ({})", response.status().as_u16());
        }
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?;
        let path = self.dir.join(image_file_name());
        fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}
