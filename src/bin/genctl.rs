use clap::{Parser, Subcommand};
use genjob::backend::HttpBackend;
use genjob::request::ParamValue;
use genjob::{Config, GeneratedImage, GenerationBackend, GenerationRequest, JobClient, JobState, Seed};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "genctl", about = "CLI for the image generation backend", version)]
struct Cli {
    /// Override GENERATOR_API_URL (the WebSocket URL is derived from it)
    #[arg(global = true, long)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a generation job and follow it to completion
    Generate(GenerateArgs),
    /// Fetch the result of a job over HTTP
    Result {
        job_id: String,
        /// Output path (defaults to ./<filename>)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// List workflows known to the backend
    Workflows {
        /// Print the JSON graph of one workflow instead of the list
        #[arg(long, value_name = "NAME")]
        show: Option<String>,
    },
    /// Poll whether a job has completed
    Progress { job_id: String },
    /// List checkpoints known to the backend
    Checkpoints,
    /// Show backend GPU status
    Gpu {
        /// Print every reported field
        #[arg(long)]
        json: bool,
    },
    /// Upload a source image and print its backend reference
    Upload { path: PathBuf },
}

#[derive(clap::Args, Debug)]
struct GenerateArgs {
    /// Workflow name as listed by `genctl workflows`
    #[arg(long)]
    workflow: String,
    /// Positive prompt text
    #[arg(long)]
    prompt: Option<String>,
    /// Negative prompt text
    #[arg(long)]
    negative: Option<String>,
    #[arg(long)]
    steps: Option<i64>,
    /// CFG scale
    #[arg(long)]
    cfg: Option<f64>,
    /// Seed; -1 lets the backend pick one
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    seed: i64,
    #[arg(long)]
    sampler: Option<String>,
    #[arg(long)]
    scheduler: Option<String>,
    #[arg(long)]
    denoise: Option<f64>,
    #[arg(long)]
    width: Option<i64>,
    #[arg(long)]
    height: Option<i64>,
    /// Local image to upload and pass as the workflow's input image
    #[arg(long, value_name = "PATH", conflicts_with = "input_ref")]
    input_image: Option<PathBuf>,
    /// Reference of an already uploaded image
    #[arg(long, value_name = "REF")]
    input_ref: Option<String>,
    /// Clip duration in seconds (video workflows)
    #[arg(long)]
    duration: Option<i64>,
    /// Aspect ratio (video workflows), e.g. 1280:720
    #[arg(long)]
    ratio: Option<String>,
    /// Extra parameters as KEY=VALUE (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    /// Output path (defaults to ./<filename>)
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    Config::dotenv_load();
    let cli = Cli::parse();

    let mut conf = Config::new()?;
    if let Some(url) = cli.api_url.as_deref() {
        conf = conf.with_api_url(url);
    }
    conf.print_env_vars();
    let backend = HttpBackend::new(&conf)?;

    match cli.command {
        Commands::Generate(args) => generate(backend, &conf, args).await,
        Commands::Result { job_id, out } => match backend.fetch_result(&job_id).await? {
            Some(image) => save_image(&image, out, &job_id).await,
            None => {
                eprintln!("No result found for job {}", job_id);
                std::process::exit(1);
            }
        },
        Commands::Workflows { show: Some(name) } => {
            let graph = backend.workflow(&name).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
            Ok(())
        }
        Commands::Workflows { show: None } => {
            for name in backend.workflows().await? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Progress { job_id } => {
            let reply = backend.progress(&job_id).await?;
            let state = if reply.completed() { "completed" } else { "pending" };
            match reply.status.status_str {
                Some(detail) => println!("{} ({})", state, detail),
                None => println!("{}", state),
            }
            Ok(())
        }
        Commands::Checkpoints => {
            for name in backend.checkpoints().await? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Gpu { json } => {
            let gpu = backend.gpu_status().await?;
            if json {
                println!("{:#?}", gpu);
            } else {
                println!(
                    "{} load={}% mem={}/{} GB temp={}C",
                    gpu.name.or(gpu.status).unwrap_or_else(|| "GPU".to_string()),
                    fmt_opt(gpu.load),
                    fmt_opt(gpu.memory_used),
                    fmt_opt(gpu.memory_total),
                    fmt_opt(gpu.temperature),
                );
            }
            Ok(())
        }
        Commands::Upload { path } => {
            let uploaded = backend.upload_image(&path).await?;
            println!("{}", uploaded.comfy_path);
            Ok(())
        }
    }
}

async fn generate(
    backend: HttpBackend,
    conf: &Config,
    args: GenerateArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = GenerationRequest::new(args.workflow).seed(Seed::from(args.seed));
    if let Some(v) = args.prompt { request = request.prompt(v); }
    if let Some(v) = args.negative { request = request.negative_prompt(v); }
    if let Some(v) = args.steps { request = request.steps(v); }
    if let Some(v) = args.cfg { request = request.cfg_scale(v); }
    if let Some(v) = args.sampler { request = request.sampler(v); }
    if let Some(v) = args.scheduler { request = request.scheduler(v); }
    if let Some(v) = args.denoise { request = request.denoise(v); }
    if let Some(v) = args.width { request = request.param("width", v); }
    if let Some(v) = args.height { request = request.param("height", v); }
    if let Some(v) = args.duration { request = request.duration(v); }
    if let Some(v) = args.ratio { request = request.ratio(v); }
    if let Some(path) = args.input_image.as_deref() {
        let uploaded = backend.upload_image(path).await?;
        request = request.input_image(uploaded.comfy_path);
    } else if let Some(reference) = args.input_ref {
        request = request.input_image(reference);
    }
    for (key, value) in parse_param_pairs(&args.params)? {
        request = request.param(key, value);
    }

    let client = JobClient::new(backend, conf);
    let mut rx = client.subscribe().await;
    let handle = match client.submit(&request).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!("Job {} started", handle.job_id());

    let mut last_percent = None;
    let mut last_notice: Option<String> = None;
    let final_state = loop {
        let snap = rx.borrow_and_update().clone();
        if snap.notice != last_notice {
            if let Some(notice) = &snap.notice {
                eprintln!("{}", notice);
            }
            last_notice = snap.notice.clone();
        }
        match &snap.state {
            JobState::Running { percent, .. } if last_percent != Some(*percent) => {
                eprintln!("{:>3}%", percent);
                last_percent = Some(*percent);
            }
            state if state.is_terminal() => break snap.state.clone(),
            _ => {}
        }
        if rx.changed().await.is_err() {
            break client.snapshot().await.state;
        }
    };

    match final_state {
        JobState::Done { job_id, image, elapsed } => {
            eprintln!("Done in {:.1}s", elapsed.as_secs_f64());
            save_image(&image, args.out, &job_id).await
        }
        JobState::Failed { message, .. } => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
        other => {
            eprintln!("Job ended in unexpected state: {:?}", other);
            std::process::exit(1);
        }
    }
}

async fn save_image(
    image: &GeneratedImage,
    out: Option<PathBuf>,
    job_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = image.decode()?;
    let kind = if image.is_video() { "video" } else { "image" };
    let default_name = image.filename.clone().unwrap_or_else(|| format!("{}.png", job_id));
    let path = out.unwrap_or_else(|| Path::new(".").join(default_name));
    tokio::fs::write(&path, &bytes).await?;
    println!("Saved {} {} ({} bytes)", kind, path.display(), bytes.len());
    Ok(())
}

fn parse_param_pairs(items: &[String]) -> Result<Vec<(String, ParamValue)>, String> {
    let mut out = Vec::new();
    for s in items {
        let Some((k, v)) = s.split_once('=') else {
            return Err(format!("Invalid --param '{}', expected KEY=VALUE", s));
        };
        let value = if let Ok(i) = v.parse::<i64>() {
            ParamValue::Integer(i)
        } else if let Ok(f) = v.parse::<f64>() {
            ParamValue::Float(f)
        } else {
            ParamValue::Text(v.to_string())
        };
        out.push((k.trim().to_string(), value));
    }
    Ok(out)
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "?".to_string())
}
