use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use showui::{
    api::{build_rocket, server_config},
    exec::{ExecModel, showui::ShowUIExec},
    grounding::Grounder,
    utils::{download_model, get_default_save_dir, parse_dtype},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL_ID: &str = "showlab/ShowUI-2B";
const DEFAULT_ADDRESS: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7860;

#[derive(Parser, Debug)]
#[command(name = "showui")]
#[command(version, about = "ShowUI-2B screenshot grounding server", long_about = None)]
struct Cli {
    /// Service listen address
    #[arg(short, long)]
    address: Option<String>,

    /// Service listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Hugging Face model id
    #[arg(long)]
    model_id: Option<String>,

    /// Local model weight path
    #[arg(long)]
    weight_path: Option<String>,

    /// Model download save directory
    #[arg(long)]
    save_dir: Option<String>,

    /// Download retry count
    #[arg(long)]
    download_retries: Option<u32>,

    /// Override the checkpoint dtype (f32, f16, bf16)
    #[arg(long)]
    dtype: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download model and start service (default)
    Cli(CliArgs),
    /// Start service only (requires --weight-path)
    Serv(ServArgs),
    /// Download model only
    Download(DownloadArgs),
    /// Locate one element on a screenshot and print the result
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Service listen address
    #[arg(short, long, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Service listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Override the checkpoint dtype (f32, f16, bf16)
    #[arg(long)]
    dtype: Option<String>,
}

#[derive(Args, Debug)]
struct CliArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Hugging Face model id
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Local model weight path (skip download if provided)
    #[arg(long)]
    weight_path: Option<String>,

    /// Model download save directory
    #[arg(long)]
    save_dir: Option<String>,

    /// Download retry count
    #[arg(long)]
    download_retries: Option<u32>,
}

#[derive(Args, Debug)]
struct ServArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Local model weight path (required)
    #[arg(long, required = true)]
    weight_path: String,
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// Hugging Face model id
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Model download save directory
    #[arg(short, long)]
    save_dir: Option<String>,

    /// Download retry count
    #[arg(long)]
    download_retries: Option<u32>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Screenshot path or url
    #[arg(short, long)]
    image: String,

    /// Element description
    #[arg(short, long)]
    query: String,

    /// Output file path (optional)
    #[arg(short, long)]
    output: Option<String>,

    /// Local model weight path (required)
    #[arg(long, required = true)]
    weight_path: String,
}

fn save_dir_or_default(save_dir: Option<String>) -> Result<String> {
    match save_dir {
        Some(dir) => Ok(dir),
        None => get_default_save_dir().ok_or(anyhow!("failed to get home directory")),
    }
}

async fn serve(common: CommonArgs, weight_path: String) -> Result<()> {
    let CommonArgs {
        address,
        port,
        dtype,
    } = common;
    let dtype = dtype.as_deref().map(parse_dtype).transpose()?;
    let config = server_config(&address, port)?;
    // loading is blocking and must finish before the port is bound
    let grounder =
        tokio::task::spawn_blocking(move || Grounder::load(&weight_path, None, dtype)).await??;
    info!("serving on http://{}:{}", address, port);
    build_rocket(grounder, config).launch().await?;
    Ok(())
}

async fn run_cli(args: CliArgs) -> Result<()> {
    let CliArgs {
        common,
        model_id,
        weight_path,
        save_dir,
        download_retries,
    } = args;

    let model_path = match weight_path {
        Some(path) => path,
        None => {
            let save_dir = save_dir_or_default(save_dir)?;
            let max_retries = download_retries.unwrap_or(3);
            let path = download_model(&model_id, &save_dir, max_retries).await?;
            path.to_string_lossy().to_string()
        }
    };
    serve(common, model_path).await
}

async fn run_serv(args: ServArgs) -> Result<()> {
    let ServArgs {
        common,
        weight_path,
    } = args;
    serve(common, weight_path).await
}

async fn run_download(args: DownloadArgs) -> Result<()> {
    let DownloadArgs {
        model_id,
        save_dir,
        download_retries,
    } = args;
    let save_dir = save_dir_or_default(save_dir)?;
    let max_retries = download_retries.unwrap_or(3);
    let path = download_model(&model_id, &save_dir, max_retries).await?;
    println!("{}", path.display());
    Ok(())
}

fn run_run(args: RunArgs) -> Result<()> {
    let RunArgs {
        image,
        query,
        output,
        weight_path,
    } = args;
    ShowUIExec::run(&image, &query, output.as_deref(), &weight_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Cli(args)) => run_cli(args).await,
        Some(Commands::Serv(args)) => run_serv(args).await,
        Some(Commands::Download(args)) => run_download(args).await,
        Some(Commands::Run(args)) => tokio::task::spawn_blocking(move || run_run(args)).await?,
        None => {
            // no subcommand behaves like `cli`
            let args = CliArgs {
                common: CommonArgs {
                    address: cli.address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
                    port: cli.port.unwrap_or(DEFAULT_PORT),
                    dtype: cli.dtype,
                },
                model_id: cli.model_id.unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
                weight_path: cli.weight_path,
                save_dir: cli.save_dir,
                download_retries: cli.download_retries,
            };
            run_cli(args).await
        }
    }
}
