pub mod img_utils;
pub mod tensor_utils;

use std::{fs, path::PathBuf, process::Command, time::Duration};

use anyhow::{Result, anyhow};
use candle_core::{DType, Device};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use dirs::home_dir;
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use tokio::time::sleep;
use tracing::{info, warn};

pub fn get_device(device: Option<&Device>) -> Device {
    match device {
        Some(d) => d.clone(),
        None => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0).unwrap_or(Device::Cpu)
            }
            #[cfg(all(not(feature = "cuda"), feature = "metal"))]
            {
                Device::new_metal(0).unwrap_or(Device::Cpu)
            }
            #[cfg(all(not(feature = "cuda"), not(feature = "metal")))]
            {
                Device::Cpu
            }
        }
    }
}

pub fn get_gpu_sm_arch() -> Result<f32> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=compute_cap")
        .arg("--format=csv,noheader")
        .output()
        .map_err(|e| anyhow!("failed to execute nvidia-smi: {}", e))?;
    if !output.status.success() {
        return Err(anyhow!(
            "nvidia-smi failed with status: {}\nError: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    let output_str = String::from_utf8_lossy(&output.stdout);
    // one line per GPU, the first device is the one we run on
    let first = output_str.lines().next().unwrap_or("").trim();
    first
        .parse::<f32>()
        .map_err(|_| anyhow!("gpu sm arch: {} parse float32 error", first))
}

/// Maps the checkpoint's `torch_dtype` onto what the current device handles.
pub fn get_dtype(dtype: Option<DType>, cfg_dtype: &str) -> DType {
    match dtype {
        Some(d) => d,
        None => {
            #[cfg(feature = "cuda")]
            {
                match cfg_dtype {
                    "float32" | "float" => DType::F32,
                    "float16" | "half" => DType::F16,
                    "bfloat16" => match get_gpu_sm_arch() {
                        // bf16 kernels need sm >= 8.0
                        Ok(arch) if arch >= 8.0 => DType::BF16,
                        _ => DType::F16,
                    },
                    _ => DType::F32,
                }
            }
            #[cfg(not(feature = "cuda"))]
            {
                match cfg_dtype {
                    "float16" | "half" => DType::F16,
                    // bf16 matmuls are slow or missing on cpu/metal
                    _ => DType::F32,
                }
            }
        }
    }
}

pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(anyhow!("unsupported dtype: {}", other)),
    }
}

pub fn string_to_static_str(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

pub fn find_type_files(path: &str, extension_type: &str) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let file_path = entry?.path();
        if file_path.is_file()
            && let Some(extension) = file_path.extension()
            && extension == extension_type
        {
            files.push(file_path.to_string_lossy().to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Rounds half to even, like Python's `round`.
pub fn round_by_factor(num: f64, factor: u32) -> u32 {
    (num / factor as f64).round_ties_even() as u32 * factor
}

pub fn floor_by_factor(num: f64, factor: u32) -> u32 {
    (num / factor as f64).floor() as u32 * factor
}

pub fn ceil_by_factor(num: f64, factor: u32) -> u32 {
    (num / factor as f64).ceil() as u32 * factor
}

pub fn get_logit_processor(
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<usize>,
    seed: u64,
) -> LogitsProcessor {
    let temperature = temperature.filter(|v| *v >= 1e-7).map(|v| v as f64);
    let sampling = match (temperature, top_k, top_p) {
        (None, _, _) => Sampling::ArgMax,
        (Some(temperature), None, None) => Sampling::All { temperature },
        (Some(temperature), None, Some(p)) => Sampling::TopP {
            p: p as f64,
            temperature,
        },
        (Some(temperature), Some(k), None) => Sampling::TopK { k, temperature },
        (Some(temperature), Some(k), Some(p)) => Sampling::TopKThenTopP {
            k,
            p: p as f64,
            temperature,
        },
    };
    LogitsProcessor::from_sampling(seed, sampling)
}

pub fn get_default_save_dir() -> Option<String> {
    home_dir().map(|mut path| {
        path.push(".showui");
        if let Err(e) = fs::create_dir_all(&path) {
            warn!("failed to create directory {:?}: {}", path, e);
        }
        path.to_string_lossy().to_string()
    })
}

const REQUIRED_FILES: [&str; 2] = ["config.json", "tokenizer.json"];
const OPTIONAL_FILES: [&str; 6] = [
    "generation_config.json",
    "preprocessor_config.json",
    "tokenizer_config.json",
    "chat_template.json",
    "vocab.json",
    "merges.txt",
];

async fn fetch_snapshot(repo: &ApiRepo) -> Result<PathBuf> {
    let mut snapshot_dir = None;
    for file in REQUIRED_FILES {
        let path = repo.get(file).await?;
        if snapshot_dir.is_none() {
            snapshot_dir = path.parent().map(PathBuf::from);
        }
    }
    for file in OPTIONAL_FILES {
        if let Err(e) = repo.get(file).await {
            info!("optional file {} not fetched: {}", file, e);
        }
    }
    let weight_files = match repo.get("model.safetensors.index.json").await {
        Ok(index_path) => {
            let index: serde_json::Value = serde_json::from_slice(&fs::read(index_path)?)?;
            let weight_map = index["weight_map"]
                .as_object()
                .ok_or(anyhow!("model.safetensors.index.json has no weight_map"))?;
            let mut shards: Vec<String> = weight_map
                .values()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            shards.sort();
            shards.dedup();
            shards
        }
        Err(_) => vec!["model.safetensors".to_string()],
    };
    for file in &weight_files {
        info!("fetching {}", file);
        repo.get(file).await?;
    }
    snapshot_dir.ok_or(anyhow!("download produced no snapshot directory"))
}

/// Fetches a model repository from the Hugging Face hub into `save_dir`
/// and returns the local snapshot directory.
pub async fn download_model(model_id: &str, save_dir: &str, max_retries: u32) -> Result<PathBuf> {
    let api = ApiBuilder::new()
        .with_cache_dir(PathBuf::from(save_dir))
        .with_progress(true)
        .build()?;
    let repo = api.model(model_id.to_string());
    let max_retries = max_retries.max(1);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        info!(model_id, "downloading model (attempt {}/{})", attempts, max_retries);
        match fetch_snapshot(&repo).await {
            Ok(dir) => {
                info!("model downloaded to {}", dir.display());
                return Ok(dir);
            }
            Err(e) => {
                if attempts >= max_retries {
                    return Err(anyhow!(
                        "failed to download model after {} attempts, last error: {}",
                        max_retries,
                        e
                    ));
                }
                warn!("download failed (attempt {}): {}, retrying in 2 seconds", attempts, e);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

pub fn get_file_path(file: &str) -> Result<PathBuf> {
    let url = url::Url::parse(file)?;
    match url.to_file_path() {
        Ok(path) => Ok(path),
        Err(_) => Ok(PathBuf::from(file.trim_start_matches("file://"))),
    }
}
