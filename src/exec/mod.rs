//! Direct inference for the `run` subcommand.

pub mod showui;

use anyhow::Result;

/// One-shot grounding from the command line.
pub trait ExecModel {
    /// * `image` - a local path or an `http(s)://`, `file://` or `data:` url
    /// * `query` - description of the element to locate
    /// * `output` - optional file the result is written to
    /// * `weight_path` - local model directory
    fn run(image: &str, query: &str, output: Option<&str>, weight_path: &str) -> Result<()>;
}
