//! Shared CLI definitions for rowscope.
//!
//! Used by the main application and by the build script (manpage) and
//! gen_docs binary (command-line-options markdown).

use clap::{CommandFactory, Parser, ValueEnum};
use std::path::{Path, PathBuf};

/// Compression applied to exported CSV files
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum CompressionFormat {
    /// Gzip compression (.gz) - Most common, good balance of speed and compression
    Gzip,
    /// Zstandard compression (.zst) - Modern, fast compression with good ratios
    Zstd,
    /// Bzip2 compression (.bz2) - Good compression ratio, slower than gzip
    Bzip2,
    /// XZ compression (.xz) - Excellent compression ratio, slower than bzip2
    Xz,
}

impl CompressionFormat {
    /// Detect compression format from file extension
    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "gz" => Some(Self::Gzip),
                "zst" | "zstd" => Some(Self::Zstd),
                "bz2" | "bz" => Some(Self::Bzip2),
                "xz" => Some(Self::Xz),
                _ => None,
            })
    }

    /// Parse the name used in config files ("gzip", "zstd", "bzip2", "xz").
    /// "none" and the empty string mean no compression.
    pub fn from_name(name: &str) -> Result<Option<Self>, String> {
        match name.trim().to_lowercase().as_str() {
            "" | "none" => Ok(None),
            "gzip" | "gz" => Ok(Some(Self::Gzip)),
            "zstd" | "zst" => Ok(Some(Self::Zstd)),
            "bzip2" | "bz2" => Ok(Some(Self::Bzip2)),
            "xz" => Ok(Some(Self::Xz)),
            other => Err(format!(
                "Unknown compression '{}'. Expected none, gzip, zstd, bzip2 or xz",
                other
            )),
        }
    }

    /// Get file extension for this compression format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => "gz",
            Self::Zstd => "zst",
            Self::Bzip2 => "bz2",
            Self::Xz => "xz",
        }
    }
}

/// File format written by an export
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// Delimited text with a header row (.csv)
    #[default]
    Csv,
    /// Array of row objects keyed by column name (.json)
    Json,
}

impl ExportFormat {
    /// Parse the name used in config files ("csv", "json").
    pub fn from_name(name: &str) -> Result<Self, String> {
        match name.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(format!("Unknown export format '{}'. Expected csv or json", other)),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

/// Command-line arguments for rowscope
#[derive(Clone, Parser, Debug)]
#[command(
    name = "rowscope",
    version,
    about = "Large query results in the terminal",
    long_about = include_str!("../long_about.txt")
)]
pub struct Args {
    /// Question to run (numeric id or name). Falls back to [source] question_id in the config file
    #[arg(value_name = "QUESTION")]
    pub question: Option<String>,

    /// Base URL of the query service, e.g. http://localhost:8080 (overrides config)
    #[arg(long = "base-url", value_name = "URL")]
    pub base_url: Option<String>,

    /// Filter as KEY=VALUE. Repeat a key to send several values for it
    #[arg(long = "filter", short = 'f', value_name = "KEY=VALUE")]
    pub filters: Vec<String>,

    /// Load the result progressively from the streaming endpoint
    #[arg(long = "stream", action)]
    pub stream: bool,

    /// Rows per streamed chunk requested from the server (default: 5000)
    #[arg(long = "chunk-size", value_name = "N")]
    pub chunk_size: Option<usize>,

    /// Request timeout in seconds (default: 300)
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Attempts made before a failed request is reported (default: 3)
    #[arg(long = "retries", value_name = "N")]
    pub retries: Option<u32>,

    /// Rows drawn above and below the visible band (default: 100)
    #[arg(long = "buffer-rows", value_name = "N")]
    pub buffer_rows: Option<usize>,

    /// Display row numbers on the left side of the table
    #[arg(long = "row-numbers", action)]
    pub row_numbers: bool,

    /// Write the result to a file and exit without starting the table view
    #[arg(long = "export", action)]
    pub export: bool,

    /// Format of exported files (default: csv)
    #[arg(long = "export-format", value_enum)]
    pub export_format: Option<ExportFormat>,

    /// Wrap JSON exports in an object with the export time, row count and query
    #[arg(long = "json-metadata", action)]
    pub json_metadata: bool,

    /// Directory for exported files (default: current directory)
    #[arg(long = "export-dir", value_name = "DIR")]
    pub export_dir: Option<PathBuf>,

    /// Field delimiter for exported CSV (default: ',')
    #[arg(long = "delimiter", value_name = "CHAR")]
    pub delimiter: Option<char>,

    /// Compress exported files (gzip, zstd, bzip2, xz)
    #[arg(long = "compression", value_enum)]
    pub compression: Option<CompressionFormat>,

    /// Prefix exported CSV with a UTF-8 byte order mark (helps spreadsheet applications)
    #[arg(long = "bom", action)]
    pub bom: bool,

    /// Enable debug mode to show operational information and log lines
    #[arg(long = "debug", action)]
    pub debug: bool,

    /// Generate default configuration file at ~/.config/rowscope/config.toml
    #[arg(long = "generate-config", action)]
    pub generate_config: bool,

    /// Force overwrite existing config file when using --generate-config
    #[arg(long = "force", requires = "generate_config", action)]
    pub force: bool,
}

/// Escape `|` and newlines for use in markdown table cells.
fn escape_table_cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn value_placeholder(arg: &clap::Arg) -> String {
    arg.get_value_names()
        .map(|names| {
            names
                .iter()
                .map(|n: &clap::builder::Str| format!("<{}>", n.as_ref() as &str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Render command-line options as markdown.
pub fn render_options_markdown() -> String {
    let mut cmd = Args::command();
    cmd.build();

    let mut out = String::from("# Command Line Options\n\n");

    out.push_str("## Usage\n\n```\n");
    out.push_str(&cmd.render_usage().to_string());
    out.push_str("\n```\n\n");

    out.push_str("## Options\n\n");
    out.push_str("| Option | Description |\n");
    out.push_str("|--------|-------------|\n");

    for arg in cmd.get_arguments() {
        let id = arg.get_id().as_ref().to_string();
        if id == "help" || id == "version" {
            continue;
        }

        let option_str = if arg.is_positional() {
            let placeholder = value_placeholder(arg);
            if arg.is_required_set() {
                placeholder
            } else {
                format!("[{placeholder}]")
            }
        } else {
            let mut parts = Vec::new();
            if let Some(s) = arg.get_short() {
                parts.push(format!("-{s}"));
            }
            if let Some(l) = arg.get_long() {
                parts.push(format!("--{l}"));
            }
            let op = parts.join(", ");
            let placeholder = if arg.get_action().takes_values() {
                value_placeholder(arg)
            } else {
                String::new()
            };
            if placeholder.is_empty() {
                op
            } else {
                format!("{op} {placeholder}")
            }
        };

        let help = arg
            .get_help()
            .map(|h| escape_table_cell(&h.to_string()))
            .unwrap_or_else(|| "-".to_string());

        out.push_str(&format!("| `{option_str}` | {help} |\n"));
    }

    out
}
