use crate::export::LineEnding;
use crate::format::NumberLocale;
use crate::{CompressionFormat, ExportFormat};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use supports_color::Stream;

pub const CONFIG_VERSION: &str = "0.1";

/// Manages config directory and config file operations
#[derive(Clone, Debug)]
pub struct ConfigManager {
    pub(crate) config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a ConfigManager with a custom config directory (primarily for testing)
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn new(app_name: &str) -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| eyre!("Could not determine config directory"))?
            .join(app_name);
        Ok(Self { config_dir })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_path(&self, path: &str) -> PathBuf {
        self.config_dir.join(path)
    }

    pub fn ensure_config_dir(&self) -> Result<()> {
        if !self.config_dir.exists() {
            std::fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }

    pub fn generate_default_config(&self) -> String {
        DEFAULT_CONFIG_TEMPLATE.to_string()
    }

    /// Write the commented default config.toml. Refuses to overwrite an
    /// existing file unless `force` is set.
    pub fn write_default_config(&self, force: bool) -> Result<PathBuf> {
        let config_path = self.config_path("config.toml");
        if config_path.exists() && !force {
            return Err(eyre!(
                "Config file already exists at {}. Use --force to overwrite.",
                config_path.display()
            ));
        }
        self.ensure_config_dir()?;
        std::fs::write(&config_path, DEFAULT_CONFIG_TEMPLATE)?;
        Ok(config_path)
    }

    /// Parse config.toml from this directory. A missing file yields defaults.
    pub fn load_user_config(&self) -> Result<AppConfig> {
        let config_path = self.config_path("config.toml");
        if !config_path.exists() {
            return Ok(AppConfig::default());
        }
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            eyre!(
                "Failed to read config file at {}: {}",
                config_path.display(),
                e
            )
        })?;
        toml::from_str(&content).map_err(|e| {
            eyre!(
                "Failed to parse config file at {}: {}",
                config_path.display(),
                e
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Configuration format version
    pub version: String,
    pub source: SourceConfig,
    pub fetch: FetchConfig,
    pub stream: StreamConfig,
    pub display: DisplayConfig,
    pub export: ExportConfig,
    pub performance: PerformanceConfig,
    pub theme: ThemeConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub query_path: String,
    pub stream_path: String,
    /// Question run when none is given on the command line.
    pub question_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts per request, the first one included.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub timeout_secs: u64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    /// Rows per chunk requested from the server. 0 leaves it to the server.
    pub chunk_size: usize,
    pub max_events_per_tick: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub row_height: u64,
    pub buffer_rows: usize,
    pub rerender_threshold: usize,
    pub direct_render_limit: usize,
    pub scroll_throttle_ms: u64,
    pub number_locale: String,
    pub date_format: String,
    pub datetime_format: String,
    pub row_numbers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// "csv" or "json"
    pub format: String,
    pub chunk_size: usize,
    pub delimiter: char,
    pub line_ending: LineEnding,
    pub byte_order_mark: bool,
    pub compression: String,
    pub directory: Option<PathBuf>,
    /// Write cells the way the table shows them instead of raw values.
    pub use_display_format: bool,
    /// Wrap JSON exports with the export time, row count and query.
    pub include_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub event_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemeConfig {
    pub color_mode: String,
    pub colors: ColorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub primary: String,
    pub secondary: String,
    pub success: String,
    pub error: String,
    pub warning: String,
    pub dimmed: String,
    pub controls_bg: String,
    pub text_primary: String,
    pub table_header: String,
    pub table_header_bg: String,
    pub row_numbers: String,
    pub alternate_row_bg: String,
    pub modal_border: String,
    pub modal_border_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    pub log_level: String,
    pub log_lines: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            source: SourceConfig::default(),
            fetch: FetchConfig::default(),
            stream: StreamConfig::default(),
            display: DisplayConfig::default(),
            export: ExportConfig::default(),
            performance: PerformanceConfig::default(),
            theme: ThemeConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            query_path: "api/query".to_string(),
            stream_path: "api/query/stream".to_string(),
            question_id: None,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            timeout_secs: 300,
            cache_capacity: 10,
            cache_ttl_secs: 300,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chunk_size: 5000,
            max_events_per_tick: 32,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            row_height: 30,
            buffer_rows: 100,
            rerender_threshold: 20,
            direct_render_limit: 1000,
            scroll_throttle_ms: 16,
            number_locale: "plain".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            datetime_format: "%Y-%m-%d %H:%M:%S".to_string(),
            row_numbers: false,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: "csv".to_string(),
            chunk_size: 50_000,
            delimiter: ',',
            line_ending: LineEnding::Lf,
            byte_order_mark: false,
            compression: "none".to_string(),
            directory: None,
            use_display_format: false,
            include_metadata: false,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            event_poll_interval_ms: 25,
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            color_mode: "auto".to_string(),
            colors: ColorConfig::default(),
        }
    }
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            primary: "cyan".to_string(),
            secondary: "yellow".to_string(),
            success: "green".to_string(),
            error: "red".to_string(),
            warning: "yellow".to_string(),
            dimmed: "dark_gray".to_string(),
            controls_bg: "indexed(236)".to_string(),
            text_primary: "white".to_string(),
            table_header: "white".to_string(),
            table_header_bg: "indexed(236)".to_string(),
            row_numbers: "dark_gray".to_string(),
            alternate_row_bg: "reset".to_string(),
            modal_border: "cyan".to_string(),
            modal_border_error: "red".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: "info".to_string(),
            log_lines: crate::logging::DEFAULT_LOG_LINES,
        }
    }
}

/// Assign `other.$field` wherever it differs from the section default.
macro_rules! merge_changed {
    ($self:ident, $other:ident, $default:ident, [$($field:ident),* $(,)?]) => {
        $(
            if $other.$field != $default.$field {
                $self.$field = $other.$field;
            }
        )*
    };
}

impl AppConfig {
    /// Defaults overlaid with the user's config.toml, validated.
    pub fn load(app_name: &str) -> Result<Self> {
        Self::load_from(&ConfigManager::new(app_name)?)
    }

    pub fn load_from(manager: &ConfigManager) -> Result<Self> {
        let mut config = AppConfig::default();
        config.merge(manager.load_user_config()?);
        config.validate()?;
        Ok(config)
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: AppConfig) {
        if other.version != CONFIG_VERSION {
            self.version = other.version;
        }
        self.source.merge(other.source);
        self.fetch.merge(other.fetch);
        self.stream.merge(other.stream);
        self.display.merge(other.display);
        self.export.merge(other.export);
        self.performance.merge(other.performance);
        self.theme.merge(other.theme);
        self.debug.merge(other.debug);
    }

    pub fn validate(&self) -> Result<()> {
        if !self.version.starts_with(CONFIG_VERSION) {
            return Err(eyre!(
                "Unsupported config version: {}. Expected {}.x",
                self.version,
                CONFIG_VERSION
            ));
        }

        if self.source.base_url.trim().is_empty() {
            return Err(eyre!("source.base_url must not be empty"));
        }
        if self.fetch.max_retries == 0 {
            return Err(eyre!("fetch.max_retries must be at least 1"));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(eyre!("fetch.timeout_secs must be greater than 0"));
        }
        if self.stream.max_events_per_tick == 0 {
            return Err(eyre!("stream.max_events_per_tick must be greater than 0"));
        }
        if self.display.row_height == 0 {
            return Err(eyre!("display.row_height must be greater than 0"));
        }
        if self.display.rerender_threshold == 0 {
            return Err(eyre!("display.rerender_threshold must be greater than 0"));
        }
        if NumberLocale::from_name(&self.display.number_locale).is_none() {
            return Err(eyre!(
                "Invalid number_locale: {}. Must be 'plain', 'pt-br' or 'en-us'",
                self.display.number_locale
            ));
        }
        if self.export.chunk_size == 0 {
            return Err(eyre!("export.chunk_size must be greater than 0"));
        }
        if !self.export.delimiter.is_ascii() || matches!(self.export.delimiter, '"' | '\n' | '\r')
        {
            return Err(eyre!(
                "export.delimiter must be an ASCII character other than a quote or line break"
            ));
        }
        self.export.compression_format()?;
        self.export.export_format()?;
        if self.performance.event_poll_interval_ms == 0 {
            return Err(eyre!("event_poll_interval_ms must be greater than 0"));
        }
        if crate::logging::parse_level(&self.debug.log_level).is_none() {
            return Err(eyre!(
                "Invalid log_level: {}. Must be off, error, warn, info, debug or trace",
                self.debug.log_level
            ));
        }

        match self.theme.color_mode.as_str() {
            "light" | "dark" | "auto" => {}
            _ => {
                return Err(eyre!(
                    "Invalid color_mode: {}. Must be 'light', 'dark', or 'auto'",
                    self.theme.color_mode
                ))
            }
        }
        self.theme.colors.validate(&ColorParser::new())
    }
}

impl SourceConfig {
    pub fn merge(&mut self, other: Self) {
        let default = SourceConfig::default();
        merge_changed!(self, other, default, [base_url, query_path, stream_path]);
        if other.question_id.is_some() {
            self.question_id = other.question_id;
        }
    }
}

impl FetchConfig {
    pub fn merge(&mut self, other: Self) {
        let default = FetchConfig::default();
        merge_changed!(
            self,
            other,
            default,
            [max_retries, base_delay_ms, timeout_secs, cache_capacity, cache_ttl_secs]
        );
    }
}

impl StreamConfig {
    pub fn merge(&mut self, other: Self) {
        let default = StreamConfig::default();
        merge_changed!(self, other, default, [enabled, chunk_size, max_events_per_tick]);
    }
}

impl DisplayConfig {
    pub fn merge(&mut self, other: Self) {
        let default = DisplayConfig::default();
        merge_changed!(
            self,
            other,
            default,
            [
                row_height,
                buffer_rows,
                rerender_threshold,
                direct_render_limit,
                scroll_throttle_ms,
                number_locale,
                date_format,
                datetime_format,
                row_numbers,
            ]
        );
    }

    pub fn locale(&self) -> NumberLocale {
        NumberLocale::from_name(&self.number_locale).unwrap_or_default()
    }
}

impl ExportConfig {
    pub fn merge(&mut self, other: Self) {
        let default = ExportConfig::default();
        merge_changed!(
            self,
            other,
            default,
            [
                format,
                chunk_size,
                delimiter,
                line_ending,
                byte_order_mark,
                compression,
                use_display_format,
                include_metadata,
            ]
        );
        if other.directory.is_some() {
            self.directory = other.directory;
        }
    }

    pub fn compression_format(&self) -> Result<Option<CompressionFormat>> {
        CompressionFormat::from_name(&self.compression).map_err(|e| eyre!("export.compression: {}", e))
    }

    pub fn export_format(&self) -> Result<ExportFormat> {
        ExportFormat::from_name(&self.format).map_err(|e| eyre!("export.format: {}", e))
    }
}

impl PerformanceConfig {
    pub fn merge(&mut self, other: Self) {
        let default = PerformanceConfig::default();
        merge_changed!(self, other, default, [event_poll_interval_ms]);
    }
}

impl ThemeConfig {
    pub fn merge(&mut self, other: Self) {
        let default = ThemeConfig::default();
        if other.color_mode != default.color_mode {
            self.color_mode = other.color_mode;
        }
        self.colors.merge(other.colors);
    }
}

impl ColorConfig {
    /// (name, value) for every configurable color.
    pub fn entries(&self) -> [(&'static str, &str); 14] {
        [
            ("primary", self.primary.as_str()),
            ("secondary", self.secondary.as_str()),
            ("success", self.success.as_str()),
            ("error", self.error.as_str()),
            ("warning", self.warning.as_str()),
            ("dimmed", self.dimmed.as_str()),
            ("controls_bg", self.controls_bg.as_str()),
            ("text_primary", self.text_primary.as_str()),
            ("table_header", self.table_header.as_str()),
            ("table_header_bg", self.table_header_bg.as_str()),
            ("row_numbers", self.row_numbers.as_str()),
            ("alternate_row_bg", self.alternate_row_bg.as_str()),
            ("modal_border", self.modal_border.as_str()),
            ("modal_border_error", self.modal_border_error.as_str()),
        ]
    }

    fn validate(&self, parser: &ColorParser) -> Result<()> {
        for (name, value) in self.entries() {
            parser
                .parse(value)
                .map_err(|e| eyre!("Invalid color value for '{}': {}", name, e))?;
        }
        Ok(())
    }

    pub fn merge(&mut self, other: Self) {
        let default = ColorConfig::default();
        merge_changed!(
            self,
            other,
            default,
            [
                primary,
                secondary,
                success,
                error,
                warning,
                dimmed,
                controls_bg,
                text_primary,
                table_header,
                table_header_bg,
                row_numbers,
                alternate_row_bg,
                modal_border,
                modal_border_error,
            ]
        );
    }
}

impl DebugConfig {
    pub fn merge(&mut self, other: Self) {
        let default = DebugConfig::default();
        merge_changed!(self, other, default, [enabled, log_level, log_lines]);
    }
}

const NAMED_COLORS: &[(&[&str], Color)] = &[
    (&["black"], Color::Black),
    (&["red"], Color::Red),
    (&["green"], Color::Green),
    (&["yellow"], Color::Yellow),
    (&["blue"], Color::Blue),
    (&["magenta"], Color::Magenta),
    (&["cyan"], Color::Cyan),
    (&["white"], Color::White),
    (&["bright_black", "gray", "grey", "dark_gray", "dark_grey"], Color::Indexed(8)),
    (&["bright_red"], Color::Indexed(9)),
    (&["bright_green"], Color::Indexed(10)),
    (&["bright_yellow"], Color::Indexed(11)),
    (&["bright_blue"], Color::Indexed(12)),
    (&["bright_magenta"], Color::Indexed(13)),
    (&["bright_cyan"], Color::Indexed(14)),
    (&["bright_white"], Color::Indexed(15)),
    (&["light_gray", "light_grey"], Color::Indexed(7)),
    (&["reset", "reversed", "none"], Color::Reset),
];

/// Color parser with terminal capability detection
#[derive(Debug, Clone, Copy)]
pub struct ColorParser {
    supports_true_color: bool,
    supports_256: bool,
    no_color: bool,
}

impl ColorParser {
    pub fn new() -> Self {
        let support = supports_color::on(Stream::Stdout);
        Self {
            supports_true_color: support.as_ref().is_some_and(|s| s.has_16m),
            supports_256: support.as_ref().is_some_and(|s| s.has_256),
            no_color: std::env::var_os("NO_COLOR").is_some(),
        }
    }

    /// Parser with fixed capabilities, independent of the current terminal.
    pub fn with_capabilities(true_color: bool, colors_256: bool) -> Self {
        Self {
            supports_true_color: true_color,
            supports_256: colors_256,
            no_color: false,
        }
    }

    /// Named color, `#rrggbb`, or `indexed(N)`.
    pub fn parse(&self, s: &str) -> Result<Color> {
        if self.no_color {
            return Ok(Color::Reset);
        }
        let value = s.trim();

        if let Some(hex) = value.strip_prefix('#') {
            let (r, g, b) = parse_hex(hex).ok_or_else(|| {
                eyre!("Invalid hex color format: '{}'. Expected format: #rrggbb", value)
            })?;
            return Ok(self.downsample(r, g, b));
        }

        let lower = value.to_lowercase().replace(' ', "_");
        if let Some(index) = lower
            .strip_prefix("indexed(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return index.trim().parse::<u8>().map(Color::Indexed).map_err(|_| {
                eyre!(
                    "Invalid indexed color: '{}'. Expected format: indexed(0-255)",
                    value
                )
            });
        }

        NAMED_COLORS
            .iter()
            .find(|(names, _)| names.contains(&lower.as_str()))
            .map(|(_, color)| *color)
            .ok_or_else(|| {
                eyre!(
                    "Unknown color name: '{}'. Use a basic ANSI name (red, bright_blue, ...), \
                     indexed(N) or #rrggbb",
                    value
                )
            })
    }

    fn downsample(&self, r: u8, g: u8, b: u8) -> Color {
        if self.supports_true_color {
            Color::Rgb(r, g, b)
        } else if self.supports_256 {
            Color::Indexed(rgb_to_256_color(r, g, b))
        } else {
            rgb_to_basic_ansi(r, g, b)
        }
    }
}

impl Default for ColorParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hex(hex: &str) -> Option<(u8, u8, u8)> {
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some((channel(0)?, channel(2)?, channel(4)?))
}

fn spread(r: u8, g: u8, b: u8) -> u8 {
    r.max(g).max(b) - r.min(g).min(b)
}

/// Nearest index in the xterm 256-color palette.
pub fn rgb_to_256_color(r: u8, g: u8, b: u8) -> u8 {
    if spread(r, g, b) < 10 {
        let gray = (u16::from(r) + u16::from(g) + u16::from(b)) / 3;
        return match gray {
            0..=7 => 16,
            248.. => 231,
            _ => 232 + ((gray - 8) * 24 / 240) as u8,
        };
    }
    let level = |c: u8| (u16::from(c) * 5 / 255) as u8;
    16 + 36 * level(r) + 6 * level(g) + level(b)
}

/// Nearest of the eight basic ANSI colors.
pub fn rgb_to_basic_ansi(r: u8, g: u8, b: u8) -> Color {
    if spread(r, g, b) < 30 {
        let avg = (u16::from(r) + u16::from(g) + u16::from(b)) / 3;
        return if avg < 64 { Color::Black } else { Color::White };
    }
    match (r > 128, g > 128, b > 128) {
        (false, false, false) => Color::Black,
        (true, false, false) => Color::Red,
        (false, true, false) => Color::Green,
        (true, true, false) => Color::Yellow,
        (false, false, true) => Color::Blue,
        (true, false, true) => Color::Magenta,
        (false, true, true) => Color::Cyan,
        (true, true, true) => Color::White,
    }
}

/// Parsed theme colors keyed by config name.
#[derive(Debug, Clone)]
pub struct Theme {
    pub colors: HashMap<String, Color>,
}

impl Theme {
    pub fn from_config(config: &ThemeConfig) -> Result<Self> {
        Self::from_config_with(config, &ColorParser::new())
    }

    pub fn from_config_with(config: &ThemeConfig, parser: &ColorParser) -> Result<Self> {
        let colors = config
            .colors
            .entries()
            .into_iter()
            .map(|(name, value)| Ok((name.to_string(), parser.parse(value)?)))
            .collect::<Result<_>>()?;
        Ok(Self { colors })
    }

    /// Color by name, Reset if unknown
    pub fn get(&self, name: &str) -> Color {
        self.colors.get(name).copied().unwrap_or(Color::Reset)
    }

    /// Color by name; None when unknown or set to reset.
    pub fn get_optional(&self, name: &str) -> Option<Color> {
        self.colors
            .get(name)
            .copied()
            .filter(|c| *c != Color::Reset)
    }
}

impl Default for Theme {
    fn default() -> Self {
        // the built-in colors are known to parse
        Self::from_config_with(&ThemeConfig::default(), &ColorParser::with_capabilities(true, true))
            .unwrap_or(Self {
                colors: HashMap::new(),
            })
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../config/default.toml");
