//! CLI binary for dossier.
//!
//! A thin shim over the library crate that loads the uploads and the form
//! file, maps CLI flags to `DossierConfig` and writes the resulting DOCX.

use anyhow::{Context, Result};
use clap::Parser;
use dossier::{
    generate_to_file, load_upload, BalanceSheetMode, DossierConfig, FormInput,
    GenerationProgressCallback, InputBundle, PlaceholderPolicy, ProgressCallback, Slot, SourceFormat,
    Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tool_auto::Tool;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: [&str; 11] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: a spinner naming the current stage, plus one log line
/// per finished stage.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&TICKS);
        bar.set_style(style);
        bar.set_prefix("Dossier");
        bar.set_message("Starting…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl GenerationProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_message(format!("{stage}…"));
    }

    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<26} {}",
            green("✓"),
            stage.label(),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_remediation_start(&self, tool: &str) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{tool} not found; downloading it (first run only)…"))
        ));
    }

    fn on_generation_complete(&self, _total_bytes: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Balance sheet as a two-page PDF
  dossier --form form.json --balance-sheet balanco.pdf \
          --income-statement dre.pdf --notes notas.md --letter carta.docx

  # Balance sheet as two images, output into a directory
  dossier --form form.json --balance-sheet-part1 ativo.png --balance-sheet-part2 passivo.png \
          --income-statement dre.png --notes notas.txt --letter carta.md -o out/

  # Inputs from URLs, fail when a placeholder is missing from the template
  dossier --form form.json --balance-sheet https://example.com/balanco.pdf ... --unmatched error

FORM FILE (JSON):
  {
    "company_name": "Acme Ltda",
    "legal_name": "Acme Comércio Ltda",
    "company_tax_id": "12.345.678/0001-90",
    "period_start": "2030-01-01",
    "period_end": "2030-12-31",
    "partners": [ { "name": "Maria Silva", "tax_id": "123.456.789-00", "role": "Sócia" } ]
  }
  Explicit "fiscal_period", "fiscal_period_short" and "statements_closing_date"
  labels may replace the date pair.

ENVIRONMENT VARIABLES:
  DOSSIER_TEMPLATE      Path to the DOCX template
  PANDOC_PATH           Path to an existing pandoc executable (skips download)
  PDFIUM_LIB_PATH       Path to an existing libpdfium (skips download)
  TOOL_AUTO_CACHE_DIR   Override the tool cache directory

SETUP:
  pdfium (~30 MB) and pandoc (~40 MB) are downloaded automatically the first
  time they are needed and cached in ~/.cache/dossier/.
"#;

/// Assemble an accounting dossier (DOCX) from a template, form data and uploads.
#[derive(Parser, Debug)]
#[command(
    name = "dossier",
    version,
    about = "Assemble an accounting dossier (DOCX) from a template, form data and uploads",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// JSON file with the form data.
    #[arg(long, env = "DOSSIER_FORM")]
    form: PathBuf,

    /// Balance sheet as one PDF with at least two pages (path or URL).
    #[arg(long, conflicts_with_all = ["balance_sheet_part1", "balance_sheet_part2"])]
    balance_sheet: Option<String>,

    /// First balance-sheet page as a PNG/JPEG image (path or URL).
    #[arg(long, requires = "balance_sheet_part2")]
    balance_sheet_part1: Option<String>,

    /// Second balance-sheet page as a PNG/JPEG image (path or URL).
    #[arg(long, requires = "balance_sheet_part1")]
    balance_sheet_part2: Option<String>,

    /// Income statement: PDF, image, DOCX or markup (path or URL).
    #[arg(long)]
    income_statement: Option<String>,

    /// Explanatory notes: Markdown, text, HTML, ODT, DOCX or PDF (path or URL).
    #[arg(long)]
    notes: Option<String>,

    /// Liability letter: Markdown, text, HTML, ODT, DOCX or PDF (path or URL).
    #[arg(long)]
    letter: Option<String>,

    /// DOCX template.
    #[arg(long, env = "DOSSIER_TEMPLATE", default_value = dossier::config::DEFAULT_TEMPLATE_PATH)]
    template: PathBuf,

    /// Output file, or a directory to write Dossie_Contabil_<company>.docx into.
    #[arg(short, long, env = "DOSSIER_OUTPUT", default_value = ".")]
    output: PathBuf,

    /// Balance-sheet rendering DPI (72–600).
    #[arg(long, env = "DOSSIER_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// What to do when a placeholder is missing from the template.
    #[arg(long, env = "DOSSIER_UNMATCHED", value_enum, default_value = "ignore")]
    unmatched: UnmatchedArg,

    /// Do not apply the template's styles to converted documents.
    #[arg(long)]
    no_template_styles: bool,

    /// Parent directory for per-run scratch files.
    #[arg(long, env = "DOSSIER_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Print run statistics as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Disable the progress display.
    #[arg(long, env = "DOSSIER_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOSSIER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOSSIER_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds for URL inputs and tool archives.
    #[arg(long, env = "DOSSIER_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum UnmatchedArg {
    Ignore,
    Error,
}

impl From<UnmatchedArg> for PlaceholderPolicy {
    fn from(v: UnmatchedArg) -> Self {
        match v {
            UnmatchedArg::Ignore => PlaceholderPolicy::Ignore,
            UnmatchedArg::Error => PlaceholderPolicy::Error,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress display replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Load inputs ──────────────────────────────────────────────────────
    let form_json = tokio::fs::read_to_string(&cli.form)
        .await
        .with_context(|| format!("Failed to read form file {:?}", cli.form))?;
    let context = FormInput::from_json(&form_json)?.into_context()?;
    let (bundle, mode) = load_bundle(&cli).await?;

    // ── Fetch missing tools with a visible download bar ─────────────────
    for tool in tools_needed(&bundle) {
        ensure_tool_interactive(tool, Duration::from_secs(cli.download_timeout), cli.quiet)?;
    }

    // ── Build config ─────────────────────────────────────────────────────
    let mut builder = DossierConfig::builder()
        .template_path(&cli.template)
        .dpi(cli.dpi)
        .balance_sheet_mode(mode)
        .unmatched_placeholder(cli.unmatched.into())
        .use_template_styles(!cli.no_template_styles)
        .download_timeout_secs(cli.download_timeout);
    if let Some(dir) = &cli.scratch_dir {
        builder = builder.scratch_root(dir);
    }
    if show_progress {
        builder = builder.progress_callback(CliProgressCallback::new() as ProgressCallback);
    }
    let config = builder.build().context("Invalid configuration")?;

    // ── Run ──────────────────────────────────────────────────────────────
    let (path, stats) = generate_to_file(&bundle, context, &config, &cli.output)
        .await
        .context("Dossier generation failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&stats).context("Failed to serialise stats")?
        );
    }
    if !cli.quiet {
        eprintln!(
            "{}  {}ms  →  {}",
            green("✔"),
            stats.total_duration_ms,
            bold(&path.display().to_string()),
        );
        for token in &stats.unmatched_placeholders {
            eprintln!("   {} {} not found in the template", cyan("⚠"), token);
        }
    }
    Ok(())
}

/// Read every given input into a bundle and pick the balance-sheet mode.
async fn load_bundle(cli: &Cli) -> Result<(InputBundle, BalanceSheetMode)> {
    let mode = if cli.balance_sheet_part1.is_some() {
        BalanceSheetMode::SplitImages
    } else {
        BalanceSheetMode::TwoPagePdf
    };
    let sources = [
        (Slot::BalanceSheet, &cli.balance_sheet),
        (Slot::BalanceSheetPart1, &cli.balance_sheet_part1),
        (Slot::BalanceSheetPart2, &cli.balance_sheet_part2),
        (Slot::IncomeStatement, &cli.income_statement),
        (Slot::ExplanatoryNotes, &cli.notes),
        (Slot::LiabilityLetter, &cli.letter),
    ];
    let mut bundle = InputBundle::new();
    for (slot, source) in sources {
        if let Some(source) = source {
            let upload = load_upload(source, cli.download_timeout)
                .await
                .with_context(|| format!("Failed to load '{slot}' from {source}"))?;
            bundle.insert(slot, upload);
        }
    }
    Ok((bundle, mode))
}

/// External tools the bundle's formats call for.
fn tools_needed(bundle: &InputBundle) -> Vec<Tool> {
    let formats: Vec<SourceFormat> = bundle
        .slots()
        .filter_map(|s| bundle.get(s).and_then(|u| u.format()))
        .collect();
    let mut tools = Vec::new();
    if formats.contains(&SourceFormat::Pdf) {
        tools.push(Tool::Pdfium);
    }
    if formats.iter().any(|f| dossier::pipeline::convert::needs_converter(*f)) {
        tools.push(Tool::Pandoc);
    }
    tools
}

/// Download `tool` once with a byte-level progress bar. The library's own
/// availability check then finds the cached copy.
fn ensure_tool_interactive(tool: Tool, timeout: Duration, quiet: bool) -> Result<()> {
    if tool_auto::locate_tool(tool).is_some() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| tool_auto::install_tool_with_timeout(tool, timeout, None))
            .with_context(|| format!("Failed to download {}", tool.name()))?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&TICKS),
    );
    dl_bar.set_prefix(tool.name());
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        tool_auto::install_tool_with_timeout(
            tool,
            timeout,
            Some(&|downloaded, total| {
                if let Some(t) = total {
                    if bar.length().unwrap_or(0) != t {
                        bar.set_length(t);
                    }
                }
                bar.set_position(downloaded);
            }),
        )
    })
    .with_context(|| format!("Failed to download {}", tool.name()))?;
    dl_bar.finish_with_message("ready ✓");
    Ok(())
}
