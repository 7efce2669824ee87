//! Colorful console output for JIT activity.
//!
//! Provides a custom `tracing` layer that formats Kiln JIT events with colors.
//!
//! ## Log Levels
//!
//! - **INFO**: Provider loading and context creation
//! - **DEBUG**: Materialized batches and released contexts
//! - **ERROR**: Fatal failures inside a foreign backend

use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT: OnceLock<()> = OnceLock::new();
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Package version for the startup line.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes console output for JIT events.
///
/// Safe to call multiple times - only the first call has effect. `RUST_LOG`
/// overrides the default `kiln_jit=info` filter.
pub fn init() {
    INIT.get_or_init(|| {
        EPOCH.get_or_init(Instant::now);
        print_banner();

        let filter = EnvFilter::builder()
            .with_default_directive(
                "kiln_jit=info"
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::INFO.into()),
            )
            .from_env_lossy();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(JitConsoleLayer)
            .try_init();
    });
}

fn elapsed_secs() -> f64 {
    EPOCH.get().map_or(0.0, |epoch| epoch.elapsed().as_secs_f64())
}

fn print_banner() {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(
        stdout,
        "{} {}",
        "kiln".bright_cyan().bold(),
        format!("v{VERSION} - JIT dispatch").bright_white()
    );
    let _ = stdout.flush();
}

/// A tracing layer that formats JIT events with colors.
pub struct JitConsoleLayer;

impl<S: Subscriber> Layer<S> for JitConsoleLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with("kiln") {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let output = format_event(&visitor, *metadata.level());
        if !output.is_empty() {
            let _ = writeln!(io::stdout(), "{}", output);
        }
    }
}

#[derive(Default)]
struct EventVisitor {
    event: Option<String>,
    message: Option<String>,
    provider: Option<String>,
    unit: Option<String>,
    decision: Option<String>,
    context: Option<u64>,
    functions: Option<u64>,
    duration_us: Option<u64>,
    exit_code: Option<u64>,
    cost: Option<f64>,
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let s = format!("{:?}", value);
        let s = s.trim_matches('"').to_string();
        match field.name() {
            "event" => self.event = Some(s),
            "message" => self.message = Some(s),
            "provider" => self.provider = Some(s),
            "unit" => self.unit = Some(s),
            "decision" => self.decision = Some(s),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "context" => self.context = Some(value),
            "functions" => self.functions = Some(value),
            "duration_us" => self.duration_us = Some(value),
            "exit_code" => self.exit_code = Some(value),
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_u64(field, value as u64);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if field.name() == "cost" {
            self.cost = Some(value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "event" => self.event = Some(value.to_string()),
            "message" => self.message = Some(value.to_string()),
            "provider" => self.provider = Some(value.to_string()),
            "unit" => self.unit = Some(value.to_string()),
            "decision" => self.decision = Some(value.to_string()),
            _ => {}
        }
    }
}

fn format_event(v: &EventVisitor, level: Level) -> String {
    match v.event.as_deref().unwrap_or("") {
        "jit_provider_loaded" => format_provider_loaded(v),
        "jit_provider_unavailable" => format_provider_unavailable(v),
        "jit_context_created" => format_context_created(v),
        "jit_materialize" => format_materialize(v, level),
        "jit_context_released" => format_context_released(v, level),
        "jit_foreign_fatal" => format_foreign_fatal(v),
        _ => String::new(),
    }
}

fn format_elapsed() -> String {
    format!("{:>7.3}s", elapsed_secs())
        .bright_black()
        .to_string()
}

fn format_provider_loaded(v: &EventVisitor) -> String {
    format!(
        "{} {} Provider {} loaded",
        format_elapsed(),
        "●".bright_green().bold(),
        v.provider.as_deref().unwrap_or("?").white().bold()
    )
}

fn format_provider_unavailable(v: &EventVisitor) -> String {
    format!(
        "{} {} Provider {} unavailable │ {}",
        format_elapsed(),
        "○".yellow().bold(),
        v.provider.as_deref().unwrap_or("?").white().bold(),
        v.message.as_deref().unwrap_or("").yellow()
    )
}

fn format_context_created(v: &EventVisitor) -> String {
    let mut output = format!(
        "{} {} Context {} │ {}",
        format_elapsed(),
        "▶".bright_blue(),
        v.context.unwrap_or(0).to_formatted_string(&Locale::en).white().bold(),
        v.decision.as_deref().unwrap_or("jit").bright_magenta()
    );
    if let Some(unit) = &v.unit {
        output.push_str(&format!(" │ {}", unit.white()));
    }
    if let Some(cost) = v.cost {
        output.push_str(&format!(
            " │ cost {}",
            (cost as u64).to_formatted_string(&Locale::en).bright_yellow()
        ));
    }
    output
}

fn format_materialize(v: &EventVisitor, level: Level) -> String {
    if level < Level::DEBUG {
        return String::new();
    }
    format!(
        "{} {} Context {} │ {} functions │ {}",
        format_elapsed(),
        "⚡".bright_cyan(),
        v.context.unwrap_or(0).to_formatted_string(&Locale::en).white(),
        v.functions
            .unwrap_or(0)
            .to_formatted_string(&Locale::en)
            .bright_magenta()
            .bold(),
        format_duration_us(v.duration_us.unwrap_or(0)).yellow()
    )
}

fn format_context_released(v: &EventVisitor, level: Level) -> String {
    if level < Level::DEBUG {
        return String::new();
    }
    format!(
        "{} {} Context {} released │ {} functions",
        format_elapsed(),
        "◀".bright_blue(),
        v.context.unwrap_or(0).to_formatted_string(&Locale::en).white(),
        v.functions.unwrap_or(0).to_formatted_string(&Locale::en).white()
    )
}

fn format_foreign_fatal(v: &EventVisitor) -> String {
    format!(
        "{} {} Fatal backend error │ {} │ exit {}",
        format_elapsed(),
        "✗".bright_red().bold(),
        v.message.as_deref().unwrap_or("").bright_red(),
        v.exit_code.unwrap_or(0)
    )
}

fn format_duration_us(us: u64) -> String {
    if us < 1000 {
        format!("{}µs", us)
    } else if us < 1_000_000 {
        format!("{:.2}ms", us as f64 / 1000.0)
    } else {
        format!("{:.2}s", us as f64 / 1_000_000.0)
    }
}
