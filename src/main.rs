use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracevault_core::cancel::Cancellation;
use tracevault_core::config::StorageConfig;
use tracevault_core::query::{DAY_MILLIS, QueryRequest};
use tracevault_core::storage::{AutocompleteTags, DependencyStore, SpanConsumer, SpanStore};
use tracevault_core::trace::{DependencyLink, Span, Trace, TraceId};
use tracevault_storage::TraceStorage;
use tracing::info;

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "tracevault",
    about = "Indexed storage and search for distributed traces",
    version
)]
struct Cli {
    /// Directory for trace storage.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON file with storage settings. Flags below override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Logical namespace for all tables.
    #[arg(long)]
    keyspace: Option<String>,

    /// Skip index writes; only trace ID lookups will work.
    #[arg(long)]
    search_disabled: bool,

    /// Treat 64-bit and 128-bit trace IDs with the same lower half as one trace.
    #[arg(long)]
    no_strict_trace_id: bool,

    /// Tag key whose values are kept for autocompletion. Repeatable.
    #[arg(long = "autocomplete-key", value_name = "KEY")]
    autocomplete_keys: Vec<String>,

    /// Abort a search after this many milliseconds.
    #[arg(long, value_name = "MS")]
    query_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store spans read from FILE (stdin when absent): a JSON array or one span per line.
    Ingest { file: Option<PathBuf> },
    /// Search traces.
    Traces {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        span: Option<String>,
        /// e.g. `error and http.method=GET`
        #[arg(long)]
        annotation_query: Option<String>,
        /// Microseconds.
        #[arg(long)]
        min_duration: Option<u64>,
        /// Microseconds.
        #[arg(long)]
        max_duration: Option<u64>,
        /// Epoch milliseconds, defaults to now.
        #[arg(long)]
        end_ts: Option<u64>,
        /// Milliseconds.
        #[arg(long, default_value_t = DAY_MILLIS)]
        lookback: u64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the spans of one or more traces.
    Trace {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List service names.
    Services,
    /// List span names of a service.
    Spans { service: String },
    /// Print dependency links for a window.
    Dependencies {
        /// Epoch milliseconds, defaults to now.
        #[arg(long)]
        end_ts: Option<u64>,
        #[arg(long, default_value_t = DAY_MILLIS)]
        lookback: u64,
    },
    /// Store pre-aggregated links from a JSON array file for the day containing DAY_MS.
    WriteDependencies { day_ms: u64, file: PathBuf },
    /// List autocomplete tag keys.
    TagKeys,
    /// List recorded values of an autocomplete tag key.
    TagValues { key: String },
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tracevault")
        .join("data")
}

fn load_config(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => StorageConfig::default(),
    };
    if let Some(keyspace) = &cli.keyspace {
        config.keyspace = keyspace.clone();
    }
    if cli.search_disabled {
        config.search_enabled = false;
    }
    if cli.no_strict_trace_id {
        config.strict_trace_id = false;
    }
    config
        .autocomplete_keys
        .extend(cli.autocomplete_keys.iter().cloned());
    if cli.query_timeout_ms.is_some() {
        config.query_timeout_ms = cli.query_timeout_ms;
    }
    Ok(config)
}

/// Accepts a JSON array of spans or JSON Lines.
fn parse_spans(input: &str) -> anyhow::Result<Vec<Span>> {
    if input.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(input)?);
    }
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| anyhow::anyhow!("line {}: {e}", i + 1))
        })
        .collect()
}

fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSONL output
// ─────────────────────────────────────────────────────────────────────────────

/// One search result per line: summary fields followed by the spans.
#[derive(Serialize)]
struct JsonlTrace<'a> {
    trace_id: String,
    /// Epoch milliseconds of the earliest span.
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp_ms: Option<u64>,
    span_count: usize,
    services: BTreeSet<&'a str>,
    spans: &'a [Span],
}

fn trace_to_jsonl(t: &Trace) -> JsonlTrace<'_> {
    JsonlTrace {
        trace_id: t.trace_id.to_string(),
        timestamp_ms: t.timestamp().map(|ts| ts / 1000),
        span_count: t.spans.len(),
        services: t.spans.iter().filter_map(Span::local_service_name).collect(),
        spans: &t.spans,
    }
}

fn print_jsonl<T: Serialize>(items: impl IntoIterator<Item = T>) -> anyhow::Result<()> {
    for item in items {
        println!("{}", serde_json::to_string(&item)?);
    }
    Ok(())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Runs blocking storage work off the async executor.
async fn blocking<T, F>(storage: &Arc<TraceStorage>, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&TraceStorage) -> Result<T, tracevault_core::error::StorageError> + Send + 'static,
{
    let storage = storage.clone();
    Ok(tokio::task::spawn_blocking(move || f(&storage)).await??)
}

/// Runs a search with an external deadline. When the deadline fires the
/// query's cancellation handle is tripped so the blocking worker unwinds.
async fn search(
    storage: &Arc<TraceStorage>,
    request: QueryRequest,
    timeout: Option<Duration>,
) -> anyhow::Result<Vec<Trace>> {
    let cancel = Cancellation::new();
    let query_cancel = cancel.clone();
    let task = {
        let storage = storage.clone();
        tokio::task::spawn_blocking(move || {
            storage.span_store().get_traces(&request, &query_cancel)
        })
    };
    let Some(timeout) = timeout else {
        return Ok(task.await??);
    };
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => Ok(joined??),
        Err(_) => {
            cancel.cancel();
            anyhow::bail!("search timed out after {} ms", timeout.as_millis())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracevault=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let timeout = config.query_timeout();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let storage = {
        let data_dir = data_dir.clone();
        Arc::new(
            tokio::task::spawn_blocking(move || TraceStorage::open(&data_dir, config)).await??,
        )
    };

    match cli.command {
        Command::Ingest { file } => {
            let spans = parse_spans(&read_input(file.as_deref())?)?;
            let count = spans.len();
            blocking(&storage, move |s| {
                s.span_consumer().accept(&spans)?;
                s.block_while_in_flight()
            })
            .await?;
            info!("Stored {count} spans in {}", data_dir.display());
        }
        Command::Traces {
            service,
            span,
            annotation_query,
            min_duration,
            max_duration,
            end_ts,
            lookback,
            limit,
        } => {
            let mut builder = QueryRequest::builder()
                .end_ts(end_ts.unwrap_or_else(now_millis))
                .lookback(lookback)
                .limit(limit);
            if let Some(service) = service {
                builder = builder.service_name(service);
            }
            if let Some(span) = span {
                builder = builder.span_name(span);
            }
            if let Some(query) = annotation_query {
                builder = builder.annotation_query(&query);
            }
            if let Some(min) = min_duration {
                builder = builder.min_duration(min);
            }
            if let Some(max) = max_duration {
                builder = builder.max_duration(max);
            }
            let traces = search(&storage, builder.build()?, timeout).await?;
            print_jsonl(traces.iter().map(trace_to_jsonl))?;
        }
        Command::Trace { ids } => {
            let ids = ids
                .iter()
                .map(|id| id.parse::<TraceId>())
                .collect::<Result<Vec<_>, _>>()?;
            let traces = blocking(&storage, move |s| s.span_store().get_traces_by_ids(&ids)).await?;
            print_jsonl(traces.iter().map(trace_to_jsonl))?;
        }
        Command::Services => {
            print_jsonl(blocking(&storage, |s| s.span_store().get_service_names()).await?)?;
        }
        Command::Spans { service } => {
            print_jsonl(
                blocking(&storage, move |s| s.span_store().get_span_names(&service)).await?,
            )?;
        }
        Command::Dependencies { end_ts, lookback } => {
            let end_ts = end_ts.unwrap_or_else(now_millis);
            print_jsonl(
                blocking(&storage, move |s| {
                    s.dependencies().get_dependencies(end_ts, lookback)
                })
                .await?,
            )?;
        }
        Command::WriteDependencies { day_ms, file } => {
            let links: Vec<DependencyLink> =
                serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            let count = links.len();
            blocking(&storage, move |s| {
                s.dependencies().write_dependency_links(&links, day_ms)?;
                s.block_while_in_flight()
            })
            .await?;
            info!("Stored {count} dependency links for day {day_ms}");
        }
        Command::TagKeys => {
            print_jsonl(blocking(&storage, |s| s.autocomplete_tags().get_keys()).await?)?;
        }
        Command::TagValues { key } => {
            print_jsonl(
                blocking(&storage, move |s| s.autocomplete_tags().get_values(&key)).await?,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spans_accepts_array_and_lines() {
        let array = r#"[{"traceId": "a", "id": "1"}, {"traceId": "a", "id": "2"}]"#;
        assert_eq!(parse_spans(array).unwrap().len(), 2);

        let lines = "{\"traceId\": \"a\", \"id\": \"1\"}\n\n{\"traceId\": \"b\", \"id\": \"2\"}\n";
        let spans = parse_spans(lines).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].trace_id, TraceId::from_u64(0xb));
    }

    #[test]
    fn test_parse_spans_reports_bad_line() {
        let err = parse_spans("{\"traceId\": \"a\", \"id\": \"1\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().starts_with("line 2"));
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(
            &path,
            r#"{"keyspace": "from_file", "autocomplete_keys": ["http.host"]}"#,
        )
        .unwrap();
        let cli = Cli::parse_from([
            "tracevault",
            "--config",
            path.to_str().unwrap(),
            "--search-disabled",
            "--autocomplete-key",
            "http.method",
            "services",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.keyspace, "from_file");
        assert!(!config.search_enabled);
        assert!(config.strict_trace_id);
        assert!(config.is_autocomplete_key("http.host"));
        assert!(config.is_autocomplete_key("http.method"));
    }
}
