use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use signalfold::{
    EmbeddingCache, EngineConfig, EventPayload, FactLog, GraphStore, HashingEmbedder, NewEvent,
    RedbGraph, SignalfoldError, ValidationError,
};
use signalfold_engine::{CancelToken, Orchestrator};
use std::env;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_RUN_ID_BYTES: usize = 512;
const MAX_IDEMPOTENCY_KEY_BYTES: usize = 512;
const MAX_CYCLES_PER_CALL: usize = 64;

/// Caller supplied something the method cannot accept.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidParams(String);

fn invalid(message: impl Into<String>) -> anyhow::Error {
    InvalidParams(message.into()).into()
}

struct AppState {
    orchestrator: Orchestrator<RedbGraph>,
    run_id: String,
}

impl AppState {
    fn open() -> Result<Self> {
        let dir = env::var("SIGNALFOLD_DATA_DIR")
            .unwrap_or_else(|_| "./signalfold-data".to_string());
        let config = EngineConfig::from_env().context("invalid SIGNALFOLD_* configuration")?;
        Self::open_at(Path::new(&dir), config)
    }

    fn open_at(dir: &Path, config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        let log = FactLog::open(dir.join("facts.redb")).context("failed to open fact log")?;
        let cache = EmbeddingCache::open(dir.join("embeddings.redb"), config.model_version.clone())
            .context("failed to open embedding cache")?
            .with_timeout(config.embed_timeout());
        let graph = RedbGraph::open(dir.join("graph.redb")).context("failed to open graph store")?;
        let orchestrator = Orchestrator::new(
            Arc::new(log),
            Arc::new(cache),
            Arc::new(HashingEmbedder::default()),
            Arc::new(graph),
            config,
        )
        .context("failed to start orchestrator")?;
        Ok(Self {
            orchestrator,
            run_id: generate_run_id()?,
        })
    }
}

fn generate_run_id() -> Result<String> {
    let mut bytes = [0_u8; 8];
    getrandom::fill(&mut bytes).map_err(|e| anyhow::anyhow!("entropy unavailable: {e}"))?;
    Ok(format!(
        "run-{}",
        bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
    ))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let state = AppState::open().context("failed to open signalfold data")?;
    info!(run_id = %state.run_id, "signalfold server ready");
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "unreadable frame");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        // Skip the body so the next frame starts at a header.
        io::copy(&mut reader.by_ref().take(len as u64), &mut io::sink())?;
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;
    let params = req.get("params");

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": { "name": "signalfold", "version": env!("CARGO_PKG_VERSION") },
            "methods": ["append", "run_cycle", "audit", "status", "ping"]
        })),
        "notifications/initialized" => return None,
        "ping" => Ok(json!({})),
        "append" => append(state, params),
        "run_cycle" => run_cycle(state),
        "audit" => audit(state, params),
        "status" => status(state),
        _ => {
            return id.map(|id_val| {
                json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "error": { "code": -32601, "message": format!("method not found: {method}") }
                })
            })
        }
    };

    let id_val = id?;
    Some(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "id": id_val, "result": value }),
        Err(err) => {
            let code = error_code(&err);
            if code == -32603 {
                warn!(method, error = %format!("{err:#}"), "request failed");
            }
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": { "code": code, "message": format!("{err:#}") }
            })
        }
    })
}

/// -32602 for anything the caller can fix, -32603 otherwise.
fn error_code(err: &anyhow::Error) -> i64 {
    let caller_fault = err.chain().any(|cause| {
        cause.is::<InvalidParams>()
            || cause.is::<ValidationError>()
            || matches!(
                cause.downcast_ref::<SignalfoldError>(),
                Some(SignalfoldError::Validation(_))
            )
    });
    if caller_fault {
        -32602
    } else {
        -32603
    }
}

fn append(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let event = params
        .and_then(|p| p.get("event"))
        .cloned()
        .ok_or_else(|| invalid("event is required"))?;
    let run_id = match params.and_then(|p| p.get("run_id")) {
        None | Some(JsonValue::Null) => state.run_id.clone(),
        Some(v) => v
            .as_str()
            .ok_or_else(|| invalid("run_id must be a string"))?
            .to_string(),
    };
    if run_id.len() > MAX_RUN_ID_BYTES {
        return Err(invalid(format!(
            "run_id exceeds max allowed size ({MAX_RUN_ID_BYTES} bytes)"
        )));
    }
    let idempotency_key = match params.and_then(|p| p.get("idempotency_key")) {
        None | Some(JsonValue::Null) => None,
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| invalid("idempotency_key must be a string"))?,
        ),
    };
    if let Some(key) = idempotency_key {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_BYTES {
            return Err(invalid(format!(
                "idempotency_key must be 1..={MAX_IDEMPOTENCY_KEY_BYTES} bytes"
            )));
        }
    }

    let payload = EventPayload::from_json(event)?;
    let event_type = payload.type_tag();
    let event = NewEvent::new(run_id, payload);
    let log = state.orchestrator.log();
    let seq = match idempotency_key {
        Some(key) => log.append_idempotent(key, event)?,
        None => log.append(event)?,
    };
    Ok(json!({ "seq": seq, "type": event_type }))
}

fn run_cycle(state: &AppState) -> Result<JsonValue> {
    let reports = state
        .orchestrator
        .run_until_idle(&CancelToken::new(), MAX_CYCLES_PER_CALL)?;
    Ok(json!({ "cycles": reports.len(), "reports": reports }))
}

fn audit(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let verify_enrichment = match params.and_then(|p| p.get("verify_enrichment")) {
        None | Some(JsonValue::Null) => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| invalid("verify_enrichment must be a boolean"))?,
    };
    let report = state.orchestrator.audit(verify_enrichment)?;
    Ok(json!({ "clean": report.is_empty(), "discrepancy": report }))
}

fn status(state: &AppState) -> Result<JsonValue> {
    let head = state.orchestrator.log().last_seq()?;
    let checkpoint = state.orchestrator.checkpoint()?;
    let snapshot = state.orchestrator.graph().snapshot()?;
    Ok(json!({
        "head": head,
        "watermark": checkpoint.watermark,
        "lag": head.saturating_sub(checkpoint.watermark),
        "phase": state.orchestrator.phase(),
        "deferred_ops": checkpoint.deferred.len(),
        "pending_events": checkpoint.pending,
        "nodes": snapshot.nodes.len(),
        "edges": snapshot.edges.len(),
        "default_run_id": state.run_id,
    }))
}
