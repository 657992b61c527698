use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use fcp_runtime::protocol::{reader_loop, writer_loop};
use fcp_runtime::render::json_registry;
use fcp_runtime::session::{
    CatalogRegistry, ClientNegotiator, Negotiation, ServerResponse, ServerSession, UiGenerator,
};
use fcp_runtime::stream::{ChunkDecoder, SurfaceSequencer};
use fcp_runtime::{
    CatalogReference, ClientModel, DynamicUiPacket, EventPayload, FcpResult, Outcome,
    ServerEnvelope, Snapshot, WidgetCatalog, validate,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fcp-host", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hold a client snapshot and apply framed server envelopes from stdin.
    Serve(ServeArgs),
    /// Validate a packet (and optionally an event) against a catalog.
    Validate(ValidateArgs),
    /// Apply update files or a JSONL generation stream to a packet.
    Apply(ApplyArgs),
    /// Render a packet to a resolved JSON tree.
    Render(RenderArgs),
    /// Run catalog negotiation against an in-process server.
    Negotiate(NegotiateArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Session id.
    #[arg(long, env = "FCP_SID", default_value = "S1")]
    sid: String,

    /// Widget catalog JSON.
    #[arg(long)]
    catalog: PathBuf,

    /// Negotiate by reference (`name@version`) before sending the full catalog.
    #[arg(long, value_parser = parse_reference)]
    reference: Option<CatalogReference>,

    /// Event JSON sent once the host is ready.
    #[arg(long)]
    start_event: Option<PathBuf>,

    /// Outbound queue bound. Falls back to FCP_OUTBOUND_QUEUE_CAP.
    #[arg(long)]
    outbound_queue_cap: Option<usize>,

    /// Inbound queue bound. Falls back to FCP_INBOUND_QUEUE_CAP.
    #[arg(long)]
    inbound_queue_cap: Option<usize>,

    /// Log the rendered tree after every applied message.
    #[arg(long, default_value_t = false)]
    print_tree: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    #[arg(long)]
    catalog: PathBuf,

    #[arg(long)]
    packet: PathBuf,

    /// Event JSON to check against the packet's layout.
    #[arg(long)]
    event: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ApplyArgs {
    #[arg(long)]
    catalog: PathBuf,

    #[arg(long)]
    packet: PathBuf,

    /// StateUpdate or LayoutUpdate JSON files, applied in order.
    #[arg(long = "update")]
    updates: Vec<PathBuf>,

    /// JSONL generation stream applied after the update files.
    #[arg(long)]
    stream: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    #[arg(long)]
    catalog: PathBuf,

    #[arg(long)]
    packet: PathBuf,
}

#[derive(Parser, Debug)]
struct NegotiateArgs {
    #[arg(long)]
    catalog: PathBuf,

    #[arg(long, value_parser = parse_reference)]
    reference: CatalogReference,

    /// Packet the in-process server answers with.
    #[arg(long)]
    packet: PathBuf,

    /// Pre-register the catalog on the server.
    #[arg(long, default_value_t = false)]
    known: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve(args) => cmd_serve(args),
        Command::Validate(args) => cmd_validate(args),
        Command::Apply(args) => cmd_apply(args),
        Command::Render(args) => cmd_render(args),
        Command::Negotiate(args) => cmd_negotiate(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_reference(raw: &str) -> Result<CatalogReference, String> {
    match raw.split_once('@') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            Ok(CatalogReference::new(name, version))
        }
        _ => Err(format!("expected name@version, got '{raw}'")),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("read '{}'", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse '{}'", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let catalog: WidgetCatalog = read_json(&args.catalog)?;
    let outbound_cap = args.outbound_queue_cap.filter(|cap| *cap > 0).unwrap_or_else(|| {
        fcp_runtime::parse_queue_capacity(
            fcp_runtime::OUTBOUND_QUEUE_CAP_ENV,
            fcp_runtime::DEFAULT_OUTBOUND_QUEUE_CAP,
        )
    });
    let inbound_cap = args.inbound_queue_cap.filter(|cap| *cap > 0).unwrap_or_else(|| {
        fcp_runtime::parse_queue_capacity(
            fcp_runtime::INBOUND_QUEUE_CAP_ENV,
            fcp_runtime::DEFAULT_INBOUND_QUEUE_CAP,
        )
    });

    let mut model = ClientModel::new(args.sid.clone(), catalog);
    if let Some(reference) = args.reference {
        model = model.with_reference(reference, None);
    }
    let registry = json_registry(model.catalog());

    let (out_tx, out_rx) = mpsc::sync_channel(outbound_cap);
    let (in_tx, in_rx) = fcp_runtime::update_queue(inbound_cap);
    let writer_handle = thread::spawn(move || writer_loop(io::stdout().lock(), out_rx));

    out_tx
        .send(model.ready())
        .map_err(|_| anyhow::anyhow!("failed to queue ready envelope"))?;

    if let Some(path) = &args.start_event {
        let payload: EventPayload = read_json(path)?;
        let dropped = AtomicU64::new(0);
        fcp_runtime::send_event(&out_tx, model.event(payload), &dropped, outbound_cap);
    }

    let reader_handle = thread::spawn(move || {
        let result = reader_loop(io::stdin().lock(), |inbound| {
            if in_tx.send(inbound).is_err() {
                tracing::warn!("update queue closed; dropping envelope");
            }
        });
        if let Err(err) = &result {
            tracing::error!(error = %err, "reader loop terminated with error");
        }
        result
    });

    tracing::info!(sid = %args.sid, outbound_cap, inbound_cap, "host ready");
    let processed = model.drain(&in_rx, &out_tx, |model, outcome| {
        report(outcome);
        if args.print_tree {
            if let Some(snapshot) = model.snapshot() {
                let (tree, _) = registry.render(snapshot);
                tracing::info!(tree = %tree, "rendered");
            }
        }
    });
    tracing::info!(processed, "input closed");

    drop(out_tx);
    match reader_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "reader thread returned error"),
        Err(err) => tracing::error!(?err, "reader thread join failed"),
    }
    match writer_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "writer thread returned error"),
        Err(err) => tracing::error!(?err, "writer thread join failed"),
    }
    Ok(())
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Applied {
            rev,
            changed_nodes,
            unapplied,
        } => tracing::info!(rev, changed = ?changed_nodes, unapplied = unapplied.len(), "applied"),
        Outcome::Rejected { rev, error } => {
            tracing::warn!(rev, code = error.code(), %error, "rejected")
        }
        Outcome::Resync { reason } => tracing::warn!(%reason, "resync"),
        Outcome::ServerError { code, message } => tracing::warn!(%code, %message, "server error"),
        Outcome::UnknownCatalog(err) => {
            tracing::info!(message = %err.message, "server lacks catalog")
        }
        Outcome::Discarded(err) => tracing::warn!(%err, "discarded"),
    }
}

fn cmd_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let catalog: WidgetCatalog = read_json(&args.catalog)?;
    let packet: DynamicUiPacket = read_json(&args.packet)?;

    let mut failed = false;
    if let Err(errors) = validate::validate_packet(&packet, &catalog) {
        eprintln!("{errors}");
        failed = true;
    }
    if let Some(path) = &args.event {
        let event: EventPayload = read_json(path)?;
        if let Err(errors) = validate::validate_event(&event, &packet.layout, &catalog) {
            eprintln!("{errors}");
            failed = true;
        }
    }
    if failed {
        bail!("validation failed");
    }
    eprintln!("ok");
    Ok(())
}

fn cmd_apply(args: ApplyArgs) -> anyhow::Result<()> {
    let catalog: WidgetCatalog = read_json(&args.catalog)?;
    let packet: DynamicUiPacket = read_json(&args.packet)?;
    let mut snapshot = Snapshot::from_packet(packet, &catalog).context("initial packet")?;

    for path in &args.updates {
        let update: ServerResponse = read_json(path)?;
        apply_response(&mut snapshot, &catalog, update)
            .with_context(|| format!("apply '{}'", path.display()))?;
    }

    if let Some(path) = &args.stream {
        let raw = std::fs::read(path).with_context(|| format!("read '{}'", path.display()))?;
        let mut decoder = ChunkDecoder::new();
        let mut chunks = decoder.push(&raw);
        chunks.extend(decoder.finish());

        let mut sequencer = SurfaceSequencer::new(fcp_runtime::DEFAULT_SID, 1);
        for (line, chunk) in chunks.into_iter().enumerate() {
            let chunk = chunk.with_context(|| format!("stream chunk {line}"))?;
            for envelope in sequencer.envelopes(&chunk)? {
                let response = match envelope {
                    ServerEnvelope::Packet { packet, .. } => ServerResponse::Packet(packet),
                    ServerEnvelope::StateUpdate { update, .. } => {
                        ServerResponse::StateUpdate(update)
                    }
                    ServerEnvelope::LayoutUpdate { update, .. } => {
                        ServerResponse::LayoutUpdate(update)
                    }
                    other => bail!("unexpected stream envelope: {other:?}"),
                };
                apply_response(&mut snapshot, &catalog, response)
                    .with_context(|| format!("stream chunk {line}"))?;
            }
        }
    }

    print_json(&snapshot.to_packet())
}

fn apply_response(
    snapshot: &mut Snapshot,
    catalog: &WidgetCatalog,
    response: ServerResponse,
) -> anyhow::Result<()> {
    match response {
        ServerResponse::Packet(packet) => {
            *snapshot = Snapshot::from_packet(packet, catalog)?;
        }
        ServerResponse::StateUpdate(update) => {
            let delta = snapshot.apply_state_update(&update, catalog)?;
            tracing::info!(
                paths = ?delta.changed_paths,
                nodes = ?delta.changed_nodes,
                "state updated"
            );
            for item in &delta.unapplied {
                tracing::warn!(
                    op = item.op_index,
                    path = %item.path,
                    key = %item.key,
                    "unapplied listUpdate item"
                );
            }
        }
        ServerResponse::LayoutUpdate(update) => {
            let delta = snapshot.apply_layout_update(&update, catalog)?;
            tracing::info!(nodes = ?delta.changed_nodes, "layout updated");
        }
        ServerResponse::UnknownCatalog(err) => bail!("server lacks catalog: {}", err.message),
    }
    Ok(())
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let catalog: WidgetCatalog = read_json(&args.catalog)?;
    let packet: DynamicUiPacket = read_json(&args.packet)?;
    let snapshot = Snapshot::new(packet.layout, packet.state);

    let (tree, report) = json_registry(&catalog).render(&snapshot);
    for fault in &report.faults {
        tracing::warn!(%fault, "render fault");
    }
    print_json(&tree)
}

/// Answers every session with the same packet.
struct FixedPacket(DynamicUiPacket);

impl UiGenerator for FixedPacket {
    fn initial_packet(
        &mut self,
        _catalog: &WidgetCatalog,
        _event: &EventPayload,
    ) -> FcpResult<DynamicUiPacket> {
        Ok(self.0.clone())
    }

    fn respond(
        &mut self,
        _catalog: &WidgetCatalog,
        _event: &EventPayload,
    ) -> FcpResult<ServerResponse> {
        Ok(ServerResponse::Packet(self.0.clone()))
    }
}

fn cmd_negotiate(args: NegotiateArgs) -> anyhow::Result<()> {
    let catalog: WidgetCatalog = read_json(&args.catalog)?;
    let mut generator = FixedPacket(read_json(&args.packet)?);
    let mut registry = CatalogRegistry::new();
    if args.known {
        registry.register(&args.reference, catalog.clone());
    }
    let mut server = ServerSession::new();
    let mut client = ClientNegotiator::new(args.reference, catalog);

    let mut event = client.prepare(EventPayload::new("app", "sessionStart", "0"));
    for round in 1..=2 {
        let response = server.handle_event(&mut registry, &mut generator, &event)?;
        let label = match &response {
            ServerResponse::Packet(_) => "packet",
            ServerResponse::UnknownCatalog(_) => "unknownCatalog",
            ServerResponse::StateUpdate(_) => "stateUpdate",
            ServerResponse::LayoutUpdate(_) => "layoutUpdate",
        };
        let line = serde_json::json!({"round": round, "response": label, "phase": server.phase()});
        println!("{line}");
        match client.on_response(&response)? {
            Negotiation::Retry(retry) => event = retry,
            Negotiation::Established | Negotiation::Update => return Ok(()),
        }
    }
    bail!("negotiation did not complete")
}
