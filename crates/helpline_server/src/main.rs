#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use helpline_server::config::{default_config_path, load_server_config_from_path};
use helpline_server::server::gateway::Gateway;
use helpline_server::server::health::HealthState;
use helpline_server::server::registry::{RoomRegistry, RoomRegistryConfig};
use helpline_server::server::store::{MemoryStore, MessageStore, RequestStore, Storage, UserStore};
use helpline_server::server::workflow::ResolutionWorkflow;
use helpline_server::server::ws::{AppState, router};

const DEFAULT_BIND: &str = "127.0.0.1:8205";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: helpline_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind   Listen address for the HTTP/WebSocket front (default: {DEFAULT_BIND})\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,helpline_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("helpline_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_arg = parse_args();

	let config_path = default_config_path()?;
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let bind = bind_arg
		.or_else(|| server_cfg.server.listen_bind.clone())
		.unwrap_or_else(|| DEFAULT_BIND.to_string());
	let addr: SocketAddr = bind
		.parse()
		.map_err(|e| anyhow::anyhow!("invalid bind address {bind:?}: {e}"))?;

	let (requests, messages, users): (Arc<dyn RequestStore>, Arc<dyn MessageStore>, Arc<dyn UserStore>) =
		if server_cfg.persistence.enabled {
			let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
				return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
			};
			let storage = Arc::new(Storage::connect(database_url).await?);
			info!("persistence connected");
			(storage.clone(), storage.clone(), storage)
		} else {
			warn!("persistence disabled; running on the in-memory store (state is lost on restart)");
			let memory = MemoryStore::new();
			(memory.clone(), memory.clone(), memory)
		};

	let mut registry_cfg = RoomRegistryConfig::default();
	if let Some(capacity) = server_cfg.server.member_queue_capacity {
		registry_cfg.member_queue_capacity = capacity;
	}
	let registry = RoomRegistry::new(registry_cfg);

	let gateway = Gateway::new(registry.clone(), Arc::clone(&requests), messages);
	let workflow = ResolutionWorkflow::new(registry, Arc::clone(&requests), users);

	let health = HealthState::new();
	let app = router(AppState {
		gateway,
		workflow,
		requests,
		health: health.clone(),
		auth_hmac_secret: server_cfg.server.auth_hmac_secret.clone(),
	});

	let listener = tokio::net::TcpListener::bind(addr).await?;
	health.mark_ready();
	info!(%addr, "helpline_server listening");

	axum::serve(listener, app).await?;

	Ok(())
}
