use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, post, web, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::Context as _;
use clap::{crate_authors, crate_description, crate_version, Parser, Subcommand};
use configbutler::admission::{self, AdmissionState};
use configbutler::controllers::{destination, rule, Context};
use configbutler::correlation::CorrelationIndex;
use configbutler::crd::{ClusterWatchRule, GitDestination, GitRepoConfig, WatchRule};
use configbutler::encrypt::EncryptionWriter;
use configbutler::metrics::Metrics;
use configbutler::router::EventRouter;
use configbutler::rules::RuleStore;
use configbutler::settings::Settings;
use configbutler::telemetry;
use configbutler::watch::{run_namespace_watch, NamespaceLabelCache, WatchManager};
use configbutler_k8s_util::client::new_client_with_metrics;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use kube::{Config, CustomResourceExt};
use prometheus_client::registry::Registry;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(
    name = "configbutler",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Listen on given port for /health and /metrics
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Listen on given port for the admission webhook
    #[arg(long, default_value_t = 8443, env)]
    webhook_port: u16,

    /// TLS certificate for the admission webhook (PEM). Without cert and
    /// key the webhook server is disabled and attribution degrades to
    /// `unknown@configbutler`.
    #[arg(long, env = "WEBHOOK_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key for the admission webhook (PEM)
    #[arg(long, env = "WEBHOOK_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    /// Example: "info,kube=debug,configbutler=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint; tracing is disabled when
    /// unset
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing, 1.0 samples everything
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Directory holding branch checkouts
    #[arg(long, env = "WORK_DIR", default_value = "/var/lib/configbutler")]
    work_dir: PathBuf,

    /// Cluster identity stamped into commit trailers
    #[arg(long, env = "CLUSTER_UID", default_value = "")]
    cluster_uid: String,

    #[arg(long, env = "CONTROLLER_NAMESPACE", default_value = "configbutler-system")]
    controller_namespace: String,

    #[arg(long, env = "CONTROLLER_NAME", default_value = "configbutler")]
    controller_name: String,

    #[arg(long, env = "INSTANCE_ID", default_value = "")]
    instance_id: String,

    /// Seconds an admission record waits for its watch event
    #[arg(long, env = "CORRELATION_TTL", default_value_t = 60)]
    correlation_ttl: u64,

    #[arg(long, env = "CORRELATION_MAX_ENTRIES", default_value_t = 8192)]
    correlation_max_entries: usize,

    /// Queued events that force a flush
    #[arg(long, env = "BATCH_MAX_FILES", default_value_t = 200)]
    batch_max_files: usize,

    /// Cumulative payload bytes that force a flush
    #[arg(long, env = "BATCH_MAX_BYTES", default_value_t = 1024 * 1024)]
    batch_max_bytes: usize,

    /// Seconds after which a non-empty batch flushes regardless of size
    #[arg(long, env = "BATCH_MAX_WAIT", default_value_t = 20)]
    batch_max_wait: u64,

    /// Seconds between API discovery refreshes
    #[arg(long, env = "DISCOVERY_REFRESH_INTERVAL", default_value_t = 300)]
    discovery_refresh_interval: u64,

    /// Seconds between remote fetches looking for external commits
    #[arg(long, env = "REMOTE_SYNC_INTERVAL", default_value_t = 30)]
    remote_sync_interval: u64,

    /// Kinds whose payloads are encrypted at write time
    #[arg(long, env = "ENCRYPTED_KINDS", value_delimiter = ',', default_value = "Secret")]
    encrypted_kinds: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the CRD manifests to stdout
    Crdgen,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            work_dir: self.work_dir.clone(),
            cluster_uid: self.cluster_uid.clone(),
            controller_namespace: self.controller_namespace.clone(),
            controller_name: self.controller_name.clone(),
            instance_id: self.instance_id.clone(),
            correlation_ttl: Duration::from_secs(self.correlation_ttl),
            correlation_max_entries: self.correlation_max_entries,
            batch_max_files: self.batch_max_files,
            batch_max_bytes: self.batch_max_bytes,
            batch_max_wait: Duration::from_secs(self.batch_max_wait),
            discovery_refresh_interval: Duration::from_secs(self.discovery_refresh_interval),
            remote_sync_interval: Duration::from_secs(self.remote_sync_interval),
            encrypted_kinds: self.encrypted_kinds.clone(),
        }
    }
}

struct HttpState {
    metrics: Arc<Metrics>,
}

#[get("/metrics")]
async fn metrics_endpoint(state: web::Data<HttpState>, _req: HttpRequest) -> impl Responder {
    let mut buffer = String::new();
    let registry = &*state.metrics.registry;
    match prometheus_client::encoding::text::encode(&mut buffer, registry) {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(buffer),
        Err(e) => {
            tracing::error!("failed to encode metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[post("/validate")]
async fn validate(
    state: web::Data<AdmissionState>,
    body: web::Json<AdmissionReview<DynamicObject>>,
) -> impl Responder {
    HttpResponse::Ok().json(admission::review(&state, body.into_inner()))
}

fn crdgen() {
    for crd in [
        GitRepoConfig::crd(),
        GitDestination::crd(),
        WatchRule::crd(),
        ClusterWatchRule::crd(),
    ] {
        // safe unwrap: CRDs derived by kube are serializable by construction
        print!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}

fn load_rustls_config(cert: &PathBuf, key: &PathBuf) -> anyhow::Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert).with_context(|| format!("open {}", cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key).with_context(|| format!("open {}", key.display()))?,
    ))?
    .context("no private key found in the webhook key file")?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid webhook certificate/key pair")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    if let Some(Command::Crdgen) = args.command {
        crdgen();
        return Ok(());
    }

    telemetry::init(
        &args.log_filter,
        args.log_format.clone(),
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = Registry::with_prefix("configbutler");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &mut registry).await?;
    let metrics = Arc::new(Metrics::new(registry));
    let settings = Arc::new(args.settings());

    let namespaces = Arc::new(NamespaceLabelCache::default());
    let rules = Arc::new(RuleStore::new(namespaces.clone()));
    let correlation = Arc::new(CorrelationIndex::new(
        settings.correlation_ttl,
        settings.correlation_max_entries,
        metrics.correlation.clone(),
    ));
    let encryptor = Arc::new(EncryptionWriter::new(settings.encrypted_kinds.clone()));

    let (router, channels) = EventRouter::new(
        client.clone(),
        settings.clone(),
        metrics.clone(),
        encryptor,
    );
    let watch_manager = WatchManager::new(
        client.clone(),
        rules.clone(),
        correlation.clone(),
        router.clone(),
        metrics.clone(),
        settings.discovery_refresh_interval,
    );
    router.set_watch_manager(watch_manager.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx;
        async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        }
    });

    tokio::spawn(run_namespace_watch(
        client.clone(),
        namespaces,
        shutdown_rx.clone(),
    ));
    tokio::spawn(router.clone().run(channels, shutdown_rx.clone()));
    tokio::spawn(watch_manager.clone().run(shutdown_rx.clone()));

    let ctx = Arc::new(Context {
        client: client.clone(),
        rules,
        router: router.clone(),
        watch: watch_manager,
        metrics: metrics.clone(),
    });
    let controllers = async {
        tokio::join!(
            rule::run_watch_rules(ctx.clone()),
            rule::run_cluster_watch_rules(ctx.clone()),
            destination::run_destinations(ctx.clone()),
        );
    };

    let http_state = web::Data::new(HttpState {
        metrics: metrics.clone(),
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(http_state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics_endpoint)
    })
    .bind(("0.0.0.0", args.port))?
    .shutdown_timeout(5);

    let admission_state = web::Data::new(AdmissionState { correlation });
    let webhook = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = load_rustls_config(cert, key)?;
            Some(
                HttpServer::new(move || {
                    App::new().app_data(admission_state.clone()).service(validate)
                })
                .bind_rustls_0_23(("0.0.0.0", args.webhook_port), tls)?
                .shutdown_timeout(5),
            )
        }
        _ => {
            tracing::warn!(
                "webhook TLS cert/key not configured; admission correlation disabled"
            );
            None
        }
    };

    metrics.ready_set(1);
    // every runtime implements graceful shutdown, so poll until all are done
    match webhook {
        Some(webhook) => {
            let (_, server, webhook) = tokio::join!(controllers, server.run(), webhook.run());
            server?;
            webhook?;
        }
        None => {
            let (_, server) = tokio::join!(controllers, server.run());
            server?;
        }
    }
    router.shutdown_all().await;
    Ok(())
}
