//! Demo gate server.
//!
//! Serves a handful of tenant-scoped routes behind the request gate, backed
//! by in-memory collaborators. Tokens are HS256 JWTs signed with
//! `--jwt-secret`; the seeded demo user is an admin of `--demo-org`.
//!
//! ```text
//! GET  /api/orgs/{org}/whoami        api limiter
//! POST /api/orgs/{org}/ai/complete   ai limiter (tiered)
//! GET  /api/orgs/{org}/reports       requires "reports.view"
//! GET  /api/orgs/{org}/settings      requires org admin
//! GET  /orgs/{org}/dashboard         browser route, redirects to /login
//! GET  /api/me/org                   org resolved from session or default
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tenantgate_core::{OrgId, OrgRole, RequestContext, Tier, UserId};
use tenantgate_server::gate::{
    CounterSweeper, GateConfig, LimiterConfig, MemoryContextBackend, MemoryDirectory,
    MemoryRateCounter, MissingOrgPolicy, RateLimiter, RequestGate, RequiredRole, RoutePolicy,
    ScopeStrategy,
};
use tenantgate_server::network::{
    authenticate, gate_middleware, GateState, JwtAuthenticator, NetworkConfig, NetworkModule,
};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Fmt,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MissingOrg {
    BadRequest,
    Forbidden,
}

impl From<MissingOrg> for MissingOrgPolicy {
    fn from(value: MissingOrg) -> Self {
        match value {
            MissingOrg::BadRequest => Self::BadRequest,
            MissingOrg::Forbidden => Self::Forbidden,
        }
    }
}

/// Multi-tenant request gate demo server
#[derive(Parser, Debug)]
#[command(name = "gate-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, env = "TENANTGATE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(long, env = "TENANTGATE_PORT", default_value_t = 8080)]
    port: u16,

    /// Allowed CORS origins, comma separated
    #[arg(long, env = "TENANTGATE_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Overall request timeout in seconds
    #[arg(long, env = "TENANTGATE_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Take client addresses from X-Forwarded-For (only behind a proxy that sets it)
    #[arg(long, env = "TENANTGATE_TRUST_FORWARDED_FOR")]
    trust_forwarded_for: bool,

    /// Shared secret for HS256 bearer tokens
    #[arg(long, env = "TENANTGATE_JWT_SECRET")]
    jwt_secret: String,

    /// Include internal error chains in rejection envelopes
    #[arg(long, env = "TENANTGATE_DEBUG")]
    debug: bool,

    /// Status used when no organization can be resolved
    #[arg(long, env = "TENANTGATE_MISSING_ORG", value_enum, default_value = "forbidden")]
    missing_org: MissingOrg,

    /// Skip the organization membership check
    #[arg(long, env = "TENANTGATE_SKIP_MEMBERSHIP_CHECK")]
    skip_membership_check: bool,

    /// Handler timeout in seconds
    #[arg(long, env = "TENANTGATE_HANDLER_TIMEOUT_SECS", default_value_t = 30)]
    handler_timeout_secs: u64,

    /// Use a pool of this many reusable scopes instead of one per request
    #[arg(
        long,
        env = "TENANTGATE_SCOPE_POOL_SIZE",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    scope_pool_size: Option<u32>,

    /// Seconds to wait for a pooled scope
    #[arg(long, env = "TENANTGATE_SCOPE_CHECKOUT_TIMEOUT_SECS", default_value_t = 5)]
    scope_checkout_timeout_secs: u64,

    /// Contact shown to users denied access to an organization
    #[arg(long, env = "TENANTGATE_ADMIN_CONTACT")]
    admin_contact: Option<String>,

    /// Login page for unauthenticated browser callers
    #[arg(long, env = "TENANTGATE_LOGIN_PATH", default_value = "/login")]
    login_path: String,

    /// Port for the Prometheus metrics endpoint
    #[arg(long, env = "TENANTGATE_METRICS_PORT", default_value_t = 9100)]
    metrics_port: u16,

    /// Disable the Prometheus metrics endpoint
    #[arg(long, env = "TENANTGATE_NO_METRICS")]
    no_metrics: bool,

    /// Seconds between sweeps of expired rate-limit windows
    #[arg(
        long,
        env = "TENANTGATE_SWEEP_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sweep_interval_secs: u64,

    /// Log output format
    #[arg(long, env = "TENANTGATE_LOG_FORMAT", value_enum, default_value = "fmt")]
    log_format: LogFormat,

    /// Demo user seeded into the directory
    #[arg(long, env = "TENANTGATE_DEMO_USER", default_value = "demo")]
    demo_user: String,

    /// Organization the demo user administers
    #[arg(
        long,
        env = "TENANTGATE_DEMO_ORG",
        default_value = "11111111-1111-1111-1111-111111111111"
    )]
    demo_org: OrgId,
}

impl Args {
    fn gate_config(&self) -> GateConfig {
        GateConfig {
            debug: self.debug,
            missing_org_policy: self.missing_org.into(),
            verify_membership: !self.skip_membership_check,
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            scope_strategy: self
                .scope_pool_size
                .map_or(ScopeStrategy::PerRequest, |size| ScopeStrategy::Pooled { size }),
            scope_checkout_timeout: Duration::from_secs(self.scope_checkout_timeout_secs),
            admin_contact: self.admin_contact.clone(),
            login_path: self.login_path.clone(),
            ..GateConfig::default()
        }
    }

    fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Fmt => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
    }
}

async fn whoami(Extension(ctx): Extension<RequestContext>) -> Json<RequestContext> {
    Json(ctx)
}

async fn ai_complete(
    Extension(ctx): Extension<RequestContext>,
    Json(prompt): Json<Value>,
) -> Json<Value> {
    Json(json!({
        "org_id": ctx.org_id,
        "tier": ctx.tier,
        "echo": prompt,
    }))
}

async fn reports(Extension(ctx): Extension<RequestContext>) -> Json<Value> {
    Json(json!({ "org_id": ctx.org_id, "reports": [] }))
}

async fn settings(Extension(ctx): Extension<RequestContext>) -> Json<Value> {
    Json(json!({
        "org_id": ctx.org_id,
        "is_super_admin": ctx.is_super_admin,
    }))
}

async fn dashboard(Extension(ctx): Extension<RequestContext>) -> Html<String> {
    Html(format!("<h1>{}</h1><p>signed in as {}</p>", ctx.org_id, ctx.user_id))
}

async fn login() -> Html<&'static str> {
    Html("<h1>Sign in</h1>")
}

/// Routes in `router` gated with `policy`.
fn gated(
    router: Router,
    gate: &RequestGate,
    network: &NetworkConfig,
    policy: RoutePolicy,
) -> Router {
    router.route_layer(from_fn_with_state(
        GateState::new(gate.clone(), policy).trust_forwarded_for(network.trust_forwarded_for),
        gate_middleware,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if !args.no_metrics {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], args.metrics_port)))
            .install()?;
        info!(port = args.metrics_port, "metrics endpoint listening");
    }

    let directory = Arc::new(MemoryDirectory::new());
    let demo_user = UserId::from(args.demo_user.as_str());
    directory.set_default_org(&demo_user, args.demo_org.to_string());
    directory.add_member(&demo_user, args.demo_org, OrgRole::Admin);
    directory.grant(&demo_user, args.demo_org, "reports.view");
    directory.set_tier(args.demo_org, Tier::Pro);

    let gate_config = args.gate_config();
    let session_org_key = gate_config.session_org_key.clone();
    let gate = RequestGate::new(
        gate_config,
        Arc::new(MemoryContextBackend::new()),
        directory.clone(),
        directory,
    );

    let network_config = args.network_config();
    let counter = Arc::new(MemoryRateCounter::new());
    let mut sweeper =
        CounterSweeper::spawn(counter.clone(), Duration::from_secs(args.sweep_interval_secs));
    let api = RateLimiter::new(LimiterConfig::api(), counter.clone());
    let ai = RateLimiter::new(LimiterConfig::ai(), counter);

    let app = Router::new()
        .merge(gated(
            Router::new()
                .route("/api/orgs/{org}/whoami", get(whoami))
                .route("/api/me/org", get(whoami)),
            &gate,
            &network_config,
            RoutePolicy::new().rate_limited(api.clone()),
        ))
        .merge(gated(
            Router::new().route("/api/orgs/{org}/ai/complete", post(ai_complete)),
            &gate,
            &network_config,
            RoutePolicy::new().rate_limited(ai),
        ))
        .merge(gated(
            Router::new().route("/api/orgs/{org}/reports", get(reports)),
            &gate,
            &network_config,
            RoutePolicy::new()
                .rate_limited(api.clone())
                .require_permission("reports.view"),
        ))
        .merge(gated(
            Router::new().route("/api/orgs/{org}/settings", get(settings)),
            &gate,
            &network_config,
            RoutePolicy::new()
                .rate_limited(api)
                .require_role(RequiredRole::Admin),
        ))
        .merge(gated(
            Router::new().route("/orgs/{org}/dashboard", get(dashboard)),
            &gate,
            &network_config,
            RoutePolicy::new(),
        ))
        .route("/login", get(login))
        .layer(from_fn_with_state(
            Arc::new(JwtAuthenticator::new(args.jwt_secret.as_bytes(), session_org_key)),
            authenticate,
        ));

    let mut network = NetworkModule::new(network_config, gate);
    let port = network.start().await?;
    info!(port, demo_user = %demo_user, demo_org = %args.demo_org, "gate server ready");

    network
        .serve(app, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    sweeper.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        let mut argv = vec!["gate-server", "--jwt-secret", "secret"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        assert!(parse(&["--sweep-interval-secs", "0"]).is_err());
        assert_eq!(parse(&["--sweep-interval-secs", "5"]).unwrap().sweep_interval_secs, 5);
    }

    #[test]
    fn empty_scope_pool_is_rejected() {
        assert!(parse(&["--scope-pool-size", "0"]).is_err());
        let args = parse(&["--scope-pool-size", "4"]).unwrap();
        assert!(matches!(
            args.gate_config().scope_strategy,
            ScopeStrategy::Pooled { size: 4 }
        ));
    }

    #[test]
    fn forwarded_for_is_untrusted_by_default() {
        assert!(!parse(&[]).unwrap().network_config().trust_forwarded_for);
        let args = parse(&["--trust-forwarded-for"]).unwrap();
        assert!(args.network_config().trust_forwarded_for);
    }
}
