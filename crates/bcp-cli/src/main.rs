mod poll;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bcp_core::JobStatus;
use bcp_storage::PgStore;
use bcp_web::WebConfig;
use clap::{Parser, Subcommand};
use poll::{judge_transport, PollSchedule, PollVerdict};
use serde_json::Value as JsonValue;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bcp")]
#[command(about = "BlogCluster Pro job service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service (default).
    Serve {
        #[arg(long, env = "BCP_WEB_PORT")]
        port: Option<u16>,
    },
    /// Apply database migrations and exit.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Poll a job until it is READY or FAILED.
    Watch {
        job_id: String,
        #[arg(long, env = "BCP_PUBLIC_BASE_URL", default_value = "http://localhost:8000")]
        base_url: String,
        /// Bearer token for the job owner.
        #[arg(long, env = "BCP_TOKEN")]
        token: Option<String>,
        /// Sent as `x-user-id` when the server trusts a proxy header.
        #[arg(long, env = "BCP_USER_ID")]
        user_id: Option<String>,
        #[arg(long, default_value_t = 40)]
        max_attempts: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn"));
    let json = std::env::var("BCP_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let mut config = WebConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            bcp_web::serve(config).await?;
        }
        Commands::Migrate { database_url } => {
            let store = PgStore::connect(&database_url, 2)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            store.close().await;
            println!("migrations applied");
        }
        Commands::Watch {
            job_id,
            base_url,
            token,
            user_id,
            max_attempts,
        } => {
            let schedule = PollSchedule {
                max_attempts,
                ..PollSchedule::default()
            };
            let auth = Auth { token, user_id };
            watch(&base_url, &job_id, &auth, schedule).await?;
        }
    }

    Ok(())
}

struct Auth {
    token: Option<String>,
    user_id: Option<String>,
}

enum Poll {
    Status(JsonValue),
    NotFound,
    Retry {
        reason: String,
        after: Option<Duration>,
    },
}

async fn poll_once(
    client: &reqwest::Client,
    url: &str,
    auth: &Auth,
    schedule: &PollSchedule,
    not_found_seen: usize,
) -> Result<Poll> {
    let mut request = client.get(url);
    if let Some(token) = &auth.token {
        request = request.bearer_auth(token);
    }
    if let Some(user_id) = &auth.user_id {
        request = request.header("x-user-id", user_id);
    }

    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(err) => {
            return match judge_transport(&err) {
                PollVerdict::Retry { after } => Ok(Poll::Retry {
                    reason: err.to_string(),
                    after,
                }),
                PollVerdict::GiveUp => Err(err.into()),
            }
        }
    };
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body: JsonValue = resp.json().await.unwrap_or(JsonValue::Null);
    if status.is_success() {
        return Ok(Poll::Status(body));
    }
    let message = body
        .get("error")
        .and_then(JsonValue::as_str)
        .unwrap_or("request failed")
        .to_string();
    let not_found_seen = if status == reqwest::StatusCode::NOT_FOUND {
        not_found_seen + 1
    } else {
        0
    };
    match schedule.judge_status(status, retry_after.as_deref(), not_found_seen) {
        PollVerdict::Retry { .. } if status == reqwest::StatusCode::NOT_FOUND => Ok(Poll::NotFound),
        PollVerdict::Retry { after } => Ok(Poll::Retry {
            reason: format!("{status}: {message}"),
            after,
        }),
        PollVerdict::GiveUp => bail!("{status}: {message}"),
    }
}

async fn watch(base_url: &str, job_id: &str, auth: &Auth, schedule: PollSchedule) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("building http client")?;
    let url = format!(
        "{}/api/research/status?jobId={job_id}",
        base_url.trim_end_matches('/')
    );

    let mut not_found_seen = 0;
    for attempt in 0..schedule.max_attempts {
        let mut hint = None;
        match poll_once(&client, &url, auth, &schedule, not_found_seen).await? {
            Poll::NotFound => {
                not_found_seen += 1;
                tracing::info!(job_id, attempt, "job not created yet");
            }
            Poll::Status(body) => {
                not_found_seen = 0;
                let status = body
                    .get("status")
                    .and_then(JsonValue::as_str)
                    .and_then(|s| s.parse::<JobStatus>().ok());
                match status {
                    Some(JobStatus::Ready) => {
                        let keywords = body["suggestions"].as_array().map_or(0, Vec::len);
                        println!("{job_id}: READY with {keywords} keyword suggestions");
                        return Ok(());
                    }
                    Some(JobStatus::Failed) => {
                        let error = body["error"].as_str().unwrap_or("unknown error");
                        bail!("{job_id}: FAILED ({error})");
                    }
                    Some(other) => tracing::info!(job_id, status = %other, attempt, "job in progress"),
                    None => tracing::warn!(job_id, attempt, "status response without a status"),
                }
            }
            Poll::Retry { reason, after } => {
                not_found_seen = 0;
                hint = after;
                tracing::warn!(job_id, attempt, %reason, "status poll failed; retrying");
            }
        }
        tokio::time::sleep(schedule.delay(attempt, hint)).await;
    }

    println!("{job_id}: still waiting after {} polls; check back later", schedule.max_attempts);
    Ok(())
}
