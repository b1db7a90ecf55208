use std::io::Write as _;

use clap::Parser;
use courier::{
    Connector, Coordinator, Credentials, DispatchConfig, InMemoryConnector, InMemoryStore,
    InsertMessages, MessageStore, NewMessage, RunReport, Store,
    transport::smtp::{SmtpConfig, SmtpConnector},
};
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Seed a queue with sample messages and dispatch them.
#[derive(Debug, Parser)]
struct Args {
    /// Sample messages to enqueue before dispatching.
    #[arg(long, default_value_t = 100)]
    messages: usize,
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Deliver over SMTP to this host instead of the in-memory endpoint.
    #[arg(long, env = "SMTP_HOST")]
    smtp_host: Option<String>,
    #[arg(long, env = "SMTP_PORT", default_value_t = 25)]
    smtp_port: u16,
    #[arg(long, env = "SMTP_USERNAME", default_value = "")]
    username: String,
    #[arg(long, env = "SMTP_PASSWORD", default_value = "")]
    password: String,
    /// Authenticate even when the server offers no STARTTLS.
    #[arg(long)]
    allow_plaintext_auth: bool,
    #[arg(long, default_value = "noreply@localhost")]
    sender: String,
    /// Store messages in PostgreSQL instead of memory.
    #[cfg(feature = "sqlx")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Retry without asking.
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let args = Args::parse();

    #[cfg(feature = "sqlx")]
    if let Some(url) = args.database_url.as_deref() {
        let pool = sqlx::PgPool::connect(url).await.unwrap();
        let store = courier::store::sqlx::PgStore::try_new(pool, Default::default())
            .await
            .unwrap();
        return with_connector(Store::new(store), &args).await;
    }

    with_connector(Store::new(InMemoryStore::new()), &args).await
}

async fn with_connector<D>(store: Store<D>, args: &Args)
where
    D: MessageStore + InsertMessages + Clone + 'static,
{
    match args.smtp_host.as_deref() {
        Some(host) => {
            let config = SmtpConfig::new(host, args.smtp_port)
                .with_plaintext_auth(args.allow_plaintext_auth);
            let connector = SmtpConnector::new(config);
            dispatch(store, connector, args).await
        }
        None => dispatch(store, InMemoryConnector::new(), args).await,
    }
}

async fn dispatch<D, C>(store: Store<D>, connector: C, args: &Args)
where
    D: MessageStore + InsertMessages + Clone + 'static,
    C: Connector + Clone + 'static,
{
    let msgs = (1..=args.messages)
        .map(|i| {
            NewMessage::new(
                args.sender.clone(),
                format!("user{i}@localhost"),
                format!("Newsletter #{i}"),
                format!("<h1>Hello user {i}</h1>"),
            )
        })
        .collect();
    store.insert_messages(msgs).await.unwrap();

    let credentials = Credentials::new(args.username.clone(), args.password.clone());
    let coordinator = Coordinator::new(store.clone(), connector, DispatchConfig::new(credentials));

    let total = store.count_not_dispatched().await.unwrap();
    let yes = args.yes;
    let report = coordinator
        .run_with_retry(total, args.workers, |report| yes || ask_retry(report))
        .await
        .unwrap();

    println!(
        "Pass {}: {} delivered, {} failed, {} not dispatched",
        report.pass,
        report.delivered(),
        report.failed,
        report.not_dispatched
    );
}

fn ask_retry(report: &RunReport) -> bool {
    print!(
        "{} message(s) were not sent. Retry? [y/N] ",
        report.not_dispatched
    );
    std::io::stdout().flush().unwrap();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer).unwrap();
    matches!(answer.trim(), "y" | "Y" | "yes")
}
