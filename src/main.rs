use std::env;
use std::io;
use std::sync::Arc;

use sas_eft::Session;
use sas_eft::config::EftConfig;
use sas_eft::csv::{read_script, write_history};
use sas_eft::storage::{FileStorage, MemoryStorage, PersistentStorage};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .expect("usage: sas-eft <script.csv> [history-dir]");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match env::var("SAS_EFT_CONFIG") {
        Ok(config_path) => EftConfig::from_file(&config_path).expect("failed to load config"),
        Err(_) => EftConfig::default(),
    };

    let storage: Arc<dyn PersistentStorage> = match env::args().nth(2) {
        Some(dir) => Arc::new(FileStorage::open(&dir).expect("failed to open history directory")),
        None => Arc::new(MemoryStorage::new()),
    };

    let mut session = Session::new(&config, storage).expect("failed to start session");
    let events = read_script(path.clone()).expect("failed to open script");
    let (event_sender, event_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in events {
            match result {
                Ok(event) => {
                    if event_sender.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    session.run(ReceiverStream::new(event_receiver)).await;

    write_history(
        io::stdout().lock(),
        session.controller().history().get_history_logs(),
    )
    .expect("failed to write history");
}
