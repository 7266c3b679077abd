//! docbase CLI shell.
//!
//! Boots the store, starts the task manager, registers the ingestion
//! handlers, and drives the document service. Upload commands block until the
//! queues drain so the process can exit with the index complete.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docbase::config::{self, Config};
use docbase::db::Store;
use docbase::embedding::create_embedder;
use docbase::events::{EventSink, TracingSink};
use docbase::ingest::Ingestor;
use docbase::llm::ConfigResolver;
use docbase::models::ProcessStatus;
use docbase::parser::ParserRegistry;
use docbase::queue::{queues_from_config, TaskManager};
use docbase::service::{DocumentService, NoThumbnailer};

#[derive(Parser)]
#[command(
    name = "docbase",
    about = "docbase — a local-first knowledge-base ingestion and indexing engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Upload files into a library and index them
    Upload {
        /// Target library id
        #[arg(long, default_value_t = 1)]
        library: i64,

        /// Files to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List documents in a library
    List {
        #[arg(long, default_value_t = 1)]
        library: i64,

        /// Keyword matched against document names
        #[arg(long, default_value = "")]
        keyword: String,

        /// Cursor: list documents before this id (0 = first page)
        #[arg(long, default_value_t = 0)]
        before: i64,

        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Sort order: created_desc or created_asc
        #[arg(long, default_value = "created_desc")]
        sort: String,
    },

    /// Rename a document (file keeps its hash prefix)
    Rename {
        id: i64,
        new_name: String,
    },

    /// Re-run the full pipeline for a document
    Reprocess {
        id: i64,
    },

    /// Re-embed a document's nodes without reparsing
    Reembed {
        id: i64,
    },

    /// Delete a document and all derived state
    Delete {
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docbase=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(config::APP_ID)
            .join(format!("{}.toml", config::APP_ID))
    });
    let config = config::load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    match cli.command {
        Commands::Init => {
            let store = Store::open(&config.app.db_path(), config.app.vector_dims).await?;
            println!("initialized {}", config.app.db_path().display());
            store.close().await;
            Ok(())
        }
        Commands::Upload { library, paths } => {
            let (store, service) = boot(&config).await?;
            service.tasks().start();

            let uploaded = service.upload_documents(library, &paths).await?;
            println!("uploaded {} of {} files", uploaded.len(), paths.len());

            wait_for_drain(&service).await?;
            for document in &uploaded {
                let row = service.get_document(document.id).await?;
                println!(
                    "  [{}] {}  parsing={:?} embedding={:?} chunks={}",
                    row.id,
                    row.original_name,
                    ProcessStatus::from_i64(row.parsing_status),
                    ProcessStatus::from_i64(row.embedding_status),
                    row.split_total,
                );
            }

            service.tasks().stop().await;
            store.close().await;
            Ok(())
        }
        Commands::List {
            library,
            keyword,
            before,
            limit,
            sort,
        } => {
            let (store, service) = boot(&config).await?;
            let documents = service
                .list_documents_page(library, &keyword, before, limit, &sort)
                .await?;
            if documents.is_empty() {
                println!("No documents.");
            }
            for document in documents {
                println!(
                    "{}. {}  {} bytes  parsing={:?} embedding={:?}",
                    document.id,
                    document.original_name,
                    document.file_size,
                    ProcessStatus::from_i64(document.parsing_status),
                    ProcessStatus::from_i64(document.embedding_status),
                );
            }
            store.close().await;
            Ok(())
        }
        Commands::Rename { id, new_name } => {
            let (store, service) = boot(&config).await?;
            let document = service.rename_document(id, &new_name).await?;
            println!("renamed {} -> {}", id, document.original_name);
            store.close().await;
            Ok(())
        }
        Commands::Reprocess { id } => {
            let (store, service) = boot(&config).await?;
            service.tasks().start();
            service.reprocess_document(id).await?;
            wait_for_drain(&service).await?;
            service.tasks().stop().await;
            println!("reprocessed {}", id);
            store.close().await;
            Ok(())
        }
        Commands::Reembed { id } => {
            let (store, service) = boot(&config).await?;
            service.tasks().start();
            service.reembed_document(id).await?;
            wait_for_drain(&service).await?;
            service.tasks().stop().await;
            println!("re-embedded {}", id);
            store.close().await;
            Ok(())
        }
        Commands::Delete { id } => {
            let (store, service) = boot(&config).await?;
            service.delete_document(id).await?;
            println!("deleted {}", id);
            store.close().await;
            Ok(())
        }
    }
}

async fn boot(config: &Config) -> Result<(Store, Arc<DocumentService>)> {
    let store = Store::open(&config.app.db_path(), config.app.vector_dims).await?;
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    let tasks = TaskManager::new(
        store.clone(),
        Duration::from_secs(config.queues.lease_secs),
        queues_from_config(&config.queues),
        events.clone(),
    );

    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        Arc::new(ParserRegistry::with_builtins()),
        config.raptor.clone(),
        config.embedding.batch_size,
        events.clone(),
    ));

    let embedder = create_embedder(&config.embedding)?;
    let resolver = Arc::new(ConfigResolver::new(config.summarizer.clone()));

    let service = DocumentService::new(
        store.clone(),
        config.clone(),
        tasks,
        ingestor,
        embedder,
        resolver,
        events,
    );
    service.register_handlers(Arc::new(NoThumbnailer));

    Ok((store, service))
}

/// Poll both queues until they are empty.
async fn wait_for_drain(service: &DocumentService) -> Result<()> {
    loop {
        let documents = service.tasks().queue_depth(docbase::queue::QUEUE_DOCUMENT).await?;
        let thumbnails = service.tasks().queue_depth(docbase::queue::QUEUE_THUMBNAIL).await?;
        if documents == 0 && thumbnails == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
