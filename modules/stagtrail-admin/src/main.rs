//! One-shot operator scripts, out of the hot path: backlog backfill,
//! unassigned-detection requeue, profile re-embedding, dead-letter
//! handling, and out-of-band location management.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inference_client::{Embedder as _, ModelRegistry};
use stagtrail_common::{l2_normalize, Config, DETECT_QUEUE, REID_QUEUE};
use stagtrail_db::models::{Deer, Detection, Image, Location};
use stagtrail_db::DispatchQueue;
use stagtrail_pipeline::crop;

#[derive(Parser)]
#[command(name = "stagtrail-admin", about = "Stagtrail operator scripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue detection for images still pending.
    Backfill {
        /// Maximum images to enqueue in this run.
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
    /// Re-enqueue deer detections that never received a profile.
    RequeueUnassigned {
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
    /// Re-embed every profile with a new extractor version.
    ReEmbed {
        /// New extraction-scheme tag, e.g. "resnet50-v2".
        #[arg(long)]
        version: String,
    },
    /// Inspect the dead-letter queue; optionally put everything back.
    DeadLetters {
        #[arg(long)]
        requeue: bool,
    },
    /// Manage camera locations (created out of band, immutable after).
    Locations {
        #[command(subcommand)]
        command: LocationCommand,
    },
}

#[derive(Subcommand)]
enum LocationCommand {
    Add {
        name: String,
        #[arg(long)]
        lat: Option<f64>,
        #[arg(long)]
        lon: Option<f64>,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagtrail=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::admin_from_env();
    let pool = stagtrail_db::connect(&config.database_url).await?;
    stagtrail_db::migrate(&pool).await?;

    match cli.command {
        Command::Backfill { limit } => {
            let queue = DispatchQueue::new(pool.clone(), config.settings.max_retries);
            let ids = Image::pending_ids(limit, &pool).await?;
            for id in &ids {
                queue.enqueue(DETECT_QUEUE, *id).await?;
            }
            info!(count = ids.len(), "pending images enqueued for detection");
        }

        Command::RequeueUnassigned { limit } => {
            let queue = DispatchQueue::new(pool.clone(), config.settings.max_retries);
            let ids = Detection::unassigned_deer_ids(limit, &pool).await?;
            for id in &ids {
                queue.enqueue(REID_QUEUE, *id).await?;
            }
            info!(count = ids.len(), "unassigned detections enqueued for reid");
        }

        Command::ReEmbed { version } => {
            if config.inference_url.is_empty() {
                bail!("INFERENCE_URL is required for re-embed");
            }
            let registry = ModelRegistry::new(
                &config.inference_url,
                config.settings.inference_slots,
                &config.detector_model,
                &config.embedder_model,
                config.aux_embedder_model.as_deref(),
                &version,
            );
            let embedder = registry.embedder().await?;
            let aux_embedder = registry.aux_embedder().await?;

            let ids = Deer::all_ids(&pool).await?;
            let total = ids.len();
            let mut updated = 0usize;
            for deer_id in ids {
                let Some((detection, context)) = Detection::exemplar_for_deer(deer_id, &pool).await?
                else {
                    warn!(%deer_id, "no exemplar sighting, profile keeps its old embedding");
                    continue;
                };

                let bytes = tokio::fs::read(&context.image_path)
                    .await
                    .with_context(|| format!("reading {}", context.image_path))?;
                let img = crop::decode(&bytes)?;
                let png = crop::crop_to_png(&img, detection.bbox())?;

                let embedding = l2_normalize(embedder.embed(&png).await?);
                let embedding_alt = match &aux_embedder {
                    Some(aux) => Some(pgvector::Vector::from(l2_normalize(aux.embed(&png).await?))),
                    None => None,
                };

                Deer::update_embedding(
                    deer_id,
                    &pgvector::Vector::from(embedding),
                    embedding_alt.as_ref(),
                    embedder.version(),
                    &pool,
                )
                .await?;
                updated += 1;
            }
            info!(updated, total, version = %version, "profiles re-embedded");
        }

        Command::DeadLetters { requeue } => {
            let queue = DispatchQueue::new(pool.clone(), config.settings.max_retries);
            let dead = queue.dead_letters(None).await?;
            if dead.is_empty() {
                info!("dead-letter queue is empty");
                return Ok(());
            }
            for letter in &dead {
                info!(
                    id = letter.id,
                    queue = %letter.queue,
                    item = %letter.item_id,
                    attempts = letter.attempts,
                    error = letter.last_error.as_deref().unwrap_or("-"),
                    moved_at = %letter.moved_at,
                    "dead letter"
                );
            }
            if requeue {
                let mut put_back = 0usize;
                for letter in &dead {
                    if queue.requeue_dead(letter.id).await? {
                        put_back += 1;
                    }
                }
                info!(put_back, "dead letters re-enqueued");
            }
        }

        Command::Locations { command } => match command {
            LocationCommand::Add { name, lat, lon } => {
                if Location::find_by_name(&name, &pool).await?.is_some() {
                    bail!("location '{name}' already exists");
                }
                let location = Location::create(&name, lat, lon, &pool).await?;
                info!(id = %location.id, name = %location.name, "location created");
            }
            LocationCommand::List => {
                for location in Location::list_all(&pool).await? {
                    info!(
                        id = %location.id,
                        name = %location.name,
                        lat = ?location.lat,
                        lon = ?location.lon,
                        "location"
                    );
                }
            }
        },
    }

    Ok(())
}
