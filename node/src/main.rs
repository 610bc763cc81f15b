use std::{env, io, num::NonZeroUsize, path::Path};

use log::{info, warn};
use machine_learning::{
    dataset::InMemoryDataSource,
    model::{EmbeddingExtractor, LinearEmbedder},
};
use orchestrator::{
    Checkpoint, DeviceCatalog, ParamInit, SafetensorsCheckpoint, TrainingConfig, restore, train,
};
use tokio::signal;

const USAGE: &str = "usage:
    node train <config.json> <train.csv> <validation.csv> [--resume]
    node verify <config.json> <enroll.csv> <test.csv>";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (command, config_path, first, second) = match args.as_slice() {
        [command, config, first, second, ..] => (command.as_str(), config, first, second),
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, USAGE)),
    };

    let config = TrainingConfig::from_file(config_path)?;
    select_devices(&config)?;

    tokio::select! {
        ret = run(command, &config, first, second, args.iter().any(|a| a == "--resume")) => ret?,
        _ = signal::ctrl_c() => {
            warn!("interrupted, stopping before the run completes");
        }
    }

    Ok(())
}

async fn run(
    command: &str,
    config: &TrainingConfig,
    first: &str,
    second: &str,
    resume: bool,
) -> io::Result<()> {
    let extractor = LinearEmbedder::new(config.feature_dim, config.embedding_dim, config.n_speaker);
    let checkpoint = SafetensorsCheckpoint::new(config.checkpoint_path());

    match command {
        "train" => {
            let mut train_set = load(first, config)?;
            let mut validation = load(second, config)?;

            let init = if resume {
                ParamInit::Restored(checkpoint.restore(extractor.layout())?)
            } else {
                ParamInit::Fresh
            };

            let (_, reports) = train(
                config,
                extractor,
                init,
                &mut train_set,
                &mut validation,
                &checkpoint,
            )
            .await?;
            if let Some(last) = reports.last() {
                info!(loss = last.loss, accuracy = last.accuracy; "training done");
            }
        }
        "verify" => {
            let mut enroll = load(first, config)?;
            let mut test = load(second, config)?;

            let report = restore(config, extractor, &checkpoint, &mut enroll, &mut test).await?;
            info!(
                num_true = report.num_true(),
                top1 = report.top1_accuracy();
                "verification done"
            );
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown command {other:?}\n{USAGE}"),
            ));
        }
    }

    Ok(())
}

fn load<P: AsRef<Path>>(path: P, config: &TrainingConfig) -> io::Result<InMemoryDataSource> {
    let batch_size = NonZeroUsize::new(config.batch_size).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "batch_size must be greater than zero")
    })?;

    let source = InMemoryDataSource::from_csv(path, batch_size, config.n_speaker)
        .map_err(io::Error::other)?;

    if source.feature_dim() != config.feature_dim {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "the dataset has {} features per row, the config expects {}",
                source.feature_dim(),
                config.feature_dim
            ),
        ));
    }

    Ok(source)
}

/// Logs which of the configured devices the replicas are placed on.
fn select_devices(config: &TrainingConfig) -> io::Result<()> {
    if config.replica_count == 0 {
        return Ok(());
    }

    if config.devices.is_empty() {
        warn!(replicas = config.replica_count; "no devices configured, replicas share the host");
        return Ok(());
    }

    let catalog = DeviceCatalog::new(config.devices.clone());
    let visible = catalog.visible_devices(config.replica_count)?;
    info!("placing {} replicas on devices {visible}", config.replica_count);
    Ok(())
}
