use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rust_convnet::model::{self, History, Model};
use rust_convnet::parsing::preprocess::{self, NUM_CLASSES};
use rust_convnet::parsing::{mnist, DataFormat, Split};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the digit dataset
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Layout of the dataset files
    #[arg(short, long, value_enum, default_value_t = DataFormat::Idx)]
    format: DataFormat,

    /// Number of epochs to train the network for
    #[arg(short, long, default_value_t = model::NUM_EPOCHS)]
    num_epochs: usize,

    /// Batch size of the network
    #[arg(short, long, default_value_t = model::BATCH_SIZE)]
    batch_size: usize,

    /// Seed for weight initialization, dropout and shuffling
    #[arg(short, long, default_value = None)]
    seed: Option<u64>,

    /// Save the loss and accuracy of every epoch as CSV
    #[arg(long, default_value = None)]
    history_path: Option<PathBuf>,
}

/// Write the per-epoch metrics to a CSV file
fn write_history(path: &Path, history: &History) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    for stats in &history.epochs {
        writer.serialize(stats)?;
    }
    writer.flush()?;

    Ok(())
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let train = mnist::load(&args.data_dir, Split::Train, args.format)?;
    let test = mnist::load(&args.data_dir, Split::Test, args.format)?;

    let train_images = preprocess::normalize(preprocess::reshape_images(&train.images)?);
    let train_labels = preprocess::one_hot(&train.labels, NUM_CLASSES)?;
    let test_images = preprocess::normalize(preprocess::reshape_images(&test.images)?);
    let test_labels = preprocess::one_hot(&test.labels, NUM_CLASSES)?;

    println!("{}", preprocess::format_shape(train_images.shape()));

    let mut classifier = model::digit_classifier(args.seed)?;
    info!("model summary:\n{}", classifier.summary());

    let history = classifier.fit(&train_images, &train_labels, args.num_epochs, args.batch_size)?;

    if let Some(history_path) = &args.history_path {
        write_history(history_path, &history)?;
        info!("wrote training history to {}", history_path.display());
    }

    let evaluation = classifier.evaluate(&test_images, &test_labels)?;
    info!(
        "the number of mistakes is {} out of {}",
        evaluation.mistakes, evaluation.samples
    );

    println!("{}", evaluation.accuracy_line());
    println!("{}", evaluation.error_rate_line());

    Ok(())
}
