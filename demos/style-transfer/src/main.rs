use anyhow::{bail, Result};
use clap::Parser;
use std::{fs, path::PathBuf};
use stylegraph::{
    image::{load_image, save_image},
    style::{FeatureNetwork, StyleTransfer, StyleTransferOptions},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Neural style transfer")]
struct Options {
    /// The content image.
    #[arg(long)]
    content: PathBuf,
    /// The style image, resized to the content image.
    #[arg(long)]
    style: PathBuf,
    /// Where to save the output image.
    #[arg(long, default_value = "output.png")]
    output: PathBuf,
    /// A serialized network with pretrained weights (json).
    #[arg(long, conflicts_with = "random_network")]
    network: Option<PathBuf>,
    /// Use VGG-19 with random weights, seeded with this value.
    #[arg(long)]
    random_network: Option<u64>,
    /// Style transfer options (json), overridden by the options below.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of steps.
    #[arg(long)]
    num_steps: Option<usize>,
    /// Multiplier of the style score.
    #[arg(long)]
    style_weight: Option<f32>,
    /// Multiplier of the content score.
    #[arg(long)]
    content_weight: Option<f32>,
    /// Resize the content image to [height, width].
    #[arg(long, num_args = 2, value_names = ["HEIGHT", "WIDTH"])]
    size: Option<Vec<usize>>,
    /// Log each stage of the pipeline.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let options = Options::parse();
    let level = if options.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let network = if let Some(path) = options.network.as_ref() {
        log::info!("Loading network from {path:?}");
        serde_json::from_slice::<FeatureNetwork>(&fs::read(path)?)?
    } else if let Some(seed) = options.random_network {
        log::warn!("Using a random network, the output will not resemble the style image");
        FeatureNetwork::vgg19_random(seed)?
    } else {
        bail!("Expected --network or --random-network!");
    };

    let mut transfer_options = if let Some(path) = options.config.as_ref() {
        serde_json::from_slice::<StyleTransferOptions>(&fs::read(path)?)?
    } else {
        StyleTransferOptions::default()
    };
    if let Some(num_steps) = options.num_steps {
        transfer_options.num_steps = num_steps;
    }
    if let Some(style_weight) = options.style_weight {
        transfer_options.style_weight = style_weight;
    }
    if let Some(content_weight) = options.content_weight {
        transfer_options.content_weight = content_weight;
    }

    let size = match options.size.as_deref() {
        Some(&[height, width]) => Some([height, width]),
        _ => None,
    };
    let content = load_image(&options.content, size)?;
    let (_, _, height, width) = content.dim();
    let style = load_image(&options.style, Some([height, width]))?;

    let output = StyleTransfer::new(network)
        .with_options(transfer_options)
        .run(content.view(), style.view())?;
    log::info!(
        "{} evaluations, loss: {:.4}",
        output.iterations(),
        output.loss()
    );
    save_image(output.image().view(), &options.output)?;
    log::info!("Saved {:?}", options.output);
    Ok(())
}
