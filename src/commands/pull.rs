use anyhow::Result;

use crate::api::images::{PullPolicy, DEFAULT_CHUNK_SIZE, DEFAULT_THRESHOLD};
use crate::cli::PullPolicyArg;
use crate::commands::build_images_api;
use crate::ui;
use crate::units::parse_bytes;

pub async fn execute(
    image: String,
    policy: Option<PullPolicyArg>,
    chunk_size: Option<String>,
    threshold: Option<String>,
) -> Result<()> {
    let (_config, images) = build_images_api()?;
    let chunk_size = match &chunk_size {
        Some(value) => parse_bytes(value)?,
        None => DEFAULT_CHUNK_SIZE,
    };
    let threshold = match &threshold {
        Some(value) => parse_bytes(value)?,
        None => DEFAULT_THRESHOLD,
    };
    let images = images.with_limits(chunk_size, threshold);

    let policy = policy.map(|p| match p {
        PullPolicyArg::Always => PullPolicy::Always,
        PullPolicyArg::IfNotPresent => PullPolicy::IfNotPresent,
        PullPolicyArg::Never => PullPolicy::Never,
    });

    match images.pull(&image, policy).await? {
        Some(pulled) => {
            let path = images.registry().image_path(&pulled.reference);
            ui::info(&format!("Pulled {} to {}", pulled.reference, path.display()));
        }
        None => ui::info("Pull skipped by policy"),
    }
    Ok(())
}
