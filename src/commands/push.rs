use anyhow::Result;

use crate::api::images::{LocalImage, DEFAULT_CHUNK_SIZE, DEFAULT_THRESHOLD};
use crate::api::models::OsInfo;
use crate::commands::build_images_api;
use crate::name::ImageRef;
use crate::ui;
use crate::units::parse_bytes;

pub struct PushArgs {
    pub image: String,
    pub force: bool,
    pub format: String,
    pub os_type: String,
    pub os_distrib: String,
    pub os_version: String,
    pub arch: String,
    pub private: bool,
    pub description: String,
    pub url: Option<String>,
    pub chunk_size: Option<String>,
    pub threshold: Option<String>,
}

pub async fn execute(args: PushArgs) -> Result<()> {
    let (_config, images) = build_images_api()?;
    let chunk_size = match &args.chunk_size {
        Some(value) => parse_bytes(value)?,
        None => DEFAULT_CHUNK_SIZE,
    };
    let threshold = match &args.threshold {
        Some(value) => parse_bytes(value)?,
        None => DEFAULT_THRESHOLD,
    };
    let images = images.with_limits(chunk_size, threshold);

    let reference = ImageRef::parse(&args.image)?;
    let mut image = LocalImage::new(reference);
    image.format = args.format;
    image.os = OsInfo {
        os_type: args.os_type,
        distrib: args.os_distrib,
        version: args.os_version,
        arch: args.arch,
    };
    image.private = args.private;
    image.description = args.description;
    image.url = args.url.unwrap_or_default();

    images.push(&mut image, args.force).await?;
    ui::info(&format!(
        "Pushed {} ({})",
        image.reference,
        ui::size(image.size)
    ));
    Ok(())
}
