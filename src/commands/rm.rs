use anyhow::Result;

use crate::commands::build_images_api;
use crate::ui;

pub async fn execute(image: String, local_only: bool) -> Result<()> {
    let (_config, images) = build_images_api()?;
    images.remove_local(&image).await?;
    if !local_only {
        images.remove_remote(&image).await?;
    }
    ui::info(&format!("Removed {image}"));
    Ok(())
}
