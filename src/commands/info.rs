use anyhow::Result;

use crate::commands::build_images_api;
use crate::ui;

pub async fn execute(image: String) -> Result<()> {
    let (_config, images) = build_images_api()?;
    let info = images.get_info(&image).await?;

    ui::info(&format!("Name:    {}", info.reference));
    ui::info(&format!("Format:  {}", info.format));
    ui::info(&format!("OS:      {}", info.os));
    ui::info(&format!("Size:    {}", ui::size(info.size)));
    ui::info(&format!("Digest:  {}", info.digest));
    if !info.description.is_empty() {
        ui::info(&format!("About:   {}", info.description));
    }
    Ok(())
}
