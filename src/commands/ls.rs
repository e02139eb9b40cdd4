use anyhow::Result;

use crate::commands::build_images_api;
use crate::ui;

pub async fn execute(username: Option<String>, page: usize, page_size: usize) -> Result<()> {
    let (_config, images) = build_images_api()?;
    let (entries, total) = images
        .list_remote(username.as_deref().unwrap_or_default(), page, page_size)
        .await?;

    for info in &entries {
        let fullname = if info.username == "_" {
            format!("{}:{}", info.name, info.tag)
        } else {
            format!("{}/{}:{}", info.username, info.name, info.tag)
        };
        ui::info(&format!(
            "{fullname}  {}  {}  {}",
            info.format,
            ui::size(info.size),
            &info.digest[..info.digest.len().min(10)]
        ));
    }
    ui::info(&format!("{} of {total} image(s)", entries.len()));
    Ok(())
}

pub async fn execute_local() -> Result<()> {
    let (_config, images) = build_images_api()?;
    let refs = images.registry().list_local()?;
    for reference in &refs {
        match images.registry().load(reference).await? {
            Some(meta) => ui::info(&format!(
                "{}  {}  {}",
                reference,
                ui::size(meta.size),
                &meta.digest[..meta.digest.len().min(10)]
            )),
            None => ui::info(&reference.to_string()),
        }
    }
    ui::info(&format!("{} local image(s)", refs.len()));
    Ok(())
}
