pub mod auth;
pub mod info;
pub mod ls;
pub mod pull;
pub mod push;
pub mod rm;
pub mod serve;

use anyhow::Result;

use crate::api::client::ApiClient;
use crate::api::images::ImagesApi;
use crate::config::Config;

pub(crate) fn build_images_api() -> Result<(Config, ImagesApi)> {
    let config = Config::load()?;
    let api = ApiClient::new(&config.api_url, config.credential.clone())?;
    let images = ImagesApi::new(api, &config.base_dir()?)?;
    Ok((config, images))
}
