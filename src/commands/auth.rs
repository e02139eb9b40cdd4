use anyhow::Result;

use crate::config::Config;
use crate::ui;

pub async fn execute(
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    api_url: Option<String>,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = api_url {
        config.api_url = url;
    }
    if token.is_some() {
        config.credential.token = token;
    }
    if username.is_some() {
        config.credential.username = username;
    }
    if password.is_some() {
        config.credential.password = password;
    }
    config.save()?;
    ui::info(&format!("Credentials saved for {}", config.api_url));
    Ok(())
}
