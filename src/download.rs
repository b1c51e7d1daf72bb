use std::fs;
use std::io::Write as _;
use std::path::Path;

use futures_util::StreamExt as _;
use reqwest::Client;

use crate::error::{AppError, Result};

pub const USER_AGENT: &str = "homeport";

/// Stream `url` to `dest`, replacing any previous file.
pub async fn download_file(client: &Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
    }

    let resp = client
        .get(url)
        .header("User-Agent", USER_AGENT)
        .send()
        .await
        .map_err(|e| AppError::network_with_url(url, e.to_string()))?;

    if !resp.status().is_success() {
        return Err(AppError::network_with_url(url, resp.status().to_string()));
    }

    let partial = dest.with_extension("part");
    let mut file = fs::File::create(&partial).map_err(|e| AppError::io(e.to_string()))?;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::network_with_url(url, e.to_string()))?;
        file.write_all(&chunk)
            .map_err(|e| AppError::io(e.to_string()))?;
    }
    drop(file);

    fs::rename(&partial, dest).map_err(|e| AppError::io(e.to_string()))?;
    Ok(())
}
