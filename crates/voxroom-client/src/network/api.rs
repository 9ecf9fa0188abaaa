use anyhow::Result;
use serde::{Deserialize, de::DeserializeOwned};
use voxroom_protocol::IceServer;

pub async fn get<T: DeserializeOwned>(url: &str) -> Result<T> {
    let client = reqwest::Client::new();
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("Request failed with status {}: {}", status, text);
    }

    Ok(response.json().await?)
}

#[derive(Debug, Deserialize)]
struct IceServersResponse {
    ice_servers: Vec<IceServer>,
}

/// STUN/TURN servers the deployment wants peers to use
pub async fn fetch_ice_servers(server_url: &str) -> Result<Vec<IceServer>> {
    let url = format!("{}/api/rtc/ice-servers", server_url.trim_end_matches('/'));
    let response: IceServersResponse = get(&url).await?;
    Ok(response.ice_servers)
}
